//! LLM-driven repair loop for packages that fail to build for another ISA.
//!
//! A [`session::RepairSession`] walks `Init → Diagnosing → Acting →
//! Validating` until the build passes, the iteration budget runs out, or the
//! tooling breaks. The [`coordinator::ModelCoordinator`] talks to the model,
//! the [`tools::ToolRegistry`] serves its queries, and the deterministic
//! pieces (working copy, patching, build service) live in
//! `repair_coordination`.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod model;
pub mod prompts;
pub mod session;
pub mod state_machine;
pub mod tools;
pub mod transcript;

pub use batch::{run_batch, BatchOutcome, BatchReport};
pub use config::RepairConfig;
pub use coordinator::{CoordinatorConfig, ModelCoordinator, ModelResponse, TurnInput};
pub use errors::{RepairError, RetryCategory};
pub use session::{FailureContext, RepairSession, SessionConfig};
pub use state_machine::{SessionState, StateMachine};
pub use tools::{RepairStrategy, ToolRegistry};
pub use transcript::{IterationRecord, SessionStatus, SessionTranscript};
