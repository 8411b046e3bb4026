//! Repair session state machine: explicit states and legal transition guards.
//!
//! Every repair session starts at `Init` and ends in exactly one of the
//! terminal states `Succeeded`, `Failed` or `Aborted`. The session calls
//! `advance()` to move between states; each call validates the edge and
//! records it in the transition log, which is persisted with the transcript.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Package staged, nothing asked of the model yet.
    Init,
    /// Building failure context and waiting on the model.
    Diagnosing,
    /// Resolving the model's response into a tool call or a repair action.
    Acting,
    /// Action applied; waiting on the build service.
    Validating,
    /// Build passed on the target ISA. Terminal.
    Succeeded,
    /// Iteration budget exhausted. Terminal.
    Failed,
    /// Tooling broke or the session was cancelled. Terminal.
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::Diagnosing => write!(f, "Diagnosing"),
            Self::Acting => write!(f, "Acting"),
            Self::Validating => write!(f, "Validating"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Legal transitions between session states.
///
/// ```text
/// Init → Diagnosing
/// Diagnosing → Acting
/// Acting → Diagnosing | Validating | Failed
/// Validating → Diagnosing | Succeeded | Failed
/// any non-terminal → Aborted
/// ```
///
/// `Acting → Diagnosing` covers both tool-call rounds and actions rejected
/// before submission (unknown path, patch that does not apply); the latter
/// can also end the session directly when they spend the last iteration.
fn is_legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    if to == Aborted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Init, Diagnosing)
            | (Diagnosing, Acting)
            | (Acting, Diagnosing)
            | (Acting, Validating)
            | (Acting, Failed)
            | (Validating, Diagnosing)
            | (Validating, Succeeded)
            | (Validating, Failed)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SessionState,
    pub to: SessionState,
    /// Completed iterations at the time of transition.
    pub iteration: u32,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current state and keeps the full transition log.
pub struct StateMachine {
    current: SessionState,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: SessionState::Init,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Attempt to advance to the next state.
    pub fn advance(
        &mut self,
        to: SessionState,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            iteration = self.iteration,
            "State transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Aborted` from any non-terminal state.
    pub fn abort(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(SessionState::Aborted, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "{} → {} ({}ms, {} transitions)",
            SessionState::Init,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            out.push_str(&format!(" [{}]", states.join(" → ")));
        }
        out
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(state: SessionState) -> StateMachine {
        StateMachine {
            current: state,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), SessionState::Init);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::Diagnosing, None).unwrap();
        sm.advance(SessionState::Acting, None).unwrap();
        sm.advance(SessionState::Validating, Some("write_file foo.spec"))
            .unwrap();
        sm.set_iteration(1);
        sm.advance(SessionState::Succeeded, None).unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 4);
        assert_eq!(sm.transitions()[3].iteration, 1);
    }

    #[test]
    fn test_tool_rounds_loop_back_to_diagnosing() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::Diagnosing, None).unwrap();
        for _ in 0..3 {
            sm.advance(SessionState::Acting, None).unwrap();
            sm.advance(SessionState::Diagnosing, Some("tool call: read_file"))
                .unwrap();
        }
        assert_eq!(sm.current(), SessionState::Diagnosing);
        assert_eq!(sm.iteration(), 0);
    }

    #[test]
    fn test_failed_build_loops_then_exhausts() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::Diagnosing, None).unwrap();
        sm.advance(SessionState::Acting, None).unwrap();
        sm.advance(SessionState::Validating, None).unwrap();
        sm.set_iteration(1);
        sm.advance(SessionState::Diagnosing, Some("build failed"))
            .unwrap();
        sm.advance(SessionState::Acting, None).unwrap();
        sm.advance(SessionState::Validating, None).unwrap();
        sm.set_iteration(2);
        sm.advance(SessionState::Failed, Some("iteration limit (2) reached"))
            .unwrap();
        assert_eq!(sm.current(), SessionState::Failed);
    }

    #[test]
    fn test_abort_from_any_state() {
        for state in [
            SessionState::Init,
            SessionState::Diagnosing,
            SessionState::Acting,
            SessionState::Validating,
        ] {
            let mut sm = at(state);
            assert!(sm.abort("cancelled").is_ok());
            assert_eq!(sm.current(), SessionState::Aborted);
            assert!(sm.is_terminal());
        }
    }

    #[test]
    fn test_cannot_leave_terminal_states() {
        for state in [
            SessionState::Succeeded,
            SessionState::Failed,
            SessionState::Aborted,
        ] {
            let mut sm = at(state);
            assert!(sm.abort("late").is_err());
            let err = sm.advance(SessionState::Diagnosing, None).unwrap_err();
            assert_eq!(err.from, state);
            assert_eq!(err.to, SessionState::Diagnosing);
        }
    }

    #[test]
    fn test_cannot_skip_validation() {
        let mut sm = at(SessionState::Acting);
        assert!(sm.advance(SessionState::Succeeded, None).is_err());
        let mut sm = at(SessionState::Diagnosing);
        assert!(sm.advance(SessionState::Validating, None).is_err());
    }

    #[test]
    fn test_transition_record_serde() {
        let record = TransitionRecord {
            from: SessionState::Validating,
            to: SessionState::Diagnosing,
            iteration: 2,
            elapsed_ms: 420,
            reason: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"from\":\"validating\""));
        assert!(!json.contains("reason"));
        let restored: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_summary() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::Diagnosing, None).unwrap();
        sm.abort("model unavailable").unwrap();
        let summary = sm.summary();
        assert!(summary.contains("Aborted"));
        assert!(summary.contains("2 transitions"));
    }
}
