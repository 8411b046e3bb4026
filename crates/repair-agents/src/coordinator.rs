//! Model coordinator: one conversation per repair iteration.
//!
//! The coordinator owns the message history and turns each model reply into a
//! [`ModelResponse`]. It holds at most one outstanding model call, never
//! touches the working copy, and hides two retry budgets from the session:
//!
//! - transport errors (network, 429, 5xx) back off and retry up to
//!   `transient_retries` times;
//! - replies that parse to [`ModelResponse::Unparseable`] are answered with a
//!   clarification nudge up to `clarification_retries` times.
//!
//! Either budget running out surfaces as [`RepairError::ModelUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use repair_coordination::{IsaPair, RepairAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::RepairError;
use crate::model::{ChatMessage, ChatModel, ChatRequest, ChatResponse, ToolCall, Usage};
use crate::prompts;
use crate::session::FailureContext;
use crate::tools::{ActionArgs, RepairStrategy, ToolRegistry, APPLY_PATCH, WRITE_FILE};

/// What the session feeds into a turn.
#[derive(Debug, Clone)]
pub enum TurnInput {
    /// Start of an iteration; resets the conversation.
    Context(FailureContext),
    /// Output of the tool the model asked for last turn.
    ToolResult { name: String, output: String },
}

/// A model reply, classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelResponse {
    ToolCallRequest {
        name: String,
        args: Value,
    },
    ProposedAction {
        action: RepairAction,
        diagnosis: Option<String>,
    },
    Unparseable {
        raw: String,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub clarification_retries: u32,
    pub transient_retries: u32,
    pub max_tool_rounds: u32,
    pub temperature: f32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            clarification_retries: 2,
            transient_retries: 3,
            max_tool_rounds: 20,
            temperature: 0.2,
        }
    }
}

pub struct ModelCoordinator {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    config: CoordinatorConfig,
    system_prompt: String,
    history: Vec<ChatMessage>,
    tool_rounds: u32,
    calls: u32,
    usage: Usage,
}

impl ModelCoordinator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        config: CoordinatorConfig,
        package: &str,
        isa: &IsaPair,
    ) -> Self {
        let system_prompt = prompts::system_prompt(package, isa, registry.strategy());
        Self {
            model,
            registry,
            config,
            system_prompt,
            history: Vec::new(),
            tool_rounds: 0,
            calls: 0,
            usage: Usage::default(),
        }
    }

    /// Model calls made so far, retries included.
    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn tools_enabled(&self) -> bool {
        self.tool_rounds < self.config.max_tool_rounds
    }

    /// Run one turn. Never returns [`ModelResponse::Unparseable`].
    pub async fn next_turn(&mut self, input: TurnInput) -> Result<ModelResponse, RepairError> {
        let strategy = self.registry.strategy();
        match input {
            TurnInput::Context(ctx) => {
                self.history = vec![
                    ChatMessage::system(self.system_prompt.clone()),
                    ChatMessage::user(prompts::render_context(&ctx)),
                ];
                self.tool_rounds = 0;
            }
            TurnInput::ToolResult { name, output } => {
                self.tool_rounds += 1;
                self.history
                    .push(ChatMessage::user(prompts::tool_result(&name, &output)));
                if !self.tools_enabled() {
                    self.history
                        .push(ChatMessage::user(prompts::tool_budget_spent(strategy)));
                }
            }
        }

        let mut attempt = 0;
        loop {
            let reply = self.complete_with_backoff().await?;
            let mut parsed = parse_response(&reply, strategy);

            if matches!(parsed, ModelResponse::ToolCallRequest { .. }) && !self.tools_enabled() {
                parsed = ModelResponse::Unparseable {
                    raw: echo(&reply),
                };
            }

            match parsed {
                ModelResponse::Unparseable { raw } => {
                    if attempt >= self.config.clarification_retries {
                        warn!(
                            model = %self.model.model_name(),
                            attempts = attempt + 1,
                            "model reply unusable; retry budget spent"
                        );
                        return Err(RepairError::ModelUnavailable(format!(
                            "{} unparseable replies",
                            attempt + 1
                        )));
                    }
                    attempt += 1;
                    debug!(attempt, "unparseable reply, sending clarification");
                    self.history.push(ChatMessage::assistant(raw));
                    self.history
                        .push(ChatMessage::user(prompts::clarification_nudge(strategy)));
                }
                response => {
                    self.history.push(ChatMessage::assistant(echo(&reply)));
                    return Ok(response);
                }
            }
        }
    }

    async fn complete_with_backoff(&mut self) -> Result<ChatResponse, RepairError> {
        let request = ChatRequest {
            messages: self.history.clone(),
            tools: self.registry.definitions(self.tools_enabled()),
            temperature: self.config.temperature,
        };

        let mut attempt = 0;
        loop {
            self.calls += 1;
            match self.model.complete(request.clone()).await {
                Ok(resp) => {
                    self.usage.prompt_tokens += resp.usage.prompt_tokens;
                    self.usage.completion_tokens += resp.usage.completion_tokens;
                    return Ok(resp);
                }
                Err(e) if e.is_transient() && attempt < self.config.transient_retries => {
                    let backoff = Duration::from_secs(2u64.pow(attempt + 1));
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        backoff_secs = backoff.as_secs(),
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(RepairError::ModelUnavailable(e.to_string())),
            }
        }
    }
}

/// Plain-text form of a reply for the conversation history.
fn echo(reply: &ChatResponse) -> String {
    let mut out = reply.content.clone().unwrap_or_default();
    for call in &reply.tool_calls {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("[tool call] {}({})", call.name, call.arguments));
    }
    out
}

/// Classify a reply. Native tool calls are inspected first, then JSON found in
/// the text. The first well-formed action for the strategy wins over any tool
/// request; every other proposal is dropped with a warning.
pub fn parse_response(reply: &ChatResponse, strategy: RepairStrategy) -> ModelResponse {
    let mut candidates: Vec<ToolCall> = reply.tool_calls.clone();
    if let Some(text) = reply.content.as_deref() {
        candidates.extend(text_tool_calls(text, strategy));
    }

    let mut action: Option<(RepairAction, Option<String>)> = None;
    let mut tool_request: Option<(String, Value)> = None;
    let mut discarded = 0usize;

    for call in candidates {
        if call.name == WRITE_FILE || call.name == APPLY_PATCH {
            let Some(found) = to_action(&call, strategy) else {
                debug!(tool = %call.name, "ignoring malformed action proposal");
                continue;
            };
            if action.is_none() {
                action = Some(found);
            } else {
                discarded += 1;
            }
        } else if tool_request.is_none() {
            let args = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
            tool_request = Some((call.name, args));
        } else {
            discarded += 1;
        }
    }

    if let Some((action, diagnosis)) = action {
        if tool_request.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(
                discarded,
                kept = %action.path(),
                "model proposed several actions; only the first is applied"
            );
        }
        let diagnosis = diagnosis.or_else(|| {
            reply
                .content
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty() && !t.starts_with('{') && !t.starts_with("```"))
                .map(String::from)
        });
        return ModelResponse::ProposedAction { action, diagnosis };
    }

    if let Some((name, args)) = tool_request {
        if discarded > 0 {
            warn!(discarded, kept = %name, "model requested several tools; serving the first");
        }
        return ModelResponse::ToolCallRequest { name, args };
    }

    ModelResponse::Unparseable { raw: echo(reply) }
}

fn to_action(call: &ToolCall, strategy: RepairStrategy) -> Option<(RepairAction, Option<String>)> {
    if call.name != strategy.action_tool() {
        return None;
    }
    let args: ActionArgs = serde_json::from_str(&call.arguments).ok()?;
    if args.path.trim().is_empty() {
        return None;
    }
    let action = match strategy {
        RepairStrategy::FullFile => RepairAction::FullFileRewrite {
            path: args.path,
            content: args.content?,
        },
        RepairStrategy::Patch => RepairAction::Patch {
            path: args.path,
            diff: args.diff.filter(|d| !d.trim().is_empty())?,
        },
    };
    Some((action, args.diagnosis))
}

/// Tool calls written as JSON in the message text, for endpoints without
/// native function calling.
///
/// Accepts `{"name": ..., "arguments": {...}}` objects, bare action argument
/// objects (`{"path": ..., "content"|"diff": ...}`), and for the patch
/// strategy a fenced ```diff block whose `+++` header names the file.
fn text_tool_calls(text: &str, strategy: RepairStrategy) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut blocks = fenced_blocks(text, "json");
    if blocks.is_empty() {
        if let Some(bare) = bare_object(text) {
            blocks.push(bare);
        }
    }

    for block in blocks {
        let Ok(value) = serde_json::from_str::<Value>(block) else {
            continue;
        };
        if let Some(name) = value.get("name").and_then(Value::as_str) {
            let args = value.get("arguments").cloned().unwrap_or(Value::Null);
            // Some endpoints double-encode the arguments.
            let arguments = match args {
                Value::String(s) => s,
                other => other.to_string(),
            };
            calls.push(ToolCall {
                name: name.to_string(),
                arguments,
            });
        } else if value.get("path").is_some() {
            calls.push(ToolCall {
                name: strategy.action_tool().to_string(),
                arguments: value.to_string(),
            });
        }
    }

    if strategy == RepairStrategy::Patch {
        for diff in fenced_blocks(text, "diff") {
            if let Some(path) = diff_target(diff) {
                calls.push(ToolCall {
                    name: APPLY_PATCH.to_string(),
                    arguments: serde_json::json!({ "path": path, "diff": diff }).to_string(),
                });
            }
        }
    }
    calls
}

fn fenced_blocks<'a>(text: &'a str, lang: &str) -> Vec<&'a str> {
    let fence = format!("```{lang}");
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&fence) {
        let after = &rest[start + fence.len()..];
        let Some(end) = after.find("```") else {
            break;
        };
        out.push(after[..end].trim_matches('\n').trim_start_matches(' '));
        rest = &after[end + 3..];
    }
    out
}

fn bare_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].trim())
}

fn diff_target(diff: &str) -> Option<String> {
    let line = diff.lines().find(|l| l.starts_with("+++ "))?;
    let path = line[4..].split('\t').next()?.trim();
    let path = path.strip_prefix("b/").unwrap_or(path);
    (path != "/dev/null" && !path.is_empty()).then(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockChatModel, ModelError};
    use repair_coordination::{RepoListing, StructureOptions};
    use serde_json::json;

    fn registry(strategy: RepairStrategy) -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(strategy, StructureOptions::default()))
    }

    fn context() -> FailureContext {
        FailureContext {
            package: "bc".into(),
            iteration: 0,
            max_iterations: 3,
            build_log_excerpt: "error: no rule to make target".into(),
            repo_listing: RepoListing {
                root: "/work/bc".into(),
                entries: Vec::new(),
                truncated: false,
            },
            prior_diagnosis: None,
            previous_modifications: Vec::new(),
        }
    }

    fn coordinator(
        model: MockChatModel,
        strategy: RepairStrategy,
        config: CoordinatorConfig,
    ) -> ModelCoordinator {
        ModelCoordinator::new(
            Arc::new(model),
            registry(strategy),
            config,
            "bc",
            &IsaPair::default(),
        )
    }

    #[test]
    fn test_native_action_call() {
        let reply = ChatResponse::tool_call(
            WRITE_FILE,
            json!({"path": "bc.spec", "content": "Name: bc\n", "diagnosis": "arch list"}),
        );
        match parse_response(&reply, RepairStrategy::FullFile) {
            ModelResponse::ProposedAction { action, diagnosis } => {
                assert_eq!(
                    action,
                    RepairAction::FullFileRewrite {
                        path: "bc.spec".into(),
                        content: "Name: bc\n".into()
                    }
                );
                assert_eq!(diagnosis.as_deref(), Some("arch list"));
            }
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_action_for_wrong_strategy_is_unparseable() {
        let reply = ChatResponse::tool_call(APPLY_PATCH, json!({"path": "bc.spec", "diff": "x"}));
        assert!(matches!(
            parse_response(&reply, RepairStrategy::FullFile),
            ModelResponse::Unparseable { .. }
        ));
    }

    #[test]
    fn test_first_action_wins() {
        let mut reply = ChatResponse::tool_call(
            WRITE_FILE,
            json!({"path": "a.spec", "content": "first"}),
        );
        reply.tool_calls.push(ToolCall {
            name: WRITE_FILE.into(),
            arguments: json!({"path": "b.patch", "content": "second"}).to_string(),
        });
        reply.tool_calls.push(ToolCall {
            name: "read_file".into(),
            arguments: json!({"path": "a.spec"}).to_string(),
        });
        match parse_response(&reply, RepairStrategy::FullFile) {
            ModelResponse::ProposedAction { action, .. } => assert_eq!(action.path(), "a.spec"),
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_action_skipped_for_next() {
        let mut reply = ChatResponse::tool_call(WRITE_FILE, json!({"path": "a.spec"}));
        reply.tool_calls.push(ToolCall {
            name: WRITE_FILE.into(),
            arguments: json!({"path": "b.spec", "content": "ok"}).to_string(),
        });
        match parse_response(&reply, RepairStrategy::FullFile) {
            ModelResponse::ProposedAction { action, .. } => assert_eq!(action.path(), "b.spec"),
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_request_from_native_call() {
        let reply = ChatResponse::tool_call("read_file", json!({"path": "bc.spec"}));
        assert_eq!(
            parse_response(&reply, RepairStrategy::Patch),
            ModelResponse::ToolCallRequest {
                name: "read_file".into(),
                args: json!({"path": "bc.spec"})
            }
        );
    }

    #[test]
    fn test_fenced_json_action() {
        let reply = ChatResponse::text(
            "The arch list lacks riscv64.\n```json\n{\"path\": \"bc.spec\", \"content\": \"new\"}\n```",
        );
        match parse_response(&reply, RepairStrategy::FullFile) {
            ModelResponse::ProposedAction { action, diagnosis } => {
                assert_eq!(action.path(), "bc.spec");
                assert!(diagnosis.unwrap().starts_with("The arch list"));
            }
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_text_tool_call_object() {
        let reply = ChatResponse::text(r#"{"name": "extract_structure", "arguments": {}}"#);
        assert_eq!(
            parse_response(&reply, RepairStrategy::FullFile),
            ModelResponse::ToolCallRequest {
                name: "extract_structure".into(),
                args: json!({})
            }
        );
    }

    #[test]
    fn test_fenced_diff_for_patch_strategy() {
        let text = "Fix:\n```diff\n--- a/bc.spec\n+++ b/bc.spec\n@@ -1,1 +1,1 @@\n-old\n+new\n```\n";
        match parse_response(&ChatResponse::text(text), RepairStrategy::Patch) {
            ModelResponse::ProposedAction {
                action: RepairAction::Patch { path, diff },
                ..
            } => {
                assert_eq!(path, "bc.spec");
                assert!(diff.contains("@@ -1,1 +1,1 @@"));
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    #[test]
    fn test_prose_is_unparseable() {
        let reply = ChatResponse::text("I think the problem is in the configure script.");
        assert!(matches!(
            parse_response(&reply, RepairStrategy::FullFile),
            ModelResponse::Unparseable { .. }
        ));
    }

    #[tokio::test]
    async fn test_unparseable_retries_then_unavailable() {
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .times(3)
            .returning(|_| Ok(ChatResponse::text("thinking...")));
        model.expect_model_name().returning(|| "mock".into());

        let mut coord = coordinator(model, RepairStrategy::FullFile, CoordinatorConfig::default());
        let err = coord
            .next_turn(TurnInput::Context(context()))
            .await
            .unwrap_err();
        assert!(matches!(err, RepairError::ModelUnavailable(_)));
        assert_eq!(coord.calls(), 3);
        // system, context, then (reply, nudge) per retry
        assert_eq!(coord.history().len(), 6);
    }

    #[tokio::test]
    async fn test_clarification_recovers() {
        let mut model = MockChatModel::new();
        let mut seq = mockall::Sequence::new();
        model
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatResponse::text("hmm")));
        model
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|req| {
                assert!(req.messages.last().unwrap().content.contains("could not be used"));
                Ok(ChatResponse::tool_call(
                    WRITE_FILE,
                    json!({"path": "bc.spec", "content": "x"}),
                ))
            });

        let mut coord = coordinator(model, RepairStrategy::FullFile, CoordinatorConfig::default());
        let resp = coord.next_turn(TurnInput::Context(context())).await.unwrap();
        assert!(matches!(resp, ModelResponse::ProposedAction { .. }));
        assert_eq!(coord.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_back_off() {
        let mut model = MockChatModel::new();
        let mut seq = mockall::Sequence::new();
        model
            .expect_complete()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(ModelError::RateLimited));
        model
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatResponse::tool_call("extract_structure", json!({}))));

        let mut coord = coordinator(model, RepairStrategy::FullFile, CoordinatorConfig::default());
        let resp = coord.next_turn(TurnInput::Context(context())).await.unwrap();
        assert!(matches!(resp, ModelResponse::ToolCallRequest { .. }));
        assert_eq!(coord.calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_error_is_unavailable_without_retry() {
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .times(1)
            .returning(|_| Err(ModelError::Auth));

        let mut coord = coordinator(model, RepairStrategy::FullFile, CoordinatorConfig::default());
        let err = coord
            .next_turn(TurnInput::Context(context()))
            .await
            .unwrap_err();
        assert!(matches!(err, RepairError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_tool_budget_withdraws_query_tools() {
        let mut model = MockChatModel::new();
        model.expect_complete().returning(|req| {
            if req.tools.len() == 1 {
                assert!(req.messages.iter().any(|m| m.content.contains("Call `write_file` now")));
                Ok(ChatResponse::tool_call(
                    WRITE_FILE,
                    json!({"path": "bc.spec", "content": "x"}),
                ))
            } else {
                Ok(ChatResponse::tool_call("read_file", json!({"path": "bc.spec"})))
            }
        });

        let config = CoordinatorConfig {
            max_tool_rounds: 1,
            ..Default::default()
        };
        let mut coord = coordinator(model, RepairStrategy::FullFile, config);
        let first = coord.next_turn(TurnInput::Context(context())).await.unwrap();
        assert!(matches!(first, ModelResponse::ToolCallRequest { .. }));

        let second = coord
            .next_turn(TurnInput::ToolResult {
                name: "read_file".into(),
                output: "Name: bc".into(),
            })
            .await
            .unwrap();
        assert!(matches!(second, ModelResponse::ProposedAction { .. }));
    }

    #[tokio::test]
    async fn test_context_resets_history() {
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .returning(|_| Ok(ChatResponse::tool_call("extract_structure", json!({}))));

        let mut coord = coordinator(model, RepairStrategy::FullFile, CoordinatorConfig::default());
        coord.next_turn(TurnInput::Context(context())).await.unwrap();
        coord
            .next_turn(TurnInput::ToolResult {
                name: "extract_structure".into(),
                output: "{}".into(),
            })
            .await
            .unwrap();
        assert_eq!(coord.history().len(), 5);

        coord.next_turn(TurnInput::Context(context())).await.unwrap();
        assert_eq!(coord.history().len(), 3);
    }
}
