//! Tool-calling loop
//!
//! Generate → inspect for tool calls → execute → append results →
//! re-generate. The loop refuses to finish on a farewell alone: it stops
//! only when the model produced no tool calls, the terminal phrase is
//! present, and the required tool (if any) has succeeded at least once.
//! That predicate is what keeps "I'll call them now, goodbye!" from being
//! said before anything was actually looked up.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::CollabResult;
use crate::llm::client::{ChatMessage, ChatModel, ChatRequest, ToolDefinition};

/// Result of executing one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub content: String,
}

/// Executes tool calls issued by the model.
#[async_trait]
pub trait ToolExecutor: Send {
    async fn execute(&mut self, name: &str, arguments: &serde_json::Value) -> ToolOutcome;
}

/// Loop configuration.
pub struct ToolLoopConfig {
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub max_iterations: usize,
    pub max_tokens: u32,
    /// Phrase whose presence marks a candidate final response.
    pub terminal_phrase: Option<String>,
    /// Tool that must have succeeded before the loop may finish.
    pub required_tool: Option<String>,
    /// Message injected when the model tries to finish too early.
    pub nudge: String,
}

/// Outcome of a completed loop.
pub struct ToolLoopResult {
    pub final_response: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    /// False when the loop hit its iteration cap or a repetition guard.
    pub success: bool,
}

/// Run the loop against `model`, executing calls through `executor`.
pub async fn run_tool_loop(
    model: &dyn ChatModel,
    initial_messages: Vec<ChatMessage>,
    config: &ToolLoopConfig,
    executor: &mut dyn ToolExecutor,
) -> CollabResult<ToolLoopResult> {
    let mut messages = vec![ChatMessage::system(&config.system_prompt)];
    messages.extend(initial_messages);

    let mut iteration = 0;
    let mut total_tool_calls = 0;
    let mut required_satisfied = config.required_tool.is_none();
    let mut seen_calls: HashSet<String> = HashSet::new();
    let mut consecutive_dupes = 0;
    const MAX_CONSECUTIVE_DUPES: usize = 2;

    loop {
        iteration += 1;
        if iteration > config.max_iterations {
            warn!("tool loop hit iteration cap");
            return Ok(ToolLoopResult {
                final_response: String::new(),
                iterations: iteration - 1,
                tool_calls_made: total_tool_calls,
                success: false,
            });
        }

        let response = model
            .chat(ChatRequest {
                messages: messages.clone(),
                tools: config.tools.clone(),
                temperature: 0.0,
                max_tokens: config.max_tokens,
            })
            .await?;

        if response.tool_calls.is_empty() {
            let text = response.text.trim().to_string();
            let phrase_ok = config
                .terminal_phrase
                .as_ref()
                .map(|phrase| text.to_lowercase().contains(&phrase.to_lowercase()))
                .unwrap_or(true);

            if phrase_ok && required_satisfied {
                return Ok(ToolLoopResult {
                    final_response: text,
                    iterations: iteration,
                    tool_calls_made: total_tool_calls,
                    success: true,
                });
            }

            // Trying to wrap up without having done the work.
            debug!(phrase_ok, required_satisfied, "premature finish, nudging");
            messages.push(ChatMessage::assistant(text));
            messages.push(ChatMessage::user(&config.nudge));
            continue;
        }

        total_tool_calls += response.tool_calls.len();
        messages.push(ChatMessage::assistant_tool_calls(
            if response.text.is_empty() { None } else { Some(response.text.clone()) },
            response.tool_calls.clone(),
        ));

        // Repetition guard: a model reissuing identical calls is stuck.
        let call_keys: Vec<String> = response
            .tool_calls
            .iter()
            .map(|call| format!("{}:{}", call.name, call.arguments))
            .collect();
        if call_keys.iter().all(|key| seen_calls.contains(key)) {
            consecutive_dupes += 1;
            if consecutive_dupes >= MAX_CONSECUTIVE_DUPES {
                warn!("tool loop repeating identical calls, stopping");
                return Ok(ToolLoopResult {
                    final_response: String::new(),
                    iterations: iteration,
                    tool_calls_made: total_tool_calls,
                    success: false,
                });
            }
        } else {
            consecutive_dupes = 0;
        }
        seen_calls.extend(call_keys);

        for call in &response.tool_calls {
            let outcome = executor.execute(&call.name, &call.arguments).await;
            if outcome.success && Some(&call.name) == config.required_tool.as_ref() {
                required_satisfied = true;
            }
            messages.push(ChatMessage::tool_result(&call.id, &outcome.content));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::{ChatOutcome, ToolCall};
    use std::sync::Mutex;

    /// Scripted model: pops one outcome per chat call.
    struct ScriptedModel {
        script: Mutex<Vec<ChatOutcome>>,
    }

    impl ScriptedModel {
        fn new(mut outcomes: Vec<ChatOutcome>) -> Self {
            outcomes.reverse();
            Self { script: Mutex::new(outcomes) }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(&self, _request: ChatRequest) -> CollabResult<ChatOutcome> {
            Ok(self.script.lock().unwrap().pop().unwrap_or_default())
        }
    }

    struct RecordingExecutor {
        calls: Vec<String>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(&mut self, name: &str, _arguments: &serde_json::Value) -> ToolOutcome {
            self.calls.push(name.to_string());
            ToolOutcome { success: true, content: format!("{name} ok") }
        }
    }

    fn tool_call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    fn config(required_tool: Option<&str>, terminal_phrase: Option<&str>) -> ToolLoopConfig {
        ToolLoopConfig {
            system_prompt: "You coordinate appointments.".into(),
            tools: vec![],
            max_iterations: 6,
            max_tokens: 200,
            terminal_phrase: terminal_phrase.map(String::from),
            required_tool: required_tool.map(String::from),
            nudge: "Look up the appointment before finishing.".into(),
        }
    }

    #[tokio::test]
    async fn finishes_when_predicate_satisfied() {
        let model = ScriptedModel::new(vec![
            ChatOutcome {
                text: String::new(),
                tool_calls: vec![tool_call("1", "lookup_appointment")],
            },
            ChatOutcome {
                text: "Found it. Proceed?".into(),
                tool_calls: vec![],
            },
        ]);
        let mut executor = RecordingExecutor { calls: vec![] };
        let result = run_tool_loop(
            &model,
            vec![ChatMessage::user("I'm running late for James")],
            &config(Some("lookup_appointment"), Some("proceed")),
            &mut executor,
        )
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(result.final_response, "Found it. Proceed?");
        assert_eq!(executor.calls, vec!["lookup_appointment"]);
    }

    #[tokio::test]
    async fn nudges_on_farewell_before_side_effects() {
        let model = ScriptedModel::new(vec![
            // Tries to say goodbye without looking anything up.
            ChatOutcome { text: "Okay, proceed, bye!".into(), tool_calls: vec![] },
            ChatOutcome {
                text: String::new(),
                tool_calls: vec![tool_call("1", "lookup_appointment")],
            },
            ChatOutcome { text: "Found it. Proceed?".into(), tool_calls: vec![] },
        ]);
        let mut executor = RecordingExecutor { calls: vec![] };
        let result = run_tool_loop(
            &model,
            vec![ChatMessage::user("late for James")],
            &config(Some("lookup_appointment"), Some("proceed")),
            &mut executor,
        )
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(result.tool_calls_made, 1);
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn repetition_guard_stops_stuck_models() {
        let same_call = ChatOutcome {
            text: String::new(),
            tool_calls: vec![tool_call("1", "lookup_appointment")],
        };
        let model = ScriptedModel::new(vec![
            same_call.clone(),
            same_call.clone(),
            same_call.clone(),
            same_call,
        ]);
        let mut executor = RecordingExecutor { calls: vec![] };
        let result = run_tool_loop(
            &model,
            vec![ChatMessage::user("late")],
            &config(None, None),
            &mut executor,
        )
        .await
        .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn iteration_cap_is_enforced() {
        let forever = ChatOutcome { text: "not done".into(), tool_calls: vec![] };
        let model = ScriptedModel::new(vec![forever.clone(); 10]);
        let mut executor = RecordingExecutor { calls: vec![] };
        let mut cfg = config(Some("lookup_appointment"), None);
        cfg.max_iterations = 3;
        let result = run_tool_loop(&model, vec![ChatMessage::user("late")], &cfg, &mut executor)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
    }
}
