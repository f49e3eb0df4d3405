use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use machinist_core::config::ModelConfig;
use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::LlmClient;
use machinist_core::types::{ChatMessage, ErrorStage, ProgressKind, Stage, StepStatus};

use crate::answer::{AnswerValidator, StructuredAnswer};
use crate::graph::engine::EventSink;
use crate::state::WorkflowState;

/// Synthesizer node — folds the accumulated step results into one validated
/// structured answer.
///
/// The first attempt streams (token events); validation failures trigger up
/// to `max_repair_attempts` corrective retries. A degraded turn gets its
/// confidence clamped and a caveat appended regardless of what the model
/// claimed.
pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    validator: AnswerValidator,
    degraded_cap: f64,
    max_repair_attempts: u32,
}

impl Synthesizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        degraded_cap: f64,
        max_repair_attempts: u32,
    ) -> Self {
        Self {
            llm,
            model,
            validator: AnswerValidator::new(),
            degraded_cap,
            max_repair_attempts,
        }
    }

    pub(crate) async fn run(
        &self,
        state: &mut WorkflowState,
        sink: &EventSink,
    ) -> Result<serde_json::Value> {
        let mut messages = self.build_prompt(state);
        let mut last_issue = String::from("no synthesis attempt succeeded");

        for attempt in 0..=self.max_repair_attempts {
            let text = if attempt == 0 {
                self.stream_attempt(&messages, sink).await
            } else {
                self.llm.complete(&self.model, messages.clone()).await
            };

            let text = match text {
                Ok(t) => t,
                Err(e) => {
                    warn!(attempt, error = %e, "Synthesis LLM call failed");
                    state.record_error(ErrorStage::Synthesize, e.to_string());
                    last_issue = e.to_string();
                    continue;
                }
            };

            match self.validator.validate(&text) {
                Ok(mut answer) => {
                    // Degradation is enforced here, not trusted to the model:
                    // any error or non-ok step caps confidence and annotates
                    // the answer.
                    if state.is_degraded() {
                        apply_degradation(&mut answer, state, self.degraded_cap);
                    }
                    info!(
                        confidence = answer.confidence,
                        sources = answer.sources.len(),
                        attempt,
                        "Answer synthesized"
                    );
                    let payload = serde_json::to_value(&answer)?;
                    state.set_final_answer(answer)?;
                    return Ok(payload);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Synthesis output failed validation");
                    state.record_error(ErrorStage::Synthesize, e.to_string());
                    last_issue = e.to_string();
                    messages.push(ChatMessage::assistant(text));
                    messages.push(ChatMessage::user(format!(
                        "That response was rejected: {}. Respond again with ONLY the \
                         corrected JSON object and nothing else.",
                        e
                    )));
                }
            }
        }

        Err(MachinistError::Validation(format!(
            "no valid answer after {} attempts: {}",
            self.max_repair_attempts + 1,
            last_issue
        )))
    }

    /// Stream one synthesis attempt, emitting token events as fragments
    /// arrive, and return the accumulated text.
    async fn stream_attempt(&self, messages: &[ChatMessage], sink: &EventSink) -> Result<String> {
        let mut stream = self
            .llm
            .stream_complete(&self.model, messages.to_vec())
            .await?;

        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            sink.emit(
                Stage::Synthesizing,
                ProgressKind::Token,
                json!({ "text": fragment }),
            )
            .await;
            text.push_str(&fragment);
        }
        Ok(text)
    }

    fn build_prompt(&self, state: &WorkflowState) -> Vec<ChatMessage> {
        let mut system = String::from(
            "You are the synthesis stage of an assistant that answers questions \
             about machines from their documentation. Combine the executed plan's \
             results into one final answer for the user.\n\
             Respond with ONLY a JSON object of this exact shape:\n\
             {\"answer\": \"...\", \"sources\": [\"...\"], \"confidence\": 0.0, \
             \"follow_up\": \"...\" or null, \
             \"origin\": \"manual\" | \"web_search\" | \"general_knowledge\" | \"mixed\" | \"none\"}\n\
             - \"sources\" lists the source identifiers of the manual passages or \
             URLs the answer relies on, in order of importance\n\
             - \"confidence\" is a number in [0, 1] reflecting how well the results \
             support the answer\n\
             - \"origin\" names where the answer primarily came from",
        );

        if state.is_degraded() {
            let failures: Vec<String> = state
                .error_log()
                .iter()
                .map(|e| format!("[{}] {}", e.stage, e.message))
                .collect();
            system.push_str(&format!(
                "\n\nSome steps failed while researching this answer:\n{}\n\
                 Acknowledge in the answer that the information may be incomplete \
                 and keep confidence low.",
                failures.join("\n")
            ));
        }

        let plan_summary = match state.plan() {
            Some(plan) if !plan.is_empty() => plan
                .iter()
                .map(|s| match &s.suggested_tool {
                    Some(tool) => format!("{}. {} ({})", s.step_id + 1, s.description, tool),
                    None => format!("{}. {}", s.step_id + 1, s.description),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "No plan was needed; answer directly.".to_string(),
        };

        let results = if state.completed_steps().is_empty() {
            "(no step results)".to_string()
        } else {
            state
                .completed_steps()
                .iter()
                .map(|s| {
                    let tool = s.tool_used.as_deref().unwrap_or("reasoning");
                    format!(
                        "--- step {} ({}, {:?}) ---\n{}",
                        s.step_id + 1,
                        tool,
                        s.status,
                        truncate(&s.raw_output, 4000)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(state.history().iter().cloned());
        messages.push(ChatMessage::user(format!(
            "Question: {}\n\nExecuted plan:\n{}\n\nStep results:\n{}\n\n\
             Provide the final structured answer.",
            state.query(),
            plan_summary,
            results
        )));
        messages
    }
}

/// Bound step output carried into the synthesis prompt.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}… [truncated]", cut)
}

/// Clamp confidence and annotate the answer for a degraded turn.
fn apply_degradation(answer: &mut StructuredAnswer, state: &WorkflowState, cap: f64) {
    answer.confidence = answer.confidence.min(cap);

    let caveat = caveat_line(state);
    if !answer.answer.contains("may be incomplete") {
        answer.answer.push_str("\n\n");
        answer.answer.push_str(&caveat);
    }
}

fn caveat_line(state: &WorkflowState) -> String {
    let failed_steps = state
        .completed_steps()
        .iter()
        .filter(|s| s.status != StepStatus::Ok)
        .count();
    format!(
        "Note: {} issue(s) occurred while researching this ({} step(s) degraded), \
         so the answer may be incomplete.",
        state.error_log().len(),
        failed_steps
    )
}
