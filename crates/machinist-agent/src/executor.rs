use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use machinist_core::config::ModelConfig;
use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::LlmClient;
use machinist_core::types::{
    ChatMessage, CompletedStep, ErrorStage, PlanStep, ProgressKind, Stage, StepStatus,
};
use machinist_tools::ToolRegistry;

use crate::graph::engine::EventSink;
use crate::state::WorkflowState;

/// Executor node — consumes exactly one pending step per invocation.
///
/// Draining the plan one step at a time keeps progress observable between
/// steps and lets the engine check the retry ceiling on each loop edge. Tool
/// failures are recovered locally: log, count, substitute free-form
/// reasoning. A node-level error here means the engine entered with no
/// pending step, which the routing never does.
pub struct Executor {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    tools: Arc<ToolRegistry>,
}

impl Executor {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig, tools: Arc<ToolRegistry>) -> Self {
        Self { llm, model, tools }
    }

    pub(crate) async fn run(
        &self,
        state: &mut WorkflowState,
        sink: &EventSink,
    ) -> Result<serde_json::Value> {
        let step = state
            .next_step()
            .cloned()
            .ok_or_else(|| MachinistError::Execution("executor entered with no pending step".into()))?;

        info!(
            step_id = step.step_id,
            total = state.plan_len(),
            tool = step.suggested_tool.as_deref().unwrap_or("-"),
            "Executing plan step"
        );

        let record = match &step.suggested_tool {
            Some(tool) => self.run_tool_step(state, &step, tool, sink).await,
            None => self.run_reasoning_step(state, &step).await,
        };

        let payload = json!({
            "step_id": record.step_id,
            "status": record.status,
            "tool": record.tool_used.clone(),
        });
        state.record_step(record)?;

        Ok(payload)
    }

    async fn run_tool_step(
        &self,
        state: &mut WorkflowState,
        step: &PlanStep,
        tool: &str,
        sink: &EventSink,
    ) -> CompletedStep {
        let input = json!({ "query": step.description });
        sink.emit(
            Stage::Executing,
            ProgressKind::ToolCall,
            json!({ "step_id": step.step_id, "tool": tool, "input": input }),
        )
        .await;

        let failure = match self.tools.execute(tool, input).await {
            Ok(result) if !result.is_error => {
                return CompletedStep {
                    step_id: step.step_id,
                    tool_used: Some(tool.to_string()),
                    raw_output: result.content,
                    status: StepStatus::Ok,
                };
            }
            Ok(result) => result.content,
            Err(e) => e.to_string(),
        };

        // Recoverable per-step failure: substitute free-form reasoning.
        warn!(tool, error = %failure, "Tool failed; substituting free-form reasoning");
        state.record_error(
            ErrorStage::Execute,
            format!("tool '{}' failed: {}", tool, failure),
        );
        state.bump_retry();

        match self.reason(state, step).await {
            Ok(text) => CompletedStep {
                step_id: step.step_id,
                tool_used: Some(tool.to_string()),
                raw_output: text,
                status: StepStatus::Fallback,
            },
            Err(e) => {
                warn!(error = %e, "Reasoning fallback also failed");
                state.record_error(
                    ErrorStage::Execute,
                    format!("reasoning fallback failed: {}", e),
                );
                CompletedStep {
                    step_id: step.step_id,
                    tool_used: Some(tool.to_string()),
                    raw_output: format!("step could not be completed: {}", e),
                    status: StepStatus::Failed,
                }
            }
        }
    }

    async fn run_reasoning_step(
        &self,
        state: &mut WorkflowState,
        step: &PlanStep,
    ) -> CompletedStep {
        match self.reason(state, step).await {
            Ok(text) => CompletedStep {
                step_id: step.step_id,
                tool_used: None,
                raw_output: text,
                status: StepStatus::Ok,
            },
            Err(e) => {
                warn!(error = %e, "Free-form reasoning step failed");
                state.record_error(ErrorStage::Execute, e.to_string());
                state.bump_retry();
                CompletedStep {
                    step_id: step.step_id,
                    tool_used: None,
                    raw_output: format!("step could not be completed: {}", e),
                    status: StepStatus::Failed,
                }
            }
        }
    }

    /// Free-form reasoning over one step, given the previous step's output.
    async fn reason(&self, state: &WorkflowState, step: &PlanStep) -> Result<String> {
        let previous = state
            .completed_steps()
            .last()
            .map(|s| s.raw_output.as_str())
            .unwrap_or("(none)");

        let messages = vec![
            ChatMessage::system(
                "You are executing one step of a plan to answer a question about a \
                 machine. Complete the step using what you know and any previous \
                 step output. Reply with the step's result only.",
            ),
            ChatMessage::user(format!(
                "Question: {}\nPlan step: {}\nPrevious step output: {}",
                state.query(),
                step.description,
                previous
            )),
        ];

        self.llm.complete(&self.model, messages).await
    }
}
