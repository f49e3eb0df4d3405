use machinist_core::error::{MachinistError, Result};
use machinist_core::types::{
    ChatMessage, CompletedStep, ErrorEntry, ErrorStage, PlanStep, StepStatus,
};

use crate::answer::StructuredAnswer;

/// The single mutable record threaded through a turn's workflow.
///
/// Owned exclusively by one in-flight graph execution; moved in, mutated in
/// place by each node, and consumed when the turn ends. The mutators enforce
/// the turn invariants: the plan is set at most once, completed steps never
/// outnumber planned steps, and the final answer is set exactly once.
#[derive(Debug)]
pub struct WorkflowState {
    query: String,
    history: Vec<ChatMessage>,
    plan: Option<Vec<PlanStep>>,
    completed_steps: Vec<CompletedStep>,
    error_log: Vec<ErrorEntry>,
    retry_count: u32,
    final_answer: Option<StructuredAnswer>,
}

impl WorkflowState {
    /// Fresh state for one turn. History is carried over from session memory.
    pub fn new(query: impl Into<String>, history: Vec<ChatMessage>) -> Self {
        Self {
            query: query.into(),
            history,
            plan: None,
            completed_steps: Vec::new(),
            error_log: Vec::new(),
            retry_count: 0,
            final_answer: None,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn plan(&self) -> Option<&[PlanStep]> {
        self.plan.as_deref()
    }

    /// Install the plan. An empty plan is the explicit answer-directly signal.
    pub fn set_plan(&mut self, steps: Vec<PlanStep>) -> Result<()> {
        if self.plan.is_some() {
            return Err(MachinistError::Planning(
                "plan already set for this turn".into(),
            ));
        }
        self.plan = Some(steps);
        Ok(())
    }

    pub fn plan_len(&self) -> usize {
        self.plan.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// The next pending step, if any. Steps are consumed front-to-back.
    pub fn next_step(&self) -> Option<&PlanStep> {
        self.plan.as_ref()?.get(self.completed_steps.len())
    }

    pub fn has_pending_steps(&self) -> bool {
        self.next_step().is_some()
    }

    /// Record the outcome of one consumed step.
    pub fn record_step(&mut self, step: CompletedStep) -> Result<()> {
        if self.completed_steps.len() >= self.plan_len() {
            return Err(MachinistError::Execution(
                "completed steps would exceed the plan".into(),
            ));
        }
        self.completed_steps.push(step);
        Ok(())
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed_steps
    }

    pub fn record_error(&mut self, stage: ErrorStage, message: impl Into<String>) {
        self.error_log.push(ErrorEntry {
            stage,
            message: message.into(),
        });
    }

    pub fn error_log(&self) -> &[ErrorEntry] {
        &self.error_log
    }

    /// Count one recoverable per-step failure toward the turn's ceiling.
    pub fn bump_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether any failure has touched this turn. Degraded turns get their
    /// answer confidence capped and a caveat appended.
    pub fn is_degraded(&self) -> bool {
        !self.error_log.is_empty()
            || self
                .completed_steps
                .iter()
                .any(|s| s.status != StepStatus::Ok)
    }

    /// Install the final answer. Only the synthesizer calls this, once.
    pub fn set_final_answer(&mut self, answer: StructuredAnswer) -> Result<()> {
        if self.final_answer.is_some() {
            return Err(MachinistError::Validation(
                "final answer already set for this turn".into(),
            ));
        }
        self.final_answer = Some(answer);
        Ok(())
    }

    pub fn final_answer(&self) -> Option<&StructuredAnswer> {
        self.final_answer.as_ref()
    }

    /// Consume the state, yielding the answer if the turn reached `done`.
    pub fn into_final_answer(self) -> Option<StructuredAnswer> {
        self.final_answer
    }
}
