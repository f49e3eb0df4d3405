use machinist_core::types::Stage;

use crate::state::WorkflowState;

/// Decide the stage that follows `current`, given the state it produced.
///
/// Pure: no I/O, no clock, no LLM. Unrecoverable node errors are routed to
/// `Failed` by the engine before this function is consulted.
pub fn next_stage(current: Stage, state: &WorkflowState, retry_ceiling: u32) -> Stage {
    match current {
        Stage::Planning => match state.plan() {
            // A populated plan goes to execution; the explicit empty plan
            // falls through to direct synthesis.
            Some(plan) if !plan.is_empty() => Stage::Executing,
            Some(_) => Stage::Synthesizing,
            // The planner returned without installing any plan: nothing the
            // rest of the graph could act on.
            None => Stage::Failed,
        },
        Stage::Executing => {
            // Partial results are still synthesized when the ceiling trips —
            // never silently dropped.
            if state.has_pending_steps() && state.retry_count() < retry_ceiling {
                Stage::Executing
            } else {
                Stage::Synthesizing
            }
        }
        Stage::Synthesizing => {
            if state.final_answer().is_some() {
                Stage::Done
            } else {
                Stage::Failed
            }
        }
        terminal => terminal,
    }
}
