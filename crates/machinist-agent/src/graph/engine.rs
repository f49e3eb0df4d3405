use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use machinist_core::config::{ModelConfig, OrchestratorConfig};
use machinist_core::traits::LlmClient;
use machinist_core::types::{ProgressEvent, ProgressKind, Stage};
use machinist_tools::ToolRegistry;

use super::routing::next_stage;
use crate::executor::Executor;
use crate::planner::Planner;
use crate::state::WorkflowState;
use crate::synthesizer::Synthesizer;

/// Buffered events between the engine and a streaming consumer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Sink for progress events. Nodes emit through it; a disabled sink makes
/// the blocking path free of channel traffic.
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl EventSink {
    pub(crate) fn disabled() -> Self {
        Self { tx: None }
    }

    pub(crate) fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) async fn emit(&self, stage: Stage, kind: ProgressKind, payload: serde_json::Value) {
        if let Some(tx) = &self.tx {
            // A gone receiver is cancellation, handled between nodes.
            let _ = tx.send(ProgressEvent::new(stage, kind, payload)).await;
        }
    }

    /// True when a streaming consumer existed but has stopped listening.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}

/// Drives a turn from `planning` to a terminal stage.
///
/// Holds the node set; the conditional edges live in [`next_stage`]. Each
/// node invocation is bracketed by `started` / `completed` (or `error`)
/// progress events; the blocking [`GraphEngine::run`] simply drops them.
pub struct GraphEngine {
    planner: Planner,
    executor: Executor,
    synthesizer: Synthesizer,
    retry_ceiling: u32,
}

impl GraphEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        model: ModelConfig,
        orchestrator: &OrchestratorConfig,
    ) -> Self {
        Self {
            planner: Planner::new(
                Arc::clone(&llm),
                model.with_temperature(orchestrator.planner_temperature),
                Arc::clone(&tools),
                orchestrator.max_plan_steps,
            ),
            executor: Executor::new(Arc::clone(&llm), model.clone(), tools),
            synthesizer: Synthesizer::new(
                llm,
                model.with_temperature(orchestrator.synthesis_temperature),
                orchestrator.degraded_confidence_cap,
                orchestrator.max_repair_attempts,
            ),
            retry_ceiling: orchestrator.retry_ceiling,
        }
    }

    /// Run a turn to completion, discarding progress events.
    ///
    /// The returned state carries `final_answer` exactly when the turn
    /// reached the `done` terminal.
    pub async fn run(&self, state: WorkflowState) -> WorkflowState {
        let (state, stage) = self.drive(state, EventSink::disabled()).await;
        debug!(terminal = %stage, "Blocking run finished");
        state
    }

    /// Run a turn, emitting progress events into a finite stream.
    ///
    /// The stream is not restartable; supply a fresh state per call. Dropping
    /// the receiver cancels the turn best-effort: in-flight work finishes but
    /// nothing further is surfaced.
    pub fn run_streaming(self: &Arc<Self>, state: WorkflowState) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let (_state, stage) = engine.drive(state, EventSink::new(tx)).await;
            debug!(terminal = %stage, "Streaming run finished");
        });
        ReceiverStream::new(rx)
    }

    /// The shared drive loop. Returns the final state and terminal stage;
    /// an abandoned stream returns early with the stage it stopped at.
    pub(crate) async fn drive(
        &self,
        mut state: WorkflowState,
        sink: EventSink,
    ) -> (WorkflowState, Stage) {
        let mut stage = Stage::Planning;

        while !stage.is_terminal() {
            if sink.is_abandoned() {
                info!(stage = %stage, "Progress consumer gone; abandoning turn");
                return (state, stage);
            }

            sink.emit(stage, ProgressKind::Started, json!({})).await;

            let outcome = match stage {
                Stage::Planning => self.planner.run(&mut state).await,
                Stage::Executing => self.executor.run(&mut state, &sink).await,
                Stage::Synthesizing => self.synthesizer.run(&mut state, &sink).await,
                Stage::Done | Stage::Failed => unreachable!("terminal stage in drive loop"),
            };

            match outcome {
                Ok(payload) => {
                    sink.emit(stage, ProgressKind::Completed, payload).await;
                    stage = next_stage(stage, &state, self.retry_ceiling);
                }
                Err(e) => {
                    error!(stage = %stage, error = %e, "Workflow node failed unrecoverably");
                    sink.emit(
                        stage,
                        ProgressKind::Error,
                        json!({"message": e.to_string()}),
                    )
                    .await;
                    stage = Stage::Failed;
                }
            }
        }

        (state, stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sink_disabled_never_abandoned() {
        let sink = EventSink::disabled();
        assert!(!sink.is_abandoned());
    }

    #[tokio::test]
    async fn test_event_sink_abandoned_after_receiver_drop() {
        let (tx, rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        assert!(!sink.is_abandoned());
        drop(rx);
        assert!(sink.is_abandoned());
    }
}
