use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::SessionStore;
use machinist_core::types::{ChatMessage, ProgressEvent, ProgressKind, SessionId, Stage};

use crate::answer::StructuredAnswer;
use crate::graph::engine::EventSink;
use crate::graph::GraphEngine;
use crate::state::WorkflowState;

/// Buffered events between a turn and its streaming consumer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Session-facing wrapper around the graph engine.
///
/// Owns conversation memory across turns: each call builds a fresh
/// `WorkflowState` from the session's history, runs the engine, and commits
/// the turn back to the store on success. A failed turn yields a fixed
/// fallback answer rather than an error; only store failures surface hard.
///
/// Concurrent turns on the same session are serialized through a per-session
/// lock so history append-order is preserved; distinct sessions run freely
/// in parallel.
pub struct AgentManager {
    engine: Arc<GraphEngine>,
    store: Arc<dyn SessionStore>,
    history_window: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentManager {
    pub fn new(
        engine: Arc<GraphEngine>,
        store: Arc<dyn SessionStore>,
        history_window: usize,
    ) -> Self {
        Self {
            engine,
            store,
            history_window,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The single-writer lock for a session.
    async fn session_lock(&self, sid: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(sid.0.clone()).or_default().clone()
    }

    /// Run one turn to completion and return the structured answer.
    pub async fn invoke(&self, query: &str, sid: &SessionId) -> Result<StructuredAnswer> {
        let lock = self.session_lock(sid).await;
        let _guard = lock.lock().await;

        info!(session_id = %sid, "Turn started");

        let history = self
            .store
            .history(sid, self.history_window)
            .await
            .map_err(session_failure)?;

        let state = WorkflowState::new(query, history);
        let state = self.engine.run(state).await;

        match state.into_final_answer() {
            Some(answer) => {
                self.commit(sid, query, &answer).await?;
                Ok(answer)
            }
            None => {
                warn!(session_id = %sid, "Turn failed; returning fallback answer");
                Ok(StructuredAnswer::fallback())
            }
        }
    }

    /// Run one turn, streaming progress events. The stream always ends with
    /// a final `completed` event carrying the structured result — real on
    /// success, the fallback on failure.
    ///
    /// Dropping the stream cancels the turn best-effort; nothing is
    /// committed to session memory for an abandoned turn.
    pub fn stream(self: &Arc<Self>, query: &str, sid: &SessionId) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let manager = Arc::clone(self);
        let query = query.to_string();
        let sid = sid.clone();

        tokio::spawn(async move {
            let lock = manager.session_lock(&sid).await;
            let _guard = lock.lock().await;

            let history = match manager.store.history(&sid, manager.history_window).await {
                Ok(h) => h,
                Err(e) => {
                    error!(session_id = %sid, error = %e, "Session store unavailable");
                    let _ = tx
                        .send(ProgressEvent::new(
                            Stage::Failed,
                            ProgressKind::Error,
                            json!({"message": MachinistError::Session(e.to_string()).to_string()}),
                        ))
                        .await;
                    return;
                }
            };

            let state = WorkflowState::new(&query, history);
            let (state, _stage) = manager
                .engine
                .drive(state, EventSink::new(tx.clone()))
                .await;

            match state.into_final_answer() {
                Some(answer) => {
                    let payload = serde_json::to_value(&answer).unwrap_or_default();
                    let event = ProgressEvent::new(Stage::Done, ProgressKind::Completed, payload);
                    // A failed send means the consumer abandoned the stream:
                    // treat the turn as cancelled and commit nothing.
                    if tx.send(event).await.is_ok() {
                        if let Err(e) = manager.commit(&sid, &query, &answer).await {
                            error!(session_id = %sid, error = %e, "Failed to commit turn");
                            let _ = tx
                                .send(ProgressEvent::new(
                                    Stage::Failed,
                                    ProgressKind::Error,
                                    json!({"message": e.to_string()}),
                                ))
                                .await;
                        }
                    }
                }
                None => {
                    let fallback = StructuredAnswer::fallback();
                    let payload = serde_json::to_value(&fallback).unwrap_or_default();
                    let _ = tx
                        .send(ProgressEvent::new(
                            Stage::Done,
                            ProgressKind::Completed,
                            payload,
                        ))
                        .await;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Discard a session's history unconditionally. Idempotent.
    pub async fn clear(&self, sid: &SessionId) -> Result<()> {
        let lock = self.session_lock(sid).await;
        let _guard = lock.lock().await;
        info!(session_id = %sid, "Clearing session memory");
        self.store.clear(sid).await.map_err(session_failure)
    }

    /// Append one completed turn to session memory.
    async fn commit(&self, sid: &SessionId, query: &str, answer: &StructuredAnswer) -> Result<()> {
        let turn = [
            ChatMessage::user(query),
            ChatMessage::assistant(&answer.answer),
        ];
        self.store
            .append(sid, &turn)
            .await
            .map_err(session_failure)
    }
}

/// Store failures are the one class surfaced to callers as hard errors.
fn session_failure(e: MachinistError) -> MachinistError {
    match e {
        MachinistError::Session(_) => e,
        other => MachinistError::Session(other.to_string()),
    }
}
