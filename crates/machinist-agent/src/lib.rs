//! Orchestration core — a stateful, conditionally-routed workflow that plans
//! steps, executes them against tools or free-form reasoning, and synthesizes
//! a validated structured answer, streaming progress along the way.
//!
//! A turn flows planner → executor (looped) → synthesizer; routing between
//! stages is a pure function over the workflow state, kept separate from the
//! node bodies. Failures at any stage degrade the answer instead of crashing
//! the session.

pub mod answer;
pub mod executor;
pub mod graph;
pub mod manager;
pub mod planner;
pub mod state;
pub mod synthesizer;

pub use answer::{AnswerOrigin, AnswerValidator, StructuredAnswer};
pub use executor::Executor;
pub use graph::{next_stage, GraphEngine};
pub use manager::AgentManager;
pub use planner::Planner;
pub use state::WorkflowState;
pub use synthesizer::Synthesizer;
