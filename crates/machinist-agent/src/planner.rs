use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use machinist_core::config::ModelConfig;
use machinist_core::error::Result;
use machinist_core::traits::LlmClient;
use machinist_core::types::{ChatMessage, ErrorStage, PlanStep};
use machinist_tools::ToolRegistry;

use crate::state::WorkflowState;

/// The keyword a model replies with when no lookup is needed.
const DIRECT_MARKER: &str = "ANSWER_DIRECTLY";

/// Planner node — turns the query and history into an ordered step plan.
///
/// Planning never aborts the turn: an LLM failure or an unparseable plan
/// falls back to a single free-form reasoning step with the failure logged.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    tools: Arc<ToolRegistry>,
    max_steps: usize,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        tools: Arc<ToolRegistry>,
        max_steps: usize,
    ) -> Self {
        Self {
            llm,
            model,
            tools,
            max_steps,
        }
    }

    pub(crate) async fn run(&self, state: &mut WorkflowState) -> Result<serde_json::Value> {
        let messages = self.build_prompt(state);
        let tool_names: Vec<String> = self.tools.list().iter().map(|s| s.to_string()).collect();

        match self.llm.complete(&self.model, messages).await {
            Ok(text) => match parse_plan(&text, &tool_names, self.max_steps) {
                ParsedPlan::Direct => {
                    info!("Planner chose to answer directly");
                    state.set_plan(vec![])?;
                }
                ParsedPlan::Steps(steps) => {
                    info!(steps = steps.len(), "Plan generated");
                    state.set_plan(steps)?;
                }
                ParsedPlan::Unparseable => {
                    warn!(
                        response = %text.chars().take(200).collect::<String>(),
                        "Planner produced an unparseable plan; using a free-form step"
                    );
                    state.record_error(ErrorStage::Plan, "plan output was unparseable");
                    state.set_plan(vec![fallback_step()])?;
                }
            },
            Err(e) => {
                warn!(error = %e, "Planner LLM call failed; using a free-form step");
                state.record_error(ErrorStage::Plan, e.to_string());
                state.set_plan(vec![fallback_step()])?;
            }
        }

        Ok(json!({ "steps": state.plan_len() }))
    }

    fn build_prompt(&self, state: &WorkflowState) -> Vec<ChatMessage> {
        let tool_lines: String = self
            .tools
            .definitions()
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "You are the planning stage of an assistant that answers questions about \
             machines from their documentation.\n\
             Available tools:\n{}\n\n\
             Produce a short plan for answering the user's question. Reply with \
             'PLAN:' followed by a numbered list of at most {} steps, one per line. \
             When a step should use a tool, put the tool name in parentheses at the \
             end of the line, e.g. '1. Look up the reset procedure (manual_lookup)'.\n\
             Prefer manual_lookup for anything about machine operation, \
             specifications, error codes, or troubleshooting. If the question needs \
             no lookup at all, reply with exactly '{}' and nothing else.",
            if tool_lines.is_empty() {
                "(none)".to_string()
            } else {
                tool_lines
            },
            self.max_steps,
            DIRECT_MARKER,
        );

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(state.history().iter().cloned());
        messages.push(ChatMessage::user(state.query()));
        messages
    }
}

/// A step substituted when planning itself failed.
fn fallback_step() -> PlanStep {
    PlanStep {
        step_id: 0,
        description: "Answer the user's question directly from general knowledge.".into(),
        suggested_tool: None,
    }
}

enum ParsedPlan {
    /// Explicit answer-directly signal; synthesize with no steps.
    Direct,
    Steps(Vec<PlanStep>),
    Unparseable,
}

/// Parse the model's plan text into steps.
///
/// Accepts numbered lines (`1. ...`), extracting a registered tool name from
/// a trailing `(tool)` annotation. Unnumbered prose is ignored.
fn parse_plan(text: &str, tool_names: &[String], max_steps: usize) -> ParsedPlan {
    if text
        .lines()
        .any(|l| l.trim().trim_end_matches('.') == DIRECT_MARKER)
    {
        return ParsedPlan::Direct;
    }

    let body = match text.split_once("PLAN:") {
        Some((_, rest)) => rest,
        None => text,
    };

    let mut steps = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        let Some(description) = strip_number_prefix(line) else {
            continue;
        };

        let (description, suggested_tool) = extract_tool(description, tool_names);
        if description.is_empty() {
            continue;
        }

        steps.push(PlanStep {
            step_id: steps.len(),
            description,
            suggested_tool,
        });

        if steps.len() == max_steps {
            break;
        }
    }

    if steps.is_empty() {
        ParsedPlan::Unparseable
    } else {
        ParsedPlan::Steps(steps)
    }
}

/// Strip a leading `N.` or `N)` numbering, returning the rest.
fn strip_number_prefix(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .map(str::trim)
}

/// Pull a `(tool_name)` annotation out of a step description, if the name is
/// registered.
fn extract_tool(description: &str, tool_names: &[String]) -> (String, Option<String>) {
    for name in tool_names {
        let annotation = format!("({})", name);
        if let Some(pos) = description.find(&annotation) {
            let mut cleaned = String::new();
            cleaned.push_str(description[..pos].trim_end());
            cleaned.push_str(&description[pos + annotation.len()..]);
            return (
                cleaned.trim().trim_end_matches(':').trim().to_string(),
                Some(name.clone()),
            );
        }
    }
    (description.trim().to_string(), None)
}
