use std::io::Write;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::cancellation::{CancellationRegistry, OperationCancelled};
use super::budget::{estimate_tokens, BudgetAccountant, BudgetState, HARD_STOP_DIRECTIVE, WARN_DIRECTIVE};
use super::registry::ToolRegistry;
use super::tracker::ToolCallTracker;

pub const MAX_TOOL_OUTPUT_CHARS: usize = 50_000;

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub text: String,
    /// True once the budget has been exhausted and no further tool calls
    /// should be issued this run.
    pub blocked: bool,
}

/// Ties the registry, loop tracker, and budget accountant together behind
/// the §4.2 invocation contract. One instance per agent run.
pub struct ToolDispatcher {
    pub registry: std::sync::Arc<ToolRegistry>,
    pub spill_dir: PathBuf,
    pub max_output_chars: usize,
}

impl ToolDispatcher {
    pub fn new(registry: std::sync::Arc<ToolRegistry>) -> Self {
        Self { registry, spill_dir: std::env::temp_dir(), max_output_chars: MAX_TOOL_OUTPUT_CHARS }
    }

    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: Value,
        tracker: &mut ToolCallTracker,
        budget: &mut BudgetAccountant,
        cancellation: &CancellationRegistry,
        job_id: &str,
    ) -> Result<DispatchOutcome, OperationCancelled> {
        cancellation.check(job_id)?;

        if budget.is_exhausted() {
            return Ok(DispatchOutcome { text: HARD_STOP_DIRECTIVE.to_string(), blocked: true });
        }

        if tracker.would_loop(tool_name, &args) {
            let text = format!(
                "[loop detected] The call `{tool_name}` with these exact arguments has been repeated too many times. Try a different approach instead of repeating it."
            );
            cancellation.check(job_id)?;
            return Ok(DispatchOutcome { text, blocked: false });
        }

        let span = info_span!("tool_dispatch", tool = tool_name);
        let raw = async {
            match self.registry.get(tool_name) {
                Some(tool) => tool.call(args.clone()).await.unwrap_or_else(|e| format!("[tool error] {e}")),
                None => format!("[tool error] unknown tool: {tool_name}"),
            }
        }
        .instrument(span)
        .await;

        tracker.record(tool_name, &args);

        let spilled = self.spill_if_needed(tool_name, &raw);
        let state = budget.record(&spilled);

        let text = match state {
            BudgetState::Ok => spilled,
            BudgetState::Warn => format!("{spilled}\n\n{WARN_DIRECTIVE}"),
            BudgetState::Exhausted => format!("{spilled}\n\n{HARD_STOP_DIRECTIVE}"),
        };

        cancellation.check(job_id)?;

        Ok(DispatchOutcome { text, blocked: state == BudgetState::Exhausted })
    }

    /// Spills output exceeding `max_output_chars` to a temp file and returns
    /// a preview plus a `read_file` continuation pointer. Exactly
    /// `max_output_chars` is NOT spilled; `max_output_chars + 1` is.
    fn spill_if_needed(&self, tool_name: &str, raw: &str) -> String {
        if raw.chars().count() <= self.max_output_chars {
            return raw.to_string();
        }
        let preview: String = raw.chars().take(2_000).collect();
        let file_name = format!("conduit-tool-output-{}-{}.txt", tool_name, uuid::Uuid::new_v4());
        let path = self.spill_dir.join(file_name);
        if let Ok(mut f) = std::fs::File::create(&path) {
            let _ = f.write_all(raw.as_bytes());
        }
        format!(
            "[output truncated: {} chars total, {} shown]\n{preview}\n\n[next step] The full output was saved to {}. Call read_file({{\"path\": \"{}\"}}) to continue reading from where this preview left off.",
            raw.chars().count(),
            preview.chars().count(),
            path.display(),
            path.display(),
        )
    }
}

pub fn estimate_text_tokens(s: &str) -> u64 {
    estimate_tokens(s)
}
