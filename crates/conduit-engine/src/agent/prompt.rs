//! System prompt composition: substitutes runtime placeholders into an
//! agent's configured instructions and appends the fixed rules every agent
//! run operates under regardless of which agent it is.

use chrono::Utc;

/// Rules injected into every composed system prompt. Fixed text rather than
/// configuration: every agent in the system follows the same interrupted-run
/// and handoff protocol so delegates can interpret each other's output.
pub const COMMON_AGENT_RULES: &str = r#"## Agent rules

- If your context budget is exhausted mid-task, do not guess at a final answer. Emit exactly one JSON object describing the interrupted state: `{"interrupted": true, "completed": [...], "remaining": [...], "notes": "..."}` and stop.
- If a tool result is truncated and ends with a "[next step]" instruction, follow that instruction on your next turn before doing anything else.
- If you receive a response from a delegated sub-agent that itself reports `"interrupted": true`, treat its `remaining` list as your own outstanding work and continue it rather than reporting the delegation as complete."#;

/// Substitutes `{{CURRENT_DATETIME}}`, `{{SESSION_CONTEXT}}`, and
/// `{{AGENT_STATS}}` placeholders into `instructions`, then appends the
/// common agent rules and an optional "Related Knowledge" section built
/// from semantic-recall snippets.
pub struct PromptComposer {
    pub session_context: Option<String>,
    pub agent_stats: Option<String>,
    pub recalled_snippets: Vec<String>,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self { session_context: None, agent_stats: None, recalled_snippets: Vec::new() }
    }
}

impl PromptComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_context(mut self, ctx: impl Into<String>) -> Self {
        self.session_context = Some(ctx.into());
        self
    }

    pub fn with_agent_stats(mut self, stats: impl Into<String>) -> Self {
        self.agent_stats = Some(stats.into());
        self
    }

    pub fn with_recalled_snippets(mut self, snippets: Vec<String>) -> Self {
        self.recalled_snippets = snippets;
        self
    }

    pub fn compose(&self, instructions: &str) -> String {
        let now = Utc::now().to_rfc3339();
        let mut body = instructions
            .replace("{{CURRENT_DATETIME}}", &now)
            .replace("{{SESSION_CONTEXT}}", self.session_context.as_deref().unwrap_or(""))
            .replace("{{AGENT_STATS}}", self.agent_stats.as_deref().unwrap_or(""));

        if !self.recalled_snippets.is_empty() {
            body.push_str("\n\n## Related Knowledge\n");
            for snippet in &self.recalled_snippets {
                body.push_str("- ");
                body.push_str(snippet);
                body.push('\n');
            }
        }

        body.push_str("\n\n");
        body.push_str(COMMON_AGENT_RULES);
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let composer = PromptComposer::new().with_session_context("cwd: /tmp").with_agent_stats("3 prior turns");
        let out = composer.compose("You work in {{SESSION_CONTEXT}}. Stats: {{AGENT_STATS}}. Now: {{CURRENT_DATETIME}}");
        assert!(out.contains("cwd: /tmp"));
        assert!(out.contains("3 prior turns"));
        assert!(!out.contains("{{CURRENT_DATETIME}}"));
        assert!(out.contains("Agent rules"));
    }

    #[test]
    fn unset_placeholders_become_empty_not_literal() {
        let composer = PromptComposer::new();
        let out = composer.compose("ctx=[{{SESSION_CONTEXT}}]");
        assert!(out.contains("ctx=[]"));
    }

    #[test]
    fn recalled_snippets_appended_as_section() {
        let composer = PromptComposer::new().with_recalled_snippets(vec!["fact one".into(), "fact two".into()]);
        let out = composer.compose("base");
        assert!(out.contains("## Related Knowledge"));
        assert!(out.contains("fact one"));
        assert!(out.contains("fact two"));
    }
}
