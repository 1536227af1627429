//! Picks which agents participate in a run based on the task's analyzed
//! scores, so cheap tasks don't pay for the full agent roster.

use std::collections::HashMap;

use conduit_kernel::{AgentRule, Depth, OptimizerConfig, TaskScores};

pub struct AgentSelector {
    thresholds: conduit_kernel::Thresholds,
    rules: HashMap<String, AgentRule>,
}

impl AgentSelector {
    pub fn new(config: &OptimizerConfig, rules: HashMap<String, AgentRule>) -> Self {
        Self { thresholds: config.thresholds.clone(), rules }
    }

    pub fn reload(&mut self, config: &OptimizerConfig, rules: HashMap<String, AgentRule>) {
        self.thresholds = config.thresholds.clone();
        self.rules = rules;
    }

    pub fn select(&self, scores: &TaskScores, available_agents: &[String]) -> conduit_kernel::SelectionResult {
        let total_score = scores.total();
        let depth = self.determine_depth(total_score);

        let mut selected = Vec::new();
        let mut skipped = Vec::new();

        for agent in available_agents {
            if agent == "orchestrator" {
                continue;
            }
            if self.should_include(agent, scores, depth) {
                selected.push(agent.clone());
            } else {
                skipped.push(agent.clone());
            }
        }

        if selected.is_empty() {
            if let Some(first) = available_agents.iter().find(|a| a.as_str() != "orchestrator") {
                selected.push(first.clone());
                skipped.retain(|a| a != first);
            }
        }

        let reason = self.generate_reason(scores, depth, &selected, &skipped, total_score);

        conduit_kernel::SelectionResult { depth, agents: selected, skipped, reason, total_score }
    }

    fn determine_depth(&self, total_score: u32) -> Depth {
        if total_score <= self.thresholds.flat_max {
            Depth::Flat
        } else if total_score <= self.thresholds.light_max {
            Depth::Light
        } else {
            Depth::Structured
        }
    }

    fn should_include(&self, agent: &str, scores: &TaskScores, depth: Depth) -> bool {
        let rule = self.rules.get(agent).cloned().unwrap_or_default();

        if rule.always == Some(true) {
            return true;
        }

        let task_type = scores.task_type.as_str();

        if rule.skip_when.task_type.iter().any(|t| t == task_type) {
            return false;
        }

        if depth == Depth::Flat {
            return false;
        }

        if rule.required_when.task_type.iter().any(|t| t == task_type) {
            return true;
        }

        for (key, threshold) in &rule.required_when.score_thresholds {
            let value = match key.as_str() {
                "scope" => Some(scores.scope as f64),
                "novelty" => Some(scores.novelty),
                "risk" => Some(scores.risk as f64),
                "complexity" => Some(scores.complexity as f64),
                "dependencies" => Some(scores.dependencies as f64),
                _ => None,
            };
            if let Some(value) = value {
                if value >= *threshold {
                    return true;
                }
            }
        }

        if depth == Depth::Structured {
            return true;
        }

        false
    }

    fn generate_reason(&self, scores: &TaskScores, depth: Depth, selected: &[String], skipped: &[String], total: u32) -> String {
        let mut parts = vec![format!("total score {total} -> {} mode", depth.as_str()), format!("task type: {}", scores.task_type.as_str())];
        if !selected.is_empty() {
            parts.push(format!("selected: {}", selected.join(", ")));
        }
        if !skipped.is_empty() {
            parts.push(format!("skipped: {}", skipped.join(", ")));
        }
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_kernel::{RequiredWhen, SkipWhen, TaskType};

    fn scores(total_ish: (u32, f64, u32, u32, u32), task_type: TaskType) -> TaskScores {
        TaskScores { scope: total_ish.0, novelty: total_ish.1, risk: total_ish.2, complexity: total_ish.3, dependencies: total_ish.4, task_type }
    }

    #[test]
    fn flat_mode_includes_only_always_agents() {
        let config = OptimizerConfig::default();
        let mut rules = HashMap::new();
        rules.insert("reviewer".to_string(), AgentRule { always: Some(true), ..Default::default() });
        let selector = AgentSelector::new(&config, rules);

        let low = scores((1, 0.1, 1, 1, 1), TaskType::Other); // total = 1+1+1+1+1=5 <= flat_max 10
        let result = selector.select(&low, &["reviewer".into(), "tester".into()]);
        assert_eq!(result.depth, Depth::Flat);
        assert_eq!(result.agents, vec!["reviewer".to_string()]);
        assert!(result.skipped.contains(&"tester".to_string()));
    }

    #[test]
    fn skip_when_excludes_regardless_of_depth() {
        let config = OptimizerConfig::default();
        let mut rules = HashMap::new();
        rules.insert("docs_writer".to_string(), AgentRule { skip_when: SkipWhen { task_type: vec!["security".into()] }, ..Default::default() });
        let selector = AgentSelector::new(&config, rules);

        let high = scores((10, 1.0, 10, 10, 10), TaskType::Security); // structured depth
        let result = selector.select(&high, &["docs_writer".into(), "security_agent".into()]);
        assert!(!result.agents.contains(&"docs_writer".to_string()));
    }

    #[test]
    fn structured_mode_includes_all_remaining() {
        let config = OptimizerConfig::default();
        let selector = AgentSelector::new(&config, HashMap::new());
        let high = scores((10, 1.0, 10, 10, 10), TaskType::Feature);
        let result = selector.select(&high, &["a".into(), "b".into()]);
        assert_eq!(result.depth, Depth::Structured);
        assert_eq!(result.agents.len(), 2);
    }

    #[test]
    fn required_when_score_threshold_includes_in_light_mode() {
        let config = OptimizerConfig::default();
        let mut rules = HashMap::new();
        let mut thresholds = HashMap::new();
        thresholds.insert("risk".to_string(), 7.0);
        rules.insert("security_agent".to_string(), AgentRule { required_when: RequiredWhen { task_type: vec![], score_thresholds: thresholds }, ..Default::default() });
        let selector = AgentSelector::new(&config, rules);

        // total = 3+5+8+3+3 = 22, within light_max=25 -> light
        let mid = scores((3, 0.5, 8, 3, 3), TaskType::Bugfix);
        let result = selector.select(&mid, &["security_agent".into(), "other_agent".into()]);
        assert_eq!(result.depth, Depth::Light);
        assert!(result.agents.contains(&"security_agent".to_string()));
        assert!(!result.agents.contains(&"other_agent".to_string()));
    }

    #[test]
    fn floor_guarantees_at_least_one_agent() {
        let config = OptimizerConfig::default();
        let selector = AgentSelector::new(&config, HashMap::new());
        let low = scores((1, 0.1, 1, 1, 1), TaskType::Other);
        let result = selector.select(&low, &["only_agent".into()]);
        assert_eq!(result.agents, vec!["only_agent".to_string()]);
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn total_score_four_against_default_flat_max_routes_flat() {
        let config = OptimizerConfig::default();
        assert!(config.thresholds.flat_max >= 10);
        let selector = AgentSelector::new(&config, HashMap::new());
        let low = scores((1, 0.0, 1, 1, 1), TaskType::Other); // total = 1+0+1+1+1 = 4
        let result = selector.select(&low, &["reviewer".into()]);
        assert_eq!(result.total_score, 4);
        assert_eq!(result.depth, Depth::Flat);
    }

    #[test]
    fn orchestrator_is_never_selected_or_skipped() {
        let config = OptimizerConfig::default();
        let selector = AgentSelector::new(&config, HashMap::new());
        let high = scores((10, 1.0, 10, 10, 10), TaskType::Feature);
        let result = selector.select(&high, &["orchestrator".into(), "worker".into()]);
        assert!(!result.agents.contains(&"orchestrator".to_string()));
        assert!(!result.skipped.contains(&"orchestrator".to_string()));
    }
}
