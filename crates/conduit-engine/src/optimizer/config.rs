//! Persists the Optimizer's tunable configuration to disk and loads the
//! per-profile agent rules that drive [`super::agent_selector::AgentSelector`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use conduit_kernel::{AgentRule, OptimizerConfig, OrchestrationError, OrchestrationResult, RequiredWhen, SkipWhen, Thresholds};

/// Loads, mutates, and atomically persists an [`OptimizerConfig`] at a fixed
/// path, writing through a sibling temp file and renaming over the target so
/// a crash mid-write never leaves a truncated config behind.
pub struct ConfigStore {
    path: PathBuf,
    config: OptimizerConfig,
}

impl ConfigStore {
    /// Loads `path` if it exists, otherwise starts from
    /// [`OptimizerConfig::default`] without touching disk.
    pub fn load(path: impl Into<PathBuf>) -> OrchestrationResult<Self> {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let on_disk: serde_json::Value = serde_json::from_str(&raw).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
                let mut merged = serde_json::to_value(OptimizerConfig::default()).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
                deep_merge(&mut merged, &on_disk);
                serde_json::from_value(merged).map_err(|e| OrchestrationError::Storage(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OptimizerConfig::default(),
            Err(e) => return Err(OrchestrationError::Storage(e.to_string())),
        };
        Ok(Self { path, config })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Writes the current config to a temp file in the same directory, then
    /// renames it over `self.path`. The rename is atomic on the same
    /// filesystem, so readers never observe a partially-written file.
    pub fn save(&self) -> OrchestrationResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        let payload = serde_json::to_vec_pretty(&self.config).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        use std::io::Write;
        tmp.write_all(&payload).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        tmp.persist(&self.path).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn update_thresholds(&mut self, thresholds: Thresholds) -> OrchestrationResult<()> {
        self.config.thresholds = thresholds;
        self.save()
    }

    /// Reads a dot-notation path (`"safety.min_success_rate"`) out of the
    /// config by round-tripping through JSON.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let value = serde_json::to_value(&self.config).ok()?;
        key.split('.').try_fold(value, |acc, part| acc.get(part).cloned())
    }

    /// Sets a dot-notation path to `value` and persists the result. The path
    /// must already exist in the config's shape; unknown keys are rejected.
    pub fn set(&mut self, key: &str, value: serde_json::Value) -> OrchestrationResult<()> {
        let mut current = serde_json::to_value(&self.config).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        set_path(&mut current, &key.split('.').collect::<Vec<_>>(), value)?;
        self.config = serde_json::from_value(current).map_err(|e| OrchestrationError::Storage(e.to_string()))?;
        self.save()
    }
}

fn set_path(value: &mut serde_json::Value, path: &[&str], new_value: serde_json::Value) -> OrchestrationResult<()> {
    let (head, rest) = match path.split_first() {
        Some(parts) => parts,
        None => return Err(OrchestrationError::Validation("empty config key".into())),
    };
    let serde_json::Value::Object(map) = value else {
        return Err(OrchestrationError::Validation("config path does not point at an object".into()));
    };
    if rest.is_empty() {
        if !map.contains_key(*head) {
            return Err(OrchestrationError::Validation(format!("unknown config key: {head}")));
        }
        map.insert(head.to_string(), new_value);
        return Ok(());
    }
    let child = map.get_mut(*head).ok_or_else(|| OrchestrationError::Validation(format!("unknown config key: {head}")))?;
    set_path(child, rest, new_value)
}

/// Recursively merges `overlay` onto `base`, overlay values winning at every
/// leaf. Non-object values (including arrays) are replaced wholesale.
fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value.clone(),
    }
}

/// The built-in agent roster consulted when no profile-specific
/// `agent_rules.yaml` is found, or to fill in agents a profile doesn't
/// mention.
pub fn default_agent_rules() -> HashMap<String, AgentRule> {
    let mut rules = HashMap::new();

    rules.insert(
        "architect".to_string(),
        AgentRule {
            always: None,
            required_when: RequiredWhen { task_type: vec![], score_thresholds: HashMap::from([("novelty".to_string(), 0.5), ("scope".to_string(), 5.0)]) },
            skip_when: SkipWhen { task_type: vec!["bugfix".into(), "docs".into()] },
        },
    );
    rules.insert(
        "code-reviewer".to_string(),
        AgentRule {
            always: None,
            required_when: RequiredWhen { task_type: vec![], score_thresholds: HashMap::from([("scope".to_string(), 3.0)]) },
            skip_when: SkipWhen { task_type: vec!["docs".into()] },
        },
    );
    rules.insert("backend-coder".to_string(), AgentRule { always: Some(true), ..Default::default() });
    rules.insert(
        "frontend-coder".to_string(),
        AgentRule {
            always: None,
            required_when: RequiredWhen { task_type: vec!["feature".into()], score_thresholds: HashMap::new() },
            skip_when: SkipWhen { task_type: vec!["bugfix".into(), "docs".into()] },
        },
    );
    rules.insert(
        "doc-writer".to_string(),
        AgentRule {
            always: None,
            required_when: RequiredWhen { task_type: vec!["docs".into(), "feature".into()], score_thresholds: HashMap::new() },
            skip_when: SkipWhen { task_type: vec!["bugfix".into()] },
        },
    );

    rules
}

/// Looks for `<rules_dir>/<profile>.yaml`, deep-merging it over
/// [`default_agent_rules`]. Falls back to the defaults untouched when the
/// profile file is absent.
pub fn load_agent_rules(rules_dir: impl AsRef<Path>, profile: &str) -> OrchestrationResult<HashMap<String, AgentRule>> {
    let defaults = default_agent_rules();
    let path = rules_dir.as_ref().join(format!("{profile}.yaml"));

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(defaults),
        Err(e) => return Err(OrchestrationError::Storage(e.to_string())),
    };

    let overlay: HashMap<String, AgentRule> = serde_yaml::from_str(&raw).map_err(|e| OrchestrationError::Storage(e.to_string()))?;

    let mut merged = defaults;
    for (name, rule) in overlay {
        merged.insert(name, rule);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json")).unwrap();
        assert_eq!(store.config().thresholds.flat_max, 10);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = ConfigStore::load(&path).unwrap();
        store.update_thresholds(Thresholds { flat_max: 12, light_max: 30 }).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.config().thresholds.flat_max, 12);
        assert_eq!(reloaded.config().thresholds.light_max, 30);
    }

    #[test]
    fn partial_config_on_disk_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"thresholds": {"flat_max": 7, "light_max": 25}}"#).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.config().thresholds.flat_max, 7);
        assert_eq!(store.config().safety.min_success_rate, 0.85);
    }

    #[test]
    fn get_reads_dot_notation_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json")).unwrap();
        let value = store.get("safety.min_success_rate").unwrap();
        assert_eq!(value, serde_json::json!(0.85));
    }

    #[test]
    fn set_writes_dot_notation_path_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = ConfigStore::load(&path).unwrap();
        store.set("tuning.min_samples", serde_json::json!(40)).unwrap();
        assert_eq!(store.config().tuning.min_samples, 40);

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.config().tuning.min_samples, 40);
    }

    #[test]
    fn set_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::load(dir.path().join("config.json")).unwrap();
        let result = store.set("tuning.nonexistent", serde_json::json!(1));
        assert!(result.is_err());
    }

    #[test]
    fn default_agent_rules_match_reference_roster() {
        let rules = default_agent_rules();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules["backend-coder"].always, Some(true));
        assert!(rules["architect"].skip_when.task_type.contains(&"bugfix".to_string()));
        assert_eq!(rules["architect"].required_when.score_thresholds.get("scope"), Some(&5.0));
    }

    #[test]
    fn missing_profile_file_returns_defaults_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        let rules = load_agent_rules(dir.path(), "nonexistent-profile").unwrap();
        assert_eq!(rules.len(), 5);
    }

    #[test]
    fn profile_file_overlays_onto_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("strict.yaml"),
            "security-agent:\n  always: true\nbackend-coder:\n  always: false\n",
        )
        .unwrap();

        let rules = load_agent_rules(dir.path(), "strict").unwrap();
        assert_eq!(rules.len(), 6);
        assert_eq!(rules["security-agent"].always, Some(true));
        assert_eq!(rules["backend-coder"].always, Some(false));
        assert_eq!(rules["architect"].skip_when.task_type, vec!["bugfix".to_string(), "docs".to_string()]);
    }
}
