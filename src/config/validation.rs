//! Unknown-key detection with "did you mean?" suggestions.
//!
//! The raw TOML is parsed into `toml::Value` first and its key tree compared
//! against the known `AppConfig` fields. Unknown keys produce warnings only;
//! they never break an existing config.

use std::collections::HashSet;

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

/// Every valid dotted key path of `AppConfig`.
///
/// Kept in step with the structs in `app_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    [
        "storage",
        "storage.data_dir",
        "backup",
        "backup.dir",
        "backup.artifact_prefix",
        "backup.table",
        "backup.max_error_len",
        "backup.mode",
        "backup.reason_order",
        "backup.command",
        "backup.command.program",
        "backup.command.host",
        "backup.command.port",
        "backup.command.user",
        "backup.command.database",
        "backup.command.password_env",
        "backup.command.timeout_secs",
        "models",
        "models.dir",
        "models.anomaly_file",
        "models.forecast_file",
        "scheduler",
        "scheduler.tick_millis",
        "scheduler.settings_reload_secs",
        "scheduler.stop_timeout_secs",
        "scheduler.restart_settle_secs",
        "scheduler.run_maintenance_on_start",
        "scheduler.pid_dir",
        "scheduler.control_timeout_secs",
        "simulation",
        "simulation.organic_anomaly_probability",
        "simulation.seed",
        "logging",
        "logging.level",
        "logging.json",
        "logging.file",
        "logging.rotate_max_bytes",
        "logging.rotate_max_age_days",
        "logging.rotate_keep",
    ]
    .into_iter()
    .collect()
}

/// Collect all dotted key paths of a TOML tree.
///
/// `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Closest known key within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|(ka, da), (kb, db)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.to_string())
}

/// Warnings for every unknown key in a raw TOML document.
///
/// Parse errors return no warnings; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("hello", "hello"), 0);
        assert_eq!(levenshtein("retension", "retention"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [backup]
            dir = "b"
            [backup.command]
            port = 1
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"backup".to_string()));
        assert!(keys.contains(&"backup.dir".to_string()));
        assert!(keys.contains(&"backup.command.port".to_string()));
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let warnings = validate_unknown_keys("[scheduler]\ntick_milis = 500\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "scheduler.tick_milis");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("scheduler.tick_millis"));
    }

    #[test]
    fn test_default_config_has_no_unknown_keys() {
        let mut config = super::super::AppConfig::default();
        config.simulation.seed = Some(7);
        config.logging.level = Some("debug".to_string());
        config.logging.file = Some("scheduler.log".into());
        let text = config.to_toml().unwrap();
        assert!(validate_unknown_keys(&text).is_empty());
    }

    #[test]
    fn test_invalid_toml_yields_no_warnings() {
        assert!(validate_unknown_keys("[[[").is_empty());
    }
}
