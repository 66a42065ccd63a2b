use std::path::PathBuf;
use std::str::FromStr;

use super::{Config, ConfigLayer};

pub fn merge_layers(user: Option<ConfigLayer>, local: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = local {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `INGEST_LOOP_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored.
pub fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let value = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(minutes) = parse_env::<u64>("INGEST_LOOP_INTERVAL_MINUTES", &value) {
        config.daemon.interval_minutes = minutes;
    }

    if let Some(raw) = value("INGEST_LOOP_RECONCILIATION_ENABLED") {
        match parse_bool(&raw) {
            Some(enabled) => config.reconciliation.enabled = enabled,
            None => {
                tracing::warn!("invalid INGEST_LOOP_RECONCILIATION_ENABLED, ignoring: {raw}");
            }
        }
    }

    if let Some(max) = parse_env::<i64>("INGEST_LOOP_RECONCILIATION_MAX_PER_CYCLE", &value) {
        config.reconciliation.max_attempts_per_cycle = max;
    }

    if let Some(days) = parse_env::<i64>("INGEST_LOOP_RECONCILIATION_LOOKBACK_DAYS", &value) {
        config.reconciliation.failure_lookback_days = days;
    }

    if let Some(dir) = value("INGEST_LOOP_RECONCILIATION_HISTORY_DIR") {
        config.history.reconciliation_dir = Some(PathBuf::from(dir));
    }
}

fn parse_env<T>(key: &str, value: impl Fn(&str) -> Option<String>) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = value(key)?;
    match raw.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use crate::config::ReconciliationConfigOverride;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn merge_layers_respects_precedence() {
        let mut user = ConfigLayer::default();
        user.reconciliation = ReconciliationConfigOverride {
            enabled: Some(false),
            max_attempts_per_cycle: Some(5),
            failure_lookback_days: None,
        };
        user.daemon.interval_minutes = Some(10);

        let mut local = ConfigLayer::default();
        local.reconciliation.enabled = Some(true);

        let config = merge_layers(Some(user), Some(local));
        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.max_attempts_per_cycle, 5);
        assert_eq!(config.reconciliation.failure_lookback_days, 1);
        assert_eq!(config.daemon.interval_minutes, 10);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_overrides_from(
            &mut config,
            lookup(&[
                ("INGEST_LOOP_INTERVAL_MINUTES", "45"),
                ("INGEST_LOOP_RECONCILIATION_ENABLED", "no"),
                ("INGEST_LOOP_RECONCILIATION_MAX_PER_CYCLE", " 4 "),
                ("INGEST_LOOP_RECONCILIATION_LOOKBACK_DAYS", "-2"),
                ("INGEST_LOOP_RECONCILIATION_HISTORY_DIR", "/audit/recon"),
            ]),
        );

        assert_eq!(config.daemon.interval_minutes, 45);
        assert!(!config.reconciliation.enabled);
        assert_eq!(config.reconciliation.max_attempts_per_cycle, 4);
        assert_eq!(config.reconciliation.failure_lookback_days, -2);
        assert_eq!(
            config.history.reconciliation_dir,
            Some(PathBuf::from("/audit/recon"))
        );
    }

    #[test]
    fn invalid_env_values_keep_defaults() {
        let mut config = Config::default();
        apply_overrides_from(
            &mut config,
            lookup(&[
                ("INGEST_LOOP_INTERVAL_MINUTES", "soon"),
                ("INGEST_LOOP_RECONCILIATION_ENABLED", "maybe"),
                ("INGEST_LOOP_RECONCILIATION_MAX_PER_CYCLE", "2.5"),
                ("INGEST_LOOP_RECONCILIATION_LOOKBACK_DAYS", ""),
            ]),
        );

        assert_eq!(config.daemon.interval_minutes, 30);
        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.max_attempts_per_cycle, 2);
        assert_eq!(config.reconciliation.failure_lookback_days, 1);
    }
}
