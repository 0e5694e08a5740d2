//! Tool configuration: JSON file plus environment overrides

use anyhow::{Context, Result};
use arena_tracker::{GrowthPolicy, HarnessConfig, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Config file pointer when `--config` is absent
pub const CONFIG_ENV: &str = "ARENA_CONFIG";
const GRANULARITY_ENV: &str = "ARENA_GRANULARITY";
const RESERVE_LIMIT_ENV: &str = "ARENA_RESERVE_LIMIT";
const GROWTH_POLICY_ENV: &str = "ARENA_GROWTH_POLICY";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    pub registry: RegistryConfig,
    pub harness: HarnessConfig,
}

/// Load configuration from file (if any), then apply environment overrides
pub fn load_config(path: Option<&Path>) -> Result<PerfConfig> {
    let env_path = std::env::var(CONFIG_ENV).ok();
    let path = path.or(env_path.as_deref().map(Path::new));

    let mut config = match path {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
        }
        None => PerfConfig::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.registry.validate()?;
    config.harness.validate()?;
    Ok(config)
}

/// Apply `ARENA_*` overrides read through `lookup`
fn apply_overrides(
    config: &mut PerfConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup(GRANULARITY_ENV) {
        config.registry.granularity = val
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", GRANULARITY_ENV, e))?;
    }

    if let Some(val) = lookup(RESERVE_LIMIT_ENV) {
        config.registry.reserve_limit = match val.trim() {
            "" | "none" => None,
            limit => Some(
                limit
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid {}: {}", RESERVE_LIMIT_ENV, e))?,
            ),
        };
    }

    if let Some(val) = lookup(GROWTH_POLICY_ENV) {
        config.registry.growth_policy = val.parse::<GrowthPolicy>()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_overrides_applied() -> Result<()> {
        let mut config = PerfConfig::default();
        apply_overrides(
            &mut config,
            lookup(&[
                (GRANULARITY_ENV, "4096"),
                (RESERVE_LIMIT_ENV, "1048576"),
                (GROWTH_POLICY_ENV, "fail_fast"),
            ]),
        )?;
        assert_eq!(config.registry.granularity, 4096);
        assert_eq!(config.registry.reserve_limit, Some(1_048_576));
        assert_eq!(config.registry.growth_policy, GrowthPolicy::FailFast);
        Ok(())
    }

    #[rstest]
    #[case(GRANULARITY_ENV, "big")]
    #[case(RESERVE_LIMIT_ENV, "-1")]
    #[case(GROWTH_POLICY_ENV, "sometimes")]
    fn test_bad_override_rejected(#[case] key: &str, #[case] value: &str) {
        let mut config = PerfConfig::default();
        assert!(apply_overrides(&mut config, lookup(&[(key, value)])).is_err());
    }

    #[test]
    fn test_limit_override_can_clear() -> Result<()> {
        let mut config = PerfConfig::default();
        config.registry.reserve_limit = Some(10);
        apply_overrides(&mut config, lookup(&[(RESERVE_LIMIT_ENV, "none")]))?;
        assert_eq!(config.registry.reserve_limit, None);
        Ok(())
    }

    #[test]
    fn test_file_sections_default_independently() -> Result<()> {
        let config: PerfConfig = serde_json::from_str(r#"{"harness": {"workers": 8}}"#)?;
        assert_eq!(config.harness.workers, 8);
        assert_eq!(config.registry, RegistryConfig::default());
        Ok(())
    }
}
