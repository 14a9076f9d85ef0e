use std::path::Path;

use crate::Config;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment
    /// variable expansion fails, TOML parsing fails, or validation
    /// fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        let expanded = crate::env::expand_env(&raw)
            .map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self =
            toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error on non-positive intervals, a zero quota unit,
    /// or a risk guard enabled with a zero threshold
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.quota.quota_per_unit <= 0.0 {
            anyhow::bail!("quota.quota_per_unit must be positive");
        }
        if self.quota.trust_quota < 0 {
            anyhow::bail!("quota.trust_quota must not be negative");
        }
        if self.quota.free_group.is_empty() {
            anyhow::bail!("quota.free_group must not be empty");
        }
        if self.batch.interval_secs == 0 {
            anyhow::bail!("batch.interval_secs must be greater than 0");
        }
        if self.dispatch.sync_frequency_secs == 0 {
            anyhow::bail!("dispatch.sync_frequency_secs must be greater than 0");
        }
        if self.dispatch.auto_groups.iter().any(String::is_empty) {
            anyhow::bail!("dispatch.auto_groups must not contain empty names");
        }
        if self.risk.enabled && (self.risk.ip_threshold == 0 || self.risk.window_minutes == 0) {
            anyhow::bail!("risk guard requires a positive ip_threshold and window_minutes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::Config;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_full_document() {
        let raw = r#"
            [kv]
            url = "redis://localhost:6379"

            [quota]
            trust_quota = 250000
            free_group = "free"

            [dispatch]
            auto_groups = ["default", "backup"]

            [batch]
            interval_secs = 10

            [risk]
            enabled = true
            window_minutes = 10
            ip_threshold = 5
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.quota.trust_quota, 250_000);
        assert_eq!(config.dispatch.auto_groups, vec!["default", "backup"]);
        assert_eq!(config.kv.unwrap().pool_size, 10);
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = "[quota]\nunknown_knob = 1\n";
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn rejects_zero_batch_interval() {
        let raw = "[batch]\ninterval_secs = 0\n";
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
