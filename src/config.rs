//! Configuration management for the sequencer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: regex::Regex = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub dispatcher: DispatcherConfig,
    pub gas: GasConfig,
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Interval between flushes of the pending queue
    pub flush_interval_ms: u64,
    /// Upper bound on a single ledger submission
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Units added to the floor when outstanding transactions are dropped
    pub escalation_step: u64,
    /// Refetch the network minimum every N nonces past the watermark (0 = off)
    pub refresh_every: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    pub reconcile_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

/// Knobs of the load simulator binary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub hrp: String,
    pub chain_id: String,
    pub accounts: usize,
    pub workers_per_account: usize,
    pub block_interval_ms: u64,
    pub min_gas_price: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            send_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            escalation_step: 1,
            refresh_every: 0,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconcile_interval_ms: 6_000,
        }
    }
}

impl SupervisorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,tx_sequencer=debug".to_string(),
            json: false,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            hrp: "sim".to_string(),
            chain_id: "local".to_string(),
            accounts: 4,
            workers_per_account: 8,
            block_interval_ms: 1_000,
            min_gas_price: 1_000_000_000,
        }
    }
}

impl Settings {
    /// Load settings from `TX_SEQUENCER_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_SEQUENCER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.flush_interval_ms == 0 {
            anyhow::bail!("dispatcher.flush_interval_ms must be positive");
        }
        if self.dispatcher.send_timeout_ms == 0 {
            anyhow::bail!("dispatcher.send_timeout_ms must be positive");
        }
        if self.gas.escalation_step == 0 {
            anyhow::bail!("gas.escalation_step must be positive");
        }
        if self.supervisor.enabled && self.supervisor.reconcile_interval_ms == 0 {
            anyhow::bail!("supervisor.reconcile_interval_ms must be positive");
        }
        if self.simulation.block_interval_ms == 0 {
            anyhow::bail!("simulation.block_interval_ms must be positive");
        }

        if self.dispatcher.send_timeout_ms < self.dispatcher.flush_interval_ms {
            tracing::warn!(
                "Send timeout {}ms is shorter than the flush interval {}ms",
                self.dispatcher.send_timeout_ms,
                self.dispatcher.flush_interval_ms
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures<'_>| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TX_SEQUENCER_TEST_VAR", "test_value");
        let input = "filter = \"info,${TX_SEQUENCER_TEST_VAR}=debug\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "filter = \"info,test_value=debug\"");
    }

    #[test]
    fn test_missing_env_var_becomes_empty() {
        let result = substitute_env_vars("a${TX_SEQUENCER_SURELY_UNSET}b");
        assert_eq!(result, "ab");
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let settings = Settings::from_toml("[dispatcher]\nflush_interval_ms = 250\n").unwrap();
        assert_eq!(settings.dispatcher.flush_interval(), Duration::from_millis(250));
        assert_eq!(settings.dispatcher.send_timeout_ms, 30_000);
        assert_eq!(settings.gas.escalation_step, 1);
        assert!(settings.supervisor.enabled);
    }

    #[test]
    fn test_rejects_zero_intervals() {
        assert!(Settings::from_toml("[dispatcher]\nflush_interval_ms = 0\n").is_err());
        assert!(Settings::from_toml("[gas]\nescalation_step = 0\n").is_err());
        assert!(Settings::from_toml(
            "[supervisor]\nenabled = true\nreconcile_interval_ms = 0\n"
        )
        .is_err());
        assert!(Settings::from_toml(
            "[supervisor]\nenabled = false\nreconcile_interval_ms = 0\n"
        )
        .is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[gas]\nescalation_step = 10\nrefresh_every = 50\n\n[logging]\njson = true\n"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.gas.escalation_step, 10);
        assert_eq!(settings.gas.refresh_every, 50);
        assert!(settings.logging.json);
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::load_from(Path::new("/nonexistent/tx-sequencer.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
