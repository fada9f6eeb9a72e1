//! Engine configuration for idle reclamation, dial timeout and pool sizing.
//!
//! Parsed from TOML. Every field has a default, so an empty file is valid:
//!
//! ```toml
//! [registry]
//! idle_threshold = "20m"
//! reap_interval = "1m"
//! dial_timeout = "5s"
//!
//! [registry.ssl_mode_mapping]
//! encrypted = "require"
//! unencrypted = "prefer"
//!
//! [postgres]
//! max_connections = 8
//!
//! [mysql]
//! max_connections = 10
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::backend::PoolLimits;
use crate::descriptor::SslModeMapping;

/// Registry-level settings shared by every backend engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Entries unused for longer than this are evicted (default: 20m).
    #[serde(with = "duration_str")]
    pub idle_threshold: Duration,
    /// Period between background sweeps (default: 1m).
    #[serde(with = "duration_str")]
    pub reap_interval: Duration,
    /// Upper bound on the TCP reachability probe (default: 5s).
    #[serde(with = "duration_str")]
    pub dial_timeout: Duration,
    /// Encryption flag to SSL mode translation.
    pub ssl_mode_mapping: SslModeMapping,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(20 * 60),
            reap_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            ssl_mode_mapping: SslModeMapping::default(),
        }
    }
}

impl RegistryConfig {
    /// Reject settings the reaper cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.idle_threshold.is_zero() {
            bail!("idle_threshold must be greater than zero");
        }
        if self.reap_interval.is_zero() {
            bail!("reap_interval must be greater than zero");
        }
        if self.dial_timeout.is_zero() {
            bail!("dial_timeout must be greater than zero");
        }
        if self.reap_interval > self.idle_threshold {
            bail!(
                "reap_interval ({:?}) must not exceed idle_threshold ({:?})",
                self.reap_interval,
                self.idle_threshold
            );
        }
        Ok(())
    }

    /// Builder method: set the idle threshold.
    pub fn with_idle_threshold(self, idle_threshold: Duration) -> Self {
        Self {
            idle_threshold,
            ..self
        }
    }

    /// Builder method: set the sweep period.
    pub fn with_reap_interval(self, reap_interval: Duration) -> Self {
        Self {
            reap_interval,
            ..self
        }
    }

    /// Builder method: set the probe timeout.
    pub fn with_dial_timeout(self, dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            ..self
        }
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub registry: RegistryConfig,
    pub postgres: PoolLimits,
    pub mysql: PoolLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            postgres: PoolLimits::postgres(),
            mysql: PoolLimits::mysql(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.registry.validate()?;
        for (name, limits) in [("postgres", &self.postgres), ("mysql", &self.mysql)] {
            if limits.max_connections == 0 {
                bail!("{name}.max_connections must be greater than zero");
            }
            if limits.min_connections > limits.max_connections {
                bail!(
                    "{name}.min_connections ({}) exceeds max_connections ({})",
                    limits.min_connections,
                    limits.max_connections
                );
            }
        }
        Ok(())
    }
}

/// Parse a duration string like "500ms", "5s", "20m", "1h". Bare numbers are
/// seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let scaled = |n: &str, unit: u64| {
        n.trim()
            .parse::<u64>()
            .ok()?
            .checked_mul(unit)
            .map(Duration::from_secs)
    };
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        scaled(secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        scaled(s, 1)
    }
}

/// Format a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter for human-readable duration strings.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration {raw:?}")))
    }
}
