//! Deployment settings consulted by the interstitial steps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment-wide configuration for the registration interstitials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterstitialSettings {
    /// Accounts must always carry a non-empty email address
    #[serde(default)]
    pub require_email_address: bool,

    /// Collect data-processing consent before registration completes
    #[serde(default = "default_true")]
    pub gdpr_enabled: bool,

    /// Digest frequency shown on the consent form ("off", "day", "week", "month")
    #[serde(default = "default_digest_freq")]
    pub daily_digest_freq: String,

    /// Terms of use text; empty disables the terms step
    #[serde(default)]
    pub terms_of_use: String,

    /// Minimum minutes between two confirmation emails for the same address
    #[serde(default = "default_confirm_interval")]
    pub email_confirm_interval_minutes: u64,

    /// Delay applied when a non-administrator fails the password challenge
    #[serde(default = "default_password_delay")]
    pub password_failure_delay_ms: u64,

    /// Reference runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for InterstitialSettings {
    fn default() -> Self {
        Self {
            require_email_address: false,
            gdpr_enabled: true,
            daily_digest_freq: default_digest_freq(),
            terms_of_use: String::new(),
            email_confirm_interval_minutes: default_confirm_interval(),
            password_failure_delay_ms: default_password_delay(),
            runner: RunnerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Reference runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Attempts allowed per step before a soft denial aborts the pipeline
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_digest_freq() -> String {
    "off".to_string()
}

fn default_confirm_interval() -> u64 {
    10
}

fn default_password_delay() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl InterstitialSettings {
    /// Load settings from defaults, an optional file, then `INTERSTITIAL_*` env vars.
    ///
    /// Nested keys use a double underscore: `INTERSTITIAL_RUNNER__MAX_ATTEMPTS=5`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&InterstitialSettings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("INTERSTITIAL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn digest_enabled(&self) -> bool {
        self.daily_digest_freq != "off"
    }

    pub fn has_terms_of_use(&self) -> bool {
        !self.terms_of_use.trim().is_empty()
    }

    pub fn email_confirm_interval(&self) -> Duration {
        Duration::from_secs(self.email_confirm_interval_minutes.saturating_mul(60))
    }

    pub fn password_failure_delay(&self) -> Duration {
        Duration::from_millis(self.password_failure_delay_ms)
    }
}
