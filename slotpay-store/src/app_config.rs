use serde::Deserialize;
use slotpay_core::secret::Masked;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub booking: BookingRules,
    pub rate_limit: RateLimitConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    pub cron: CronConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// No URL means the in-memory store.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KafkaConfig {
    pub brokers: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BookingRules {
    pub default_hold_seconds: u64,
    pub max_hold_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window_seconds: u64,
    /// Let requests through when the limiter backend is down.
    #[serde(default)]
    pub fail_open: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sweep_interval_seconds: u64,
    pub reconcile_interval_seconds: u64,
}

fn default_true() -> bool { true }

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// Shared secret per gateway name.
    #[serde(default)]
    pub secrets: HashMap<String, Masked<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CronConfig {
    pub secret: Masked<String>,
}

/// Without `base_url` sessions are served by the in-process mock gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub redirect_base_url: String,
    pub base_url: Option<String>,
    pub api_key: Option<Masked<String>>,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
}

fn default_gateway_timeout() -> u64 { 10 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `SLOTPAY__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("SLOTPAY").separator("__"))
            .build()?;

        s.try_deserialize::<Self>()?.validated()
    }

    /// Single inline TOML document, no environment overrides.
    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    fn validated(self) -> Result<Self, config::ConfigError> {
        if self.rate_limit.limit == 0 || self.rate_limit.window_seconds == 0 {
            return Err(config::ConfigError::Message(
                "rate_limit.limit and rate_limit.window_seconds must be positive".into(),
            ));
        }
        if self.booking.default_hold_seconds == 0 || self.booking.default_hold_seconds > self.booking.max_hold_seconds {
            return Err(config::ConfigError::Message(
                "booking.default_hold_seconds must be positive and at most booking.max_hold_seconds".into(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize_from_toml() {
        let raw = r#"
            [server]
            port = 8080

            [booking]
            default_hold_seconds = 900
            max_hold_seconds = 3600

            [rate_limit]
            limit = 30
            window_seconds = 60

            [scheduler]
            sweep_interval_seconds = 30
            reconcile_interval_seconds = 300

            [webhooks.secrets]
            datatrans = "whsec_test"

            [cron]
            secret = "cron_test"

            [gateway]
            name = "datatrans"
            redirect_base_url = "https://pay.example.test"
        "#;

        let config = Config::from_toml(raw).unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(config.database.url.is_none());
        assert_eq!(config.database.max_connections, 5);
        assert!(!config.rate_limit.fail_open);
        assert!(config.scheduler.enabled);
        assert_eq!(config.webhooks.secrets["datatrans"].expose(), "whsec_test");
        assert_eq!(format!("{:?}", config.cron.secret), "********");
        assert!(config.gateway.base_url.is_none());
        assert_eq!(config.gateway.timeout_seconds, 10);
    }

    #[test]
    fn test_zero_rate_limit_window_is_rejected() {
        let raw = r#"
            [server]
            port = 8080

            [booking]
            default_hold_seconds = 900
            max_hold_seconds = 3600

            [rate_limit]
            limit = 30
            window_seconds = 0

            [scheduler]
            sweep_interval_seconds = 30
            reconcile_interval_seconds = 300

            [cron]
            secret = "cron_test"

            [gateway]
            name = "mock"
            redirect_base_url = "https://pay.example.test"
        "#;

        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("window_seconds"));
    }
}
