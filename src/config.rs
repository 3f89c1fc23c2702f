use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is not a valid number: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub webhook_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSettings {
    pub free_note_limit: i64,
    pub free_meeting_minutes: i64,
    pub monthly_price_id: Option<String>,
    pub annual_price_id: Option<String>,
    pub event_retention_days: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            free_note_limit: 10,
            free_meeting_minutes: 60,
            monthly_price_id: None,
            annual_price_id: None,
            event_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    pub max_attempts: usize,
    pub retry_backoff: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub stripe: Option<StripeSettings>,
    pub billing: BillingSettings,
    pub store: StoreSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let stripe =
            get("STRIPE_WEBHOOK_SECRET").map(|webhook_secret| StripeSettings { webhook_secret });

        let defaults = BillingSettings::default();
        let billing = BillingSettings {
            free_note_limit: parse_or(
                "FREE_NOTE_LIMIT",
                get("FREE_NOTE_LIMIT"),
                defaults.free_note_limit,
            )?,
            free_meeting_minutes: parse_or(
                "FREE_MEETING_LIMIT",
                get("FREE_MEETING_LIMIT"),
                defaults.free_meeting_minutes,
            )?,
            monthly_price_id: get("STRIPE_MONTHLY_PRICE_ID"),
            annual_price_id: get("STRIPE_ANNUAL_PRICE_ID"),
            event_retention_days: parse_or(
                "BILLING_EVENT_RETENTION_DAYS",
                get("BILLING_EVENT_RETENTION_DAYS"),
                defaults.event_retention_days,
            )?,
        };

        let store_defaults = StoreSettings::default();
        let max_attempts: usize = parse_or(
            "STORE_MAX_ATTEMPTS",
            get("STORE_MAX_ATTEMPTS"),
            store_defaults.max_attempts,
        )?;
        let backoff_ms: u64 = parse_or(
            "STORE_RETRY_BACKOFF_MS",
            get("STORE_RETRY_BACKOFF_MS"),
            store_defaults.retry_backoff.as_millis() as u64,
        )?;
        let store = StoreSettings {
            max_attempts: max_attempts.max(1),
            retry_backoff: Duration::from_millis(backoff_ms),
        };

        let database_max_connections = parse_or(
            "DATABASE_MAX_CONNECTIONS",
            get("DATABASE_MAX_CONNECTIONS"),
            5u32,
        )?;

        Ok(Config {
            database_url,
            database_max_connections,
            stripe,
            billing,
            store,
        })
    }
}

fn parse_or<T: FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
