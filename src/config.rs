//! Service configuration, read from `ONBOARD_*` environment variables.

use secrecy::SecretString;

use crate::email::SmtpConfig;
use crate::error::ConfigError;

/// Runtime configuration for the onboarding service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP bind port.
    pub port: u16,
    /// Path of the local SQLite database file.
    pub db_path: String,
    /// Days until an unfinished registration expires.
    pub registration_ttl_days: i64,
    /// SMTP delivery settings; absent means codes are logged only.
    pub smtp: Option<SmtpConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: "./data/clinic-onboard.db".to_string(),
            registration_ttl_days: 7,
            smtp: None,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    /// Build configuration from the environment, falling back to defaults.
    ///
    /// SMTP is optional but all-or-nothing: setting `ONBOARD_SMTP_HOST`
    /// makes the username, password, and from-address required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port = parsed_var("ONBOARD_PORT", defaults.port)?;
        let db_path = std::env::var("ONBOARD_DB_PATH").unwrap_or(defaults.db_path);
        let registration_ttl_days =
            parsed_var("ONBOARD_TTL_DAYS", defaults.registration_ttl_days)?;
        if registration_ttl_days <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "ONBOARD_TTL_DAYS".to_string(),
                message: "must be a positive number of days".to_string(),
            });
        }

        let smtp = match std::env::var("ONBOARD_SMTP_HOST") {
            Ok(host) => {
                let require = |key: &str| {
                    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
                };
                Some(SmtpConfig {
                    host,
                    port: parsed_var("ONBOARD_SMTP_PORT", 587)?,
                    username: require("ONBOARD_SMTP_USERNAME")?,
                    password: SecretString::from(require("ONBOARD_SMTP_PASSWORD")?),
                    from_address: require("ONBOARD_SMTP_FROM")?,
                })
            }
            Err(_) => None,
        };

        Ok(Self {
            port,
            db_path,
            registration_ttl_days,
            smtp,
        })
    }
}
