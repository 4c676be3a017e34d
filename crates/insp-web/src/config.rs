use std::fmt;
use std::time::Duration;

use insp_sync::parse_flag;
use thiserror::Error;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("INSP_JWT_SECRET must be set unless INSP_AUTH_DISABLED is enabled")]
    MissingSecret,
    #[error("INSP_AUTH_DISABLED cannot be enabled when INSP_ENV=production")]
    BypassInProduction,
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone)]
pub enum AuthMode {
    Enforced { secret: String },
    /// Non-production bypass; only reachable through an explicit flag.
    Disabled,
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enforced { .. } => f.write_str("Enforced { secret: [REDACTED] }"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token_ttl: Duration,
    pub clock_skew: Duration,
    pub protect_reads: bool,
    pub protect_sync: bool,
}

impl AuthConfig {
    pub fn enforced(secret: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Enforced {
                secret: secret.into(),
            },
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            clock_skew: Duration::from_secs(60),
            protect_reads: false,
            protect_sync: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            ..Self::enforced(String::new())
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let flag = |key: &str| lookup(key).map(|v| parse_flag(&v)).unwrap_or(false);

        let production = lookup("INSP_ENV")
            .map(|v| v.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let mut config = if flag("INSP_AUTH_DISABLED") {
            if production {
                return Err(ConfigError::BypassInProduction);
            }
            Self::disabled()
        } else {
            let secret = lookup("INSP_JWT_SECRET")
                .filter(|s| !s.trim().is_empty())
                .ok_or(ConfigError::MissingSecret)?;
            Self::enforced(secret)
        };

        if let Some(raw) = lookup("INSP_TOKEN_TTL_SECS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::Invalid {
                    key: "INSP_TOKEN_TTL_SECS",
                    value: raw.clone(),
                })?;
            config.token_ttl = Duration::from_secs(secs);
        }
        config.protect_reads = flag("INSP_PROTECT_READS");
        config.protect_sync = flag("INSP_PROTECT_SYNC");
        Ok(config)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.mode, AuthMode::Disabled)
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub auth: AuthConfig,
}

impl WebConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_port = std::env::var("INSP_WEB_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok();
        let port = match raw_port {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "INSP_WEB_PORT",
                value: raw.clone(),
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            port,
            auth: AuthConfig::from_env()?,
        })
    }
}
