use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::Duration;

use murmur_api::LoginPolicy;
use murmur_auth::{PasswordCost, TokenConfig};

/// JWT secrets that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
    "changeme",
];

/// Longest accepted token lifetime, ten years.
const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 3600;

/// Server configuration, read from `MURMUR_*` environment variables.
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub tokens: TokenConfig,
    pub password_cost: PasswordCost,
    pub login_policy: LoginPolicy,
    pub cleanup_interval_secs: u64,
    /// `None` means any origin.
    pub cors_origins: Option<Vec<String>>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let host = get("MURMUR_HOST", "0.0.0.0");
        let port: u16 = get("MURMUR_PORT", "3000")
            .parse()
            .context("MURMUR_PORT must be a port number")?;
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        let access_secret = required_secret(&var, "MURMUR_JWT_ACCESS_SECRET")?;
        let refresh_secret = required_secret(&var, "MURMUR_JWT_REFRESH_SECRET")?;
        if access_secret == refresh_secret {
            bail!("MURMUR_JWT_ACCESS_SECRET and MURMUR_JWT_REFRESH_SECRET must differ");
        }

        let access_ttl: i64 = parse(&var, "MURMUR_ACCESS_TTL_SECS", 900)?;
        let refresh_ttl: i64 = parse(&var, "MURMUR_REFRESH_TTL_SECS", 7 * 24 * 3600)?;
        if access_ttl <= 0 || refresh_ttl <= 0 {
            bail!("token lifetimes must be positive");
        }
        if access_ttl > MAX_TTL_SECS || refresh_ttl > MAX_TTL_SECS {
            bail!("token lifetimes must be at most {MAX_TTL_SECS} seconds");
        }

        let defaults = PasswordCost::default();
        let password_cost = PasswordCost {
            memory_kib: parse(&var, "MURMUR_PASSWORD_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse(&var, "MURMUR_PASSWORD_ITERATIONS", defaults.iterations)?,
        };

        let cors_origins = var("MURMUR_CORS_ORIGINS").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        });

        Ok(Self {
            addr,
            db_path: get("MURMUR_DB_PATH", "murmur.db").into(),
            tokens: TokenConfig {
                access_secret,
                refresh_secret,
                access_ttl: Duration::seconds(access_ttl),
                refresh_ttl: Duration::seconds(refresh_ttl),
            },
            password_cost,
            login_policy: LoginPolicy {
                conceal_deactivated: parse(&var, "MURMUR_CONCEAL_DEACTIVATED", false)?,
            },
            cleanup_interval_secs: parse::<u64>(&var, "MURMUR_CLEANUP_INTERVAL_SECS", 3600)?.max(1),
            cors_origins: cors_origins.filter(|list| !list.is_empty()),
        })
    }
}

fn required_secret(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<String> {
    let secret = var(key).unwrap_or_default();
    if secret.is_empty() || PLACEHOLDER_SECRETS.contains(&secret.as_str()) {
        bail!("{key} is unset or still a placeholder; set it in your .env file and restart");
    }
    Ok(secret)
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    const SECRETS: [(&str, &str); 2] = [
        ("MURMUR_JWT_ACCESS_SECRET", "access-0123456789"),
        ("MURMUR_JWT_REFRESH_SECRET", "refresh-0123456789"),
    ];

    #[test]
    fn defaults_apply() {
        let config = load(&SECRETS).unwrap();
        assert_eq!(config.addr.port(), 3000);
        assert_eq!(config.db_path, PathBuf::from("murmur.db"));
        assert_eq!(config.tokens.access_ttl, Duration::minutes(15));
        assert_eq!(config.tokens.refresh_ttl, Duration::days(7));
        assert!(!config.login_policy.conceal_deactivated);
        assert_eq!(config.cleanup_interval_secs, 3600);
        assert!(config.cors_origins.is_none());
    }

    #[test]
    fn secrets_are_required_and_distinct() {
        assert!(load(&[]).is_err());
        assert!(
            load(&[
                ("MURMUR_JWT_ACCESS_SECRET", "dev-secret-change-me"),
                ("MURMUR_JWT_REFRESH_SECRET", "refresh-0123456789"),
            ])
            .is_err()
        );
        assert!(
            load(&[
                ("MURMUR_JWT_ACCESS_SECRET", "same-secret-value"),
                ("MURMUR_JWT_REFRESH_SECRET", "same-secret-value"),
            ])
            .is_err()
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = SECRETS.to_vec();
        pairs.extend([
            ("MURMUR_PORT", "8080"),
            ("MURMUR_ACCESS_TTL_SECS", "60"),
            ("MURMUR_PASSWORD_MEMORY_KIB", "4096"),
            ("MURMUR_CONCEAL_DEACTIVATED", "true"),
            ("MURMUR_CORS_ORIGINS", "https://a.example, https://b.example,"),
        ]);
        let config = load(&pairs).unwrap();

        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.tokens.access_ttl, Duration::seconds(60));
        assert_eq!(config.password_cost.memory_kib, 4096);
        assert!(config.login_policy.conceal_deactivated);
        assert_eq!(
            config.cors_origins.unwrap(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn token_lifetimes_are_bounded() {
        for (key, value) in [
            ("MURMUR_ACCESS_TTL_SECS", "0"),
            ("MURMUR_REFRESH_TTL_SECS", "-60"),
            ("MURMUR_ACCESS_TTL_SECS", "999999999999999999"),
            ("MURMUR_REFRESH_TTL_SECS", "9223372036854775807"),
        ] {
            let mut pairs = SECRETS.to_vec();
            pairs.push((key, value));
            assert!(load(&pairs).is_err(), "{key}={value} was accepted");
        }

        let mut pairs = SECRETS.to_vec();
        pairs.push(("MURMUR_REFRESH_TTL_SECS", "315360000"));
        assert_eq!(load(&pairs).unwrap().tokens.refresh_ttl, Duration::days(3650));
    }

    #[test]
    fn bad_numbers_are_errors() {
        let mut pairs = SECRETS.to_vec();
        pairs.push(("MURMUR_PORT", "not-a-port"));
        assert!(load(&pairs).is_err());
    }
}
