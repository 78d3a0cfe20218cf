use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

/// Process-wide configuration, loaded once at startup.
///
/// Values come from the YAML config file; a handful of `GOGEMINI_*`
/// environment variables override the file (useful for containers).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: String,
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_disable_key_threshold")]
    pub disable_key_threshold: i64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            disable_key_threshold: default_disable_key_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often the revival sweep probes quarantined keys, e.g. "10m".
    #[serde(default = "default_key_revival_interval")]
    pub key_revival_interval: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            key_revival_interval: default_key_revival_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn key_revival_interval(&self) -> Duration {
        parse_duration(&self.key_revival_interval).unwrap_or_else(|_| Duration::from_secs(600))
    }
}

fn default_port() -> u16 {
    8080
}

fn default_disable_key_threshold() -> i64 {
    3
}

fn default_key_revival_interval() -> String {
    "10m".to_string()
}

/// Load the config file, apply environment overrides, validate.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(port) = std::env::var("GOGEMINI_PORT") {
        if let Ok(port) = port.parse() {
            config.port = port;
        }
    }
    if let Ok(debug) = std::env::var("GOGEMINI_DEBUG") {
        config.debug = debug == "true";
    }
    if let Ok(db_type) = std::env::var("GOGEMINI_DATABASE_TYPE") {
        config.database.db_type = db_type;
    }
    if let Ok(dsn) = std::env::var("GOGEMINI_DATABASE_DSN") {
        config.database.dsn = dsn;
    }
    if let Ok(password) = std::env::var("GOGEMINI_ADMIN_PASSWORD") {
        config.admin.password = password;
    }
}

fn validate(config: &Config) -> anyhow::Result<()> {
    match config.database.db_type.as_str() {
        "sqlite" | "postgres" | "mysql" => {}
        other => bail!("unsupported database type: {other}"),
    }
    if config.database.dsn.is_empty() {
        bail!("database.dsn must not be empty");
    }
    if config.admin.password.is_empty() {
        bail!("admin.password must not be empty");
    }
    if config.proxy.disable_key_threshold < 1 {
        bail!("proxy.disable_key_threshold must be at least 1");
    }
    parse_duration(&config.scheduler.key_revival_interval)
        .with_context(|| "invalid scheduler.key_revival_interval")?;
    Ok(())
}

/// Parse durations of the form "30s", "10m", "1h" or a bare number of seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value.parse().with_context(|| format!("bad duration: {s}"))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => bail!("bad duration unit in: {s}"),
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
port: 9000
debug: true
database:
  type: sqlite
  dsn: gogemini.db
admin:
  password: secret
"#
    }

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = parse(base_yaml());
        assert_eq!(cfg.port, 9000);
        assert!(cfg.debug);
        assert_eq!(cfg.database.db_type, "sqlite");
        assert_eq!(cfg.database.dsn, "gogemini.db");
        assert_eq!(cfg.admin.password, "secret");
        // Omitted sections fall back to defaults.
        assert_eq!(cfg.proxy.disable_key_threshold, 3);
        assert_eq!(
            cfg.scheduler.key_revival_interval(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let cfg = parse(
            r#"
database:
  type: postgres
  dsn: postgres://localhost/gogemini
admin:
  password: pw
"#,
        );
        assert_eq!(cfg.port, 8080);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_validate_rejects_unknown_db_type() {
        let mut cfg = parse(base_yaml());
        cfg.database.db_type = "oracle".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_admin_password() {
        let mut cfg = parse(base_yaml());
        cfg.admin.password = String::new();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut cfg = parse(base_yaml());
        cfg.proxy.disable_key_threshold = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_env_overrides_take_priority() {
        // Env access is process-global, so set and clear inside one test.
        std::env::set_var("GOGEMINI_PORT", "7777");
        std::env::set_var("GOGEMINI_DEBUG", "false");
        std::env::set_var("GOGEMINI_DATABASE_TYPE", "mysql");
        std::env::set_var("GOGEMINI_DATABASE_DSN", "mysql://db/gogemini");
        std::env::set_var("GOGEMINI_ADMIN_PASSWORD", "override");

        let mut cfg = parse(base_yaml());
        apply_env_overrides(&mut cfg);

        assert_eq!(cfg.port, 7777);
        assert!(!cfg.debug);
        assert_eq!(cfg.database.db_type, "mysql");
        assert_eq!(cfg.database.dsn, "mysql://db/gogemini");
        assert_eq!(cfg.admin.password, "override");

        for var in [
            "GOGEMINI_PORT",
            "GOGEMINI_DEBUG",
            "GOGEMINI_DATABASE_TYPE",
            "GOGEMINI_DATABASE_DSN",
            "GOGEMINI_ADMIN_PASSWORD",
        ] {
            std::env::remove_var(var);
        }
    }
}
