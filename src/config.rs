use serde::Deserialize;

/// Application configuration.
///
/// Sources, later overriding earlier: compiled defaults, `config.yaml` in
/// the working directory or `./conf`, then `CLAND_*` environment variables
/// (`CLAND_SERVER_PORT`, `CLAND_SERVER_HOST`, `CLAND_SERVER_MODE`,
/// `CLAND_LOG_LEVEL`, `CLAND_LOG_COMPRESS`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `debug` or `production`.
    #[serde(default = "default_mode")]
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path; empty logs to stderr.
    #[serde(default)]
    pub filename: String,
    /// Accepted for config compatibility; rotation does not compress.
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// `memory` or `sqlite`.
    #[serde(default = "default_db_driver")]
    pub driver: String,
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mode() -> String {
    "debug".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_driver() -> String {
    "memory".to_string()
}

fn default_db_path() -> String {
    "cland-chat.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            mode: default_mode(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            filename: String::new(),
            compress: false,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            driver: default_db_driver(),
            path: default_db_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server: ServerConfig::default(),
            log: LogConfig::default(),
            db: DbConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::File::with_name("conf/config").required(false))
            .add_source(
                config::Environment::with_prefix("CLAND")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn is_production(&self) -> bool {
        self.server.mode == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        assert!(!cfg.is_production());
        assert_eq!(cfg.db.driver, "memory");
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn yaml_fragment_deserialises() {
        let raw = r#"
server:
  host: 127.0.0.1
  port: 9090
  mode: production
log:
  level: warn
  filename: logs/cland.log
  compress: true
db:
  driver: sqlite
  path: /tmp/chat.db
"#;
        let cfg: AppConfig = serde_yaml_from_str(raw);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9090");
        assert!(cfg.is_production());
        assert_eq!(cfg.db.driver, "sqlite");
        assert!(cfg.log.compress);
    }

    fn serde_yaml_from_str(raw: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
