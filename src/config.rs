// Application configuration: process settings from environment variables and
// CLI flags, bot settings from a JSON file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::bot::bridge::DEFAULT_BRIDGE_ADDR;
use crate::bot::manager::{DEFAULT_LOGIN_COMMANDS, RECONNECT_DELAY};
use crate::bot::{BotSettings, ConnectOptions, Timings};
use crate::relay::DEFAULT_HISTORY_LIMIT;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind_addr: IpAddr,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Bot configuration file (see [`BotConfig`]).
    pub bot_config_path: PathBuf,
    /// JSON file holding panel user accounts.
    pub users_path: PathBuf,
    /// Where console log history is persisted across restarts.
    pub log_history_path: PathBuf,
    /// Number of log entries replayed to new console observers.
    pub log_history_limit: usize,
    /// Directory with the browser UI. Served when it exists.
    pub static_dir: PathBuf,
    /// Start the bot as soon as the process is up.
    pub auto_start: bool,
    /// Password for the protected admin account, used only to seed an empty user store.
    pub admin_password: Option<String>,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `BIND_ADDR` - listen address (default: `0.0.0.0`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `CONFIG_PATH` - bot config file (default: `config.json`)
    /// - `USERS_PATH` - user store (default: `data/users.json`)
    /// - `BOT_LOG_PATH` - persisted console history (default: `bot-log.json`)
    /// - `LOG_HISTORY_LIMIT` - console history size (default: 200)
    /// - `STATIC_DIR` - browser UI directory (default: `public`)
    /// - `AUTO_START` - set to `true` to start the bot at launch
    /// - `ADMIN_PASSWORD` - seeds the protected admin account in an empty user store
    ///
    /// CLI flags:
    /// - `--port <PORT>` - override the port
    /// - `--config <PATH>` - override the bot config file
    /// - `--auto-start` - same as `AUTO_START=true`
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = env("BIND_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let bot_config_path = Self::parse_cli_value(args, "--config")
            .or_else(|| env("CONFIG_PATH"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"));

        let users_path = env("USERS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/users.json"));

        let log_history_path = env("BOT_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("bot-log.json"));

        let log_history_limit = env("LOG_HISTORY_LIMIT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HISTORY_LIMIT);

        let static_dir = env("STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("public"));

        let auto_start = args.iter().any(|a| a == "--auto-start")
            || env("AUTO_START")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false);

        let admin_password = env("ADMIN_PASSWORD").filter(|p| !p.is_empty());

        Config {
            bind_addr,
            port,
            bot_config_path,
            users_path,
            log_history_path,
            log_history_limit,
            static_dir,
            auto_start,
            admin_password,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bot config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Bot configuration file, read once at startup:
///
/// ```json
/// {
///   "minecraft": { "host": "mc.example.net", "port": 25565, "version": "1.20.4", "auth": "offline" },
///   "bot": { "username": "PanelBot", "password": "secret" },
///   "bridge": { "addr": "127.0.0.1:3001" },
///   "reconnect": { "delay_ms": 10000, "max_delay_ms": 300000 }
/// }
/// ```
///
/// `bridge` and `reconnect` are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub minecraft: MinecraftConfig,
    pub bot: BotAccount,
    pub bridge: BridgeConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinecraftConfig {
    pub host: String,
    pub port: u16,
    pub version: String,
    pub auth: String,
}

impl Default for MinecraftConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25565,
            version: "1.20.4".to_string(),
            auth: "offline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotAccount {
    pub username: String,
    pub password: Option<String>,
    /// Chat commands sent after spawning; `{password}` is substituted.
    pub login_commands: Vec<String>,
}

impl Default for BotAccount {
    fn default() -> Self {
        Self {
            username: "PanelBot".to_string(),
            password: None,
            login_commands: DEFAULT_LOGIN_COMMANDS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub addr: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_BRIDGE_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub delay_ms: u64,
    /// Enables capped exponential backoff when set.
    pub max_delay_ms: Option<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: RECONNECT_DELAY.as_millis() as u64,
            max_delay_ms: None,
        }
    }
}

impl BotConfig {
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Read the config file, falling back to defaults when it is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{e}; using default bot settings");
                Self::default()
            }
        }
    }

    /// Settings for the lifecycle manager.
    pub fn settings(&self) -> BotSettings {
        let timings = Timings {
            reconnect_delay: Duration::from_millis(self.reconnect.delay_ms),
            reconnect_max_delay: self.reconnect.max_delay_ms.map(Duration::from_millis),
            ..Timings::default()
        };
        BotSettings {
            connect: ConnectOptions {
                host: self.minecraft.host.clone(),
                port: self.minecraft.port,
                username: self.bot.username.clone(),
                password: self.bot.password.clone().filter(|p| !p.is_empty()),
                auth: self.minecraft.auth.clone(),
                version: self.minecraft.version.clone(),
            },
            login_commands: self.bot.login_commands.clone(),
            timings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(&args(&["botpanel"]), |_| None);
        assert_eq!(config.port, 3000);
        assert_eq!(config.bot_config_path, PathBuf::from("config.json"));
        assert_eq!(config.users_path, PathBuf::from("data/users.json"));
        assert_eq!(config.log_history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(!config.auto_start);
        assert!(config.admin_password.is_none());
    }

    #[test]
    fn test_cli_overrides_env() {
        let env: HashMap<&str, &str> =
            HashMap::from([("PORT", "4000"), ("CONFIG_PATH", "/etc/bot.json"), ("AUTO_START", "1")]);
        let config = Config::from_sources(&args(&["botpanel", "--port", "5000"]), |k| {
            env.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.port, 5000);
        assert_eq!(config.bot_config_path, PathBuf::from("/etc/bot.json"));
        assert!(config.auto_start);
    }

    #[test]
    fn test_bot_config_full() {
        let config = BotConfig::from_json(
            r#"{
                "minecraft": {"host": "mc.example.net", "port": 25570, "version": "1.19.2", "auth": "microsoft"},
                "bot": {"username": "Helper", "password": "pw"},
                "reconnect": {"delay_ms": 2000, "max_delay_ms": 60000}
            }"#,
        )
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.connect.host, "mc.example.net");
        assert_eq!(settings.connect.port, 25570);
        assert_eq!(settings.connect.auth, "microsoft");
        assert_eq!(settings.connect.password.as_deref(), Some("pw"));
        assert_eq!(settings.login_commands.len(), 2);
        assert_eq!(settings.timings.reconnect_delay, Duration::from_secs(2));
        assert_eq!(settings.timings.reconnect_max_delay, Some(Duration::from_secs(60)));
        assert_eq!(config.bridge.addr, DEFAULT_BRIDGE_ADDR);
    }

    #[test]
    fn test_bot_config_partial_uses_defaults() {
        let config = BotConfig::from_json(r#"{"bot": {"username": "Solo", "password": ""}}"#).unwrap();
        let settings = config.settings();
        assert_eq!(settings.connect.host, "localhost");
        assert_eq!(settings.connect.port, 25565);
        assert_eq!(settings.connect.username, "Solo");
        assert!(settings.connect.password.is_none());
        assert_eq!(settings.timings.reconnect_delay, RECONNECT_DELAY);
        assert!(settings.timings.reconnect_max_delay.is_none());
    }

    #[test]
    fn test_missing_config_falls_back() {
        let config = BotConfig::load(Path::new("/nonexistent/botpanel/config.json"));
        assert_eq!(config.bot.username, "PanelBot");
        assert!(BotConfig::from_json("{not json").is_err());
    }
}
