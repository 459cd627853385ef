use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use lib_watch::{CoreConfig, CoreError, CoreResult};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Live camera monitoring ingestion server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "MONITOR_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "MONITOR_CORE_CONFIG_PATH", help = "Path to a JSON file holding the full ingestion-core configuration tree.")]
    pub core_config_path: Option<PathBuf>,

    #[clap(long, env = "MONITOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "MONITOR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "MONITOR_WS_URL", help = "Backend WebSocket URL to ingest from.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "MONITOR_CONNECT_TIMEOUT_MS", help = "Connect timeout in milliseconds.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long, env = "MONITOR_PING_INTERVAL_MS", help = "Liveness probe interval in milliseconds.")]
    pub ping_interval_ms: Option<u64>,

    #[clap(long, env = "MONITOR_TARGET_FPS", help = "Target frame rate for stream alignment.")]
    pub target_fps: Option<u32>,

    #[clap(long, env = "MONITOR_BREAKER_THRESHOLD", help = "Consecutive failures before a component circuit breaker opens.")]
    pub breaker_threshold: Option<u32>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            core_config_path: other.core_config_path.or(self.core_config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            ws_url: other.ws_url.or(self.ws_url),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            ping_interval_ms: other.ping_interval_ms.or(self.ping_interval_ms),
            target_fps: other.target_fps.or(self.target_fps),
            breaker_threshold: other.breaker_threshold.or(self.breaker_threshold),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Builds the ingestion-core configuration: the optional core config file
    /// first, then the flat server-level overrides on top.
    pub fn to_core_config(&self) -> CoreResult<CoreConfig> {
        let mut core = match &self.core_config_path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|e| {
                    CoreError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str::<CoreConfig>(&raw)?
            }
            None => CoreConfig::default(),
        };

        if let Some(url) = &self.ws_url {
            core.channel.url = url.clone();
        }
        if let Some(ms) = self.connect_timeout_ms {
            core.channel.connect_timeout_ms = ms;
        }
        if let Some(ms) = self.ping_interval_ms {
            core.channel.ping_interval_ms = ms;
        }
        if let Some(fps) = self.target_fps {
            core.sync.target_fps = fps;
        }
        if let Some(threshold) = self.breaker_threshold {
            core.resilience.breaker_threshold = threshold;
        }

        // The server connects eagerly; recovery handles the rest.
        core.channel.auto_connect = true;

        let parsed = url::Url::parse(&core.channel.url)
            .map_err(|e| CoreError::Config(format!("invalid backend URL: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(CoreError::Config(format!(
                "backend URL must be ws:// or wss://, got '{}'",
                parsed.scheme()
            )));
        }
        Ok(core)
    }
}

pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ws_url: Some("ws://127.0.0.1:9030/stream".to_string()),
        ..Default::default()
    };

    // 2. Load from config file (server_monitor.conf) if present.
    //    Allow overriding default config file path with CLI arg.
    let cli_args_for_path = Config::parse();

    let config_file_path = cli_args_for_path
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_monitor.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!(
                    "Failed to parse config file: {}. Falling back to other sources.",
                    config_file_path.display()
                );
            }
        } else {
            log::warn!(
                "Failed to read config file: {}. Falling back to other sources.",
                config_file_path.display()
            );
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Override with environment variables and CLI arguments.
    let cli_args_final = Config::parse();
    let mut current_config = current_config.merge(cli_args_final);

    // 4. Fall back to the per-user core config file if one exists.
    if current_config.core_config_path.is_none() {
        if let Some(config_dir) = dirs::config_dir() {
            let candidate = config_dir.join("server_monitor").join("core.json");
            if candidate.exists() {
                current_config.core_config_path = Some(candidate);
            }
        }
    }

    current_config
}
