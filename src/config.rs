// src/config.rs

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Grace period and restart-delay knobs for every transcoder.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct FfmpegConfig {
    /// Seconds to wait after the last client leaves before killing the process.
    pub timeout: u64,
    /// Seconds to wait after an unexpected death before restarting.
    pub reload: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct HttpServerConfig {
    pub addr: String,
    pub stat_url: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct RtmpServerConfig {
    pub app: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct ThumbnailConfig {
    /// Seconds between sweep rounds.
    pub interval: u64,
    /// Max transcoders alive at once during a round.
    pub workers: usize,
    /// Per-job timeout, in seconds.
    pub timeout: u64,
    /// Optional delay before the first round ever runs.
    pub start_after: Option<u64>,
    pub input_opt: String,
    pub output_opt: String,
    pub resize_opt: String,
    /// `"small:320,medium:640"` style list of named output sizes.
    pub sizes: String,
    pub dir: String,
    pub format: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct LogConfig {
    pub dir: String,
}

/// Root configuration for the supervisor, loaded from layered TOML files plus
/// environment overrides, the way `artisan_middleware::config::AppConfig` does.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct SupervisorConfig {
    pub ffmpeg: FfmpegConfig,
    #[serde(rename = "http-server")]
    pub http_server: HttpServerConfig,
    #[serde(rename = "rtmp-server")]
    pub rtmp_server: RtmpServerConfig,
    pub thumbnail: ThumbnailConfig,
    pub log: LogConfig,
}

impl SupervisorConfig {
    /// Loads configuration the way `AppConfig::new` does: defaults, then
    /// `Settings.toml`, then `Settings.<RUN_MODE>.toml`, then `APP__`-prefixed
    /// environment variables, in that order of increasing precedence.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("ffmpeg.timeout", 10)?
            .set_default("ffmpeg.reload", 5)?
            .set_default("http-server.addr", "http://127.0.0.1")?
            .set_default("http-server.stat_url", "/stat")?
            .set_default("rtmp-server.app", "live")?
            .set_default("thumbnail.interval", 300)?
            .set_default("thumbnail.workers", 4)?
            .set_default("thumbnail.timeout", 15)?
            .set_default("thumbnail.start_after", 0)?
            .set_default("thumbnail.input_opt", "-y")?
            .set_default("thumbnail.output_opt", "-vframes 1")?
            .set_default("thumbnail.resize_opt", "-vf scale={}:-1")?
            .set_default("thumbnail.sizes", "small:320,medium:640")?
            .set_default("thumbnail.dir", "/tmp/thumbnails")?
            .set_default("thumbnail.format", "jpg")?
            .set_default("log.dir", "/tmp/stream-supervisor-logs")?;

        let builder = builder.add_source(File::with_name("Settings").required(false));
        let builder = builder
            .add_source(File::with_name(&format!("Settings.{}", run_mode)).required(false));
        let builder = builder.add_source(Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Basic sanity checks, mirroring `AppConfig::validate`.
    pub fn validate(&self) -> Result<(), String> {
        if self.thumbnail.workers == 0 {
            return Err("thumbnail.workers must be greater than 0".into());
        }
        if self.rtmp_server.app.is_empty() {
            return Err("rtmp-server.app must be provided".into());
        }
        if self.http_server.addr.is_empty() || self.http_server.stat_url.is_empty() {
            return Err("http-server.addr and http-server.stat_url must be provided".into());
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg.timeout)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg.reload)
    }

    pub fn stats_url(&self) -> String {
        format!("{}{}", self.http_server.addr, self.http_server.stat_url)
    }
}
