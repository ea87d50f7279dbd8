use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "webjudge", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', global = true)]
    pub config_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the job queue, workers, and submission API
    Coordinator {
        /// Whether to flush the existing queue and record database
        #[arg(long = "flush-data", short = 'f', default_value_t = false)]
        flush_data: bool,
    },
    /// Run the sandbox service that executes grading scripts in a browser
    Sandbox,
}

impl CliArgs {
    /// Load the configuration from the specified file, or defaults when absent
    pub fn to_config(&self) -> std::io::Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub target: TargetConfig,
    pub sandbox: SandboxConfig,
    pub webhook: WebhookConfig,
    pub storage: StorageConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: u8,
    /// Defaults to the platform data directory
    pub database_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            database_path: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TargetConfig {
    pub image: String,
    /// Overrides the image's default command when non-empty
    pub command: Vec<String>,
    pub network: String,
    pub port: u16,
    /// Directory the snapshot is mounted at inside the container
    pub mount_path: String,
    pub ready_marker: String,
    pub start_timeout: Seconds,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    /// Where snapshots are materialised; system temp dir when absent
    pub work_dir: Option<PathBuf>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            image: "webjudge-target:latest".to_string(),
            command: Vec::new(),
            network: "webjudge-internal".to_string(),
            port: 8080,
            mount_path: "/srv/app".to_string(),
            ready_marker: "Ready".to_string(),
            start_timeout: Seconds(10.0),
            memory: "256m".to_string(),
            cpus: "0.5".to_string(),
            pids_limit: 128,
            work_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Address the sandbox service listens on and the coordinator dials
    pub address: String,
    pub reply_timeout: Seconds,
    pub script_timeout: Seconds,
    pub heartbeat_interval: Seconds,
    pub reconnect_interval: Seconds,
    pub pool_size: usize,
    pub max_pages: usize,
    pub image_cap: ByteSize,
    /// Path to a Chromium binary; auto-detected when absent
    pub chrome_executable: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7070".to_string(),
            reply_timeout: Seconds(30.0),
            script_timeout: Seconds(10.0),
            heartbeat_interval: Seconds(15.0),
            reconnect_interval: Seconds(2.0),
            pool_size: 1,
            max_pages: 4,
            image_cap: ByteSize(5 * 1024 * 1024),
            chrome_executable: None,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct WebhookConfig {
    /// Notifications are disabled when absent
    pub url: Option<String>,
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to the platform data directory
    pub artifact_dir: Option<PathBuf>,
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            public_base_url: "http://127.0.0.1:12345/artifacts".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Seconds(pub f64);

impl From<Seconds> for Duration {
    fn from(s: Seconds) -> Self {
        Duration::from_secs_f64(s.0.max(0.0))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub usize);
