use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use serde::Deserialize;

use crate::language::Language;
use crate::sandbox::SweepPolicy;

#[derive(Parser)]
#[command(name = "codejudge", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Address to bind, overrides the configuration file
    #[arg(long = "bind-address")]
    pub bind_address: Option<String>,

    /// Port to bind, overrides the configuration file
    #[arg(long = "port", short = 'p')]
    pub bind_port: Option<u16>,
}

impl CliArgs {
    /// Load the configuration from the specified file, falling back to defaults
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Failed to open config file {path}"))?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)
                    .with_context(|| format!("Failed to parse config file {path}"))?
            }
            None => Config::default(),
        };

        if let Some(addr) = &self.bind_address {
            config.server.bind_address = addr.clone();
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = port;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub judge: JudgeConfig,
    pub workspace: WorkspaceConfig,
    pub reclaimer: ReclaimerConfig,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let sandbox = &self.sandbox;
        if sandbox.time_limit_ms == 0 || sandbox.compile_time_limit_ms == 0 {
            return Err(anyhow!("time limits must be positive"));
        }
        if sandbox.memory_limit_mb == 0 || sandbox.compile_memory_limit_mb == 0 {
            return Err(anyhow!("memory limits must be positive"));
        }
        if !(sandbox.cpus > 0.0) {
            return Err(anyhow!("sandbox.cpus must be positive, got {}", sandbox.cpus));
        }
        if self.judge.max_test_cases == 0 {
            return Err(anyhow!("judge.max_test_cases must be positive"));
        }
        if self.reclaimer.interval_secs == 0 {
            return Err(anyhow!("reclaimer.interval_secs must be positive"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 12345,
        }
    }
}

/// Isolation knobs handed to every sandbox container
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container engine CLI, e.g. `docker` or `podman`
    pub engine: String,
    pub memory_limit_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub tmpfs_size_mb: u64,
    /// `uid:gid` the program runs as inside the container
    pub user: String,
    pub time_limit_ms: u64,
    pub compile_time_limit_ms: u64,
    pub compile_memory_limit_mb: u64,
    pub kill_grace_ms: u64,
    pub output_limit_bytes: usize,
    pub pull_missing_images: bool,
    pub images: ImageConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            memory_limit_mb: 128,
            cpus: 0.5,
            pids_limit: 64,
            tmpfs_size_mb: 50,
            user: "65534:65534".to_string(),
            time_limit_ms: 10_000,
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 256,
            kill_grace_ms: 2_000,
            output_limit_bytes: 8 * 1024 * 1024,
            pull_missing_images: false,
            images: ImageConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn compile_time_limit(&self) -> Duration {
        Duration::from_millis(self.compile_time_limit_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ImageConfig {
    pub cpp: String,
    pub java: String,
    pub python: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            cpp: "gcc:13".to_string(),
            java: "eclipse-temurin:17-jdk".to_string(),
            python: "python:3.11-slim".to_string(),
        }
    }
}

impl ImageConfig {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::Cpp => &self.cpp,
            Language::Java => &self.java,
            Language::Python => &self.python,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    pub output_match: OutputMatch,
    /// Synthesize keyword-based cases for problems without explicit ones
    pub heuristic_fallback: bool,
    pub max_test_cases: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            output_match: OutputMatch::Trim,
            heuristic_fallback: false,
            max_test_cases: 100,
        }
    }
}

/// How actual output is compared against the expected answer
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputMatch {
    /// Equal after trimming outer whitespace
    #[default]
    Trim,
    /// Trailing spaces on each line and trailing blank lines are ignored
    Lines,
    /// Byte-for-byte equality
    Strict,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: Option<PathBuf>,
}

impl WorkspaceConfig {
    /// The configured root, or `<user cache dir>/workspaces`
    pub fn resolve_root(&self) -> anyhow::Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }

        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "codejudge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("workspaces"))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub interval_secs: u64,
    /// Trigger an extra sweep after this many executions, 0 disables
    pub every_n_executions: u64,
    pub workspace_retention_secs: u64,
    pub container_retention_secs: u64,
    pub image_retention_hours: u64,
    pub prune_images: bool,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            every_n_executions: 50,
            workspace_retention_secs: 3600,
            container_retention_secs: 3600,
            image_retention_hours: 24,
            prune_images: true,
        }
    }
}

impl ReclaimerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn workspace_retention(&self) -> Duration {
        Duration::from_secs(self.workspace_retention_secs)
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            container_retention: Duration::from_secs(self.container_retention_secs),
            image_retention: self
                .prune_images
                .then(|| Duration::from_secs(self.image_retention_hours * 3600)),
        }
    }
}
