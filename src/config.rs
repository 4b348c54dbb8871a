use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured profile list
pub const PROFILES_ENV: &str = "DEVGATE_PROFILES";

/// Global configuration for the development proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Inbound server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised frontend dev server
    #[serde(default)]
    pub dev_server: DevServerConfig,

    /// Active runtime profiles (e.g. "dev", "prod")
    #[serde(default)]
    pub profiles: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path prefixes owned by the backend and never forwarded
    #[serde(default = "default_excluded_prefixes")]
    pub excluded_prefixes: Vec<String>,

    /// Max time for one forwarded exchange with the dev server
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections kept to the dev server (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            excluded_prefixes: default_excluded_prefixes(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Command used to launch the dev server: either a single shell-style line
/// or an explicit argument vector.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum StartCommand {
    Line(String),
    Args(Vec<String>),
}

/// Configuration of the supervised dev server process
///
/// # Security Warning
///
/// `start_command` is executed directly with the permissions of this process.
/// Configuration files must come from trusted sources only.
#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Enable the dev server integration at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Launch the dev server during startup
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Treat a failed start as a fatal startup error
    #[serde(default)]
    pub required: bool,

    /// Host the dev server listens on
    #[serde(default = "default_dev_host")]
    pub host: String,

    /// Port the dev server listens on
    #[serde(default = "default_dev_port")]
    pub port: u16,

    /// Frontend project directory the command runs in
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Production build output, relative to `working_dir`
    #[serde(default = "default_build_dir")]
    pub build_dir: String,

    /// Command to launch the dev server (default: `npm run dev -- --host H --port P`)
    pub start_command: Option<StartCommand>,

    /// Environment variables merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Seconds to wait for a readiness signal
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Substrings in the dev server's output that mark it ready
    #[serde(default = "default_readiness_patterns")]
    pub readiness_patterns: Vec<String>,

    /// Also probe the dev server over HTTP while waiting for readiness
    #[serde(default)]
    pub readiness_probe: bool,

    /// Seconds between the graceful signal and tree kill
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self::new(&default_dev_host(), default_dev_port())
    }
}

impl DevServerConfig {
    /// Create a dev server config with defaults for everything but the address
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            enabled: true,
            auto_start: true,
            required: false,
            host: host.to_string(),
            port,
            working_dir: default_working_dir(),
            build_dir: default_build_dir(),
            start_command: None,
            env: HashMap::new(),
            startup_timeout_secs: default_startup_timeout(),
            readiness_patterns: default_readiness_patterns(),
            readiness_probe: false,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    /// Set the command as an argument vector (builder pattern)
    pub fn with_command<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.start_command = Some(StartCommand::Args(args.into_iter().map(Into::into).collect()));
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the startup timeout (builder pattern)
    pub fn with_startup_timeout_secs(mut self, secs: u64) -> Self {
        self.startup_timeout_secs = secs;
        self
    }

    /// Set the readiness patterns (builder pattern)
    pub fn with_readiness_patterns<S: Into<String>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.readiness_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn build_path(&self) -> PathBuf {
        self.working_dir.join(&self.build_dir)
    }

    /// Resolve the command line to execute, falling back to the npm default
    pub fn command_line(&self) -> anyhow::Result<Vec<String>> {
        let argv = match &self.start_command {
            Some(StartCommand::Line(line)) => shell_words::split(line)
                .map_err(|e| anyhow::anyhow!("Invalid dev_server.start_command: {}", e))?,
            Some(StartCommand::Args(args)) => args.clone(),
            None => self.default_command(),
        };

        if argv.is_empty() {
            anyhow::bail!("dev_server.start_command must not be empty");
        }
        Ok(argv)
    }

    fn default_command(&self) -> Vec<String> {
        let mut argv: Vec<String> = if cfg!(windows) {
            vec!["cmd.exe".into(), "/c".into(), "npm.cmd".into()]
        } else {
            vec!["npm".into()]
        };
        argv.extend([
            "run".to_string(),
            "dev".to_string(),
            "--".to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ]);
        argv
    }

    /// Validate the dev server configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("dev_server: 'port' must be between 1 and 65535".to_string());
        }
        if self.startup_timeout_secs == 0 {
            errors.push("dev_server: 'startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.host.is_empty() {
            errors.push("dev_server: 'host' must not be empty".to_string());
        }
        if let Err(e) = self.command_line() {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_excluded_prefixes() -> Vec<String> {
    vec!["/api/".to_string(), "/actuator/".to_string()]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_dev_host() -> String {
    "localhost".to_string()
}

fn default_dev_port() -> u16 {
    5173
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("frontend")
}

fn default_build_dir() -> String {
    "dist".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_readiness_patterns() -> Vec<String> {
    vec!["ready in".to_string(), "Local:".to_string()]
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(mut dev_errors) = self.dev_server.validate() {
            errors.append(&mut dev_errors);
        }

        for prefix in &self.server.excluded_prefixes {
            if !prefix.starts_with('/') {
                errors.push(format!(
                    "server: excluded prefix '{}' must start with '/'",
                    prefix
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Split a comma separated profile list, ignoring blanks
pub fn parse_profiles(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}
