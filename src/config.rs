//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `COMMAND_TIMEOUT_MS`,
//!    `MAX_OUTPUT_SIZE_BYTES`, `SANDBOXD_LISTEN`, `SANDBOXD_WORKDIR`
//! 2. **Config file** — path via `--config <path>`, or `sandboxd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//! command_timeout_ms = 30000
//! max_output_size_bytes = 10485760  # 10 MiB
//! process_max_age_secs = 1800
//!
//! [shell]
//! shell = "/bin/bash"
//! default_working_dir = "/workspace"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3000`). The bound port is the
    /// control plane and can never be exposed through the port registry.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections (default 128).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Default per-command timeout in milliseconds (default 30 000).
    /// Per-session and per-request overrides supersede this.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Maximum per-command log size in bytes (default 10 MiB). Commands whose
    /// captured output exceeds this fail with `OUTPUT_TOO_LARGE`.
    #[serde(default = "default_max_output_size_bytes")]
    pub max_output_size_bytes: u64,
    /// Terminal process records older than this are garbage-collected
    /// (default 1800 s).
    #[serde(default = "default_process_max_age_secs")]
    pub process_max_age_secs: u64,
    /// Interval between process GC sweeps (default 1800 s).
    #[serde(default = "default_process_gc_interval_secs")]
    pub process_gc_interval_secs: u64,
    /// Inactive port entries older than this are garbage-collected
    /// (default 3600 s).
    #[serde(default = "default_port_max_inactive_secs")]
    pub port_max_inactive_secs: u64,
    /// Interval between port GC sweeps (default 1800 s).
    #[serde(default = "default_port_gc_interval_secs")]
    pub port_gc_interval_secs: u64,
    /// Maximum file size in bytes for `/api/files` read/write (default 10 MiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

/// Shell defaults used when requests don't specify overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary for sessions (default `/bin/bash`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Working directory for new sessions (default `/workspace`).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_max_connections() -> usize {
    128
}
fn default_command_timeout_ms() -> u64 {
    30000
}
fn default_max_output_size_bytes() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}
fn default_process_max_age_secs() -> u64 {
    1800
}
fn default_process_gc_interval_secs() -> u64 {
    1800
}
fn default_port_max_inactive_secs() -> u64 {
    3600
}
fn default_port_gc_interval_secs() -> u64 {
    1800
}
fn default_max_file_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_working_dir() -> String {
    "/workspace".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            command_timeout_ms: default_command_timeout_ms(),
            max_output_size_bytes: default_max_output_size_bytes(),
            process_max_age_secs: default_process_max_age_secs(),
            process_gc_interval_secs: default_process_gc_interval_secs(),
            port_max_inactive_secs: default_port_max_inactive_secs(),
            port_gc_interval_secs: default_port_gc_interval_secs(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_working_dir: default_working_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            shell: ShellConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (exits on failure). Otherwise looks
    /// for `sandboxd.toml` in the current directory, falling back to compiled
    /// defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            match std::fs::read_to_string(p) {
                Ok(text) => match toml::from_str(&text) {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("Failed to parse config {p}: {e}");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("Failed to read config {p}: {e}");
                    std::process::exit(1);
                }
            }
        } else if Path::new("sandboxd.toml").exists() {
            match std::fs::read_to_string("sandboxd.toml") {
                Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                    eprintln!("Failed to parse sandboxd.toml: {e}, using defaults");
                    Config::default()
                }),
                Err(_) => Config::default(),
            }
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SANDBOXD_LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("SANDBOXD_WORKDIR") {
            self.shell.default_working_dir = v;
        }
        if let Ok(v) = std::env::var("COMMAND_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.server.command_timeout_ms = ms,
                Err(_) => eprintln!("Ignoring non-numeric COMMAND_TIMEOUT_MS={v}"),
            }
        }
        if let Ok(v) = std::env::var("MAX_OUTPUT_SIZE_BYTES") {
            match v.parse() {
                Ok(bytes) => self.server.max_output_size_bytes = bytes,
                Err(_) => eprintln!("Ignoring non-numeric MAX_OUTPUT_SIZE_BYTES={v}"),
            }
        }
    }

    /// The control-plane port, parsed from the listen address.
    ///
    /// This port is unconditionally reserved: the port registry refuses to
    /// expose it.
    #[must_use]
    pub fn control_port(&self) -> u16 {
        self.server
            .listen
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000)
    }

    /// Validate config values, returning a list of human-readable problems.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.listen is not a valid socket address: {}",
                self.server.listen
            ));
        }
        if self.server.command_timeout_ms == 0 {
            errors.push("server.command_timeout_ms must be > 0".to_string());
        }
        if self.server.max_output_size_bytes == 0 {
            errors.push("server.max_output_size_bytes must be > 0".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:3000");
        assert_eq!(config.server.command_timeout_ms, 30000);
        assert_eq!(config.server.max_output_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.shell.shell, "/bin/bash");
        assert_eq!(config.shell.default_working_dir, "/workspace");
        assert_eq!(config.control_port(), 3000);
    }

    #[test]
    fn control_port_follows_listen() {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:8787".to_string();
        assert_eq!(config.control_port(), 8787);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            command_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.server.command_timeout_ms, 500);
        assert_eq!(config.server.listen, "0.0.0.0:3000");
        assert_eq!(config.shell.default_working_dir, "/workspace");
    }

    #[test]
    fn validate_rejects_bad_listen() {
        let mut config = Config::default();
        config.server.listen = "not-an-addr".to_string();
        assert_eq!(config.validate().len(), 1);
    }
}
