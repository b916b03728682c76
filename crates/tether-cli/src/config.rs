//! Configuration system for the Tether CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tether_native::SessionConfig;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Tether configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session tunables passed to the native layer
    #[serde(default)]
    pub session: SessionConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named host profiles
    #[serde(default)]
    pub hosts: Vec<HostProfile>,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Show a progress bar for `get` and `put`
    #[serde(default = "default_true")]
    pub show_progress: bool,
    /// Permission bits for files created by `put`
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    /// Permission bits for directories created by `mkdir`
    #[serde(default = "default_directory_mode")]
    pub directory_mode: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A named host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostProfile {
    /// Name used on the command line
    pub name: String,
    /// Host name or address
    pub hostname: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Private key file used for public key authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

/// A fully resolved connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    /// Host name or address
    pub hostname: String,
    /// SSH port
    pub port: u16,
    /// Login user, if known
    pub user: Option<String>,
    /// Private key file, if any
    pub identity_file: Option<PathBuf>,
}

impl HostTarget {
    /// Parse `[user@]host[:port]`. IPv6 addresses must be bracketed when a
    /// port is given.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let (user, rest) = match spec.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => anyhow::bail!("Empty user in host '{}'", spec),
            None => (None, spec),
        };

        let (hostname, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| anyhow::anyhow!("Unterminated '[' in host '{}'", spec))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, spec)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => anyhow::bail!("Unexpected '{}' after address in host '{}'", tail, spec),
            };
            (host.to_string(), port)
        } else {
            match rest.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host.to_string(), parse_port(port, spec)?),
                // Bare IPv6 address
                Some(_) => (rest.to_string(), DEFAULT_PORT),
                None => (rest.to_string(), DEFAULT_PORT),
            }
        };

        if hostname.is_empty() {
            anyhow::bail!("Empty hostname in host '{}'", spec);
        }

        Ok(Self {
            hostname,
            port,
            user,
            identity_file: None,
        })
    }

    /// `host:port` suitable for `ToSocketAddrs`
    #[must_use]
    pub fn address(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

fn parse_port(port: &str, spec: &str) -> anyhow::Result<u16> {
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid port '{}' in host '{}'", port, spec))?;
    if port == 0 {
        anyhow::bail!("Invalid port 0 in host '{}'", spec);
    }
    Ok(port)
}

// Default values

fn default_true() -> bool {
    true
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_directory_mode() -> u32 {
    0o755
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            show_progress: true,
            file_mode: default_file_mode(),
            directory_mode: default_directory_mode(),
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

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tether/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Resolve a command-line host: a profile name, or `[user@]host[:port]`.
    ///
    /// A `user@` prefix on a profile name overrides the profile's user.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec cannot be parsed.
    pub fn resolve_host(&self, spec: &str) -> anyhow::Result<HostTarget> {
        let (user, name) = match spec.rsplit_once('@') {
            Some((user, name)) => (Some(user), name),
            None => (None, spec),
        };

        if let Some(profile) = self.hosts.iter().find(|h| h.name == name) {
            return Ok(HostTarget {
                hostname: profile.hostname.clone(),
                port: profile.port,
                user: user.map(str::to_string).or_else(|| profile.user.clone()),
                identity_file: profile.identity_file.clone(),
            });
        }

        HostTarget::parse(spec)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.session.validate()?;

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        // Validate permission bits
        for (name, mode) in [
            ("file_mode", self.transfer.file_mode),
            ("directory_mode", self.transfer.directory_mode),
        ] {
            if mode > 0o7777 {
                anyhow::bail!("Invalid {}: {:o} (must be at most 7777)", name, mode);
            }
        }

        // Validate host profiles
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() || host.name.contains('@') || host.name.contains(':') {
                anyhow::bail!("Host profile name '{}' is invalid", host.name);
            }
            if !seen.insert(host.name.as_str()) {
                anyhow::bail!("Duplicate host profile '{}'", host.name);
            }
            if host.hostname.is_empty() {
                anyhow::bail!("Host profile '{}' has empty hostname", host.name);
            }
            if host.port == 0 {
                anyhow::bail!("Host profile '{}' has invalid port: 0", host.name);
            }
        }

        Ok(())
    }
}
