//! Server configuration.
//!
//! Options come from the command line (`-C <conf> -v -d -h`) and a
//! configuration file of `key = value` assignments — the subset of a Lua
//! configuration the external scripting host hands the core, parsed here
//! so the server also runs standalone. Command line flags win over file
//! values.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::logger::Topics;
use crate::protocol::MSG_SIZE_DEFAULT;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("line {0}: cannot parse '{1}'")]
    BadLine(usize, String),

    #[error("bad value for '{0}': {1}")]
    BadValue(&'static str, String),
}

/// Parsed command line.
#[derive(Debug, Default, Clone)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
    pub daemonize: bool,
    pub help: bool,
}

/// Usage text for `-h`.
pub const USAGE: &str = "\
usage: tagserver [-C <config>] [-v] [-d] [-h]
  -C <config>  read options from a configuration file
  -v           verbose logging (all topics)
  -d           daemonize (handled by the service supervisor)
  -h           print this help and exit
";

/// Parse the process argument list (without the program name).
pub fn parse_args(args: &[String]) -> Result<CliOptions, ConfigError> {
    let mut opts = CliOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-C" => {
                let path = iter
                    .next()
                    .ok_or_else(|| ConfigError::BadValue("-C", "missing path".to_string()))?;
                opts.config_path = Some(PathBuf::from(path));
            }
            "-v" => opts.verbose = true,
            "-d" => opts.daemonize = true,
            "-h" => opts.help = true,
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
    }
    Ok(opts)
}

/// The full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UNIX socket the server listens on
    pub socket_path: PathBuf,
    /// Optional TCP listener
    pub tcp_port: Option<u16>,
    pub tcp_host: String,
    /// Accepted for the external supervisor; the core does not fork
    pub daemonize: bool,
    pub pid_file: Option<PathBuf>,
    pub retention_file: PathBuf,
    pub retention_interval_ms: u64,
    pub max_message_size: u32,
    pub verbosity: Topics,
    pub tag_list_start_size: usize,
    pub tag_list_grow: usize,
    /// Element capacity of queue tags
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/opendax"),
            tcp_port: None,
            tcp_host: "127.0.0.1".to_string(),
            daemonize: false,
            pid_file: None,
            retention_file: PathBuf::from("retentive.db"),
            retention_interval_ms: 5000,
            max_message_size: MSG_SIZE_DEFAULT,
            verbosity: Topics::FATAL | Topics::ERROR | Topics::MAJOR,
            tag_list_start_size: 1024,
            tag_list_grow: 1024,
            queue_depth: 32,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from parsed command line options.
    pub fn load(opts: &CliOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = &opts.config_path {
            config.apply_file(path)?;
        }
        if opts.verbose {
            config.verbosity = Topics::ALL;
        }
        if opts.daemonize {
            config.daemonize = true;
        }
        Ok(config)
    }

    /// Apply `key = value` assignments from a configuration file.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("--") || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::BadLine(lineno + 1, raw.to_string()))?;
            self.apply(key.trim(), unquote(value.trim()))?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "socket_path" => self.socket_path = PathBuf::from(value),
            "tcp_port" => {
                let port = value
                    .parse::<u16>()
                    .map_err(|_| ConfigError::BadValue("tcp_port", value.to_string()))?;
                self.tcp_port = if port == 0 { None } else { Some(port) };
            }
            "tcp_host" => self.tcp_host = value.to_string(),
            "daemonize" => {
                self.daemonize = parse_bool(value)
                    .ok_or_else(|| ConfigError::BadValue("daemonize", value.to_string()))?
            }
            "pid_file" => self.pid_file = Some(PathBuf::from(value)),
            "retention_file" => self.retention_file = PathBuf::from(value),
            "retention_interval_ms" => {
                self.retention_interval_ms = value.parse().map_err(|_| {
                    ConfigError::BadValue("retention_interval_ms", value.to_string())
                })?
            }
            "max_message_size" => {
                self.max_message_size = value
                    .parse()
                    .map_err(|_| ConfigError::BadValue("max_message_size", value.to_string()))?
            }
            "verbosity" => {
                let bits = parse_number(value)
                    .ok_or_else(|| ConfigError::BadValue("verbosity", value.to_string()))?;
                self.verbosity = Topics::from_bits_truncate(bits);
            }
            "tag_list_start_size" => {
                self.tag_list_start_size = value.parse().map_err(|_| {
                    ConfigError::BadValue("tag_list_start_size", value.to_string())
                })?
            }
            "tag_list_grow" => {
                self.tag_list_grow = value
                    .parse()
                    .map_err(|_| ConfigError::BadValue("tag_list_grow", value.to_string()))?
            }
            "queue_depth" => {
                self.queue_depth = value
                    .parse()
                    .map_err(|_| ConfigError::BadValue("queue_depth", value.to_string()))?
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

fn unquote(v: &str) -> &str {
    let v = v.trim();
    if v.len() >= 2 && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\''))) {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_number(v: &str) -> Option<u32> {
    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        v.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_conf(body: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "dax_conf_{}_{}.lua",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_args() {
        let args: Vec<String> = ["-C", "/etc/opendax.conf", "-v"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let opts = parse_args(&args).unwrap();
        assert_eq!(opts.config_path.as_deref(), Some(Path::new("/etc/opendax.conf")));
        assert!(opts.verbose);
        assert!(!opts.daemonize);
        assert!(parse_args(&["-x".to_string()]).is_err());
    }

    #[test]
    fn test_defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.socket_path, Path::new("/tmp/opendax"));
        assert_eq!(c.tcp_port, None);
        assert_eq!(c.max_message_size, 65536);
        assert_eq!(c.retention_interval_ms, 5000);
        assert_eq!(c.tag_list_start_size, 1024);
    }

    #[test]
    fn test_config_file() {
        let path = temp_conf(
            r#"
-- opendax server configuration
socket_path = "/tmp/dax_test"
tcp_port = 7777
verbosity = 0xFFFF
retention_interval_ms = 250
# also a comment
daemonize = true
"#,
        );
        let mut c = ServerConfig::default();
        c.apply_file(&path).unwrap();
        assert_eq!(c.socket_path, Path::new("/tmp/dax_test"));
        assert_eq!(c.tcp_port, Some(7777));
        assert_eq!(c.verbosity, Topics::ALL);
        assert_eq!(c.retention_interval_ms, 250);
        assert!(c.daemonize);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bad_config_lines() {
        let path = temp_conf("nonsense\n");
        let mut c = ServerConfig::default();
        assert!(matches!(
            c.apply_file(&path),
            Err(ConfigError::BadLine(1, _))
        ));
        let _ = std::fs::remove_file(&path);

        let path = temp_conf("unknown_key = 5\n");
        assert!(matches!(
            c.apply_file(&path),
            Err(ConfigError::UnknownOption(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
