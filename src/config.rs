//! Per-role configuration, validated once at construction.
//!
//! Every option a role understands is enumerated here; there is no dynamic
//! option bag. Validation failures are configuration errors: the process must
//! fail fast before any coordination state is created.

use std::path::PathBuf;

/// Configuration errors. Non-retryable; reported once and the process exits.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no coordination servers specified")]
    NoServers,
    #[error("base path is required")]
    MissingPath,
    #[error("a process is either a source or a destination, not both")]
    ConflictingRoles,
    #[error("malformed subpath override {0:?}: expected \"{{depth}}_{{subpath}}\"")]
    BadOverride(String),
    #[error("malformed credentials: expected \"user:password\"")]
    BadCredentials,
    #[error("invalid exclusion regex: {0}")]
    BadExcludeRegex(#[from] regex::Error),
}

/// Coordination service connection settings shared by both roles.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// `host:port` addresses of the coordination service ensemble.
    pub servers: Vec<String>,
    /// Session name; isolates one replication run from another.
    pub session: String,
    /// Optional digest credentials (`user`, `password`).
    pub credentials: Option<(String, String)>,
    /// Optional identity suffix to disambiguate processes sharing a pid space.
    pub name: Option<String>,
}

impl ConnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        Ok(())
    }
}

/// Flags forwarded to the transfer tool for every work unit.
#[derive(Debug, Clone, Default)]
pub struct RsyncOptions {
    pub dry_run: bool,
    pub delete: bool,
    pub checksum: bool,
    pub hard_links: bool,
    pub verbose: bool,
    pub drop_cache: bool,
    /// Transfer timeout in seconds, forwarded as `--timeout`.
    pub timeout: Option<u64>,
    /// Unvalidated `key:value` passthrough flags, applied last. This is a
    /// documented trust boundary: the operator owns what goes in here.
    pub passthrough: Vec<String>,
}

/// Configuration for the source role.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Root of the tree to replicate.
    pub base_path: PathBuf,
    /// Partition depth. 0 means one recursive unit for the whole tree.
    pub depth: u32,
    /// Exclusion regex matched against full paths.
    pub exclude_re: Option<String>,
    /// Restrict the exclusion to paths owned by this user.
    pub exclude_user: Option<String>,
    /// `{depth}_{subpath}` re-partitioning overrides, deepest last.
    pub subpath_overrides: Vec<String>,
    pub rsync: RsyncOptions,
    /// Where to persist the final `{unfinished, failed, completed}` record.
    pub done_file: Option<PathBuf>,
    /// Verify the base path is reachable before handing out work.
    pub verify_path: bool,
    /// Transfer attempts per work unit before it degrades to the failed queue.
    pub attempts: u32,
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingPath);
        }
        for token in &self.subpath_overrides {
            match token.split_once('_') {
                Some((depth, sub)) if depth.parse::<u32>().is_ok() && !sub.is_empty() => {}
                _ => return Err(ConfigError::BadOverride(token.clone())),
            }
        }
        if let Some(re) = &self.exclude_re {
            regex::Regex::new(re)?;
        }
        Ok(())
    }
}

/// Configuration for the destination role.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    /// Root of the tree the daemon exposes read-write.
    pub base_path: PathBuf,
    /// Fixed daemon port; an existing live claim on it is a fatal error.
    pub port: Option<u16>,
    /// First port probed when no fixed port is given.
    pub start_port: u16,
    /// Pause/resume based on base path reachability.
    pub verify_path: bool,
    pub drop_cache: bool,
    /// Daemon relaunch attempts before giving up.
    pub attempts: u32,
}

impl DestinationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingPath);
        }
        Ok(())
    }
}

/// Parse a `user:password` credentials string.
pub fn parse_credentials(text: &str) -> Result<(String, String), ConfigError> {
    match text.split_once(':') {
        Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
            Ok((user.to_string(), pass.to_string()))
        }
        _ => Err(ConfigError::BadCredentials),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_config() -> SourceConfig {
        SourceConfig {
            base_path: PathBuf::from("/data"),
            depth: 4,
            exclude_re: None,
            exclude_user: None,
            subpath_overrides: vec![],
            rsync: RsyncOptions::default(),
            done_file: None,
            verify_path: false,
            attempts: 3,
        }
    }

    #[test]
    fn valid_source_config() {
        assert!(source_config().validate().is_ok());
    }

    #[test]
    fn missing_path_rejected() {
        let mut cfg = source_config();
        cfg.base_path = PathBuf::new();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingPath)));
    }

    #[test]
    fn override_tokens_checked() {
        let mut cfg = source_config();
        cfg.subpath_overrides = vec!["2_a1/ab2".to_string()];
        assert!(cfg.validate().is_ok());
        cfg.subpath_overrides = vec!["deep-a1".to_string()];
        assert!(matches!(cfg.validate(), Err(ConfigError::BadOverride(_))));
        cfg.subpath_overrides = vec!["x_a1".to_string()];
        assert!(matches!(cfg.validate(), Err(ConfigError::BadOverride(_))));
    }

    #[test]
    fn exclude_regex_checked() {
        let mut cfg = source_config();
        cfg.exclude_re = Some(r"/\.snapshots(/.*|$)".to_string());
        assert!(cfg.validate().is_ok());
        cfg.exclude_re = Some("(".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::BadExcludeRegex(_))));
    }

    #[test]
    fn credentials_parsing() {
        assert_eq!(
            parse_credentials("root:admin").unwrap(),
            ("root".to_string(), "admin".to_string())
        );
        assert!(parse_credentials("rootadmin").is_err());
        assert!(parse_credentials(":x").is_err());
    }
}
