use crate::services::{
    compress::Compressor,
    export_service::ExportSettings,
    naming::SuffixPolicy,
    replication::RemoteNaming,
    transfer::{Credentials, TransferTarget, resolve_known_hosts_path, split_host_port},
};
use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use std::{collections::BTreeSet, env, fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Buckets created at startup if missing.
    pub buckets: Vec<String>,
    /// `None` when `NOBACKUP` is set.
    pub backup: Option<BackupConfig>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Scheduled key-value backups with off-host replication")]
pub struct Args {
    /// Host to bind the status server to (overrides KV_BACKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind the status server to (overrides KV_BACKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides KV_BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Apply the schema and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {key} value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("backup directory {}: {source}", path.display())]
    BackupDir { path: PathBuf, source: io::Error },
    #[error("backup directory {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

/// Settings for the export pipeline and the scheduler.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,
    pub hours: BTreeSet<u32>,
    pub suffix: SuffixPolicy,
    pub zip: bool,
    pub zip_command: String,
    pub concurrency: usize,
    pub grace: TimeDelta,
    pub tick: Duration,
    pub replication: ReplicationConfig,
}

/// Settings for the off-host copy. Disabled unless fully specified.
#[derive(Clone)]
pub struct ReplicationConfig {
    pub host: String,
    pub directory: String,
    pub username: String,
    pub password: String,
    pub key_path: String,
    pub suffix: SuffixPolicy,
    /// `BK_SCP_KNOWN_HOSTS`, else `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
    pub inactivity_timeout: Duration,
    pub tick: Duration,
}

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_GRACE_HOURS: i64 = 25;
pub const DEFAULT_TICK_SECS: u64 = 15;
pub const DEFAULT_SCP_TIMEOUT_SECS: u64 = 300;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("KV_BACKUP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("KV_BACKUP_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing KV_BACKUP_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading KV_BACKUP_PORT"),
        };
        let env_db = env::var("KV_BACKUP_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/kv_backup.db".into());

        let lookup = |key: &str| env::var(key).ok();
        let buckets = parse_list(lookup("BUCKETS").as_deref());
        let backup =
            BackupConfig::from_lookup(lookup).context("reading backup configuration")?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            buckets,
            backup,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl BackupConfig {
    /// Read the `BK_*` keys through `lookup`. Returns `None` when `NOBACKUP`
    /// is set.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &'static str| parse_bool(key, get(key).as_deref());

        if flag("NOBACKUP")? {
            return Ok(None);
        }

        let raw_dir = get("BK_PATH").ok_or(ConfigError::Missing("BK_PATH"))?;
        let backup_dir =
            std::fs::canonicalize(&raw_dir).map_err(|source| ConfigError::BackupDir {
                path: PathBuf::from(&raw_dir),
                source,
            })?;
        if !backup_dir.is_dir() {
            return Err(ConfigError::NotADirectory(backup_dir));
        }

        let hours = parse_hours(&get("BK_HOURS").ok_or(ConfigError::Missing("BK_HOURS"))?)?;

        let concurrency = parse_number("BK_NUM_GO", get("BK_NUM_GO"), DEFAULT_CONCURRENCY)?;
        if concurrency < 1 {
            return Err(ConfigError::Invalid {
                key: "BK_NUM_GO",
                value: concurrency.to_string(),
                reason: "must be at least 1".into(),
            });
        }

        let grace_hours = parse_number(
            "BK_GRACE_HOURS",
            get("BK_GRACE_HOURS"),
            DEFAULT_GRACE_HOURS,
        )?;
        let grace = TimeDelta::try_hours(grace_hours)
            .filter(|grace| *grace > TimeDelta::zero())
            .ok_or_else(|| ConfigError::Invalid {
                key: "BK_GRACE_HOURS",
                value: grace_hours.to_string(),
                reason: "must be a positive number of hours".into(),
            })?;

        let tick = parse_secs("BK_TICK_SECS", get("BK_TICK_SECS"), DEFAULT_TICK_SECS)?;

        let replication = ReplicationConfig {
            host: get("BK_SCP_HOST").unwrap_or_default(),
            directory: get("BK_SCP_DIR").unwrap_or_default(),
            username: get("BK_SCP_UNAME").unwrap_or_default(),
            password: lookup("BK_SCP_UPWD").unwrap_or_default(),
            key_path: get("BK_SCP_PATH_TO_KEY").unwrap_or_default(),
            suffix: SuffixPolicy {
                day: flag("BK_SCP_SUFFIX_DAY")?,
                hour: flag("BK_SCP_SUFFIX_HOUR")?,
            },
            known_hosts: resolve_known_hosts_path(get("BK_SCP_KNOWN_HOSTS").as_deref()),
            inactivity_timeout: parse_secs(
                "BK_SCP_TIMEOUT_SECS",
                get("BK_SCP_TIMEOUT_SECS"),
                DEFAULT_SCP_TIMEOUT_SECS,
            )?,
            tick: parse_secs("BK_SCP_TICK_SECS", get("BK_SCP_TICK_SECS"), DEFAULT_TICK_SECS)?,
        };
        if replication.is_enabled() && replication.known_hosts.is_none() {
            return Err(ConfigError::Missing("BK_SCP_KNOWN_HOSTS"));
        }

        Ok(Some(Self {
            backup_dir,
            hours,
            suffix: SuffixPolicy {
                day: flag("BK_SUFFIX_DAY")?,
                hour: flag("BK_SUFFIX_HOUR")?,
            },
            zip: flag("BK_ZIP")?,
            zip_command: get("BK_ZIP_CMD").unwrap_or_else(|| "zip".into()),
            concurrency,
            grace,
            tick,
            replication,
        }))
    }

    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            backup_dir: self.backup_dir.clone(),
            suffix: self.suffix,
            concurrency: self.concurrency,
            compressor: self.zip.then(|| Compressor::new(self.zip_command.clone())),
        }
    }

    pub fn remote_naming(&self) -> RemoteNaming {
        RemoteNaming {
            suffix: self.replication.suffix,
            zip: self.zip,
        }
    }
}

impl ReplicationConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.is_empty()
            && !self.directory.is_empty()
            && !self.username.is_empty()
            && (!self.password.is_empty() || !self.key_path.is_empty())
    }

    /// Transfer destination, or `None` when replication is disabled.
    /// A password wins over a key file when both are set.
    pub fn target(&self) -> Option<TransferTarget> {
        if !self.is_enabled() {
            return None;
        }
        let known_hosts = self.known_hosts.clone()?;
        let (host, port) = split_host_port(&self.host);
        let credentials = if self.password.is_empty() {
            Credentials::PrivateKey(PathBuf::from(&self.key_path))
        } else {
            Credentials::Password(self.password.clone())
        };
        Some(TransferTarget {
            host,
            port,
            directory: self.directory.clone(),
            username: self.username.clone(),
            credentials,
            known_hosts,
            inactivity_timeout: self.inactivity_timeout,
        })
    }
}

impl fmt::Debug for ReplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationConfig")
            .field("host", &self.host)
            .field("directory", &self.directory)
            .field("username", &self.username)
            .field("password", &"x".repeat(self.password.len()))
            .field("key_path", &self.key_path)
            .field("suffix", &self.suffix)
            .field("known_hosts", &self.known_hosts)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("tick", &self.tick)
            .finish()
    }
}

/// Boolean flags accept `1 t T true TRUE True` and `0 f F false FALSE False`.
/// An unset or empty key is false.
fn parse_bool(key: &'static str, value: Option<&str>) -> Result<bool, ConfigError> {
    match value.map(str::trim) {
        None => Ok(false),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True") => Ok(true),
        Some("0" | "f" | "F" | "false" | "FALSE" | "False") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

fn parse_hours(raw: &str) -> Result<BTreeSet<u32>, ConfigError> {
    let mut hours = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let hour = part
            .parse::<u32>()
            .ok()
            .filter(|h| *h < 24)
            .ok_or_else(|| ConfigError::Invalid {
                key: "BK_HOURS",
                value: part.to_string(),
                reason: "hours must be between 0 and 23".into(),
            })?;
        hours.insert(hour);
    }
    if hours.is_empty() {
        return Err(ConfigError::Missing("BK_HOURS"));
    }
    Ok(hours)
}

fn parse_number<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

fn parse_secs(
    key: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = parse_number(key, value, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: "must be at least one second".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
