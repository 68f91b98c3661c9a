// src/config/settings.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::config::model::BuildSection;
use crate::errors::{KilnError, Result};
use crate::scheduler::default_parallelism;
use crate::types::{CacheMode, HistoryStorageMode};

pub const ENV_OFFLINE: &str = "KILN_OFFLINE";
pub const ENV_CACHE_DIR: &str = "KILN_CACHE_DIR";
pub const ENV_REMOTE_URL: &str = "KILN_REMOTE_CACHE_URL";
pub const ENV_REMOTE_USER: &str = "KILN_REMOTE_CACHE_USER";
pub const ENV_REMOTE_PASSWORD: &str = "KILN_REMOTE_CACHE_PASSWORD";

const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub url: String,
    pub push: bool,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Fully resolved settings for one build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub max_workers: usize,
    pub cache_mode: CacheMode,
    /// No remote cache calls at all.
    pub offline: bool,
    pub continue_on_failure: bool,
    /// Ignore history and cache reads; every task executes.
    pub rerun: bool,
    pub cache_dir: PathBuf,
    pub history_dir: PathBuf,
    pub history_storage: HistoryStorageMode,
    pub remote: Option<RemoteSettings>,
    pub cancel_grace: Duration,
    pub verify_snapshots: bool,
    pub watch_changes: bool,
}

/// Flags passed on the command line. `None`/`false` leaves the lower layers
/// alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_workers: Option<usize>,
    pub build_cache: Option<CacheMode>,
    pub offline: bool,
    pub continue_on_failure: bool,
    pub rerun: bool,
}

impl BuildSettings {
    /// Built-in defaults for a project rooted at `root`.
    pub fn defaults(root: &Path) -> Self {
        let state_dir = root.join(".kiln");
        Self {
            max_workers: default_parallelism(),
            cache_mode: CacheMode::default(),
            offline: false,
            continue_on_failure: false,
            rerun: false,
            cache_dir: state_dir.join("cache"),
            history_dir: state_dir,
            history_storage: HistoryStorageMode::default(),
            remote: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            verify_snapshots: false,
            watch_changes: false,
        }
    }

    /// Defaults, then `[build]`, then environment (read through `env`), then
    /// CLI flags.
    pub fn resolve(
        root: &Path,
        section: &BuildSection,
        env: impl Fn(&str) -> Option<String>,
        cli: &CliOverrides,
    ) -> Result<Self> {
        let mut s = Self::defaults(root);

        if let Some(n) = section.max_workers {
            s.max_workers = n;
        }
        if let Some(mode) = section.build_cache {
            s.cache_mode = mode;
        }
        if let Some(offline) = section.offline {
            s.offline = offline;
        }
        if let Some(cont) = section.continue_on_failure {
            s.continue_on_failure = cont;
        }
        if let Some(dir) = &section.cache_dir {
            s.cache_dir = root.join(dir);
        }
        if let Some(dir) = &section.history_dir {
            s.history_dir = root.join(dir);
        }
        if let Some(mode) = section.history_storage {
            s.history_storage = mode;
        }
        if let Some(grace) = &section.cancel_grace {
            s.cancel_grace = parse_duration(grace).map_err(KilnError::ConfigError)?;
        }
        if let Some(verify) = section.verify_snapshots {
            s.verify_snapshots = verify;
        }
        if let Some(watch) = section.watch_changes {
            s.watch_changes = watch;
        }
        if let Some(remote) = &section.remote {
            let timeout = match &remote.timeout {
                Some(t) => parse_duration(t).map_err(KilnError::ConfigError)?,
                None => DEFAULT_REMOTE_TIMEOUT,
            };
            s.remote = Some(RemoteSettings {
                url: remote.url.clone(),
                push: remote.push,
                timeout,
                username: remote.username.clone(),
                password: remote.password.clone(),
            });
        }

        if let Some(value) = env(ENV_OFFLINE) {
            s.offline = parse_bool(&value).ok_or_else(|| {
                KilnError::ConfigError(format!("{ENV_OFFLINE}: expected 1/0 or true/false, got {value:?}"))
            })?;
        }
        if let Some(dir) = env(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
            s.cache_dir = root.join(dir);
        }
        if let Some(url) = env(ENV_REMOTE_URL).filter(|u| !u.is_empty()) {
            match &mut s.remote {
                Some(remote) => remote.url = url,
                None => {
                    s.remote = Some(RemoteSettings {
                        url,
                        push: false,
                        timeout: DEFAULT_REMOTE_TIMEOUT,
                        username: None,
                        password: None,
                    })
                }
            }
        }
        if let Some(remote) = &mut s.remote {
            if let Some(user) = env(ENV_REMOTE_USER) {
                remote.username = Some(user);
            }
            if let Some(password) = env(ENV_REMOTE_PASSWORD) {
                remote.password = Some(password);
            }
        }

        if let Some(n) = cli.max_workers {
            s.max_workers = n;
        }
        if let Some(mode) = cli.build_cache {
            s.cache_mode = mode;
        }
        s.offline |= cli.offline;
        s.continue_on_failure |= cli.continue_on_failure;
        s.rerun |= cli.rerun;

        if s.max_workers == 0 {
            return Err(KilnError::ConfigError("max_workers must be >= 1".to_string()));
        }

        debug!(settings = ?s.redacted(), "resolved build settings");
        Ok(s)
    }

    /// Same settings without the remote password, for logging.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(remote) = &mut copy.remote {
            if remote.password.is_some() {
                remote.password = Some("***".to_string());
            }
        }
        copy
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Parse `"<n>ms"`, `"<n>s"`, `"<n>m"`, `"<n>h"` or `"<n>d"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration {s:?} is missing a unit (ms, s, m, h or d)"))?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "s" => Some(n),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        "d" => n.checked_mul(86_400),
        _ => return Err(format!("invalid duration unit in {s:?} (expected ms, s, m, h or d)")),
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| format!("duration {s:?} is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::RemoteSection;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5 parsecs").is_err());
    }

    #[test]
    fn defaults_live_under_dot_kiln() {
        let s = BuildSettings::resolve(Path::new("/proj"), &BuildSection::default(), |_| None, &CliOverrides::default())
            .unwrap();
        assert_eq!(s.cache_dir, PathBuf::from("/proj/.kiln/cache"));
        assert_eq!(s.history_dir, PathBuf::from("/proj/.kiln"));
        assert_eq!(s.cache_mode, CacheMode::On);
        assert!(s.max_workers >= 1);
        assert!(s.remote.is_none());
    }

    #[test]
    fn layers_override_in_order() {
        let section = BuildSection {
            max_workers: Some(2),
            offline: Some(false),
            cache_dir: Some(PathBuf::from("build-cache")),
            remote: Some(RemoteSection {
                url: "https://cache.example.com".into(),
                push: true,
                timeout: Some("3s".into()),
                username: None,
                password: None,
            }),
            ..BuildSection::default()
        };
        let env = env_from(&[
            (ENV_OFFLINE, "true"),
            (ENV_CACHE_DIR, "/tmp/kiln-cache"),
            (ENV_REMOTE_USER, "ci"),
            (ENV_REMOTE_PASSWORD, "secret"),
        ]);
        let cli = CliOverrides {
            max_workers: Some(8),
            build_cache: Some(CacheMode::Off),
            ..CliOverrides::default()
        };

        let s = BuildSettings::resolve(Path::new("/proj"), &section, env, &cli).unwrap();
        assert_eq!(s.max_workers, 8);
        assert_eq!(s.cache_mode, CacheMode::Off);
        assert!(s.offline);
        assert_eq!(s.cache_dir, PathBuf::from("/tmp/kiln-cache"));
        let remote = s.remote.as_ref().unwrap();
        assert!(remote.push);
        assert_eq!(remote.timeout, Duration::from_secs(3));
        assert_eq!(remote.username.as_deref(), Some("ci"));
        assert_eq!(s.redacted().remote.unwrap().password.as_deref(), Some("***"));
    }

    #[test]
    fn env_url_creates_pull_only_remote() {
        let env = env_from(&[(ENV_REMOTE_URL, "http://cache:8080")]);
        let s = BuildSettings::resolve(Path::new("/proj"), &BuildSection::default(), env, &CliOverrides::default())
            .unwrap();
        let remote = s.remote.unwrap();
        assert_eq!(remote.url, "http://cache:8080");
        assert!(!remote.push);
    }

    #[test]
    fn bad_offline_value_is_rejected() {
        let env = env_from(&[(ENV_OFFLINE, "maybe")]);
        let err = BuildSettings::resolve(Path::new("/proj"), &BuildSection::default(), env, &CliOverrides::default())
            .unwrap_err();
        assert!(err.to_string().contains(ENV_OFFLINE));
    }

    #[test]
    fn zero_workers_from_cli_is_rejected() {
        let cli = CliOverrides {
            max_workers: Some(0),
            ..CliOverrides::default()
        };
        assert!(
            BuildSettings::resolve(Path::new("/proj"), &BuildSection::default(), |_| None, &cli).is_err()
        );
    }
}
