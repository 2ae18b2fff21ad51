//! Run-wide configuration and where to find it.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the configuration file inside [config_dir].
pub const CONFIG_FILE: &str = "config.yaml";

/// Returns a [PathBuf] to the directory where Vigil's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/vigil`.
/// Otherwise, it returns `/etc/vigil`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/vigil";

    let mut path = PathBuf::new();

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }

    #[cfg(not(test))]
    path.push("/");

    path.push(CONFIG_DIR);
    path
}

/// Settings that apply to every step of a run unless a step overrides them.
///
/// Every field has a default, so an empty or missing configuration file is valid.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Whether steps run on all of their hosts at once when they don't say otherwise.
    pub parallel: bool,

    /// The ceiling on any single command, including connecting to the host.
    ///
    /// Commands that exceed it are abandoned and their steps are errored.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// The command that applies a manifest. The shell-quoted manifest is appended as the final
    /// argument.
    ///
    /// The command must follow `--detailed-exitcodes` conventions: 0 means nothing changed, 2
    /// means changes were applied, and 4 or 6 mean something failed.
    pub apply_command: String,

    /// Defaults for steps that ask to be retried.
    pub retry: RetryPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            parallel: false,
            command_timeout: Duration::from_secs(600),
            apply_command: "puppet apply --detailed-exitcodes -e".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Reads a [RunConfig] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parses a [RunConfig] from YAML text. Empty text yields the defaults.
    ///
    /// A zero `command_timeout` or `poll_interval` is rejected: the first would time out every
    /// command, and the second would retry without pause.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        if config.command_timeout.is_zero() {
            bail!("command_timeout must be greater than zero");
        }
        if config.retry.poll_interval.is_zero() {
            bail!("retry.poll_interval must be greater than zero");
        }
        Ok(config)
    }

    /// Reads `config.yaml` from [config_dir] if it exists, and returns the defaults otherwise.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = config_dir().join(CONFIG_FILE);
        match path.try_exists() {
            Ok(true) => Self::load(&path),
            Ok(false) => Ok(Self::default()),
            Err(err) => Err(err)
                .with_context(|| format!("could not check for config file {}", path.display())),
        }
    }
}

/// How long to keep retrying a check, and how long to wait between attempts.
///
/// Retries use a fixed interval. The states we wait for (a port opening, a service answering)
/// are reached within a short, bounded window, so there is nothing to gain from backing off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}
