//! Types for representing individual steps of a scenario.

use crate::config::RetryPolicy;
use crate::core::host::{Host, HostRegistry};
#[cfg(doc)]
use crate::core::scenario::Scenario;
use anyhow::bail;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a [Step] does on each of its hosts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Runs a shell command.
    Command(String),

    /// Applies a manifest with the configured apply command. The manifest is never parsed; it is
    /// passed through as a single argument.
    Apply(String),
}

/// Which hosts a [Step] runs on.
///
/// # (De)serialization
///
/// In YAML, unit variants are plain strings (`on: all`, `on: pairs`) and the rest are
/// single-entry maps (`on: {role: server}`, `on: {hosts: [a, b]}`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Targets {
    /// Every host in the suite.
    #[default]
    All,

    /// Every host tagged with the role.
    Role(String),

    /// The named hosts, in the order given.
    Hosts(Vec<String>),

    /// Every ordered pair of distinct hosts. The step runs on the first host of each pair and can
    /// refer to the second as `$peer`.
    Pairs,

    /// Like [Targets::Pairs], restricted to hosts tagged with the role.
    RolePairs(String),
}

impl Targets {
    /// Expands these targets against `registry` into `(host, peer)` tuples.
    ///
    /// Names in [Targets::Hosts] that are missing from the registry are skipped, since the
    /// registry may have been narrowed on the command line after the suite was validated.
    pub fn resolve<'r>(&self, registry: &'r HostRegistry) -> Vec<(&'r Host, Option<&'r Host>)> {
        use Targets::*;
        match self {
            All => registry.hosts().iter().map(|host| (host, None)).collect(),
            Role(role) => registry.with_role(role).map(|host| (host, None)).collect(),
            Hosts(names) => names
                .iter()
                .filter_map(|name| registry.get(name))
                .map(|host| (host, None))
                .collect(),
            Pairs => pair_targets(registry.pairs(None)),
            RolePairs(role) => pair_targets(registry.pairs(Some(role))),
        }
    }
}

fn pair_targets<'r>(pairs: Vec<(&'r Host, &'r Host)>) -> Vec<(&'r Host, Option<&'r Host>)> {
    pairs
        .into_iter()
        .map(|(host, peer)| (host, Some(peer)))
        .collect()
}

/// Whether an [Action::Apply] must, may, or must not change the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// Changes are fine; failures are not.
    #[default]
    Any,

    /// The apply must report changes.
    Changes,

    /// The apply must report no changes, e.g. because the manifest was already applied.
    NoChanges,
}

/// What a finished command must look like for its step to pass.
///
/// Patterns are regular expressions and may use variables. Every pattern must match somewhere in
/// its stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Expect {
    pub exit_code: i32,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stdout: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stderr: Vec<String>,
}

/// A step's own retry settings. Anything left unset comes from the run's [RetryPolicy].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOverrides {
    #[serde(with = "humantime_serde")]
    pub max_wait: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
}

impl RetryOverrides {
    pub fn resolve(&self, defaults: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_wait: self.max_wait.unwrap_or(defaults.max_wait),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
        }
    }
}

/// One step of a [Scenario].
///
/// A step runs once per target: once per host, or once per ordered pair for
/// [Targets::Pairs]. Results are independent per target.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "StepFile")]
pub struct Step {
    /// Used in reports. May contain variables.
    pub name: String,

    pub action: Action,

    pub on: Targets,

    /// Whether to run on all targets at once. [None] defers to the run configuration.
    ///
    /// Either way, the scenario waits for every target to finish before moving on.
    pub parallel: Option<bool>,

    /// If `true`, [Step::expand] turns this step into two: this one, then the same apply
    /// again with [ChangePolicy::NoChanges].
    pub idempotent: bool,

    pub changes: ChangePolicy,

    pub expect: Expect,

    /// If set, the step is retried at a fixed interval until it passes or time runs out.
    pub retry: Option<RetryOverrides>,
}

/// The shape of a step in a suite file, before validation.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    apply: Option<String>,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    on: Targets,
    #[serde(default)]
    parallel: Option<bool>,
    #[serde(default)]
    idempotent: bool,
    #[serde(default)]
    changes: ChangePolicy,
    #[serde(default)]
    expect: Expect,
    #[serde(default)]
    retry: Option<RetryOverrides>,
}

impl TryFrom<StepFile> for Step {
    type Error = anyhow::Error;

    fn try_from(file: StepFile) -> anyhow::Result<Self> {
        let action = match (file.command, file.apply) {
            (Some(command), None) => Action::Command(command),
            (None, Some(manifest)) => Action::Apply(manifest),
            (Some(_), Some(_)) => bail!("a step cannot have both `command` and `apply`"),
            (None, None) => bail!("a step needs either `command` or `apply`"),
        };

        if let Action::Command(_) = action {
            if file.idempotent {
                bail!("only `apply` steps can be `idempotent`");
            }
            if file.changes != ChangePolicy::Any {
                bail!("only `apply` steps can set `changes`");
            }
        }

        if let Some(RetryOverrides {
            poll_interval: Some(interval),
            ..
        }) = file.retry
        {
            if interval.is_zero() {
                bail!("`retry.poll_interval` must be greater than zero");
            }
        }

        for pattern in file.expect.stdout.iter().chain(&file.expect.stderr) {
            if let Err(err) = Regex::new(pattern) {
                bail!("invalid output pattern /{pattern}/: {err}");
            }
        }

        Ok(Step {
            name: file.name.unwrap_or_else(|| title(&action)),
            action,
            on: file.on,
            parallel: file.parallel,
            idempotent: file.idempotent,
            changes: file.changes,
            expect: file.expect,
            retry: file.retry,
        })
    }
}

impl Step {
    /// Creates a [Step] that runs on all hosts with default settings.
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Step {
            name: name.into(),
            action,
            on: Targets::All,
            parallel: None,
            idempotent: false,
            changes: ChangePolicy::Any,
            expect: Expect::default(),
            retry: None,
        }
    }

    /// Replaces every idempotent apply in `list` with the apply followed by its idempotence
    /// check.
    ///
    /// The check has the same targets and parallelism, is named `<name> (idempotence)`, requires
    /// [ChangePolicy::NoChanges], and is never retried. Neither of the resulting steps is marked
    /// idempotent, so expanding twice changes nothing.
    pub fn expand(list: &mut Vec<Self>) {
        let mut output = Vec::with_capacity(list.len());
        for step in list.drain(..) {
            if !step.idempotent {
                output.push(step);
                continue;
            }

            let first = Step {
                idempotent: false,
                ..step
            };
            let check = Step {
                name: format!("{} (idempotence)", first.name),
                changes: ChangePolicy::NoChanges,
                retry: None,
                ..first.clone()
            };
            output.push(first);
            output.push(check);
        }
        *list = output;
    }
}

/// Generates a one-line identifier for an [Action], suitable for use as a step's name.
pub fn title(action: &Action) -> String {
    use Action::*;
    match action {
        Command(command) => format!("command: {}", first_line(command)),
        Apply(manifest) => format!("apply: {}", first_line(manifest)),
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}
