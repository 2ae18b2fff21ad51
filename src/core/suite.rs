//! Types for representing suite files.

use crate::core::host::{Host, HostRegistry};
use crate::core::scenario::Scenario;
use crate::core::step::{Step, Targets};
use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Represents a suite file: the hosts under test and the scenarios to run against them.
///
/// This type is typically parsed from a suite file, but it can be constructed programmatically
/// as well.
#[derive(Clone, Debug, PartialEq)]
pub struct Suite {
    /// The file from which this value was parsed (if any).
    pub source: Option<PathBuf>,

    /// The [Suite]'s name. Used for informational, logging, and debugging purposes.
    pub name: String,

    /// Suite-level variables, available to every scenario.
    ///
    /// Order is preserved from the source file and determines substitution order.
    pub vars: IndexMap<String, String>,

    pub hosts: HostRegistry,

    /// Run in order. Idempotent applies have already been expanded by [Step::expand].
    pub scenarios: Vec<Scenario>,
}

/// The shape of a suite file, before validation.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SuiteFile {
    name: String,
    #[serde(default)]
    vars: IndexMap<String, String>,
    hosts: Vec<Host>,
    #[serde(default)]
    scenarios: Vec<Scenario>,
}

impl Suite {
    /// Loads and validates a suite file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read suite file {}", path.display()))?;
        let mut suite = Self::from_yaml(&yaml)
            .with_context(|| format!("invalid suite file {}", path.display()))?;
        suite.source = Some(path.to_owned());
        Ok(suite)
    }

    /// Parses and validates a suite from YAML text.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let file: SuiteFile = serde_yaml::from_str(yaml)?;
        let mut suite = Suite {
            source: None,
            name: file.name,
            vars: file.vars,
            hosts: HostRegistry::new(file.hosts)?,
            scenarios: file.scenarios,
        };
        for scenario in &mut suite.scenarios {
            Step::expand(&mut scenario.steps);
        }
        suite.validate()?;
        Ok(suite)
    }

    /// Checks that every host a step names exists, every role a step targets is held by at least
    /// one host, and every pair step has at least one pair.
    pub fn validate(&self) -> anyhow::Result<()> {
        for scenario in &self.scenarios {
            for step in &scenario.steps {
                let context = || {
                    format!(
                        "in step \"{}\" of scenario \"{}\"",
                        step.name, scenario.name,
                    )
                };
                match &step.on {
                    Targets::Hosts(names) => {
                        for name in names {
                            if self.hosts.get(name).is_none() {
                                return Err(anyhow::anyhow!("unknown host \"{name}\""))
                                    .with_context(context);
                            }
                        }
                    }
                    Targets::Role(role) => {
                        if self.hosts.with_role(role).next().is_none() {
                            return Err(anyhow::anyhow!("no host has the role \"{role}\""))
                                .with_context(context);
                        }
                    }
                    Targets::RolePairs(role) => match self.hosts.with_role(role).count() {
                        0 => {
                            return Err(anyhow::anyhow!("no host has the role \"{role}\""))
                                .with_context(context);
                        }
                        1 => {
                            return Err(anyhow::anyhow!(
                                "only one host has the role \"{role}\", so there are no pairs"
                            ))
                            .with_context(context);
                        }
                        _ => {}
                    },
                    Targets::Pairs => {
                        if self.hosts.len() < 2 {
                            return Err(anyhow::anyhow!("pairs need at least two hosts"))
                                .with_context(context);
                        }
                    }
                    Targets::All => {}
                }
            }
        }
        Ok(())
    }

    /// The suite and scenario variables merged for `scenario`, scenario values winning.
    pub fn vars_for(&self, scenario: &Scenario) -> IndexMap<String, String> {
        let mut vars = self.vars.clone();
        for (var, value) in &scenario.vars {
            let _ = vars.insert(var.clone(), value.clone());
        }
        vars
    }

    /// Narrows the suite to the named hosts.
    pub fn retain_hosts(&mut self, names: &[String]) -> anyhow::Result<()> {
        self.hosts.retain(names)
    }

    /// Narrows the suite to scenarios named `name`. Fails if there are none.
    pub fn retain_scenarios(&mut self, name: &str) -> anyhow::Result<()> {
        self.scenarios.retain(|scenario| scenario.name == name);
        if self.scenarios.is_empty() {
            bail!("no scenario named \"{name}\" in suite \"{}\"", self.name);
        }
        Ok(())
    }
}
