//! Types for representing scenarios and the steps they run on each host.

use crate::core::host::Host;
use crate::core::step::{Action, Step};
#[cfg(doc)]
use crate::core::suite::Suite;
use indexmap::IndexMap;
use regex::{NoExpand, Regex};
use serde::Deserialize;

/// One test case: an ordered list of [Step]s.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Used for reporting and for `--scenario` filtering.
    pub name: String,

    /// [Scenario]-level variables. These take precedence over [Suite::vars].
    ///
    /// Order is preserved from the source file and determines substitution order.
    #[serde(default)]
    pub vars: IndexMap<String, String>,

    /// Executed in order. A step does not start until every target of the previous step is done.
    pub steps: Vec<Step>,
}

/// A [Step] in the context of a single target.
///
/// A [HostStep] carries everything needed to turn the step into concrete command text for its
/// host: the host itself, the peer (for pair targets), and the variables in scope.
#[derive(Clone, Debug)]
pub struct HostStep<'s> {
    host: &'s Host,
    peer: Option<&'s Host>,
    step: &'s Step,
    vars: &'s IndexMap<String, String>,
}

impl<'s> HostStep<'s> {
    /// Creates a new [HostStep]. `vars` holds the suite and scenario variables already merged in
    /// precedence order.
    pub fn new(
        host: &'s Host,
        peer: Option<&'s Host>,
        step: &'s Step,
        vars: &'s IndexMap<String, String>,
    ) -> Self {
        HostStep {
            host,
            peer,
            step,
            vars,
        }
    }

    pub fn host(&self) -> &'s Host {
        self.host
    }

    pub fn peer(&self) -> Option<&'s Host> {
        self.peer
    }

    /// The original, uncompiled [Step].
    pub fn step(&self) -> &'s Step {
        self.step
    }

    /// Prepares the [Step] to run on [Self::host]. Substitutes variables into the step's name,
    /// its command or manifest, and its expected output patterns.
    ///
    /// # Variables
    ///
    /// Suite and scenario variables are substituted in the order they were defined, followed by
    /// these built-in variables, which override any user variable of the same name:
    ///
    /// * `host` and `address`: the target host's name and network address.
    /// * `peer` and `peer_address`: the same for the other host of a pair. Only defined for pair
    ///   targets.
    ///
    /// # Substitution rules
    ///
    /// 1. Simple substitution (`$var`): matches on word boundaries, so `$host.example.com`
    ///    matches the variable `host`, but `$hostname` does not. Use braced substitution to glue
    ///    a variable to a word: `${host}_nginx`.
    ///
    /// 2. Braced substitution (`${var}`): replaced with the variable named `var`.
    ///
    /// Undefined variables are left alone, so shell variables pass through to the host as long
    /// as their names don't collide. Substitution is not recursive: a value that itself contains
    /// `$var` is inserted as-is, though a later variable may still match it.
    pub fn compile(&self) -> Step {
        // Inserting a built-in over a user variable of the same name keeps the user variable's
        // position but takes the built-in's value.
        let mut vars: IndexMap<&str, &str> = self
            .vars
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        vars.insert("host", &self.host.name);
        vars.insert("address", self.host.address());
        if let Some(peer) = self.peer {
            vars.insert("peer", &peer.name);
            vars.insert("peer_address", peer.address());
        }

        let mut step = self.step.clone();
        for (var, value) in vars {
            // A single regex per variable keeps the two forms from substituting into each
            // other's output.
            let var = regex::escape(var);
            let pattern = format!(r"\${var}\b|\$\{{{var}}}");
            let regex = match Regex::new(&pattern) {
                Ok(regex) => regex,
                // Escaped variable names always form a valid pattern.
                Err(_) => continue,
            };

            let replace = |s: &mut String| {
                *s = regex.replace_all(s, NoExpand(value)).into_owned();
            };

            replace(&mut step.name);
            match &mut step.action {
                Action::Command(text) | Action::Apply(text) => replace(text),
            }
            step.expect.stdout.iter_mut().for_each(replace);
            step.expect.stderr.iter_mut().for_each(replace);
        }
        step
    }
}
