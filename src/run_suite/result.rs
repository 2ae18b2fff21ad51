//! The outcomes of steps and scenarios.

use std::fmt::{self, Display};
use std::process::Output;
use std::time::Duration;

/// How a step ended on one host.
///
/// Every step starts out pending, is running once it is dispatched to its host's worker, and
/// then lands in exactly one of these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The exit code, change policy, and output predicates all held.
    Passed,

    /// The command ran but did not do what the step expected.
    Failed,

    /// The step could not be evaluated: the host was unreachable, the command timed out, or the
    /// run was cancelled.
    Errored,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Errored => "errored",
        };
        f.write_str(word)
    }
}

/// What a command left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code. For applies, a bare "changes applied" code (2) is reported as 0.
    ///
    /// A command killed by a signal has no exit code and is reported as -1.
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    /// Whether an apply reported changes. Always `false` for commands.
    pub changed: bool,
}

impl CommandOutput {
    /// Converts the raw [Output] of a command.
    ///
    /// If `apply` is set, the exit code is read with `--detailed-exitcodes` conventions: bit 2
    /// means changes were applied and bit 4 means something failed.
    pub fn from_process(output: Output, apply: bool) -> Self {
        let raw = output.status.code().unwrap_or(-1);
        let (exit_code, changed) = match (apply, raw) {
            (true, 2) => (0, true),
            (true, 6) => (raw, true),
            _ => (raw, false),
        };

        CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            changed,
        }
    }
}

/// The result of one step on one target.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    /// The step's compiled name.
    pub step: String,

    pub host: String,

    /// The other host of a pair, if the step targeted pairs.
    pub peer: Option<String>,

    pub outcome: Outcome,

    /// Time spent from dispatch to completion, including retries.
    pub duration: Duration,

    /// The output of the last attempt. [None] if nothing ran, e.g. because the host was
    /// unreachable.
    pub output: Option<CommandOutput>,

    /// Why the step did not pass. [None] when it passed.
    pub detail: Option<String>,
}

impl StepResult {
    /// A one-line label for the target, e.g. `alice` or `alice -> bob`.
    pub fn target(&self) -> String {
        match &self.peer {
            Some(peer) => format!("{} -> {peer}", self.host),
            None => self.host.clone(),
        }
    }
}

/// The results of one scenario, in execution order.
///
/// Results of a parallel step are listed in target order, not completion order.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioResult {
    pub name: String,

    pub steps: Vec<StepResult>,
}

impl ScenarioResult {
    /// [Outcome::Failed] if any step failed or errored, otherwise [Outcome::Passed].
    ///
    /// A scenario is never [Outcome::Errored]; infrastructure faults fail it like any other
    /// problem.
    pub fn outcome(&self) -> Outcome {
        match self.steps.iter().all(|step| step.outcome == Outcome::Passed) {
            true => Outcome::Passed,
            false => Outcome::Failed,
        }
    }
}
