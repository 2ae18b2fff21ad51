//! Reports the outcome of each step as it finishes, and summarizes the run at the end.
//!
//! The arrangement of this module follows a pattern used throughout the crate. Instead of a
//! generic method that takes real or fake writers, callers pick a real or fake [Report]
//! implementation and call its trait methods. The real implementation locks stdout and stderr
//! just before writing and releases them as soon as it is done, then hands the locked writers to
//! one of the testable functions below (e.g. [_starting], [_report], [_summary]), which hold all
//! of the formatting logic.

use crate::run_suite::result::{CommandOutput, Outcome, ScenarioResult, StepResult};
use async_trait::async_trait;
use std::fmt::Display;
use std::io::{self, Write};
use std::ops::DerefMut;
use std::time::Duration;
use tokio::task;

/// Prints feedback about each step to stdout/stderr to keep the user informed.
#[async_trait]
pub trait Report: Send {
    /// Reports that a scenario is about to start.
    async fn scenario(&mut self, name: &str) -> io::Result<()>;

    /// Reports that a step is about to be dispatched to `target`.
    async fn starting(&mut self, target: &str, step: &str) -> io::Result<()>;

    /// Reports the outcome of a step on one target.
    async fn report(&mut self, result: &StepResult) -> io::Result<()>;

    /// Reports that a step has no hosts to run on, e.g. after `--hosts` narrowed the suite.
    async fn skipped(&mut self, step: &str) -> io::Result<()>;

    /// Reports the summary of the whole run.
    async fn summary(&mut self, summary: &Summary) -> io::Result<()>;
}

/// The real, production-ready [Report] implementation. Uses the real stdout/stderr.
///
/// Requires a multi-threaded Tokio runtime.
#[derive(Clone, Debug)]
pub struct Reporter;

#[async_trait]
impl Report for Reporter {
    async fn scenario(&mut self, name: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || _scenario(&mut stdout, name))
    }

    async fn starting(&mut self, target: &str, step: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || _starting(&mut stdout, target, step))
    }

    async fn report(&mut self, result: &StepResult) -> io::Result<()> {
        // Lock stdout and stderr for sane output ordering. For this same reason, we do not use
        // Tokio's async IO, which provides no locking mechanisms.
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        task::block_in_place(move || _report(&mut stdout, &mut stderr, result))
    }

    async fn skipped(&mut self, step: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || _skipped(&mut stdout, step))
    }

    async fn summary(&mut self, summary: &Summary) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || _summary(&mut stdout, summary))
    }
}

/// Counts of outcomes over a whole run, plus the details of everything that did not pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Summary {
    pub scenarios: usize,
    pub scenarios_failed: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,

    /// Every step result that did not pass, in execution order.
    pub failures: Vec<Failure>,
}

/// A step result that did not pass, with the scenario it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub scenario: String,
    pub result: StepResult,
}

impl Summary {
    /// The first thing that went wrong, for diagnostics.
    pub fn first_failure(&self) -> Option<&Failure> {
        self.failures.first()
    }

    /// Whether every step of every scenario passed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    /// The process exit code for this run: 0 if everything passed, otherwise the number of
    /// failed and errored steps in the low byte. A count whose low byte is 0 becomes 1, and
    /// counts never reach 255, which is reserved for errors that stop a run from starting.
    pub fn exit_code(&self) -> u8 {
        let count = self.failed + self.errored;
        if count == 0 {
            return 0;
        }
        match (count % 256) as u8 {
            0 => 1,
            255 => 254,
            low => low,
        }
    }
}

/// Aggregates scenario results into a [Summary]. Does not modify the results.
pub fn summarize(results: &[ScenarioResult]) -> Summary {
    let mut summary = Summary {
        scenarios: results.len(),
        ..Summary::default()
    };

    for scenario in results {
        if scenario.outcome() != Outcome::Passed {
            summary.scenarios_failed += 1;
        }
        for result in &scenario.steps {
            match result.outcome {
                Outcome::Passed => summary.passed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Errored => summary.errored += 1,
            }
            if result.outcome != Outcome::Passed {
                summary.failures.push(Failure {
                    scenario: scenario.name.clone(),
                    result: result.clone(),
                });
            }
        }
    }
    summary
}

fn write_indented(
    mut writer: impl Write,
    indent: usize,
    header: impl Display,
    content: impl AsRef<str>,
) -> io::Result<()> {
    writeln!(writer, "{:indent$}{header}", "")?;
    for line in content.as_ref().lines() {
        writeln!(writer, "{:width$}{line}", "", width = indent + 4)?;
    }
    Ok(())
}

fn write_output(mut writer: impl Write, indent: usize, output: &CommandOutput) -> io::Result<()> {
    if !output.stdout.is_empty() {
        write_indented(&mut writer, indent, "Captured stdout:", &output.stdout)?;
    }
    if !output.stderr.is_empty() {
        write_indented(&mut writer, indent, "Captured stderr:", &output.stderr)?;
    }
    Ok(())
}

/// Formats a [Duration] to tenths of a second.
fn seconds(duration: Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}

/// A testable method containing the logic for reporting that a scenario is starting.
pub fn _scenario<OT: Write, O: DerefMut<Target = OT>>(mut stdout: O, name: &str) -> io::Result<()> {
    writeln!(&mut stdout, "\n=== {name}")
}

/// A testable method containing the logic for reporting that a step is starting.
pub fn _starting<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    target: &str,
    step: &str,
) -> io::Result<()> {
    writeln!(
        &mut stdout,
        // Adding one extra space lines up "Starting" with "Finished" in the final output.
        "[{target}] Starting  {step}",
        // Ex:      Finished {step}
    )
}

/// A testable method containing the logic for reporting a step without hosts.
pub fn _skipped<OT: Write, O: DerefMut<Target = OT>>(mut stdout: O, step: &str) -> io::Result<()> {
    writeln!(&mut stdout, "Skipped {step}: no hosts left to run on")
}

/// A testable method containing the logic for reporting the outcome of a step.
///
/// Passing steps get one line on stdout. Anything else goes to stderr along with the reason and
/// the captured output of the last attempt.
pub fn _report<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    result: &StepResult,
) -> io::Result<()> {
    let target = result.target();
    let duration = seconds(result.duration);

    if result.outcome == Outcome::Passed {
        return writeln!(
            &mut stdout,
            "[{target}] Finished {} ({duration})",
            result.step,
        );
    }

    writeln!(
        &mut stderr,
        "[{target}] Step {}: {} ({duration})",
        result.outcome, result.step,
    )?;
    if let Some(detail) = &result.detail {
        write_indented(stderr.deref_mut(), 4, "Reason:", detail)?;
    }
    if let Some(output) = &result.output {
        write_output(stderr.deref_mut(), 4, output)?;
    }
    Ok(())
}

/// A testable method containing the logic for reporting the summary of a run.
pub fn _summary<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    summary: &Summary,
) -> io::Result<()> {
    writeln!(&mut stdout)?;

    if !summary.failures.is_empty() {
        writeln!(&mut stdout, "Failures:")?;
        for (i, failure) in summary.failures.iter().enumerate() {
            let result = &failure.result;
            writeln!(
                &mut stdout,
                "  {}) {} / {} [{}]: {}",
                i + 1,
                failure.scenario,
                result.step,
                result.target(),
                result.outcome,
            )?;
            if let Some(detail) = &result.detail {
                write_indented(stdout.deref_mut(), 6, "Reason:", detail)?;
            }
            if let Some(output) = &result.output {
                write_output(stdout.deref_mut(), 6, output)?;
            }
        }
        writeln!(&mut stdout)?;
    }

    writeln!(
        &mut stdout,
        "{} scenarios, {} failed; {} steps passed, {} failed, {} errored",
        summary.scenarios, summary.scenarios_failed, summary.passed, summary.failed, summary.errored,
    )
}
