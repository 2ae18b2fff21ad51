//! Runs a suite's scenarios against its hosts and reports the results.

pub mod client;
pub mod report;
pub mod result;
pub mod retry;
pub mod worker;

use crate::config::RunConfig;
use crate::core::{Action, ChangePolicy, HostStep, Scenario, Step, Suite};
use crate::error::StepError;
use client::{ClientInterface, ConnectionManager, ManageClient};
use futures::future;
use regex::Regex;
use report::{summarize, Report, Reporter, Summary};
use result::{CommandOutput, Outcome, ScenarioResult, StepResult};
use retry::retry_until;
use std::collections::HashSet;
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker::Workers;

/// Runs every scenario of `suite` and prints the results as they arrive.
///
/// Step failures do not make this function fail; they are counted in the returned [Summary].
/// Errors are only returned if the results could not be written. Firing `cancel` abandons
/// in-flight commands and marks every step that has not run yet as errored.
///
/// Requires a multi-threaded Tokio runtime.
pub async fn run_suite(
    suite: &Suite,
    config: &RunConfig,
    cancel: CancellationToken,
) -> io::Result<Summary> {
    let (_, summary) = _run_suite(suite, config, ConnectionManager, Reporter, cancel).await?;
    Ok(summary)
}

/// Like [run_suite], but with injectable connections and reporting. Also returns the results of
/// each scenario.
pub async fn _run_suite<MC, CI, R>(
    suite: &Suite,
    config: &RunConfig,
    manager: MC,
    mut reporter: R,
    cancel: CancellationToken,
) -> io::Result<(Vec<ScenarioResult>, Summary)>
where
    MC: ManageClient<CI>,
    CI: ClientInterface,
    R: Report,
{
    let workers = Workers::spawn(
        suite.hosts.hosts(),
        manager,
        config.command_timeout,
        cancel.clone(),
    );
    let context = RunContext {
        suite,
        config,
        workers: &workers,
        cancel: &cancel,
    };

    let results = async {
        let mut results = Vec::with_capacity(suite.scenarios.len());
        for scenario in &suite.scenarios {
            info!("running scenario \"{}\"", scenario.name);
            results.push(context.run_scenario(scenario, &mut reporter).await?);
        }
        Ok::<_, io::Error>(results)
    }
    .await;

    // Connections are closed even if reporting failed.
    workers.shutdown().await;
    let results = results?;

    let summary = summarize(&results);
    info!(
        "suite \"{}\" finished: {} passed, {} failed, {} errored",
        suite.name, summary.passed, summary.failed, summary.errored,
    );
    reporter.summary(&summary).await?;
    Ok((results, summary))
}

/// Everything a step needs in order to run, besides the step itself.
struct RunContext<'r> {
    suite: &'r Suite,
    config: &'r RunConfig,
    workers: &'r Workers,
    cancel: &'r CancellationToken,
}

/// What to do with one target of a step.
enum Dispatch<'s> {
    /// Run the compiled step.
    Run(HostStep<'s>, Step),

    /// Don't run it; this is the result.
    Skip(StepResult),
}

/// A finished target.
struct Finished {
    result: StepResult,

    /// Whether the host should be left alone for the rest of the scenario.
    lost_connection: bool,
}

impl From<StepResult> for Finished {
    fn from(result: StepResult) -> Self {
        Finished {
            result,
            lost_connection: false,
        }
    }
}

impl<'r> RunContext<'r> {
    async fn run_scenario<R: Report>(
        &self,
        scenario: &Scenario,
        reporter: &mut R,
    ) -> io::Result<ScenarioResult> {
        reporter.scenario(&scenario.name).await?;

        let vars = self.suite.vars_for(scenario);
        let mut unreachable = HashSet::new();
        let mut results = Vec::new();

        for step in &scenario.steps {
            let resolved = step.on.resolve(&self.suite.hosts);
            if resolved.is_empty() {
                // Validation guarantees targets, so the host list must have been narrowed.
                warn!(
                    "step \"{}\" of scenario \"{}\" has no hosts left to run on",
                    step.name, scenario.name,
                );
                reporter.skipped(&step.name).await?;
                continue;
            }
            let targets = resolved
                .into_iter()
                .map(|(host, peer)| HostStep::new(host, peer, step, &vars));

            if step.parallel.unwrap_or(self.config.parallel) {
                let dispatches: Vec<_> = targets
                    .map(|target| self.dispatch(target, &unreachable))
                    .collect();
                for dispatch in &dispatches {
                    if let Dispatch::Run(target, compiled) = dispatch {
                        reporter.starting(&label(target), &compiled.name).await?;
                    }
                }

                // Barrier: the next step waits for every branch of this one. Results are
                // reported in target order once all of them are in.
                let finished = future::join_all(dispatches.into_iter().map(|dispatch| async move {
                    match dispatch {
                        Dispatch::Run(target, compiled) => {
                            self.run_host_step(&target, compiled).await
                        }
                        Dispatch::Skip(result) => result.into(),
                    }
                }))
                .await;
                for done in finished {
                    record(done, &mut unreachable, &mut results, reporter).await?;
                }
            } else {
                for target in targets {
                    let done = match self.dispatch(target, &unreachable) {
                        Dispatch::Run(target, compiled) => {
                            reporter.starting(&label(&target), &compiled.name).await?;
                            self.run_host_step(&target, compiled).await
                        }
                        Dispatch::Skip(result) => result.into(),
                    };
                    record(done, &mut unreachable, &mut results, reporter).await?;
                }
            }
        }

        Ok(ScenarioResult {
            name: scenario.name.clone(),
            steps: results,
        })
    }

    /// Compiles `target` and decides whether it can run.
    fn dispatch<'s>(&self, target: HostStep<'s>, unreachable: &HashSet<String>) -> Dispatch<'s> {
        let compiled = target.compile();
        let host = &target.host().name;

        let detail = if self.cancel.is_cancelled() {
            StepError::Cancelled.to_string()
        } else if unreachable.contains(host) {
            format!("not run: {host} became unreachable earlier in this scenario")
        } else {
            return Dispatch::Run(target, compiled);
        };

        debug!("skipping \"{}\" on {host}: {detail}", compiled.name);
        Dispatch::Skip(StepResult {
            step: compiled.name,
            host: host.clone(),
            peer: target.peer().map(|peer| peer.name.clone()),
            outcome: Outcome::Errored,
            duration: Duration::ZERO,
            output: None,
            detail: Some(detail),
        })
    }

    /// Runs a compiled step on its host, retrying it if the step asks for that.
    async fn run_host_step(&self, target: &HostStep<'_>, step: Step) -> Finished {
        let host = target.host();
        let start = Instant::now();
        let mut last = None;

        let (command, apply) = match &step.action {
            Action::Command(command) => (Ok(command.clone()), false),
            Action::Apply(manifest) => (
                client::apply_command(&self.config.apply_command, manifest)
                    .map_err(|err| StepError::Assertion(format!("{err:#}"))),
                true,
            ),
        };

        let outcome = match command {
            Err(err) => Err(err),
            Ok(command) => {
                debug!("dispatching \"{}\" to {}", step.name, label(target));
                let attempt = || {
                    let command = command.clone();
                    async move {
                        let output = self.workers.run(&host.name, command).await?;
                        Ok::<_, StepError>(CommandOutput::from_process(output, apply))
                    }
                };
                let check = |output: &CommandOutput| {
                    last = Some(output.clone());
                    verify(&step, output)
                };

                let run = async {
                    match step.retry {
                        Some(overrides) => {
                            let policy = overrides.resolve(self.config.retry);
                            retry_until(attempt, check, policy.max_wait, policy.poll_interval)
                                .await
                        }
                        None => {
                            let mut check = check;
                            attempt()
                                .await
                                .and_then(|output| check(&output).map(|()| output))
                        }
                    }
                };

                tokio::select! {
                    _ = self.cancel.cancelled() => Err(StepError::Cancelled),
                    outcome = run => outcome,
                }
            }
        };

        let (outcome, detail, lost_connection) = match outcome {
            Ok(_) => (Outcome::Passed, None, false),
            Err(err) => (err.outcome(), Some(err.to_string()), err.lost_connection()),
        };

        Finished {
            result: StepResult {
                step: step.name,
                host: host.name.clone(),
                peer: target.peer().map(|peer| peer.name.clone()),
                outcome,
                duration: start.elapsed(),
                output: last,
                detail,
            },
            lost_connection,
        }
    }
}

/// Checks a command's output against what `step` expects.
fn verify(step: &Step, output: &CommandOutput) -> Result<(), StepError> {
    if output.exit_code != step.expect.exit_code {
        return Err(StepError::Assertion(format!(
            "expected exit code {}, got {}",
            step.expect.exit_code, output.exit_code,
        )));
    }

    match (step.changes, output.changed) {
        (ChangePolicy::NoChanges, true) => {
            return Err(StepError::Assertion(
                "expected no changes, but the manifest applied changes".to_string(),
            ));
        }
        (ChangePolicy::Changes, false) => {
            return Err(StepError::Assertion(
                "expected changes, but none were applied".to_string(),
            ));
        }
        _ => {}
    }

    let streams = [
        ("stdout", &step.expect.stdout, &output.stdout),
        ("stderr", &step.expect.stderr, &output.stderr),
    ];
    for (stream, patterns, text) in streams {
        for pattern in patterns {
            // Substituted variables can break a pattern that was valid when the suite loaded.
            let regex = Regex::new(pattern).map_err(|err| {
                StepError::Assertion(format!("invalid {stream} pattern /{pattern}/: {err}"))
            })?;
            if !regex.is_match(text) {
                return Err(StepError::Assertion(format!(
                    "{stream} did not match /{pattern}/"
                )));
            }
        }
    }
    Ok(())
}

/// Reports a finished target and adds it to the scenario's results.
async fn record<R: Report>(
    done: Finished,
    unreachable: &mut HashSet<String>,
    results: &mut Vec<StepResult>,
    reporter: &mut R,
) -> io::Result<()> {
    if done.lost_connection {
        unreachable.insert(done.result.host.clone());
    }
    reporter.report(&done.result).await?;
    results.push(done.result);
    Ok(())
}

/// A one-line label for a target, e.g. `alice` or `alice -> bob`.
fn label(target: &HostStep) -> String {
    match target.peer() {
        Some(peer) => format!("{} -> {}", target.host().name, peer.name),
        None => target.host().name.clone(),
    }
}
