//! Multi-host acceptance testing for declarative infrastructure.
//!
//! # YAML file types
//!
//! Suite files and configuration files. A suite declares the hosts under test, some variables,
//! and an ordered list of scenarios. Each scenario is an ordered list of steps, and each step
//! either runs a shell command or applies a manifest on one or more hosts. The configuration file
//! holds run-wide defaults such as the command timeout and the apply command.
//!
//! # Program flow
//!
//! 1. On the control node, the user invokes the `vigil` binary with a suite file.
//!
//! 2. The suite is loaded into a [Suite](core::Suite), which validates host references and
//!    expands idempotent applies into pairs of steps.
//!
//! 3. [run_suite] spawns one worker per host. Each worker owns its host's connection and runs one
//!    command at a time. Scenarios run in order; steps within a scenario run in order; a step's
//!    targets run either one after another or all at once, and the next step waits for all of
//!    them.
//!
//! 4. Every step result flows to a [Report](run_suite::report::Report) implementation, which
//!    prints progress and finally a summary listing each failure with its host, step, and
//!    captured output.
//!
//! Manifests are opaque. They are handed to an external apply command (by default
//! `puppet apply --detailed-exitcodes`), whose exit code tells us whether anything changed.

pub mod config;
pub mod core;
pub mod error;
pub mod run_suite;

#[doc(inline)]
pub use run_suite::run_suite;
