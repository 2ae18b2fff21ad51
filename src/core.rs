//! Provides types that represent the user's instructions, e.g. suite files and their contents.

pub mod host;
pub mod scenario;
pub mod step;
pub mod suite;

#[doc(inline)]
pub use host::{Host, HostRegistry, Transport};

#[doc(inline)]
pub use scenario::{HostStep, Scenario};

#[doc(inline)]
pub use step::{Action, ChangePolicy, Expect, Step, Targets};

#[doc(inline)]
pub use suite::Suite;

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use indexmap::IndexMap;

    /// Returns a [Suite] with one local [Host] and one [Scenario], which contains one [Step].
    /// Also returns clones of these contained values for convenience.
    pub fn suite() -> (Suite, Host, Scenario, Step) {
        let step = Step::new("say hi", Action::Command("echo hi".into()));

        let scenario = Scenario {
            name: "API test".into(),
            vars: IndexMap::new(),
            steps: vec![step.clone()],
        };

        let host = Host::local("archie-desktop");

        let suite = Suite {
            source: None,
            name: "API test".into(),
            vars: IndexMap::new(),
            hosts: HostRegistry::new(vec![host.clone()]).unwrap(),
            scenarios: vec![scenario.clone()],
        };

        (suite, host, scenario, step)
    }
}
