//! Types for describing the hosts under test.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// How Vigil reaches a host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Connect over SSH. Login details not given on the [Host] come from `~/.ssh/config`.
    #[default]
    Ssh,

    /// Run commands on the control node with `sh -c`. Mostly useful for trying out suites.
    Local,
}

/// A single test target.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    /// The name used in suite files, reports, and the `$host` variable.
    pub name: String,

    /// The network address to connect to. Defaults to [Self::name].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// The login user. If [None], SSH picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// A private key to log in with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    #[serde(default)]
    pub transport: Transport,

    /// Free-form tags that steps can target, e.g. `server` or `client`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Host {
    /// Creates an SSH [Host] with no roles whose address is its name.
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            name: name.into(),
            address: None,
            user: None,
            port: None,
            identity_file: None,
            transport: Transport::Ssh,
            roles: vec![],
        }
    }

    /// Creates a [Transport::Local] [Host].
    pub fn local(name: impl Into<String>) -> Self {
        Host {
            transport: Transport::Local,
            ..Host::new(name)
        }
    }

    /// The address to connect to.
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// The hosts of a suite, in the order the suite lists them.
///
/// Host names are unique within a registry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostRegistry {
    hosts: Vec<Host>,
}

impl HostRegistry {
    /// Creates a [HostRegistry], failing if two hosts share a name.
    pub fn new(hosts: Vec<Host>) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.name.as_str()) {
                bail!("host \"{}\" is listed more than once", host.name);
            }
        }
        Ok(HostRegistry { hosts })
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|host| host.name == name)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Returns the hosts tagged with `role`, in registry order.
    pub fn with_role<'r, 's: 'r>(
        &'s self,
        role: &'r str,
    ) -> impl Iterator<Item = &'s Host> + 'r {
        self.hosts.iter().filter(move |host| host.has_role(role))
    }

    /// Returns every ordered pair of distinct hosts, optionally only among hosts with `role`.
    ///
    /// Pairs come out grouped by their first host, in registry order: for hosts `a`, `b`, `c`
    /// that is `(a, b)`, `(a, c)`, `(b, a)`, `(b, c)`, `(c, a)`, `(c, b)`.
    pub fn pairs(&self, role: Option<&str>) -> Vec<(&Host, &Host)> {
        let members: Vec<&Host> = match role {
            Some(role) => self.with_role(role).collect(),
            None => self.hosts.iter().collect(),
        };

        let mut pairs = Vec::with_capacity(members.len() * members.len().saturating_sub(1));
        for first in &members {
            for second in &members {
                if first.name != second.name {
                    pairs.push((*first, *second));
                }
            }
        }
        pairs
    }

    /// Drops every host not named in `names`. Fails if `names` mentions an unknown host.
    pub fn retain(&mut self, names: &[String]) -> anyhow::Result<()> {
        for name in names {
            if self.get(name).is_none() {
                bail!("host \"{name}\" is not part of this suite");
            }
        }
        self.hosts.retain(|host| names.contains(&host.name));
        Ok(())
    }
}
