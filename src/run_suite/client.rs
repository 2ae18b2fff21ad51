//! Provides an interface to run commands on hosts, over SSH or locally.

use crate::core::host::{Host, Transport};
use anyhow::bail;
use async_trait::async_trait;
#[cfg(feature = "openssh")]
use openssh::{KnownHosts, Session, SessionBuilder};
use shlex::Quoter;
use std::process::Output;
use tokio::process::Command;

/// Connects to hosts and returns values representing those connections.
///
/// One value of this type is shared by every host worker, so connecting must not depend on
/// mutable state that other hosts could observe.
#[async_trait]
pub trait ManageClient<CI: ClientInterface>: Clone + Send + Sync + 'static {
    /// Connect to `host` and, on success, return an interface to the host.
    async fn connect(&mut self, host: &Host) -> anyhow::Result<CI>;
}

/// The interface that Vigil uses to talk to a host.
///
/// Only one command runs at a time on a given interface.
#[async_trait]
pub trait ClientInterface: Send + 'static {
    /// Runs `command` through the host's shell and waits for it to finish.
    ///
    /// A nonzero exit code is not an error. Errors mean the command could not be run or its
    /// result could not be collected, e.g. because the connection dropped.
    async fn run(&mut self, command: &str) -> anyhow::Result<Output>;

    /// Tears the connection down.
    async fn close(self) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Builds the command that applies `manifest` by appending it, shell-quoted, to `apply_command`.
pub fn apply_command(apply_command: &str, manifest: &str) -> anyhow::Result<String> {
    match Quoter::new().quote(manifest) {
        Ok(quoted) => Ok(format!("{apply_command} {quoted}")),
        Err(_) => bail!("manifest cannot be passed to a shell because it contains a nul byte"),
    }
}

/// Production implementation of [ManageClient]. Picks a [Client] based on [Host::transport].
#[derive(Clone, Debug, Default)]
pub struct ConnectionManager;

#[async_trait]
impl ManageClient<Client> for ConnectionManager {
    async fn connect(&mut self, host: &Host) -> anyhow::Result<Client> {
        match host.transport {
            #[cfg(feature = "openssh")]
            Transport::Ssh => Ok(Client::Ssh(SshClient::connect(host).await?)),
            #[cfg(not(feature = "openssh"))]
            Transport::Ssh => bail!("cannot reach {}: built without SSH support", host.name),
            Transport::Local => Ok(Client::Local(LocalClient)),
        }
    }
}

/// Production implementation of [ClientInterface].
pub enum Client {
    #[cfg(feature = "openssh")]
    Ssh(SshClient),
    Local(LocalClient),
}

#[async_trait]
impl ClientInterface for Client {
    async fn run(&mut self, command: &str) -> anyhow::Result<Output> {
        match self {
            #[cfg(feature = "openssh")]
            Client::Ssh(client) => client.run(command).await,
            Client::Local(client) => client.run(command).await,
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        match self {
            #[cfg(feature = "openssh")]
            Client::Ssh(client) => client.close().await,
            Client::Local(client) => client.close().await,
        }
    }
}

/// Runs commands over a multiplexed OpenSSH session.
///
/// Settings not given on the [Host] (user, port, key) fall back to the control node's
/// `~/.ssh/config`. Unknown host keys are added to `known_hosts`.
#[cfg(feature = "openssh")]
pub struct SshClient {
    session: Session,
}

#[cfg(feature = "openssh")]
impl SshClient {
    pub async fn connect(host: &Host) -> anyhow::Result<Self> {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Add);
        if let Some(user) = &host.user {
            builder.user(user.clone());
        }
        if let Some(port) = host.port {
            builder.port(port);
        }
        if let Some(key) = &host.identity_file {
            builder.keyfile(key);
        }
        Ok(SshClient {
            session: builder.connect_mux(host.address()).await?,
        })
    }
}

#[cfg(feature = "openssh")]
#[async_trait]
impl ClientInterface for SshClient {
    async fn run(&mut self, command: &str) -> anyhow::Result<Output> {
        // The remote shell parses the command line, exactly as `ssh host '<command>'` would.
        Ok(self.session.raw_command(command).output().await?)
    }

    async fn close(self) -> anyhow::Result<()> {
        Ok(self.session.close().await?)
    }
}

/// Runs commands on the control node with `sh -c`.
#[derive(Clone, Debug, Default)]
pub struct LocalClient;

#[async_trait]
impl ClientInterface for LocalClient {
    async fn run(&mut self, command: &str) -> anyhow::Result<Output> {
        // If the caller gives up on us (timeout or cancellation), the child must not outlive it.
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }
}
