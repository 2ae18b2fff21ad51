//! One task per host, each owning that host's connection.
//!
//! The runner never touches a connection directly. It sends commands to a host's worker and
//! awaits the reply. A worker handles one command at a time, so commands for the same host run in
//! the order they were sent, while workers for different hosts run independently. No connection
//! is ever shared, so nothing needs a lock.

use crate::core::host::Host;
use crate::error::StepError;
use crate::run_suite::client::{ClientInterface, ManageClient};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::process::Output;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A command for a worker, with a channel for the result.
struct Job {
    command: String,
    reply: oneshot::Sender<Result<Output, StepError>>,
}

/// Handles to every host's worker.
pub struct Workers {
    senders: HashMap<String, mpsc::UnboundedSender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawns one worker per host. Workers connect lazily, when their first command arrives.
    ///
    /// Each command, including the connection attempt it may trigger, is abandoned after
    /// `timeout`. Every in-flight command is abandoned as soon as `cancel` fires.
    pub fn spawn<MC, CI>(
        hosts: &[Host],
        manager: MC,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        MC: ManageClient<CI>,
        CI: ClientInterface,
    {
        let mut senders = HashMap::new();
        let mut handles = Vec::with_capacity(hosts.len());

        for host in hosts {
            let (sender, receiver) = mpsc::unbounded_channel();
            let worker = HostWorker {
                host: host.clone(),
                manager: manager.clone(),
                client: None,
                timeout,
                cancel: cancel.clone(),
                receiver,
                _client: PhantomData,
            };
            senders.insert(host.name.clone(), sender);
            handles.push(tokio::spawn(worker.run()));
        }

        Workers { senders, handles }
    }

    /// Runs `command` on `host` and waits for the result.
    pub async fn run(&self, host: &str, command: String) -> Result<Output, StepError> {
        let lost = || StepError::Connection {
            host: host.to_string(),
            message: "host worker is not running".to_string(),
        };

        let sender = self.senders.get(host).ok_or_else(lost)?;
        let (reply, response) = oneshot::channel();
        sender.send(Job { command, reply }).map_err(|_| lost())?;
        response.await.map_err(|_| lost())?
    }

    /// Stops every worker once its queue is empty and closes its connection.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("host worker panicked: {err}");
            }
        }
    }
}

struct HostWorker<MC, CI> {
    host: Host,
    manager: MC,

    /// [None] until the first command, and again after the connection breaks.
    client: Option<CI>,

    timeout: Duration,
    cancel: CancellationToken,
    receiver: mpsc::UnboundedReceiver<Job>,
    _client: PhantomData<fn() -> CI>,
}

impl<MC, CI> HostWorker<MC, CI>
where
    MC: ManageClient<CI>,
    CI: ClientInterface,
{
    async fn run(mut self) {
        while let Some(mut job) = self.receiver.recv().await {
            let result = self.execute(&job.command, &mut job.reply).await;
            // The runner may have stopped waiting, e.g. after a cancellation.
            let _ = job.reply.send(result);
        }

        if let Some(client) = self.client.take() {
            debug!("disconnecting from {}", self.host.name);
            if let Err(err) = client.close().await {
                warn!("failed to close connection to {}: {err:#}", self.host.name);
            }
        }
    }

    async fn execute(
        &mut self,
        command: &str,
        reply: &mut oneshot::Sender<Result<Output, StepError>>,
    ) -> Result<Output, StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let deadline = time::Instant::now() + self.timeout;
        let outcome = {
            let host = &self.host;
            let manager = &mut self.manager;
            let slot = &mut self.client;
            let attempt = async {
                let client = match slot {
                    Some(client) => client,
                    slot @ None => {
                        debug!("connecting to {}", host.name);
                        slot.insert(manager.connect(host).await.map_err(Broken)?)
                    }
                };
                debug!("running on {}: {command}", host.name);
                client.run(command).await.map_err(Broken)
            };

            tokio::select! {
                _ = self.cancel.cancelled() => None,
                // Nobody is waiting for the result anymore, e.g. a retry window closed.
                _ = reply.closed() => None,
                result = time::timeout_at(deadline, attempt) => Some(result),
            }
        };

        match outcome {
            None => {
                // The command may still be running; don't reuse a connection in that state.
                self.client = None;
                Err(StepError::Cancelled)
            }
            Some(Err(_elapsed)) => {
                self.client = None;
                Err(StepError::Timeout {
                    host: self.host.name.clone(),
                    after: self.timeout,
                })
            }
            Some(Ok(Err(Broken(err)))) => {
                warn!("lost connection to {}: {err:#}", self.host.name);
                self.client = None;
                Err(StepError::Connection {
                    host: self.host.name.clone(),
                    message: format!("{err:#}"),
                })
            }
            Some(Ok(Ok(output))) => Ok(output),
        }
    }
}

/// A connection that failed or broke.
struct Broken(anyhow::Error);
