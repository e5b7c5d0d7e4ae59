//! Agent command dispatch.
//!
//! Node agents can not be reached by the control plane, so commands are delivered by having each
//! agent hold open a long poll against its own node. A node's pending command lives on the node
//! record itself, holding at most one command: enqueueing overwrites whatever was there before, so
//! an agent only ever observes the newest desired state.
//!
//! Waiters are woken through a per-node `watch` channel. The channel carries no payload other than
//! a change counter; the node record remains the source of truth and delivery is an atomic
//! take-and-clear of the record's slot. Removing a data source closes every channel of its nodes,
//! which releases any blocked waiters with a terminal signal.


use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::database::Database;
use crate::error::AppError;
use berth_core::models::{Command, DataSourceNode};

const METRIC_COMMANDS_ENQUEUED: &str = "berth_commands_enqueued";
const METRIC_COMMANDS_DELIVERED: &str = "berth_commands_delivered";
const METRIC_POLL_TIMEOUTS: &str = "berth_command_poll_timeouts";

/// The number of times a contended compare-and-set of a node's command slot is attempted.
const SLOT_WRITE_ATTEMPTS: usize = 5;

/// The signal published on a node's wake-up channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    /// The node's record changed, carrying a change counter.
    Open(u64),
    /// The node's data source has been removed.
    Removed,
}

/// The outcome of a long poll for a node's command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A command was taken from the node's slot.
    Command(Command),
    /// The poll timed out without a command becoming available.
    NoCommand,
    /// The node's data source was removed while polling.
    ClusterRemoved,
}

/// The key of a node's wake-up channel.
type NodeKey = (String, String);

/// The command dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    channels: Arc<DashMap<NodeKey, watch::Sender<Signal>>>,
}

impl Dispatcher {
    /// Create a new instance.
    pub fn new(db: Database) -> Self {
        metrics::describe_counter!(METRIC_COMMANDS_ENQUEUED, metrics::Unit::Count, "commands enqueued for node agents");
        metrics::describe_counter!(METRIC_COMMANDS_DELIVERED, metrics::Unit::Count, "commands delivered to node agents");
        metrics::describe_counter!(METRIC_POLL_TIMEOUTS, metrics::Unit::Count, "command polls which timed out without a command");
        Self { db, channels: Default::default() }
    }

    /// Set the pending command of the given node, overwriting any undelivered command.
    ///
    /// Any other staged changes of the record are written along with the command. The write is
    /// guarded by the record's version, so a stale record yields a conflict for the caller to retry.
    #[tracing::instrument(level = "debug", skip(self, node), fields(data_source = %node.data_source, host = %node.host))]
    pub async fn enqueue(&self, mut node: DataSourceNode, command: Command) -> Result<DataSourceNode> {
        node.pending_command = Some(command);
        let node = self.db.update_node(node).await?;
        self.commands_written(&node.data_source, &[node.host.as_str()]);
        Ok(node)
    }

    /// Record that commands were written to the given nodes by some other means, waking their waiters.
    pub fn commands_written(&self, data_source: &str, hosts: &[&str]) {
        for host in hosts {
            metrics::counter!(METRIC_COMMANDS_ENQUEUED).increment(1);
            self.notify(data_source, host);
        }
    }

    /// Wake any waiters of the given node.
    pub fn notify(&self, data_source: &str, host: &str) {
        if let Some(tx) = self.channels.get(&(data_source.to_string(), host.to_string())) {
            tx.send_modify(|signal| {
                if let Signal::Open(seq) = signal {
                    *seq = seq.wrapping_add(1);
                }
            });
        }
    }

    /// Release all waiters of the given data source's nodes with a terminal signal.
    pub fn close_data_source(&self, data_source: &str) {
        let keys: Vec<NodeKey> = self.channels.iter().filter(|entry| entry.key().0 == data_source).map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.channels.remove(&key) {
                tx.send_replace(Signal::Removed);
            }
        }
        tracing::debug!(data_source, "closed command channels of data source");
    }

    /// Block until a command is available for the given node, or until the timeout elapses.
    ///
    /// A delivered command is cleared from the node's slot, and is therefore delivered at most once.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_for_command(&self, data_source: &str, host: &str, timeout: Duration) -> Result<PollOutcome> {
        let key: NodeKey = (data_source.to_string(), host.to_string());
        // Subscribe before inspecting the slot so that no write between the two is missed.
        let mut rx = self.channels.entry(key.clone()).or_insert_with(|| watch::channel(Signal::Open(0)).0).subscribe();
        let outcome = self.poll(data_source, host, timeout, &mut rx).await;
        if !matches!(outcome, Ok(PollOutcome::Command(_)) | Ok(PollOutcome::NoCommand)) {
            // The node is gone, drop its channel unless another waiter still holds it.
            self.channels.remove_if(&key, |_, tx| tx.receiver_count() <= 1);
        }
        outcome
    }

    async fn poll(&self, data_source: &str, host: &str, timeout: Duration, rx: &mut watch::Receiver<Signal>) -> Result<PollOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let removed = *rx.borrow_and_update() == Signal::Removed;
            if removed {
                return Ok(PollOutcome::ClusterRemoved);
            }
            if let Some(outcome) = self.take_command(data_source, host).await? {
                return Ok(outcome);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // The sender is only ever dropped once its data source is removed.
                Ok(Err(_closed)) => return Ok(PollOutcome::ClusterRemoved),
                Err(_elapsed) => {
                    metrics::counter!(METRIC_POLL_TIMEOUTS).increment(1);
                    return Ok(PollOutcome::NoCommand);
                }
            }
        }
    }

    /// The number of live wake-up channels.
    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Atomically take the pending command of the given node, if any.
    async fn take_command(&self, data_source: &str, host: &str) -> Result<Option<PollOutcome>> {
        for _ in 0..SLOT_WRITE_ATTEMPTS {
            let mut node = match self.db.get_node(data_source, host).await? {
                Some(node) => node,
                None => {
                    if self.db.get_data_source(data_source).await?.is_none() {
                        return Ok(Some(PollOutcome::ClusterRemoved));
                    }
                    bail!(AppError::ResourceNotFound(format!("node {} of data source {} not found", host, data_source)));
                }
            };
            let command = match node.pending_command.take() {
                Some(command) => command,
                None => return Ok(None),
            };
            match self.db.update_node(node).await {
                Ok(_) => {
                    metrics::counter!(METRIC_COMMANDS_DELIVERED).increment(1);
                    tracing::debug!(data_source, host, ?command, "delivering command to node agent");
                    return Ok(Some(PollOutcome::Command(command)));
                }
                Err(err) if AppError::is_conflict(&err) => continue,
                Err(err) if AppError::is_not_found(&err) => return Ok(Some(PollOutcome::ClusterRemoved)),
                Err(err) => return Err(err),
            }
        }
        // Every contender publishes a wake-up after its write, so the caller will look again.
        Ok(None)
    }
}
