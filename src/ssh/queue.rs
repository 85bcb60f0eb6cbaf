// Per-cluster FIFO: every script execution against a given cluster passes through a single
// worker task so that at most one ssh invocation is ever in flight per cluster. Clusters are
// independent of one another and get their own queue, spawned lazily on first use.

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use super::identity::Identity;
use crate::error::{GatewayError, Result};

struct Job {
    host: String,
    identity: Identity,
    script: String,
    reply: oneshot::Sender<Result<String>>,
}

pub struct TransportQueue {
    workers: DashMap<String, mpsc::Sender<Job>>,
}

impl TransportQueue {
    pub fn new() -> Self {
        TransportQueue {
            workers: DashMap::new(),
        }
    }

    pub async fn submit(&self, host: &str, identity: Identity, script: String) -> Result<String> {
        let sender = self.worker_for(host);
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            host: host.to_string(),
            identity,
            script,
            reply: reply_tx,
        };
        sender
            .send(job)
            .await
            .map_err(|_| GatewayError::Transport(format!("transport queue for {host} is gone")))?;
        reply_rx
            .await
            .map_err(|_| GatewayError::Transport(format!("transport worker for {host} dropped reply")))?
    }

    fn worker_for(&self, host: &str) -> mpsc::Sender<Job> {
        if let Some(existing) = self.workers.get(host) {
            return existing.clone();
        }
        // Two callers racing to create the same cluster's worker both build a channel here;
        // DashMap::entry resolves the race by keeping only the first one inserted.
        let (tx, rx) = mpsc::channel::<Job>(32);
        let entry = self
            .workers
            .entry(host.to_string())
            .or_insert_with(|| tx.clone());
        if entry.value().same_channel(&tx) {
            tokio::spawn(run_worker(rx));
        }
        entry.value().clone()
    }
}

impl Default for TransportQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let result = super::run_once(&job.host, &job.identity, &job.script).await;
        let _ = job.reply.send(result);
    }
}
