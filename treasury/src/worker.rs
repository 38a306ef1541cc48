//! Background replenishment worker.

use std::sync::Arc;

use abanex_common::Ticker;
use abanex_market::ExchangeProvider;
use dashmap::DashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::replenisher::TreasuryReplenisher;

enum Job {
    Check(Ticker),
    Flush(oneshot::Sender<()>),
}

/// Sending side of the replenishment queue. Cheap to clone.
#[derive(Clone)]
pub struct ReplenishmentQueue {
    sender: mpsc::Sender<Job>,
    pending: Arc<DashSet<Ticker>>,
}

impl ReplenishmentQueue {
    /// Queue a check for `ticker`. A currency already waiting is not queued
    /// twice. Returns false when the check was dropped.
    pub fn enqueue(&self, ticker: Ticker) -> bool {
        if !self.pending.insert(ticker.clone()) {
            debug!(ticker = %ticker, "Replenishment check already pending");
            return true;
        }

        match self.sender.try_send(Job::Check(ticker.clone())) {
            Ok(()) => true,
            Err(_) => {
                self.pending.remove(&ticker);
                warn!(ticker = %ticker, "Replenishment queue unavailable, check dropped");
                false
            }
        }
    }

    /// Wait until every check queued before this call has run. Returns
    /// at once if the worker has stopped.
    pub async fn flush(&self) {
        let (done, finished) = oneshot::channel();
        if self.sender.send(Job::Flush(done)).await.is_ok() {
            let _ = finished.await;
        }
    }

    /// Number of currencies waiting for a check.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Tokio task running queued replenishment checks one at a time.
pub struct ReplenishmentWorker {
    queue: ReplenishmentQueue,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReplenishmentWorker {
    /// Spawn the worker on the current runtime.
    pub fn spawn(
        replenisher: Arc<TreasuryReplenisher>,
        provider: Arc<dyn ExchangeProvider>,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (stop, stopped) = oneshot::channel();
        let pending = Arc::new(DashSet::new());

        let task = tokio::spawn(run(
            receiver,
            stopped,
            pending.clone(),
            replenisher,
            provider,
        ));
        info!(capacity, "Replenishment worker started");

        Self {
            queue: ReplenishmentQueue { sender, pending },
            stop: Some(stop),
            task,
        }
    }

    /// Get a handle for queueing checks.
    pub fn queue(&self) -> ReplenishmentQueue {
        self.queue.clone()
    }

    /// Stop accepting work, run the checks already queued and wait for the
    /// task to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            error!(error = %e, "Replenishment worker panicked");
        }
        info!("Replenishment worker stopped");
    }
}

async fn run(
    mut receiver: mpsc::Receiver<Job>,
    mut stopped: oneshot::Receiver<()>,
    pending: Arc<DashSet<Ticker>>,
    replenisher: Arc<TreasuryReplenisher>,
    provider: Arc<dyn ExchangeProvider>,
) {
    loop {
        tokio::select! {
            biased;
            Some(job) = receiver.recv() => {
                handle(job, &pending, &replenisher, provider.as_ref()).await;
            }
            _ = &mut stopped => break,
            else => break,
        }
    }

    receiver.close();
    while let Ok(job) = receiver.try_recv() {
        handle(job, &pending, &replenisher, provider.as_ref()).await;
    }
}

async fn handle(
    job: Job,
    pending: &DashSet<Ticker>,
    replenisher: &TreasuryReplenisher,
    provider: &dyn ExchangeProvider,
) {
    match job {
        Job::Check(ticker) => check(&ticker, pending, replenisher, provider).await,
        Job::Flush(done) => {
            let _ = done.send(());
        }
    }
}

async fn check(
    ticker: &Ticker,
    pending: &DashSet<Ticker>,
    replenisher: &TreasuryReplenisher,
    provider: &dyn ExchangeProvider,
) {
    // Cleared first so debt created during this check queues a fresh one.
    pending.remove(ticker);
    match replenisher.maybe_replenish(ticker, provider).await {
        Ok(outcome) => debug!(ticker = %ticker, ?outcome, "Queued replenishment check done"),
        Err(e) => error!(ticker = %ticker, error = %e, "Queued replenishment check failed"),
    }
}
