//! Admission, scheduling and the worker pool.
//!
//! The admission loop rate-checks inbound updates and files them into
//! per-chat mailboxes, pushing one fairness record per update. The
//! scheduling loop claims the oldest record whose chat no worker holds
//! and hands that chat's next update to the pool. Workers release the
//! chat when the router is done with it, so one chat is never processed
//! twice at once and its updates keep their arrival order.

pub mod mailbox;
pub mod queue;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::limiter::{RateLimiter, RateSettings, DEFAULT_SWEEP_INTERVAL};
use crate::router::{Action, Router};
use crate::update::{ChatId, Update};

pub use mailbox::Mailboxes;
pub use queue::{FairnessQueue, InFlightTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub workers: usize,
    pub mailbox_capacity: usize,
    /// Scheduling poll interval when no worker reports back.
    pub tick: Duration,
    /// Inbound limit per sender.
    pub rate: RateSettings,
    pub sweep_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            mailbox_capacity: mailbox::DEFAULT_MAILBOX_CAPACITY,
            tick: Duration::from_millis(100),
            rate: RateSettings::DISABLED,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            workers: config.workers_count.max(1),
            mailbox_capacity: config.mailbox_capacity,
            tick: config.tick(),
            rate: config.rate(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

struct Shared<A: Action> {
    router: Arc<Router<A>>,
    limiter: RateLimiter<i64>,
    tracker: InFlightTracker,
    mailboxes: Mailboxes,
    wake: Notify,
}

pub struct Dispatcher<A: Action> {
    shared: Arc<Shared<A>>,
    settings: DispatchSettings,
}

impl<A: Action> Dispatcher<A> {
    pub fn new(router: Router<A>, settings: DispatchSettings) -> Self {
        let shared = Shared {
            router: Arc::new(router),
            limiter: RateLimiter::new(settings.rate),
            tracker: InFlightTracker::new(),
            mailboxes: Mailboxes::new(settings.mailbox_capacity),
            wake: Notify::new(),
        };
        Self {
            shared: Arc::new(shared),
            settings,
        }
    }

    pub fn router(&self) -> &Arc<Router<A>> {
        &self.shared.router
    }

    /// Drops the oldest pending record of a chat. Its mail stays until a
    /// later record schedules it.
    pub fn omit(&self, chat_id: ChatId) -> bool {
        self.shared.tracker.omit(chat_id)
    }

    /// Consumes `updates` until the stream ends or `cancel` fires.
    ///
    /// When the stream ends, queued updates are processed before this
    /// returns. On cancellation handlers that already started run to
    /// completion; nothing new is picked up.
    pub async fn run<S>(&self, updates: S, cancel: CancellationToken)
    where
        S: Stream<Item = Update> + Send + Unpin,
    {
        let stop = cancel.child_token();
        let workers = self.settings.workers.max(1);
        let (intake_tx, intake_rx) = mpsc::channel::<Update>(workers);
        let intake_rx = Arc::new(Mutex::new(intake_rx));
        let mut tasks = JoinSet::new();

        {
            let shared = self.shared.clone();
            let interval = self.settings.sweep_interval;
            let stop = stop.clone();
            tasks.spawn(async move { shared.limiter.run_sweeper(interval, stop).await });
        }

        for worker_id in 0..workers {
            let shared = self.shared.clone();
            let intake = intake_rx.clone();
            let cancel = cancel.clone();
            let stop = stop.clone();
            tasks.spawn(async move { work(worker_id, shared, intake, cancel, stop).await });
        }
        drop(intake_rx);

        {
            let shared = self.shared.clone();
            let tick = self.settings.tick;
            let stop = stop.clone();
            tasks.spawn(async move { schedule(shared, intake_tx, tick, stop).await });
        }

        info!(workers, rate_limited = self.shared.limiter.is_enabled(), "dispatcher started");
        let mut notices = JoinSet::new();
        admit(&self.shared, updates, &mut notices, &cancel).await;

        if !cancel.is_cancelled() {
            self.drain(&cancel).await;
        }
        stop.cancel();

        while let Some(joined) = notices.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "rate limit notice failed");
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "dispatcher task failed");
            }
        }
        info!("dispatcher stopped");
    }

    async fn drain(&self, cancel: &CancellationToken) {
        let tracker = &self.shared.tracker;
        while tracker.queued() > 0 || tracker.in_flight() > 0 {
            debug!(
                queued = tracker.queued(),
                in_flight = tracker.in_flight(),
                "waiting for pending updates"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.tick) => {}
            }
        }
    }
}

/// Rate-limit notices run on `notices` so a slow hook for one sender
/// never holds back the updates of others.
async fn admit<A, S>(
    shared: &Shared<A>,
    mut updates: S,
    notices: &mut JoinSet<()>,
    cancel: &CancellationToken,
) where
    A: Action,
    S: Stream<Item = Update> + Unpin,
{
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = updates.next() => match next {
                Some(update) => update,
                None => {
                    info!("update stream closed");
                    return;
                }
            },
        };

        let update_id = update.id;
        let chat_id = update.chat_id;
        let user_id = update.user_id.map(|u| u.0);
        debug!(update_id, %chat_id, ?user_id, "received update");

        if update.is_rate_checked() {
            let key = user_id.unwrap_or(chat_id.0);
            if !shared.limiter.allow(&key) {
                debug!(update_id, %chat_id, ?user_id, "rate limit exceeded, dropping update");
                while notices.try_join_next().is_some() {}
                let router = shared.router.clone();
                let cancel = cancel.clone();
                notices.spawn(async move { router.notify_rate_limited(update, cancel).await });
                continue;
            }
        }

        // a full mailbox holds admission back until the chat drains
        let delivered = tokio::select! {
            _ = cancel.cancelled() => return,
            delivered = shared.mailboxes.deliver(update) => delivered,
        };
        if let Err(err) = delivered {
            error!(update_id, %chat_id, error = %err, "failed to queue update");
            continue;
        }
        shared.tracker.push(chat_id);
        shared.wake.notify_one();
        debug!(update_id, %chat_id, "update queued for processing");
    }
}

async fn schedule<A: Action>(
    shared: Arc<Shared<A>>,
    intake: mpsc::Sender<Update>,
    tick: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = shared.wake.notified() => {}
            _ = ticker.tick() => {}
        }

        while let Some(chat_id) = shared.tracker.next_eligible() {
            let Some(update) = shared.mailboxes.take(chat_id) else {
                warn!(%chat_id, "chat scheduled with empty mailbox, releasing");
                shared.tracker.release(chat_id);
                continue;
            };
            debug!(update_id = update.id, %chat_id, "handing update to worker");
            if intake.send(update).await.is_err() {
                shared.tracker.release(chat_id);
                return;
            }
        }
    }
}

async fn work<A: Action>(
    worker_id: usize,
    shared: Arc<Shared<A>>,
    intake: Arc<Mutex<mpsc::Receiver<Update>>>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        let next = {
            let mut intake = intake.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                update = intake.recv() => update,
            }
        };
        let Some(update) = next else {
            debug!(worker_id, "worker stopping");
            return;
        };

        let update_id = update.id;
        let chat_id = update.chat_id;
        debug!(worker_id, update_id, %chat_id, "start processing update");

        let routed = AssertUnwindSafe(shared.router.dispatch(update, cancel.clone()))
            .catch_unwind()
            .await;
        if routed.is_err() {
            error!(worker_id, update_id, %chat_id, "handler panicked");
        }

        shared.tracker.release(chat_id);
        shared.wake.notify_one();
        debug!(worker_id, update_id, %chat_id, "finished processing update");
    }
}
