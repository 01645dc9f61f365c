//! Delivery dispatcher
//!
//! A single coordination loop per relay. It reacts to three inputs:
//! - the intake signal, fired once a message is fully written to `incoming`
//! - the retry timer, which re-signals everything in `retry`
//! - the stuck timer, which re-signals stale `incoming`/`processing` messages
//!   nobody is working on
//!
//! The loop only claims and spawns. Delivery runs in separate tasks, bounded
//! by a semaphore that each task acquires itself, so the loop never waits on
//! delivery work.

use crate::config::QueueConfig;
use crate::delivery::{process_message, DeliveryContext, DeliveryOutcome};
use crate::message::MessageId;
use crate::metrics;
use crate::queue::{ScoreGuard, Scoreboard, Section};
use crate::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Default retry sweep interval (5 seconds)
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default stuck sweep interval (60 seconds)
pub const DEFAULT_STUCK_INTERVAL: Duration = Duration::from_secs(60);

/// Default age after which an unclaimed message counts as stuck (5 minutes)
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Default number of concurrent delivery tasks
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// Default event channel capacity (1000 events)
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub retry_interval: Duration,
    pub stuck_interval: Duration,

    /// How long a message may sit in `incoming` or `processing` unclaimed
    pub stale_after: Duration,

    /// Upper bound on delivery tasks running at once
    pub max_concurrent: usize,

    pub event_channel_capacity: usize,

    /// Re-signal leftovers from a previous run when the loop starts
    pub recover_on_start: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stuck_interval: DEFAULT_STUCK_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            recover_on_start: true,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take intervals and pool size from the queue section of the config file
    pub fn from_queue_config(queue: &QueueConfig) -> Self {
        Self {
            retry_interval: queue.retry_interval(),
            stuck_interval: queue.stuck_interval(),
            stale_after: queue.stale_after(),
            max_concurrent: queue.max_concurrent_deliveries,
            ..Default::default()
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_stuck_interval(mut self, interval: Duration) -> Self {
        self.stuck_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_recover_on_start(mut self, enabled: bool) -> Self {
        self.recover_on_start = enabled;
        self
    }
}

/// Events emitted by the dispatcher
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    Started,
    Stopped,

    /// A delivery task was spawned
    Dispatched { id: MessageId, section: Section },

    /// A delivery task finished
    Processed {
        id: MessageId,
        outcome: DeliveryOutcome,
    },

    /// Retry sweep completed
    RetrySweep { count: usize },

    /// Stuck sweep completed
    StuckSweep { count: usize },

    Error { message: String },
}

/// Commands that can be sent to the dispatcher
#[derive(Debug, Clone)]
pub enum DispatcherCommand {
    /// Run the retry sweep now
    RetryNow,
    /// Run the stuck sweep now
    SweepNow,
    /// Stop intake and wait for in-flight deliveries
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Signal {
    pub(crate) id: MessageId,
    pub(crate) section: Section,
}

/// Intake handle for newly arrived messages
///
/// Submitting never blocks. Once the dispatcher has stopped, submissions are
/// refused and the message is picked up by recovery on the next start.
#[derive(Debug, Clone)]
pub struct Intake {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Intake {
    /// Signal a message that is fully written to `incoming`
    pub fn submit(&self, id: MessageId) -> bool {
        self.submit_from(id, Section::Incoming)
    }

    pub fn submit_from(&self, id: MessageId, section: Section) -> bool {
        self.tx.send(Signal { id, section }).is_ok()
    }

    /// Intake whose signals go to the returned receiver instead of a dispatcher
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

fn send_event(event_tx: &broadcast::Sender<DispatcherEvent>, event: DispatcherEvent) {
    if event_tx.send(event).is_err() {
        tracing::trace!("Dispatcher event sent but no receivers subscribed");
    }
}

/// Delivery dispatcher
pub struct Dispatcher {
    config: DispatcherConfig,
    ctx: DeliveryContext,
    scoreboard: Arc<Scoreboard>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,

    event_tx: broadcast::Sender<DispatcherEvent>,
    command_tx: mpsc::Sender<DispatcherCommand>,
    command_rx: Option<mpsc::Receiver<DispatcherCommand>>,
    intake_tx: mpsc::UnboundedSender<Signal>,
    intake_rx: Option<mpsc::UnboundedReceiver<Signal>>,

    running: bool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, ctx: DeliveryContext) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(10);
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Self {
            config,
            ctx,
            scoreboard: Arc::new(Scoreboard::new()),
            permits,
            tasks: JoinSet::new(),
            event_tx,
            command_tx,
            command_rx: Some(command_rx),
            intake_tx,
            intake_rx: Some(intake_rx),
            running: false,
        }
    }

    pub fn intake(&self) -> Intake {
        Intake {
            tx: self.intake_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.event_tx.subscribe()
    }

    pub fn command_sender(&self) -> mpsc::Sender<DispatcherCommand> {
        self.command_tx.clone()
    }

    pub fn scoreboard(&self) -> &Arc<Scoreboard> {
        &self.scoreboard
    }

    /// Number of delivery tasks not yet reaped
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Run the coordination loop until a shutdown command arrives
    pub async fn run(&mut self) -> Result<()> {
        let mut intake_rx = self
            .intake_rx
            .take()
            .ok_or_else(|| crate::RelayError::Config("Dispatcher already running".to_string()))?;
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| crate::RelayError::Config("Dispatcher already running".to_string()))?;

        self.running = true;
        metrics::set_health_status(true);
        send_event(&self.event_tx, DispatcherEvent::Started);
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            retry_interval_secs = self.config.retry_interval.as_secs_f64(),
            stuck_interval_secs = self.config.stuck_interval.as_secs_f64(),
            "Dispatcher started"
        );

        if self.config.recover_on_start {
            self.recover();
        }

        let mut retry = interval_at(
            Instant::now() + self.config.retry_interval,
            self.config.retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stuck = interval_at(
            Instant::now() + self.config.stuck_interval,
            self.config.stuck_interval,
        );
        stuck.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(signal) = intake_rx.recv() => {
                    self.dispatch(signal.id, signal.section);
                }
                _ = retry.tick() => {
                    self.retry_sweep();
                }
                _ = stuck.tick() => {
                    self.stuck_sweep();
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Delivery task panicked");
                        send_event(&self.event_tx, DispatcherEvent::Error {
                            message: format!("Delivery task failed: {}", e),
                        });
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match self.handle_command(cmd) {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
            }
        }

        drop(intake_rx);
        self.shutdown().await;
        Ok(())
    }

    fn handle_command(&mut self, cmd: DispatcherCommand) -> CommandResult {
        match cmd {
            DispatcherCommand::RetryNow => {
                self.retry_sweep();
            }
            DispatcherCommand::SweepNow => {
                self.stuck_sweep();
            }
            DispatcherCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                return CommandResult::Stop;
            }
        }
        CommandResult::Continue
    }

    /// Stop intake, cancel puzzle searches, and let running deliveries finish
    async fn shutdown(&mut self) {
        self.running = false;
        self.ctx.abort.store(true, Ordering::SeqCst);

        let pending = self.tasks.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight deliveries");
        }
        self.wait_idle().await;

        metrics::set_health_status(false);
        send_event(&self.event_tx, DispatcherEvent::Stopped);
        tracing::info!("Dispatcher shutdown complete");
    }

    /// Wait until every spawned delivery task has finished
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
    }

    /// Claim a message and spawn its delivery; false if it is already in flight
    pub fn dispatch(&mut self, id: MessageId, section: Section) -> bool {
        match self.scoreboard.claim(id, section) {
            Some(guard) => {
                self.spawn_delivery(guard, section);
                true
            }
            None => {
                tracing::debug!(message_id = %id, %section, "Already in flight, dropping signal");
                false
            }
        }
    }

    fn spawn_delivery(&mut self, guard: ScoreGuard, section: Section) {
        let id = *guard.id();
        let ctx = self.ctx.clone();
        let permits = Arc::clone(&self.permits);
        let event_tx = self.event_tx.clone();

        self.tasks.spawn(async move {
            // Released on every exit path, panics included
            let _guard = guard;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let outcome = process_message(&ctx, id, section).await;
            tracing::debug!(message_id = %id, %outcome, "Delivery task finished");
            send_event(&event_tx, DispatcherEvent::Processed { id, outcome });
        });

        send_event(&self.event_tx, DispatcherEvent::Dispatched { id, section });
    }

    /// Re-signal every message in `retry`; returns how many were dispatched
    pub fn retry_sweep(&mut self) -> usize {
        self.update_queue_metrics();

        let ids = match self.ctx.queue.list(Section::Retry) {
            Ok(ids) => ids,
            Err(e) => {
                self.report_error(format!("Cannot list retry queue: {}", e));
                return 0;
            }
        };

        let count = ids
            .into_iter()
            .filter(|id| self.dispatch(*id, Section::Retry))
            .count();

        if count > 0 {
            tracing::debug!(count, "Retry sweep dispatched messages");
        }
        send_event(&self.event_tx, DispatcherEvent::RetrySweep { count });
        count
    }

    /// Re-signal stale `incoming` and `processing` messages nobody is working on
    pub fn stuck_sweep(&mut self) -> usize {
        let queue = Arc::clone(&self.ctx.queue);
        let mut count = 0;

        for section in [Section::Incoming, Section::Processing] {
            let stale = match queue.list_stale(section, self.config.stale_after) {
                Ok(stale) => stale,
                Err(e) => {
                    self.report_error(format!("Cannot list stale {} messages: {}", section, e));
                    continue;
                }
            };

            for entry in stale {
                let id = match entry {
                    Ok(id) => id,
                    Err(e) => {
                        self.report_error(format!("Cannot read {} entry: {}", section, e));
                        continue;
                    }
                };
                if self.scoreboard.is_active(&id) {
                    continue;
                }

                let dispatched = match section {
                    Section::Processing => self.rescue_orphan(id),
                    _ => self.dispatch(id, section),
                };
                if dispatched {
                    count += 1;
                }
            }
        }

        if count > 0 {
            tracing::info!(count, "Stuck sweep re-dispatched messages");
        }
        send_event(&self.event_tx, DispatcherEvent::StuckSweep { count });
        count
    }

    /// Move an unclaimed `processing` message to `stuck` and deliver it from there
    fn rescue_orphan(&mut self, id: MessageId) -> bool {
        let Some(guard) = self.scoreboard.claim(id, Section::Stuck) else {
            return false;
        };

        match self
            .ctx
            .queue
            .move_message(Section::Processing, Section::Stuck, &id)
        {
            Ok(()) => {
                tracing::warn!(message_id = %id, "Recovered orphaned message from processing");
                self.spawn_delivery(guard, Section::Stuck);
                true
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                self.report_error(format!("Cannot move {} to stuck: {}", id, e));
                false
            }
        }
    }

    /// Re-signal whatever a previous run left behind
    ///
    /// Nothing can be in flight yet, so every `processing` entry is an orphan.
    pub fn recover(&mut self) -> usize {
        let queue = Arc::clone(&self.ctx.queue);
        let mut count = 0;

        for section in [Section::Incoming, Section::Processing, Section::Stuck] {
            let ids = match queue.list(section) {
                Ok(ids) => ids,
                Err(e) => {
                    self.report_error(format!("Cannot list {} during recovery: {}", section, e));
                    continue;
                }
            };
            for id in ids {
                let dispatched = match section {
                    Section::Processing => self.rescue_orphan(id),
                    _ => self.dispatch(id, section),
                };
                if dispatched {
                    count += 1;
                }
            }
        }

        if count > 0 {
            tracing::info!(count, "Recovered messages from previous run");
        }
        count
    }

    fn update_queue_metrics(&self) {
        for section in Section::ALL {
            if let Ok(depth) = self.ctx.queue.count(section) {
                metrics::set_queue_depth(section.as_str(), depth);
            }
        }
    }

    fn report_error(&self, message: String) {
        tracing::error!("{}", message);
        send_event(&self.event_tx, DispatcherEvent::Error { message });
    }
}
