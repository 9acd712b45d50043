//! Core actor framework types and traits.
//!
//! Provides the building blocks every resource actor runs on:
//! - `Actor` trait for defining actor behavior
//! - `StopSignal` / `StopListener`, an idempotent one-shot stop broadcast
//! - `Mailbox` for sending messages to an actor with backpressure
//! - `spawn_actor` and the run loop (stop, message, or periodic tick)

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nestplane_id::ActorId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Called once before the loop starts. An error means the loop never runs.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Interval after which `on_tick` runs if no message arrived.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic work. Same return convention as `handle`.
    async fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        Ok(true)
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        // Default: no cleanup
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: ActorId,

    /// Stop signal receiver.
    pub stop: StopListener,

    /// Message counter.
    pub messages_processed: u64,

    /// Tick counter.
    pub ticks: u64,

    /// Last message processing time.
    pub last_message_at: Option<Instant>,

    /// Current actor state (for introspection).
    pub state: ActorState,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(actor_id: ActorId, stop: StopListener) -> Self {
        Self {
            actor_id,
            stop,
            messages_processed: 0,
            ticks: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }

    /// Check if stop has been signaled.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Actor is starting up.
    Starting,
    /// Actor is running and processing messages.
    Running,
    /// Actor is stopping.
    Stopping,
    /// Actor has stopped.
    Stopped,
    /// Actor has failed.
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the loop keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the loop stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Stop signal
// =============================================================================

/// One-shot stop broadcast shared by an actor and everyone holding its handle.
///
/// Stopping is idempotent: later calls are no-ops.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal stop. Returns true only for the call that actually stopped.
    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`StopSignal`].
#[derive(Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop has been signaled.
    pub async fn stopped(&mut self) {
        // A dropped sender can never signal; treat it as stopped.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

// =============================================================================
// Mailbox
// =============================================================================

/// Bounded, FIFO sending side of an actor's queue.
///
/// `send` waits while the queue is full, but gives up as soon as the
/// actor's stop signal fires.
pub struct Mailbox<M: Message> {
    /// Sender for the actor's queue.
    tx: mpsc::Sender<M>,

    /// The actor's stop signal.
    stop: StopSignal,

    /// Actor ID for logging.
    actor_id: ActorId,
}

impl<M: Message> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stop: self.stop.clone(),
            actor_id: self.actor_id,
        }
    }
}

impl<M: Message> Mailbox<M> {
    /// Send a message, waiting for room if the queue is full.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        let mut stop = self.stop.listener();
        if stop.is_stopped() {
            return Err(ActorError::ActorStopped);
        }

        tokio::select! {
            biased;

            _ = stop.stopped() => Err(ActorError::ActorStopped),

            sent = self.tx.send(msg) => {
                sent.map_err(|_| ActorError::ActorStopped)?;
                self.warn_if_backlogged();
                Ok(())
            }
        }
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        if self.stop.is_stopped() {
            return Err(ActorError::ActorStopped);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })?;
        self.warn_if_backlogged();
        Ok(())
    }

    /// Messages waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    fn warn_if_backlogged(&self) {
        let (len, cap) = (self.len(), self.capacity());
        if is_backlogged(len, cap) {
            warn!(
                actor_id = %self.actor_id,
                queued = len,
                capacity = cap,
                "Actor queue is almost full"
            );
        }
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Everything needed to talk to and stop a spawned actor.
pub struct ActorHandle<M: Message> {
    pub mailbox: Mailbox<M>,
    pub stop: StopSignal,
    task: JoinHandle<()>,
}

impl<M: Message> ActorHandle<M> {
    pub fn actor_id(&self) -> &ActorId {
        self.mailbox.actor_id()
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the actor task to finish.
    pub async fn join(&mut self) {
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                error!(actor_id = %self.actor_id(), error = %e, "Actor task panicked");
            }
        }
    }
}

/// Spawn an actor on the runtime with a queue of `mailbox_size` messages.
pub fn spawn_actor<A: Actor>(actor: A, mailbox_size: usize) -> ActorHandle<A::Message> {
    spawn_actor_with_stop(actor, mailbox_size, StopSignal::new())
}

/// Like [`spawn_actor`], sharing an existing stop signal with the actor.
pub fn spawn_actor_with_stop<A: Actor>(
    actor: A,
    mailbox_size: usize,
    stop: StopSignal,
) -> ActorHandle<A::Message> {
    let actor_id = ActorId::new();
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));

    info!(actor_id = %actor_id, actor_type = %actor.name(), "Spawned actor");

    let task = tokio::spawn(run_actor_loop(actor, rx, stop.listener(), actor_id));

    ActorHandle {
        mailbox: Mailbox {
            tx,
            stop: stop.clone(),
            actor_id,
        },
        stop,
        task,
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    stop: StopListener,
    actor_id: ActorId,
) {
    let mut ctx = ActorContext::new(actor_id, stop.clone());
    let mut stop = stop;

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, actor = %actor.name(), error = %e, "Actor failed to start");
        ctx.state = ActorState::Failed;
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    let tick = actor.tick_interval();

    loop {
        let outcome = tokio::select! {
            biased;

            // Check stop first
            _ = stop.stopped() => {
                info!(actor_id = %actor_id, "Actor received stop signal");
                break;
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;
                        ctx.last_message_at = Some(Instant::now());
                        actor.handle(msg, &mut ctx).await
                    }
                    None => {
                        debug!(actor_id = %actor_id, "Actor mailbox closed");
                        break;
                    }
                }
            }

            _ = sleep_or_pending(tick) => {
                ctx.ticks += 1;
                actor.on_tick(&mut ctx).await
            }
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                info!(actor_id = %actor_id, "Actor requested stop");
                break;
            }
            Err(e) => {
                error!(actor_id = %actor_id, error = %e, "Actor error");
                if matches!(e, ActorError::Permanent(_)) {
                    ctx.state = ActorState::Failed;
                    break;
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopped;
    }

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        ticks = ctx.ticks,
        "Actor stopped"
    );
}

async fn sleep_or_pending(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

/// More than 80% of the queue is in use.
pub(crate) fn is_backlogged(len: usize, capacity: usize) -> bool {
    len * 5 > capacity * 4
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct TestMessage(String);

    struct Recorder {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
        ticks: Arc<AtomicU64>,
        tick: Option<Duration>,
    }

    #[async_trait]
    impl Actor for Recorder {
        type Message = TestMessage;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&mut self, msg: TestMessage, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            let stop = msg.0 == "stop";
            self.seen.lock().unwrap().push(msg.0);
            Ok(!stop)
        }

        fn tick_interval(&self) -> Option<Duration> {
            self.tick
        }

        async fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn recorder(tick: Option<Duration>) -> (Recorder, Arc<std::sync::Mutex<Vec<String>>>, Arc<AtomicU64>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let ticks = Arc::new(AtomicU64::new(0));
        (
            Recorder {
                seen: seen.clone(),
                ticks: ticks.clone(),
                tick,
            },
            seen,
            ticks,
        )
    }

    #[test]
    fn test_stop_signal_is_idempotent() {
        let stop = StopSignal::new();
        let listener = stop.listener();
        assert!(!listener.is_stopped());

        assert!(stop.stop());
        assert!(!stop.stop());
        assert!(listener.is_stopped());
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_messages_processed_in_order() {
        let (actor, seen, _) = recorder(None);
        let mut handle = spawn_actor(actor, 16);

        for m in ["a", "b", "stop"] {
            handle.mailbox.send(TestMessage(m.to_string())).await.unwrap();
        }
        handle.join().await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "stop"]);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_ticks_when_idle() {
        let (actor, _, ticks) = recorder(Some(Duration::from_millis(10)));
        let mut handle = spawn_actor(actor, 16);

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop.stop();
        handle.join().await;

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_blocked_send_released_by_stop() {
        let stop = StopSignal::new();
        let (tx, _rx) = mpsc::channel::<TestMessage>(1);
        let mailbox = Mailbox {
            tx,
            stop: stop.clone(),
            actor_id: ActorId::new(),
        };

        mailbox.send(TestMessage("fill".into())).await.unwrap();
        assert!(matches!(
            mailbox.try_send(TestMessage("overflow".into())),
            Err(ActorError::MailboxFull)
        ));

        let blocked = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.send(TestMessage("blocked".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        stop.stop();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(ActorError::ActorStopped)));
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let (actor, _, _) = recorder(None);
        let mut handle = spawn_actor(actor, 4);

        handle.stop.stop();
        handle.join().await;

        assert!(matches!(
            handle.mailbox.send(TestMessage("late".into())).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_queue_length_tracks_pending_messages() {
        let stop = StopSignal::new();
        let (tx, _rx) = mpsc::channel::<TestMessage>(10);
        let mailbox = Mailbox {
            tx,
            stop,
            actor_id: ActorId::new(),
        };

        for i in 0..9 {
            mailbox.try_send(TestMessage(i.to_string())).unwrap();
        }
        assert_eq!(mailbox.len(), 9);
        assert_eq!(mailbox.capacity(), 10);
    }

    #[test]
    fn test_backlog_threshold_is_above_eighty_percent() {
        assert!(!is_backlogged(0, 100));
        assert!(!is_backlogged(80, 100));
        assert!(is_backlogged(81, 100));
        assert!(is_backlogged(100, 100));
        assert!(!is_backlogged(0, 1));
        assert!(is_backlogged(1, 1));
    }

    #[tokio::test]
    async fn test_mailbox_reports_backlog_past_threshold() {
        let (tx, _rx) = mpsc::channel::<TestMessage>(5);
        let mailbox = Mailbox {
            tx,
            stop: StopSignal::new(),
            actor_id: ActorId::new(),
        };

        for i in 0..4 {
            mailbox.try_send(TestMessage(i.to_string())).unwrap();
        }
        assert!(!is_backlogged(mailbox.len(), mailbox.capacity()));

        mailbox.try_send(TestMessage("5".into())).unwrap();
        assert!(is_backlogged(mailbox.len(), mailbox.capacity()));
    }
}
