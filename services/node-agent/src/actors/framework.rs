//! Core actor framework types and traits.
//!
//! Provides the building blocks the agent's long-lived components run on:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors
//! - `Supervisor` for spawning actors and stopping them together

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
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
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,
    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,
    /// Messages handled so far.
    pub messages_processed: u64,
    /// Current lifecycle state.
    pub state: ActorState,
}

impl ActorContext {
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
            state: ActorState::Starting,
        }
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Send without blocking the caller, falling back to a spawned send when
    /// the mailbox is full. Used from `Drop` impls.
    pub fn send_detached(&self, msg: M) {
        match self.tx.try_send(msg) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    let tx = self.tx.clone();
                    rt.spawn(async move {
                        let _ = tx.send(msg).await;
                    });
                }
            }
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }}

/// Type-erased actor reference for supervision.
pub struct ActorRef {
    pub actor_id: String,
    pub actor_type: String,
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns spawned actors and stops them together.
#[derive(Default)]
pub struct Supervisor {
    children: HashMap<String, ActorRef>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn an actor.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        self.spawn_with(mailbox_size, |_| actor)
    }

    /// Spawn an actor that needs a handle to its own mailbox, for example to
    /// receive completions from tasks it starts.
    pub fn spawn_with<A, F>(&mut self, mailbox_size: usize, build: F) -> ActorHandle<A::Message>
    where
        A: Actor,
        F: FnOnce(ActorHandle<A::Message>) -> A,
    {
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let provisional = ActorHandle {
            tx,
            actor_id: String::new(),
        };
        let actor = build(provisional.clone());
        let actor_type = actor.name().to_string();
        let actor_id = format!("{}_{}", actor_type, generate_actor_id());

        let loop_id = actor_id.clone();
        let task_handle = tokio::spawn(async move {
            run_actor_loop(actor, rx, shutdown_rx, loop_id).await;
        });

        self.children.insert(
            actor_id.clone(),
            ActorRef {
                actor_id: actor_id.clone(),
                actor_type: actor_type.clone(),
                task_handle,
                shutdown_tx,
            },
        );

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");
        ActorHandle {
            tx: provisional.tx,
            actor_id,
        }
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Permanent(e)) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        ctx.state = ActorState::Failed;
                        break;
                    }
                    Err(e) => {
                        warn!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    ctx.state = ActorState::Stopped;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
