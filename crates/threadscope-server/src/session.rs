//! One live viewer connection.
//!
//! Lifecycle: `Connecting → Active → Closing → Closed`, never backwards.
//!
//! An active session runs two tasks:
//! - the read loop discards viewer frames, renews the read deadline on every
//!   `Pong` and notices peer close, read errors and a missed deadline;
//! - the write loop sends a keepalive `Ping` every `ping_interval` and writes
//!   each delivered snapshot as one JSON text frame.
//!
//! Whatever ends the session first (peer close, read/write failure, write
//! timeout, keepalive timeout, shutdown) runs the teardown: Active → Closing,
//! deregistration, cancellation of both loops. Later triggers are no-ops.
//! The session is `Closed` once both loops have exited and the connection
//! halves are dropped.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use threadscope_core::{Registry, SubscriberId, Subscription};
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;

const CONNECTING: u8 = 0;
const ACTIVE: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CONNECTING => Self::Connecting,
            ACTIVE => Self::Active,
            CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// What ended a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The viewer sent a close frame.
    PeerClosed,
    /// The connection ended without a close frame.
    PeerGone,
    ReadError(String),
    WriteError(String),
    WriteTimeout,
    /// No pong within the read deadline.
    KeepaliveTimeout,
    /// Server shutdown or an explicit close from the host.
    Shutdown,
    /// A session loop panicked.
    Internal,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::PeerGone => write!(f, "connection dropped"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::WriteError(e) => write!(f, "write error: {e}"),
            Self::WriteTimeout => write!(f, "write timed out"),
            Self::KeepaliveTimeout => write!(f, "keepalive timeout"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub reason: CloseReason,
    /// Snapshots written to the viewer.
    pub delivered: u64,
}

struct Control {
    id: Uuid,
    state: AtomicU8,
    reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    registry: Registry,
    subscriber: SubscriberId,
    delivered: AtomicU64,
}

impl Control {
    fn state(&self) -> SessionState {
        SessionState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn activate(&self) -> bool {
        self.state
            .compare_exchange(CONNECTING, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Closing` and release the registry entry. Only the first call
    /// has any effect; it returns true.
    fn teardown(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= CLOSING {
                return false;
            }
            match self.state.compare_exchange(
                current,
                CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.registry.deregister(self.subscriber);
        log::info!("session {} closing: {reason}", self.id);
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.cancel.cancel();
        true
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            reason: self
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or(CloseReason::Shutdown),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Tears the session down if a loop exits without having done so, which
/// only happens when it unwinds.
struct LoopExit(Arc<Control>);

impl Drop for LoopExit {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.teardown(CloseReason::Internal);
        }
    }
}

/// Cloneable view of a session for the host: observe state, force close.
#[derive(Clone)]
pub struct SessionHandle {
    control: Arc<Control>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// Close the session from outside. Safe to race with any other trigger.
    pub fn close(&self) -> bool {
        self.control.teardown(CloseReason::Shutdown)
    }
}

/// A viewer connection that has been accepted and registered but not yet
/// started. Build one with [`crate::Hub::open_session`].
pub struct Session {
    control: Arc<Control>,
    subscription: Subscription,
    config: SessionConfig,
}

impl Session {
    pub(crate) fn open(
        registry: &Registry,
        config: SessionConfig,
        parent: &CancellationToken,
    ) -> Self {
        let subscription = registry.register(config.outbound_capacity);
        let control = Arc::new(Control {
            id: Uuid::new_v4(),
            state: AtomicU8::new(CONNECTING),
            reason: Mutex::new(None),
            cancel: parent.child_token(),
            registry: registry.clone(),
            subscriber: subscription.id(),
            delivered: AtomicU64::new(0),
        });
        Self {
            control,
            subscription,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.control.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Drive the session over an already upgraded connection until it closes.
    pub async fn run<W, R>(self, writer: W, reader: R) -> SessionSummary
    where
        W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
        R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
    {
        let Session {
            control,
            subscription,
            config,
        } = self;

        if control.activate() {
            log::info!("session {} active", control.id);
            let read_task = tokio::spawn(read_loop(
                Arc::clone(&control),
                reader,
                config.read_deadline,
            ));
            let write_task = tokio::spawn(write_loop(
                Arc::clone(&control),
                writer,
                subscription,
                config,
            ));
            let (read_result, write_result) = tokio::join!(read_task, write_task);
            for (name, result) in [("read", read_result), ("write", write_result)] {
                if let Err(e) = result {
                    log::error!("session {} {name} loop failed: {e}", control.id);
                }
            }
        } else {
            // Closed before it ever started.
            drop(subscription);
            drop(writer);
            drop(reader);
        }

        control.state.store(CLOSED, Ordering::Release);
        let summary = control.summary();
        log::debug!(
            "session {} closed after {} snapshots ({})",
            summary.id,
            summary.delivered,
            summary.reason
        );
        summary
    }
}

async fn read_loop<R>(control: Arc<Control>, mut reader: R, read_deadline: Duration)
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let _exit = LoopExit(Arc::clone(&control));
    let mut deadline = Instant::now() + read_deadline;

    loop {
        let next = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => {
                control.teardown(CloseReason::Shutdown);
                return;
            }
            next = timeout_at(deadline, reader.next()) => next,
        };

        match next {
            Err(_) => {
                control.teardown(CloseReason::KeepaliveTimeout);
                return;
            }
            Ok(None) => {
                control.teardown(CloseReason::PeerGone);
                return;
            }
            Ok(Some(Err(e))) => {
                control.teardown(CloseReason::ReadError(e.to_string()));
                return;
            }
            Ok(Some(Ok(Message::Pong(_)))) => deadline = Instant::now() + read_deadline,
            Ok(Some(Ok(Message::Close(_)))) => {
                control.teardown(CloseReason::PeerClosed);
                return;
            }
            // Viewers have nothing to say; pings are answered by the transport.
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn write_loop<W>(
    control: Arc<Control>,
    mut writer: W,
    mut subscription: Subscription,
    config: SessionConfig,
) where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let _exit = LoopExit(Arc::clone(&control));
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut writable = true;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => {
                control.teardown(CloseReason::Shutdown);
                break;
            }
            _ = ping.tick() => {
                send(&mut writer, Message::Ping(Bytes::new()), config.write_timeout).await
            }
            next = subscription.recv() => {
                let Some(snapshot) = next else {
                    control.teardown(CloseReason::Shutdown);
                    break;
                };
                match serde_json::to_string(&*snapshot) {
                    Ok(json) => {
                        let sent = send(&mut writer, Message::Text(json.into()), config.write_timeout).await;
                        if sent.is_ok() {
                            control.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        sent
                    }
                    Err(e) => {
                        log::warn!(
                            "session {}: skipping snapshot #{}, encode failed: {e}",
                            control.id,
                            snapshot.seq
                        );
                        Ok(())
                    }
                }
            }
        };

        if let Err(reason) = outcome {
            writable = false;
            control.teardown(reason);
            break;
        }
    }

    drop(subscription);
    // A sink that failed or timed out is dropped without further writes.
    if writable {
        let _ = timeout(config.write_timeout, writer.send(Message::Close(None))).await;
        let _ = timeout(config.write_timeout, writer.close()).await;
    }
}

async fn send<W>(writer: &mut W, message: Message, limit: Duration) -> Result<(), CloseReason>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    match timeout(limit, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CloseReason::WriteError(e.to_string())),
        Err(_) => Err(CloseReason::WriteTimeout),
    }
}
