//! In-process transport over unbounded channels.
//!
//! Two handlers can be linked so that whatever one sends arrives on the
//! other's `receive` stream. Failures and latency can be injected, which is
//! what the engine and router tests rely on.

use crate::error::{Error, Result};
use crate::protocol::{channel_stream, A2AMessage, HandlerProfile, MessageStream, ProtocolHandler};
use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Send attempts kept for inspection by default.
pub const DEFAULT_ATTEMPT_HISTORY: usize = 1024;

pub struct MemoryHandler {
    name: String,
    version: String,
    profile: Option<HandlerProfile>,
    /// Most recent send attempts, including the ones that were made to fail
    attempts: RwLock<VecDeque<A2AMessage>>,
    history: usize,
    attempt_total: AtomicUsize,
    pending_failures: AtomicU32,
    fail_always: AtomicBool,
    latency: Mutex<Option<Duration>>,
    inbound_tx: mpsc::UnboundedSender<A2AMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<A2AMessage>>>,
    peer: Mutex<Option<mpsc::UnboundedSender<A2AMessage>>>,
    disconnected: AtomicBool,
}

impl MemoryHandler {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            version: version.into(),
            profile: None,
            attempts: RwLock::new(VecDeque::new()),
            history: DEFAULT_ATTEMPT_HISTORY,
            attempt_total: AtomicUsize::new(0),
            pending_failures: AtomicU32::new(0),
            fail_always: AtomicBool::new(false),
            latency: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            peer: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn with_profile(mut self, profile: HandlerProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Keeps at most `history` attempts; older ones are dropped.
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    /// Connects two handlers so each one's sends land in the other's inbound stream.
    pub fn link(a: &MemoryHandler, b: &MemoryHandler) {
        if let Ok(mut peer) = a.peer.lock() {
            *peer = Some(b.inbound_tx.clone());
        }
        if let Ok(mut peer) = b.peer.lock() {
            *peer = Some(a.inbound_tx.clone());
        }
    }

    /// Makes the next `count` sends fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Makes every send fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_always.store(failing, Ordering::SeqCst);
    }

    /// Delays every send by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Pushes a message onto this handler's inbound stream.
    pub fn inject(&self, message: A2AMessage) -> Result<()> {
        self.inbound_tx
            .send(message)
            .map_err(|e| Error::transport(format!("Inbound channel closed: {}", e)))
    }

    /// The retained send attempts, oldest first.
    pub async fn attempts(&self) -> Vec<A2AMessage> {
        self.attempts.read().await.iter().cloned().collect()
    }

    /// Every send attempt so far, including the ones no longer retained.
    pub async fn attempt_count(&self) -> usize {
        self.attempt_total.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ProtocolHandler for MemoryHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn profile(&self) -> Option<HandlerProfile> {
        self.profile.clone()
    }

    fn can_handle(&self, message: &A2AMessage) -> bool {
        message.routing.protocol == self.name
    }

    async fn send(&self, message: &A2AMessage) -> Result<()> {
        if self.is_disconnected() {
            return Err(Error::transport(format!("{}:{} is disconnected", self.name, self.version)));
        }

        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.attempt_total.fetch_add(1, Ordering::SeqCst);
        {
            let mut attempts = self.attempts.write().await;
            while !attempts.is_empty() && attempts.len() >= self.history {
                attempts.pop_front();
            }
            if self.history > 0 {
                attempts.push_back(message.clone());
            }
        }

        if self.should_fail() {
            debug!(message_id = %message.id, "Injected transport failure");
            return Err(Error::transport(format!(
                "{}:{} failed to deliver {}",
                self.name, self.version, message.id
            )));
        }

        let peer = self.peer.lock().ok().and_then(|guard| guard.clone());
        if let Some(peer) = peer {
            peer.send(message.clone())
                .map_err(|e| Error::transport(format!("Peer channel closed: {}", e)))?;
        }
        Ok(())
    }

    fn receive(&self) -> MessageStream {
        let rx = self.inbound_rx.lock().ok().and_then(|mut guard| guard.take());
        match rx {
            Some(rx) => channel_stream(rx),
            // The inbound stream can only be taken once.
            None => Box::pin(stream::empty()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
