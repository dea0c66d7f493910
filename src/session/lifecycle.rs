//! Connection lifecycle and scoped termination handling
//!
//! [`Lifecycle`] owns the session state, the active transport and channel,
//! and the set of operations currently in flight. Transport signals arrive
//! through [`Lifecycle::dispatch`]. A termination signal is delivered to every
//! live [`OperationScope`]; when none is alive the fallback clears the channel
//! and logs, so the next call fails fast instead of hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::events::{ClientEvent, TransportEvent};
use super::state::{SessionState, TerminationHandling};
use super::transport::{EventSink, Transport};
use crate::sftp::channel::RemoteChannel;
use crate::sftp::error::{ErrorCode, SftpError};
use crate::ssh::DebugSink;

struct Scope {
    op: &'static str,
    tx: Option<oneshot::Sender<TransportEvent>>,
}

struct Inner {
    state: SessionState,
    /// Connect call currently owning the session, if any
    attempt: Option<u64>,
    /// Generation of the transport the session is bound to
    attached: Option<u64>,
    transport: Option<Arc<dyn Transport>>,
    channel: Option<Arc<dyn RemoteChannel>>,
    handling: TerminationHandling,
    scopes: HashMap<u64, Scope>,
    closed_waiters: Vec<oneshot::Sender<()>>,
    debug: Option<DebugSink>,
}

impl Inner {
    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected session transition {:?} -> {:?}", self.state, next);
        }
        debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn reset_closed(&mut self) {
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed);
        }
        self.attempt = None;
        self.attached = None;
        self.transport = None;
        self.channel = None;
        for waiter in self.closed_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Hand the signal to every operation in flight. Returns false if none.
    fn notify_scopes(&mut self, event: &TransportEvent) -> bool {
        if self.scopes.is_empty() {
            return false;
        }
        for scope in self.scopes.values_mut() {
            if let Some(tx) = scope.tx.take() {
                debug!("Delivering {:?} to operation '{}'", event, scope.op);
                let _ = tx.send(event.clone());
            }
        }
        self.handling = TerminationHandling::Scoped;
        true
    }
}

/// What `end()` has to do.
pub(crate) enum EndStep {
    AlreadyClosed,
    Shutdown(Arc<dyn Transport>, oneshot::Receiver<()>),
    /// Another `end()` is already tearing down
    Wait(oneshot::Receiver<()>),
}

pub struct Lifecycle {
    inner: Mutex<Inner>,
    generation: AtomicU64,
    next_scope: AtomicU64,
    next_attempt: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: SessionState::Closed,
                attempt: None,
                attached: None,
                transport: None,
                channel: None,
                handling: TerminationHandling::Unhandled,
                scopes: HashMap::new(),
                closed_waiters: Vec::new(),
                debug: None,
            }),
            generation: AtomicU64::new(0),
            next_scope: AtomicU64::new(0),
            next_attempt: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn handling(&self) -> TerminationHandling {
        self.inner.lock().handling
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == SessionState::Connected && inner.channel.is_some()
    }

    /// Every event published after this call, in order. Unbounded: a
    /// receiver that is never drained keeps its backlog until dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ClientEvent) {
        // Dropped receivers are pruned here
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Forward diagnostic text to tracing and the configured debug sink.
    pub fn debug_msg(&self, msg: &str) {
        debug!("{}", msg);
        let sink = self.inner.lock().debug.clone();
        if let Some(sink) = sink {
            sink.emit(msg);
        }
    }

    /// The active channel, or a "no connection" error.
    pub fn channel(&self) -> Result<Arc<dyn RemoteChannel>, SftpError> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.channel) {
            (SessionState::Connected, Some(channel)) => Ok(channel.clone()),
            _ => Err(SftpError::not_connected()),
        }
    }

    /// Closed → Connecting. Rejects when a channel exists or a connect runs.
    ///
    /// Returns the attempt token the rest of the connect sequence must present.
    pub(crate) fn begin_connect(&self, debug: Option<DebugSink>) -> Result<u64, SftpError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Closed || inner.channel.is_some() {
            return Err(SftpError::already_connected());
        }
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        inner.transition(SessionState::Connecting);
        inner.attempt = Some(attempt);
        inner.debug = debug;
        Ok(attempt)
    }

    /// False once `end()` (or a newer connect) has taken the session away
    /// from `attempt`.
    pub(crate) fn attempt_live(&self, attempt: u64) -> bool {
        let inner = self.inner.lock();
        inner.state == SessionState::Connecting && inner.attempt == Some(attempt)
    }

    /// Sink for a fresh connection attempt. Older sinks become stale.
    pub(crate) fn next_sink(self: &Arc<Self>) -> EventSink {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        EventSink::new(generation, Arc::downgrade(self))
    }

    /// Bind the session to the transport dialed with `generation`.
    pub(crate) fn attach_transport(
        &self,
        attempt: u64,
        generation: u64,
        transport: Arc<dyn Transport>,
    ) -> Result<(), SftpError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Connecting
            || inner.attempt != Some(attempt)
            || self.generation.load(Ordering::SeqCst) != generation
        {
            return Err(SftpError::new(
                ErrorCode::ConnectionLost,
                "Connection attempt was abandoned",
            ));
        }
        inner.attached = Some(generation);
        inner.transport = Some(transport);
        Ok(())
    }

    /// Connecting → Connected, unless the transport died meanwhile.
    pub(crate) fn attach_channel(
        &self,
        generation: u64,
        channel: Arc<dyn RemoteChannel>,
    ) -> Result<(), SftpError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Connecting || inner.attached != Some(generation) {
            return Err(SftpError::new(
                ErrorCode::ConnectionLost,
                "Connection closed during channel negotiation",
            ));
        }
        inner.channel = Some(channel);
        inner.transition(SessionState::Connected);
        Ok(())
    }

    /// Drop back to Closed after a failed connect, returning the transport
    /// (if any) so the caller can shut it down. A no-op once the session no
    /// longer belongs to `attempt`.
    pub(crate) fn abort_connect(&self, attempt: u64) -> Option<Arc<dyn Transport>> {
        let mut inner = self.inner.lock();
        if inner.attempt != Some(attempt) {
            return None;
        }
        let transport = inner.transport.take();
        if inner.state == SessionState::Connecting {
            inner.reset_closed();
        }
        transport
    }

    pub(crate) fn begin_end(&self) -> EndStep {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closed => EndStep::AlreadyClosed,
            SessionState::Ending => {
                let (tx, rx) = oneshot::channel();
                inner.closed_waiters.push(tx);
                EndStep::Wait(rx)
            }
            SessionState::Connecting | SessionState::Connected => match inner.transport.clone() {
                Some(transport) => {
                    let (tx, rx) = oneshot::channel();
                    inner.closed_waiters.push(tx);
                    inner.channel = None;
                    inner.transition(SessionState::Ending);
                    EndStep::Shutdown(transport, rx)
                }
                None => {
                    // Still dialing: the pending attempt is discarded on attach
                    inner.reset_closed();
                    EndStep::AlreadyClosed
                }
            },
        }
    }

    /// Give up waiting for `close` and mark the session closed.
    pub(crate) fn force_closed(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Closed {
            warn!("Transport did not report close in time, forcing session closed");
            inner.reset_closed();
        }
    }

    /// Route one transport signal.
    pub fn dispatch(&self, generation: u64, event: TransportEvent) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(
                "Ignoring {:?} from stale transport generation {}",
                event, generation
            );
            return;
        }

        let mut note = None;
        {
            let mut inner = self.inner.lock();
            if event.is_termination() && inner.attached == Some(generation) {
                match inner.state {
                    SessionState::Ending => {
                        if event == TransportEvent::Close {
                            inner.notify_scopes(&event);
                            inner.reset_closed();
                            info!("SFTP session closed");
                        }
                    }
                    SessionState::Connecting | SessionState::Connected => {
                        inner.reset_closed();
                        if !inner.notify_scopes(&event) {
                            inner.handling = TerminationHandling::Global;
                            note = Some(format!(
                                "Transport signalled {:?} with no operation in flight; channel cleared",
                                event
                            ));
                        }
                    }
                    SessionState::Closed => {}
                }
            }
        }

        if let Some(note) = note {
            warn!("{}", note);
            self.debug_msg(&note);
        }
        self.publish(ClientEvent::Transport(event));
    }

    /// Register a scope for operation `op`; it is released when dropped.
    pub fn begin_operation(self: &Arc<Self>, op: &'static str) -> OperationScope {
        let id = self.next_scope.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.lock().scopes.insert(id, Scope { op, tx: Some(tx) });
        OperationScope {
            id,
            op,
            rx: Some(rx),
            lifecycle: self.clone(),
        }
    }

    fn end_operation(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.scopes.remove(&id);
        if inner.scopes.is_empty() {
            inner.handling = TerminationHandling::Unhandled;
        }
    }

    #[cfg(test)]
    pub(crate) fn active_scopes(&self) -> usize {
        self.inner.lock().scopes.len()
    }
}

/// Listener registration for one public operation.
pub struct OperationScope {
    id: u64,
    op: &'static str,
    rx: Option<oneshot::Receiver<TransportEvent>>,
    lifecycle: Arc<Lifecycle>,
}

impl OperationScope {
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Resolves with the termination signal that hit this operation.
    /// Never resolves if none arrives.
    pub async fn terminated(&mut self) -> TransportEvent {
        if let Some(rx) = self.rx.as_mut() {
            if let Ok(event) = rx.await {
                self.rx = None;
                return event;
            }
            self.rx = None;
        }
        std::future::pending().await
    }
}

impl Drop for OperationScope {
    fn drop(&mut self) {
        self.lifecycle.end_operation(self.id);
    }
}
