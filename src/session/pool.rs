//! Bounded session pool and admission controller
//!
//! Every session state change happens under one lock, so admission decisions
//! are serialized and occupancy is checked and updated atomically. Transport
//! calls (handshakes, releases) are made after the lock is dropped.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::state::{DeviceSession, SessionId, SessionState};
use crate::config::SessionConfig;
use crate::error::{SessionError, TransportError};
use crate::network::{DeviceCandidate, Transport, TransportHandle, WriteAck};
use crate::telemetry::{EventHub, TelemetryEvent};

/// A queued connection request
struct QueuedRequest {
    ticket: u64,
    device_id: String,
    enqueued_at: Instant,
}

#[derive(Default)]
struct PoolState {
    sessions: BTreeMap<SessionId, DeviceSession>,
    queue: VecDeque<QueuedRequest>,
    next_session: u64,
    next_ticket: u64,
    closed: bool,
}

impl PoolState {
    fn occupancy(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state.occupies_slot())
            .count()
    }

    /// A slot is already on its way to being freed
    fn release_pending(&self) -> bool {
        self.sessions
            .values()
            .any(|s| s.state == SessionState::Draining || s.abort_requested)
    }

    fn admit(&mut self, candidate: &DeviceCandidate, now: Instant, fx: &mut Effects) -> SessionId {
        self.next_session += 1;
        let id = SessionId(self.next_session);
        self.sessions
            .insert(id, DeviceSession::connecting(id, candidate.clone(), now));
        fx.events.push(TelemetryEvent::SessionChanged {
            session_id: id,
            device_id: candidate.device_id.clone(),
            from: None,
            to: SessionState::Connecting,
        });
        id
    }
}

/// Side effects collected under the lock and applied after it is dropped
#[derive(Default)]
struct Effects {
    released: Vec<TransportHandle>,
    events: Vec<TelemetryEvent>,
    wake: bool,
}

fn transition(session: &mut DeviceSession, next: SessionState, fx: &mut Effects) -> bool {
    match session.transition(next) {
        Some(from) => {
            fx.events.push(TelemetryEvent::SessionChanged {
                session_id: session.id,
                device_id: session.candidate.device_id.clone(),
                from: Some(from),
                to: next,
            });
            true
        }
        None => false,
    }
}

/// Remove a session, handing its transport handle back exactly once
fn close_session(state: &mut PoolState, id: SessionId, fx: &mut Effects) {
    if let Some(mut session) = state.sessions.remove(&id) {
        if session.state != SessionState::Closed {
            transition(&mut session, SessionState::Closed, fx);
        }
        if let Some(handle) = session.take_resources() {
            fx.released.push(handle);
        }
        fx.wake = true;
        tracing::debug!(session = %id, device = %session.candidate.device_id, "session closed");
    }
}

/// Move a session toward `Closed`. Active sessions drain; connecting ones
/// are closed once their handshake resolves.
fn begin_drain(state: &mut PoolState, id: SessionId, fx: &mut Effects) -> bool {
    let ready = match state.sessions.get_mut(&id) {
        None => return false,
        Some(session) => {
            match session.state {
                SessionState::Active => {
                    transition(session, SessionState::Draining, fx);
                }
                SessionState::Connecting => {
                    session.abort_requested = true;
                }
                SessionState::Draining | SessionState::Closed => {}
            }
            session.ready_to_close()
        }
    };
    if ready {
        close_session(state, id, fx);
    }
    true
}

/// Least-recently-active `Active` session idle for longer than `threshold`;
/// ties go to the earliest session id
fn find_victim(state: &PoolState, now: Instant, threshold: Duration) -> Option<SessionId> {
    state
        .sessions
        .values()
        .filter(|s| s.state == SessionState::Active)
        .filter(|s| now.saturating_duration_since(s.last_active) > threshold)
        .min_by_key(|s| (s.last_active, s.id))
        .map(|s| s.id)
}

/// When the next `Active` session becomes evictable
fn next_eviction_check(state: &PoolState, threshold: Duration) -> Option<Instant> {
    state
        .sessions
        .values()
        .filter(|s| s.state == SessionState::Active)
        .map(|s| s.last_active + threshold + Duration::from_millis(1))
        .min()
}

enum Decision {
    Admit(SessionId),
    Wait(Option<Instant>),
}

struct Inner<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    state: Mutex<PoolState>,
    /// Signalled on every session change and queue change
    changed: Notify,
    events: Arc<EventHub>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<T: Transport> Inner<T> {
    fn apply(&self, fx: Effects) {
        let wake = fx.wake || !fx.events.is_empty();
        for handle in fx.released {
            tracing::debug!(handle = handle.id(), device = handle.device_id(), "releasing transport handle");
            self.transport.release(handle);
        }
        for event in fx.events {
            self.events.publish(event);
        }
        if wake {
            self.changed.notify_waiters();
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PoolState, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut fx)
        };
        self.apply(fx);
        result
    }

    /// One serialized admission decision for the request holding `ticket`
    fn decide(&self, ticket: u64, candidate: &DeviceCandidate) -> Result<Decision, SessionError> {
        let capacity = self.config.capacity;
        let threshold = self.config.inactivity_threshold();

        self.with_state(|state, fx| {
            if state.closed {
                return Err(SessionError::PoolClosed);
            }
            let now = Instant::now();
            loop {
                if state.queue.front().map(|r| r.ticket) != Some(ticket) {
                    return Ok(Decision::Wait(None));
                }
                if state.occupancy() < capacity {
                    state.queue.pop_front();
                    let id = state.admit(candidate, now, fx);
                    tracing::info!(session = %id, device = %candidate, "admitted");
                    return Ok(Decision::Admit(id));
                }
                if state.release_pending() {
                    return Ok(Decision::Wait(None));
                }
                match find_victim(state, now, threshold) {
                    Some(victim) => {
                        tracing::info!(session = %victim, for_device = %candidate, "evicting inactive session");
                        begin_drain(state, victim, fx);
                    }
                    None => return Ok(Decision::Wait(next_eviction_check(state, threshold))),
                }
            }
        })
    }

    fn finish_handshake(
        &self,
        id: SessionId,
        result: Result<TransportHandle, TransportError>,
    ) -> Result<(TransportHandle, CancellationToken), SessionError> {
        self.with_state(|state, fx| {
            let closed = state.closed;
            let handle = match result {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "handshake failed");
                    close_session(state, id, fx);
                    return Err(SessionError::from(e));
                }
            };

            let Some(session) = state.sessions.get_mut(&id) else {
                fx.released.push(handle);
                return Err(SessionError::Aborted(id.0));
            };
            session.handle = Some(handle.clone());

            if session.abort_requested || closed {
                close_session(state, id, fx);
                return Err(if closed {
                    SessionError::PoolClosed
                } else {
                    SessionError::Aborted(id.0)
                });
            }

            transition(session, SessionState::Active, fx);
            session.last_active = Instant::now();
            let token = self.shutdown.child_token();
            session.watcher = Some(token.clone());
            Ok((handle, token))
        })
    }
}

/// Admission-controlled pool of receiver sessions
pub struct SessionPool<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for SessionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> SessionPool<T> {
    pub fn new(transport: Arc<T>, config: SessionConfig, events: Arc<EventHub>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
                events,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Request a slot, waiting up to the configured admission deadline
    pub async fn request_admission(&self, candidate: DeviceCandidate) -> Result<SessionId, SessionError> {
        let deadline = self.inner.config.admission_deadline();
        self.request_admission_within(candidate, deadline).await
    }

    /// Request a slot, waiting up to `within`.
    ///
    /// Requests are served FIFO. When the pool is full, the least-recently
    /// active session idle for longer than the inactivity threshold is
    /// evicted to make room. The returned session is `Active` once its
    /// handshake succeeds.
    pub async fn request_admission_within(
        &self,
        candidate: DeviceCandidate,
        within: Duration,
    ) -> Result<SessionId, SessionError> {
        let deadline = Instant::now() + within;

        let ticket = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(SessionError::PoolClosed);
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.queue.push_back(QueuedRequest {
                ticket,
                device_id: candidate.device_id.clone(),
                enqueued_at: Instant::now(),
            });
            ticket
        };
        let guard = TicketGuard {
            inner: &self.inner,
            ticket,
        };

        let id = match tokio::time::timeout_at(deadline, self.wait_for_slot(ticket, &candidate)).await {
            Ok(result) => result?,
            Err(_) => {
                drop(guard);
                tracing::warn!(device = %candidate, waited_ms = within.as_millis() as u64, "admission timed out");
                return Err(SessionError::ConnectionTimeout(within.as_millis() as u64));
            }
        };
        drop(guard);

        self.handshake(id, candidate).await
    }

    /// Admit only if a slot is free right now and nobody is queued
    pub async fn try_admit(&self, candidate: DeviceCandidate) -> Result<SessionId, SessionError> {
        let capacity = self.inner.config.capacity;
        let id = self.inner.with_state(|state, fx| {
            if state.closed {
                return Err(SessionError::PoolClosed);
            }
            let occupancy = state.occupancy();
            if !state.queue.is_empty() || occupancy >= capacity {
                return Err(SessionError::CapacityExceeded(occupancy));
            }
            Ok(state.admit(&candidate, Instant::now(), fx))
        })?;
        self.handshake(id, candidate).await
    }

    async fn wait_for_slot(&self, ticket: u64, candidate: &DeviceCandidate) -> Result<SessionId, SessionError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.decide(ticket, candidate)? {
                Decision::Admit(id) => return Ok(id),
                Decision::Wait(Some(at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Decision::Wait(None) => notified.await,
            }
        }
    }

    async fn handshake(&self, id: SessionId, candidate: DeviceCandidate) -> Result<SessionId, SessionError> {
        let mut guard = ConnectingGuard {
            inner: &self.inner,
            id: Some(id),
        };
        let result = self.inner.transport.connect(&candidate).await;
        guard.id = None;

        let (handle, token) = self.inner.finish_handshake(id, result)?;
        self.spawn_watcher(id, handle, token);
        tracing::info!(session = %id, device = %candidate, "session active");
        Ok(id)
    }

    /// Evict the session when its peer goes away
    fn spawn_watcher(&self, id: SessionId, handle: TransportHandle, token: CancellationToken) {
        let pool: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = transport.disconnected(&handle) => {
                    if let Some(inner) = pool.upgrade() {
                        tracing::info!(session = %id, "peer disconnected");
                        SessionPool { inner }.evict(id);
                    }
                }
            }
        });
    }

    /// Mark a session as having just carried traffic
    pub fn record_activity(&self, id: SessionId) -> bool {
        let mut state = self.inner.state.lock();
        match state.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Active => {
                session.last_active = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn update_rssi(&self, id: SessionId, rssi: Option<i32>) {
        if let Some(session) = self.inner.state.lock().sessions.get_mut(&id) {
            session.rssi = rssi;
        }
    }

    /// Drain a session; it closes once its in-flight writes finish.
    ///
    /// Returns `false` when the session is unknown or already closed.
    pub fn evict(&self, id: SessionId) -> bool {
        self.inner.with_state(|state, fx| begin_drain(state, id, fx))
    }

    /// Drain every session
    pub fn drain_all(&self) {
        self.inner.with_state(|state, fx| {
            let ids: Vec<SessionId> = state.sessions.keys().copied().collect();
            for id in ids {
                begin_drain(state, id, fx);
            }
        });
    }

    /// Drain every session and wait until all of them are closed
    pub async fn close_all(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.drain_all();
            if self.inner.state.lock().sessions.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Refuse further requests, close every session and join the watchers
    pub async fn shutdown(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed.notify_waiters();
        self.close_all().await;
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::info!("session pool shut down");
    }

    /// Start one write cycle: a lease for every `Active` session
    pub fn begin_writes(&self) -> Vec<WriteLease<T>> {
        let mut state = self.inner.state.lock();
        state
            .sessions
            .values_mut()
            .filter(|s| s.state == SessionState::Active)
            .filter_map(|s| {
                let handle = s.handle.clone()?;
                s.in_flight += 1;
                Some(WriteLease {
                    pool: self.clone(),
                    id: s.id,
                    handle,
                    settled: false,
                })
            })
            .collect()
    }

    /// Read the signal of every active session; returns the weakest RSSI
    pub async fn poll_signal(&self) -> Option<i32> {
        let targets: Vec<(SessionId, TransportHandle)> = {
            let state = self.inner.state.lock();
            state
                .sessions
                .values()
                .filter(|s| s.state == SessionState::Active)
                .filter_map(|s| s.handle.clone().map(|h| (s.id, h)))
                .collect()
        };

        let mut weakest: Option<i32> = None;
        for (id, handle) in targets {
            match self.inner.transport.read_signal(&handle).await {
                Ok(rssi) => {
                    self.update_rssi(id, rssi);
                    if let Some(rssi) = rssi {
                        weakest = Some(weakest.map_or(rssi, |w| w.min(rssi)));
                    }
                }
                Err(e) => tracing::debug!(session = %id, error = %e, "signal read failed"),
            }
        }
        weakest
    }

    pub fn occupancy(&self) -> usize {
        self.inner.state.lock().occupancy()
    }

    /// Requests waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn state_of(&self, id: SessionId) -> Option<SessionState> {
        self.inner.state.lock().sessions.get(&id).map(|s| s.state)
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let state = self.inner.state.lock();
        PoolSnapshot {
            capacity: self.inner.config.capacity,
            occupancy: state.occupancy(),
            queue: state
                .queue
                .iter()
                .map(|r| QueuedSummary {
                    device_id: r.device_id.clone(),
                    waiting_ms: now.saturating_duration_since(r.enqueued_at).as_millis() as u64,
                })
                .collect(),
            sessions: state
                .sessions
                .values()
                .map(|s| SessionSummary {
                    id: s.id,
                    device_id: s.candidate.device_id.clone(),
                    name: s.candidate.name.clone(),
                    state: s.state,
                    idle_ms: now.saturating_duration_since(s.last_active).as_millis() as u64,
                    rssi: s.rssi,
                    consecutive_failures: s.consecutive_failures,
                })
                .collect(),
        }
    }
}

/// Removes an unresolved request from the queue
struct TicketGuard<'a, T: Transport> {
    inner: &'a Inner<T>,
    ticket: u64,
}

impl<T: Transport> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.inner.with_state(|state, fx| {
            let before = state.queue.len();
            state.queue.retain(|r| r.ticket != ticket);
            fx.wake = state.queue.len() != before;
        });
    }
}

/// Closes a session whose handshake was abandoned mid-flight
struct ConnectingGuard<'a, T: Transport> {
    inner: &'a Inner<T>,
    id: Option<SessionId>,
}

impl<T: Transport> Drop for ConnectingGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            tracing::debug!(session = %id, "handshake abandoned");
            self.inner.with_state(|state, fx| close_session(state, id, fx));
        }
    }
}

/// One session's share of a write cycle.
///
/// Settle it with [`succeed`](Self::succeed) or [`fail`](Self::fail); a lease
/// dropped unsettled only releases its in-flight slot.
pub struct WriteLease<T: Transport> {
    pool: SessionPool<T>,
    id: SessionId,
    handle: TransportHandle,
    settled: bool,
}

impl<T: Transport> WriteLease<T> {
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }

    pub async fn write(&self, bytes: Bytes) -> Result<WriteAck, TransportError> {
        self.pool.inner.transport.write(&self.handle, bytes).await
    }

    /// Every chunk was written; counts as activity
    pub fn succeed(mut self) {
        self.settle(None);
    }

    /// A write failed; drains the session after too many in a row
    pub fn fail(mut self, error: &TransportError) {
        self.settle(Some(error));
    }

    fn settle(&mut self, error: Option<&TransportError>) {
        self.settled = true;
        let limit = self.pool.inner.config.write_failure_limit;
        let id = self.id;
        self.pool.inner.with_state(|state, fx| {
            let ready = {
                let Some(session) = state.sessions.get_mut(&id) else {
                    return;
                };
                session.in_flight = session.in_flight.saturating_sub(1);
                match error {
                    None => {
                        session.consecutive_failures = 0;
                        if session.state == SessionState::Active {
                            session.last_active = Instant::now();
                        }
                    }
                    Some(e) => {
                        session.consecutive_failures += 1;
                        tracing::warn!(
                            session = %id,
                            error = %e,
                            consecutive = session.consecutive_failures,
                            "write failed"
                        );
                        fx.events.push(TelemetryEvent::WriteFailed {
                            session_id: id,
                            error: e.to_string(),
                            consecutive: session.consecutive_failures,
                        });
                        if session.consecutive_failures >= limit && session.state == SessionState::Active {
                            transition(session, SessionState::Draining, fx);
                        }
                    }
                }
                session.ready_to_close()
            };
            if ready {
                close_session(state, id, fx);
            }
        });
    }
}

impl<T: Transport> Drop for WriteLease<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        let id = self.id;
        self.pool.inner.with_state(|state, fx| {
            let ready = match state.sessions.get_mut(&id) {
                Some(session) => {
                    session.in_flight = session.in_flight.saturating_sub(1);
                    session.ready_to_close()
                }
                None => false,
            };
            if ready {
                close_session(state, id, fx);
            }
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub device_id: String,
    pub name: String,
    pub state: SessionState,
    pub idle_ms: u64,
    pub rssi: Option<i32>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedSummary {
    pub device_id: String,
    pub waiting_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub occupancy: usize,
    pub queue: Vec<QueuedSummary>,
    pub sessions: Vec<SessionSummary>,
}
