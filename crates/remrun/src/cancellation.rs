//! # Cancellation Coordinator
//!
//! Carries a caller-side cancellation to the server-side invocation.
//!
//! ## Client side
//!
//! [`CancellationCoordinator::run`] drives one invocation through
//! `Created -> Sent -> Completed`, or, when the caller cancels while the
//! request is outstanding, through `CancelRequested` into a race between the
//! primary response and a best-effort cancel message. The primary response
//! always wins if it arrives first; the cancel attempt is then abandoned.
//! Once the server acknowledges the cancel, the response still wins if it
//! arrives within `cancel_grace`; otherwise the call ends as `CancelDelivered`.
//! A cancel that never reaches the server bounds the wait too, ending the call
//! as `Abandoned`.
//!
//! ## Server side
//!
//! [`InFlightTable`] maps `(interface, method, invocation)` to the token handed
//! to the running implementation. Registration happens before the
//! implementation starts and the entry is removed exactly once, by the guard,
//! when the dispatch reaches a terminal state.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use remwire::InterfaceId;
use remwire::InvocationId;
use remwire::MethodId;
use remwire::RemotingRequest;

use crate::config::CancellationConfig;

/// Client-side lifecycle of one invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    Sent,
    CancelRequested,
    Completed,
    CancelDelivered,
}

/// How a coordinated invocation ended.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The primary response arrived, whether or not a cancel was requested.
    Completed(T),
    /// The server acknowledged the cancel and no response followed within the grace period.
    CancelDelivered,
    /// The caller cancelled before anything was sent.
    CancelledBeforeSend,
    /// No cancel reached the server and the response did not arrive in time.
    /// The remote invocation may still be running.
    Abandoned,
}

impl<T> Outcome<T> {
    pub fn state(&self) -> InvocationState {
        match self {
            Self::Completed(_) => InvocationState::Completed,
            Self::CancelDelivered => InvocationState::CancelDelivered,
            Self::CancelledBeforeSend => InvocationState::Created,
            Self::Abandoned => InvocationState::CancelRequested,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !matches!(self, Self::Completed(_))
    }
}

/// Runs the client side of the cancel race.
#[derive(Clone, Debug, Default)]
pub struct CancellationCoordinator {
    config: CancellationConfig,
}

impl CancellationCoordinator {
    pub fn new(config: CancellationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CancellationConfig {
        &self.config
    }

    /// Awaits `primary`, racing it against a cancel once `token` fires.
    ///
    /// `send_cancel` performs one non-retried cancel delivery and reports
    /// whether the server found the invocation in flight. An ack of `false`
    /// means the cancel overtook the request; the message is sent again after
    /// `cancel_retry_delay`, up to `max_cancel_attempts`. If none of them is
    /// delivered, the response is awaited for `undelivered_wait`, then one last
    /// cancel goes out and the call ends as [`Outcome::Abandoned`] unless the
    /// response still arrives within `cancel_grace`. Once `token` fires the
    /// call therefore ends in bounded time. Errors from the cancel path are
    /// logged and never surface to the caller.
    pub async fn run<T, E, P, C, CF, CE>(
        &self,
        token: &CancellationToken,
        primary: P,
        mut send_cancel: C,
    ) -> Result<Outcome<T>, E>
    where
        P: Future<Output = Result<T, E>>,
        C: FnMut() -> CF,
        CF: Future<Output = Result<bool, CE>>,
        CE: Display,
    {
        if token.is_cancelled() {
            tracing::debug!("cancelled before send");
            return Ok(Outcome::CancelledBeforeSend);
        }

        tokio::pin!(primary);
        tracing::trace!(state = ?InvocationState::Sent, "invocation in flight");

        tokio::select! {
            biased;
            result = &mut primary => return result.map(Outcome::Completed),
            _ = token.cancelled() => {}
        }

        tracing::debug!(state = ?InvocationState::CancelRequested, "caller cancelled, racing cancel message");

        let attempts = self.config.max_cancel_attempts.max(1);
        let delivered = {
            let cancel_loop = async {
                for attempt in 1..=attempts {
                    if self.deliver(&mut send_cancel, attempt).await {
                        return true;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(self.config.cancel_retry_delay).await;
                    }
                }
                false
            };
            tokio::pin!(cancel_loop);

            tokio::select! {
                biased;
                result = &mut primary => {
                    tracing::debug!("response won the cancel race");
                    return result.map(Outcome::Completed);
                }
                delivered = &mut cancel_loop => delivered,
            }
        };

        if !delivered {
            tracing::debug!(wait = ?self.config.undelivered_wait, "cancel not delivered, awaiting response");
            if let Ok(result) = tokio::time::timeout(self.config.undelivered_wait, &mut primary).await {
                return result.map(Outcome::Completed);
            }
            if !self.deliver(&mut send_cancel, attempts + 1).await {
                tracing::warn!(state = ?InvocationState::CancelRequested, "cancel never delivered, abandoning invocation");
                return Ok(Outcome::Abandoned);
            }
        }

        tracing::debug!("cancel acknowledged, allowing response grace period");
        match tokio::time::timeout(self.config.cancel_grace, &mut primary).await {
            Ok(result) => result.map(Outcome::Completed),
            Err(_) => {
                tracing::debug!(state = ?InvocationState::CancelDelivered, "cancel delivered");
                Ok(Outcome::CancelDelivered)
            }
        }
    }

    /// One cancel delivery, bounded by `cancel_timeout` when set.
    async fn deliver<C, CF, CE>(&self, send_cancel: &mut C, attempt: u32) -> bool
    where
        C: FnMut() -> CF,
        CF: Future<Output = Result<bool, CE>>,
        CE: Display,
    {
        let delivery = send_cancel();
        let delivered = match self.config.cancel_timeout {
            Some(limit) => match tokio::time::timeout(limit, delivery).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(attempt, "cancel attempt timed out");
                    return false;
                }
            },
            None => delivery.await,
        };
        match delivered {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(attempt, "cancel found nothing in flight");
                false
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "cancel delivery failed");
                false
            }
        }
    }
}

/// Join key between a request and its cancel message.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct InFlightKey {
    pub interface_id: InterfaceId,
    pub method_id: MethodId,
    pub invocation_id: InvocationId,
}

impl InFlightKey {
    /// Key of a cancellable request; `None` when it carries no invocation id.
    pub fn of(request: &RemotingRequest) -> Option<Self> {
        let invocation_id = request.invocation_id.clone()?;
        Some(Self {
            interface_id: request.interface_id,
            method_id: request.method_id,
            invocation_id,
        })
    }
}

impl std::fmt::Display for InFlightKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.interface_id, self.method_id, self.invocation_id)
    }
}

/// The invocation is already running under this key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateInvocation(pub InFlightKey);

impl std::fmt::Display for DuplicateInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invocation {} is already in flight", self.0)
    }
}

impl std::error::Error for DuplicateInvocation {}

/// Server-side table of cancellable invocations in flight.
#[derive(Clone, Default)]
pub struct InFlightTable {
    entries: Arc<DashMap<InFlightKey, CancellationToken>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` with a fresh token. The entry lives until the guard drops.
    pub fn register(&self, key: InFlightKey) -> Result<InFlightGuard, DuplicateInvocation> {
        let token = CancellationToken::new();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => return Err(DuplicateInvocation(key)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        tracing::trace!(%key, "registered in-flight invocation");
        Ok(InFlightGuard {
            key,
            token,
            entries: self.entries.clone(),
        })
    }

    /// Triggers the token registered under `key`. Returns whether an entry existed.
    pub fn cancel(&self, key: &InFlightKey) -> bool {
        match self.entries.get(key) {
            Some(token) => {
                token.cancel();
                tracing::debug!(%key, "cancel delivered to in-flight invocation");
                true
            }
            None => {
                tracing::debug!(%key, "cancel for unknown or finished invocation ignored");
                false
            }
        }
    }

    pub fn contains(&self, key: &InFlightKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keeps an in-flight entry alive; removes it on drop.
pub struct InFlightGuard {
    key: InFlightKey,
    token: CancellationToken,
    entries: Arc<DashMap<InFlightKey, CancellationToken>>,
}

impl InFlightGuard {
    pub fn key(&self) -> &InFlightKey {
        &self.key
    }

    /// Token to hand to the implementation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entries.remove(&self.key);
    }
}
