//! Shutdown coordination
//!
//! One interrupt has to reach several independent loops, and some of those
//! loops look for the signal at more than one point. Each consumer therefore
//! registers a named subscription together with the number of copies it will
//! consume. Triggering the coordinator delivers exactly that many copies to
//! every subscription, once, no matter how often `trigger` is called.
//!
//! Each subscription is backed by an `async_channel` whose capacity equals its
//! copy count, so delivery never waits on a slow consumer.

use crate::error::{Error, Result};
use async_channel::{Receiver, Sender, TryRecvError};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

/// Why shutdown started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// Programmatic request (end of run, fatal error)
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Requested => f.write_str("requested"),
        }
    }
}

struct Registration {
    name: String,
    copies: usize,
    tx: Sender<ShutdownReason>,
}

#[derive(Default)]
struct State {
    fired: Option<ShutdownReason>,
    registrations: Vec<Registration>,
}

struct Inner {
    state: Mutex<State>,
    token: CancellationToken,
}

/// Fans a single shutdown event out to every registered subscription
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ShutdownCoordinator")
            .field("fired", &state.fired)
            .field("subscriptions", &state.registrations.len())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                token: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a consumer that will look for the signal `copies` times
    ///
    /// When shutdown already fired the copies are delivered straight away.
    pub fn subscribe(&self, name: &str, copies: usize) -> Result<ShutdownSubscription> {
        if copies == 0 {
            return Err(Error::Shutdown(format!(
                "subscription '{}' must take at least one copy",
                name
            )));
        }

        let (tx, rx) = async_channel::bounded(copies);
        let registration = Registration {
            name: name.to_string(),
            copies,
            tx,
        };

        let late = {
            let mut state = self.lock();
            if state.registrations.iter().any(|r| r.name == name) {
                return Err(Error::Shutdown(format!(
                    "subscription '{}' is already registered",
                    name
                )));
            }
            let late = state.fired.map(|reason| (reason, clone_registration(&registration)));
            state.registrations.push(registration);
            late
        };

        if let Some((reason, registration)) = late {
            debug!(subscriber = name, "registered after shutdown, delivering now");
            deliver(registration, reason);
        }

        Ok(ShutdownSubscription {
            name: name.to_string(),
            copies,
            rx,
        })
    }

    /// Start shutdown
    ///
    /// Returns `false` when shutdown had already been triggered, in which case
    /// nothing is delivered again.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let pending: Vec<Registration> = {
            let mut state = self.lock();
            if let Some(previous) = state.fired {
                debug!(%reason, %previous, "shutdown already triggered");
                return false;
            }
            state.fired = Some(reason);
            state.registrations.iter().map(clone_registration).collect()
        };

        info!(%reason, subscribers = pending.len(), "Shutdown triggered");
        self.inner.token.cancel();

        for registration in pending {
            deliver(registration, reason);
        }
        true
    }

    /// Whether shutdown has started
    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The reason shutdown started, if it has
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.lock().fired
    }

    /// Level-triggered view of the same event
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Wait until shutdown has been triggered by anyone
    pub async fn wait(&self) {
        self.inner.token.cancelled().await
    }

    /// Trigger with [`ShutdownReason::Interrupt`] on the next Ctrl+C
    pub async fn listen_for_interrupt(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        self.trigger(ShutdownReason::Interrupt);
        Ok(())
    }
}

fn clone_registration(registration: &Registration) -> Registration {
    Registration {
        name: registration.name.clone(),
        copies: registration.copies,
        tx: registration.tx.clone(),
    }
}

/// Push every copy for one subscription, on a background task when a runtime
/// is available
fn deliver(registration: Registration, reason: ShutdownReason) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(
                async move {
                    push_copies(&registration, reason);
                }
                .with_current_subscriber(),
            );
        }
        Err(_) => push_copies(&registration, reason),
    }
}

fn push_copies(registration: &Registration, reason: ShutdownReason) {
    for _ in 0..registration.copies {
        // Capacity equals the copy count, so only a closed channel can fail
        if registration.tx.try_send(reason).is_err() {
            warn!(
                subscriber = %registration.name,
                "shutdown subscription closed before delivery"
            );
            return;
        }
    }
    debug!(
        subscriber = %registration.name,
        copies = registration.copies,
        "shutdown delivered"
    );
}

/// Receiving side of one registration
///
/// Clones share the same queue: a copy taken by one clone is gone for all.
#[derive(Clone)]
pub struct ShutdownSubscription {
    name: String,
    copies: usize,
    rx: Receiver<ShutdownReason>,
}

impl fmt::Debug for ShutdownSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSubscription")
            .field("name", &self.name)
            .field("copies", &self.copies)
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl ShutdownSubscription {
    /// Wait for one copy of the signal
    ///
    /// Returns `None` once the coordinator is gone and no copies remain.
    pub async fn recv(&self) -> Option<ShutdownReason> {
        self.rx.recv().await.ok()
    }

    /// Blocking variant for consumers running on plain threads
    pub fn recv_blocking(&self) -> Option<ShutdownReason> {
        self.rx.recv_blocking().ok()
    }

    /// Take a copy if one is waiting
    pub fn try_recv(&self) -> Option<ShutdownReason> {
        match self.rx.try_recv() {
            Ok(reason) => Some(reason),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of copies this subscription was registered for
    pub fn copies(&self) -> usize {
        self.copies
    }

    /// Copies delivered but not yet consumed
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_copies_rejected() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.subscribe("nobody", 0).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.subscribe("session", 2).unwrap();
        assert!(coordinator.subscribe("session", 1).is_err());
    }

    #[test]
    fn test_trigger_without_runtime_delivers_inline() {
        let coordinator = ShutdownCoordinator::new();
        let sub = coordinator.subscribe("sink", 2).unwrap();

        assert!(coordinator.trigger(ShutdownReason::Requested));
        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.try_recv(), Some(ShutdownReason::Requested));
        assert_eq!(sub.recv_blocking(), Some(ShutdownReason::Requested));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_token_and_reason_follow_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert!(!coordinator.is_triggered());
        assert_eq!(coordinator.reason(), None);

        coordinator.trigger(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert_eq!(coordinator.reason(), Some(ShutdownReason::Interrupt));

        // The first reason sticks
        assert!(!coordinator.trigger(ShutdownReason::Requested));
        assert_eq!(coordinator.reason(), Some(ShutdownReason::Interrupt));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Interrupt.to_string(), "interrupt");
        assert_eq!(ShutdownReason::Requested.to_string(), "requested");
    }
}
