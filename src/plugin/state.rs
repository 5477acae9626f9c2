//! Advertiser State Machine
//!
//! `Unregistered -> Registering -> Serving -> Unregistered`. A failed
//! registration goes back to `Unregistered`. Anything else is rejected and
//! logged.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle of one pool's kubelet endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvertiserState {
    Unregistered,
    Registering,
    Serving,
}

impl AdvertiserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvertiserState::Unregistered => "unregistered",
            AdvertiserState::Registering => "registering",
            AdvertiserState::Serving => "serving",
        }
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: AdvertiserState) -> bool {
        use AdvertiserState::*;
        matches!(
            (*self, next),
            (Unregistered, Registering)
                | (Registering, Serving)
                | (Registering, Unregistered)
                | (Serving, Unregistered)
        )
    }
}

impl fmt::Display for AdvertiserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable state of one advertiser
#[derive(Debug, Clone)]
pub struct StateHandle {
    pool: String,
    tx: Arc<watch::Sender<AdvertiserState>>,
}

impl StateHandle {
    pub fn new(pool: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(AdvertiserState::Unregistered);
        Self {
            pool: pool.into(),
            tx: Arc::new(tx),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn current(&self) -> AdvertiserState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdvertiserState> {
        self.tx.subscribe()
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub fn transition(&self, next: AdvertiserState) -> bool {
        let pool = &self.pool;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                info!(pool = %pool, from = %state, to = %next, "Advertiser state changed");
                *state = next;
                true
            } else {
                warn!(pool = %pool, from = %state, to = %next, "Ignoring invalid advertiser transition");
                false
            }
        })
    }

    /// Fail with `NotReady` unless the endpoint is registered and serving
    pub fn ensure_serving(&self) -> Result<()> {
        match self.current() {
            AdvertiserState::Serving => Ok(()),
            state => Err(Error::NotReady {
                pool: self.pool.clone(),
                state: state.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_lifecycle() {
        let state = StateHandle::new("serial");
        assert_eq!(state.current(), AdvertiserState::Unregistered);
        assert_matches!(state.ensure_serving(), Err(Error::NotReady { .. }));

        assert!(state.transition(AdvertiserState::Registering));
        assert!(state.transition(AdvertiserState::Serving));
        assert!(state.ensure_serving().is_ok());

        assert!(state.transition(AdvertiserState::Unregistered));
        assert_eq!(state.current(), AdvertiserState::Unregistered);
    }

    #[test]
    fn test_invalid_transitions_ignored() {
        let state = StateHandle::new("serial");
        assert!(!state.transition(AdvertiserState::Serving));
        assert!(!state.transition(AdvertiserState::Unregistered));
        assert_eq!(state.current(), AdvertiserState::Unregistered);

        state.transition(AdvertiserState::Registering);
        assert!(!state.transition(AdvertiserState::Registering));
        assert_eq!(state.current(), AdvertiserState::Registering);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let state = StateHandle::new("serial");
        let mut rx = state.subscribe();

        state.transition(AdvertiserState::Registering);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), AdvertiserState::Registering);

        // Ignored transitions wake nobody
        state.transition(AdvertiserState::Registering);
        assert!(!rx.has_changed().unwrap());
    }
}
