//! Per-request state machine.
//!
//! ```text
//! received -> emulating -> awaiting_user_decision -> confirming -> sent
//!                                                 \-> cancelling -> sent
//! confirming -> broadcast -> (retried confirm) -> sent
//! ```
//!
//! A request may only be claimed for confirm or cancel once at a time. A
//! second claim while the first is in flight, or after the response went
//! out, fails with `RequestError::AlreadyHandled`.
//!
//! Finished requests are kept for a retention window so late duplicate
//! claims still see `sent`, then evicted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::RequestError;
use crate::transfer::ChainMessage;

/// Where a request stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Emulating,
    AwaitingUserDecision,
    Confirming,
    /// Broadcast succeeded, the success reply has not reached the relay yet.
    Broadcast(ChainMessage),
    Cancelling,
    Sent,
}

impl RequestState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Emulating => "emulating",
            Self::AwaitingUserDecision => "awaiting_user_decision",
            Self::Confirming => "confirming",
            Self::Broadcast(_) => "broadcast",
            Self::Cancelling => "cancelling",
            Self::Sent => "sent",
        }
    }

    /// The user has not decided yet and nothing was submitted.
    fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Received | Self::Emulating | Self::AwaitingUserDecision
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requests are scoped by app since ids are only unique per app.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub client_id: String,
    pub request_id: String,
}

impl RequestKey {
    pub fn new(client_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            request_id: request_id.into(),
        }
    }
}

/// Outcome of a successful confirm claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmClaim {
    /// Nothing was broadcast yet.
    Fresh,
    /// An earlier attempt broadcast this message; only the reply is missing.
    AlreadyBroadcast(ChainMessage),
}

struct Tracked {
    state: RequestState,
    updated: Instant,
}

impl Tracked {
    fn new(state: RequestState) -> Self {
        Self {
            state,
            updated: Instant::now(),
        }
    }

    fn set(&mut self, state: RequestState) {
        self.state = state;
        self.updated = Instant::now();
    }
}

/// In-memory request states. `sent` entries are dropped once they are older
/// than the retention window; claims on a dropped or never registered
/// request fail with `RequestError::Unknown`.
pub struct RequestTracker {
    states: Mutex<HashMap<RequestKey, Tracked>>,
    retention: Duration,
}

impl RequestTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn with_states<T>(&self, f: impl FnOnce(&mut HashMap<RequestKey, Tracked>) -> T) -> T {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut states)
    }

    fn evict_expired(&self, states: &mut HashMap<RequestKey, Tracked>) {
        let before = states.len();
        states.retain(|_, tracked| {
            tracked.state != RequestState::Sent || tracked.updated.elapsed() < self.retention
        });
        let evicted = before - states.len();
        if evicted > 0 {
            tracing::debug!(evicted, tracked = states.len(), "Evicted finished requests");
        }
    }

    pub fn state(&self, key: &RequestKey) -> Option<RequestState> {
        self.with_states(|states| states.get(key).map(|tracked| tracked.state.clone()))
    }

    pub fn len(&self) -> usize {
        self.with_states(|states| states.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a freshly received request. Known requests keep their state.
    pub fn register(&self, key: RequestKey) {
        self.with_states(|states| {
            self.evict_expired(states);
            states
                .entry(key)
                .or_insert_with(|| Tracked::new(RequestState::Received));
        });
    }

    /// Mark a request terminal without going through a claim, e.g. for
    /// automatic error replies.
    pub fn mark_sent(&self, key: RequestKey) {
        self.with_states(|states| {
            states.insert(key, Tracked::new(RequestState::Sent));
            self.evict_expired(states);
        });
    }

    /// Drop every request of an app that is no longer connected.
    pub fn forget_client(&self, client_id: &str) -> usize {
        self.with_states(|states| {
            let before = states.len();
            states.retain(|key, _| key.client_id != client_id);
            before - states.len()
        })
    }

    pub fn begin_preview(&self, key: &RequestKey) -> Result<(), RequestError> {
        self.with_states(|states| {
            let tracked = Self::tracked(states, key)?;
            if !tracked.state.is_open() {
                return Err(Self::handled_or_invalid(key, &tracked.state, "emulating"));
            }
            tracked.set(RequestState::Emulating);
            Ok(())
        })
    }

    /// Preview is done; the user may now decide.
    pub fn finish_preview(&self, key: &RequestKey) {
        self.with_states(|states| {
            if let Some(tracked) = states.get_mut(key)
                && tracked.state == RequestState::Emulating
            {
                tracked.set(RequestState::AwaitingUserDecision);
            }
        });
    }

    pub fn claim_confirm(&self, key: &RequestKey) -> Result<ConfirmClaim, RequestError> {
        self.with_states(|states| {
            let tracked = Self::tracked(states, key)?;
            let claim = match &tracked.state {
                RequestState::Broadcast(message) => ConfirmClaim::AlreadyBroadcast(message.clone()),
                s if s.is_open() => ConfirmClaim::Fresh,
                s => return Err(Self::handled_or_invalid(key, s, "confirming")),
            };
            tracked.set(RequestState::Confirming);
            Ok(claim)
        })
    }

    pub fn claim_cancel(&self, key: &RequestKey) -> Result<(), RequestError> {
        self.with_states(|states| {
            let tracked = Self::tracked(states, key)?;
            if !tracked.state.is_open() {
                return Err(Self::handled_or_invalid(key, &tracked.state, "cancelling"));
            }
            tracked.set(RequestState::Cancelling);
            Ok(())
        })
    }

    /// Give a failed confirm back to the user, who may retry or cancel.
    pub fn release(&self, key: &RequestKey) {
        self.with_states(|states| {
            if let Some(tracked) = states.get_mut(key)
                && tracked.state == RequestState::Confirming
            {
                tracked.set(RequestState::AwaitingUserDecision);
            }
        });
    }

    /// Broadcast went through but the reply did not; keep the message for
    /// the retry.
    pub fn park_broadcast(&self, key: &RequestKey, message: ChainMessage) {
        self.with_states(|states| {
            states.insert(key.clone(), Tracked::new(RequestState::Broadcast(message)));
        });
    }

    fn tracked<'a>(
        states: &'a mut HashMap<RequestKey, Tracked>,
        key: &RequestKey,
    ) -> Result<&'a mut Tracked, RequestError> {
        states.get_mut(key).ok_or_else(|| RequestError::Unknown {
            request_id: key.request_id.clone(),
        })
    }

    fn handled_or_invalid(key: &RequestKey, state: &RequestState, target: &str) -> RequestError {
        match state {
            RequestState::Confirming | RequestState::Cancelling | RequestState::Sent => {
                RequestError::AlreadyHandled {
                    request_id: key.request_id.clone(),
                }
            }
            other => RequestError::InvalidTransition {
                request_id: key.request_id.clone(),
                state: other.name().to_string(),
                target: target.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const RETENTION: Duration = Duration::from_secs(300);

    fn key() -> RequestKey {
        RequestKey::new("app", "1")
    }

    fn tracker_with(keys: &[RequestKey]) -> RequestTracker {
        let tracker = RequestTracker::new(RETENTION);
        for key in keys {
            tracker.register(key.clone());
        }
        tracker
    }

    #[test]
    fn happy_path_reaches_sent() {
        let tracker = tracker_with(&[key()]);
        tracker.begin_preview(&key()).unwrap();
        assert_eq!(tracker.state(&key()), Some(RequestState::Emulating));
        tracker.finish_preview(&key());
        assert_eq!(tracker.state(&key()), Some(RequestState::AwaitingUserDecision));

        assert_eq!(tracker.claim_confirm(&key()).unwrap(), ConfirmClaim::Fresh);
        tracker.mark_sent(key());
        assert_eq!(tracker.state(&key()), Some(RequestState::Sent));
    }

    #[test]
    fn second_claim_is_rejected() {
        let tracker = tracker_with(&[key()]);
        tracker.claim_confirm(&key()).unwrap();

        let err = tracker.claim_confirm(&key()).unwrap_err();
        assert!(matches!(err, RequestError::AlreadyHandled { .. }));
        let err = tracker.claim_cancel(&key()).unwrap_err();
        assert!(matches!(err, RequestError::AlreadyHandled { .. }));
    }

    #[test]
    fn released_confirm_can_be_cancelled() {
        let tracker = tracker_with(&[key()]);
        tracker.claim_confirm(&key()).unwrap();
        tracker.release(&key());

        tracker.claim_cancel(&key()).unwrap();
        assert_eq!(tracker.state(&key()), Some(RequestState::Cancelling));
    }

    #[test]
    fn broadcast_state_resumes_without_new_message() {
        let tracker = tracker_with(&[key()]);
        let message = ChainMessage::from_base64("AAAA");
        tracker.claim_confirm(&key()).unwrap();
        tracker.park_broadcast(&key(), message.clone());

        assert!(matches!(
            tracker.claim_cancel(&key()).unwrap_err(),
            RequestError::InvalidTransition { .. }
        ));
        assert_eq!(
            tracker.claim_confirm(&key()).unwrap(),
            ConfirmClaim::AlreadyBroadcast(message)
        );
    }

    #[test]
    fn requests_are_scoped_per_app() {
        let a = RequestKey::new("a", "1");
        let b = RequestKey::new("b", "1");
        let tracker = tracker_with(&[a.clone(), b.clone()]);
        tracker.claim_confirm(&a).unwrap();
        tracker.claim_confirm(&b).unwrap();
    }

    #[test]
    fn preview_after_send_is_already_handled() {
        let tracker = tracker_with(&[key()]);
        tracker.mark_sent(key());
        assert!(matches!(
            tracker.begin_preview(&key()).unwrap_err(),
            RequestError::AlreadyHandled { .. }
        ));
    }

    #[test]
    fn unregistered_requests_cannot_be_claimed() {
        let tracker = RequestTracker::new(RETENTION);
        assert!(matches!(
            tracker.claim_confirm(&key()).unwrap_err(),
            RequestError::Unknown { .. }
        ));
        assert!(matches!(
            tracker.claim_cancel(&key()).unwrap_err(),
            RequestError::Unknown { .. }
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn sent_requests_are_evicted_after_retention() {
        let tracker = RequestTracker::new(Duration::ZERO);
        let open = RequestKey::new("app", "open");
        tracker.register(open.clone());
        for i in 0..100 {
            let key = RequestKey::new("app", i.to_string());
            tracker.register(key.clone());
            tracker.mark_sent(key);
        }

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.state(&open), Some(RequestState::Received));
        assert!(matches!(
            tracker.claim_confirm(&RequestKey::new("app", "7")).unwrap_err(),
            RequestError::Unknown { .. }
        ));
    }

    #[test]
    fn forgetting_a_client_drops_all_of_its_requests() {
        let tracker = tracker_with(&[
            RequestKey::new("a", "1"),
            RequestKey::new("a", "2"),
            RequestKey::new("b", "1"),
        ]);
        tracker.mark_sent(RequestKey::new("a", "2"));

        assert_eq!(tracker.forget_client("a"), 2);
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            tracker.state(&RequestKey::new("b", "1")),
            Some(RequestState::Received)
        );
    }
}
