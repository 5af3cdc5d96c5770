//! Pending HTTP-01 challenge map.
//!
//! The ACME flow publishes `token → key authorization` entries here; the
//! collaborating HTTP layer looks tokens up when the provider's validator
//! requests `/.well-known/acme-challenge/<token>`, serves the bytes
//! verbatim, and fires the completion signal so the waiting flow can move
//! on to polling the authorization.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::AcmeError;

/// Path prefix the HTTP layer matches for challenge requests.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

struct Entry {
    body: Arc<[u8]>,
    served: Arc<Notify>,
    superseded: CancellationToken,
}

/// Process-wide map of pending HTTP-01 challenges.
///
/// Publishing a token that is already pending supersedes the stale entry:
/// its waiter is canceled and the new key authorization is served from
/// then on.
#[derive(Default)]
pub struct ChallengeMap {
    entries: DashMap<String, Entry>,
}

/// Renewal-flow side of a pending challenge: awaits delivery.
pub struct ChallengeWaiter {
    served: Arc<Notify>,
    superseded: CancellationToken,
}

/// Responder side of a pending challenge: the bytes to serve and the
/// signal to fire once they went out.
pub struct ServedChallenge {
    body: Arc<[u8]>,
    served: Arc<Notify>,
}

impl ChallengeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a pending challenge, superseding any stale entry for the
    /// same token.
    pub fn publish(&self, token: &str, key_authorization: &str) -> ChallengeWaiter {
        let served = Arc::new(Notify::new());
        let superseded = CancellationToken::new();
        let entry = Entry {
            body: key_authorization.as_bytes().into(),
            served: Arc::clone(&served),
            superseded: superseded.clone(),
        };
        if let Some(stale) = self.entries.insert(token.to_string(), entry) {
            debug!(token, "superseding stale pending challenge");
            stale.superseded.cancel();
        } else {
            debug!(token, "pending challenge published");
        }
        ChallengeWaiter { served, superseded }
    }

    /// Look up a pending challenge by token.
    pub fn try_get(&self, token: &str) -> Option<ServedChallenge> {
        let entry = self.entries.get(token)?;
        trace!(token, "pending challenge served");
        Some(ServedChallenge {
            body: Arc::clone(&entry.body),
            served: Arc::clone(&entry.served),
        })
    }

    /// Drop a pending challenge once its authorization concluded.
    pub fn remove(&self, token: &str) {
        if self.entries.remove(token).is_some() {
            debug!(token, "pending challenge removed");
        }
    }

    /// Extract the token from a request path, if it is a challenge path.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }
}

impl ChallengeWaiter {
    /// Wait until the responder signals delivery.
    ///
    /// Errors if the wait exceeds `timeout`, the entry is superseded by a
    /// newer publication, or `cancel` fires.
    pub async fn wait(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        tokio::select! {
            _ = self.served.notified() => Ok(()),
            _ = self.superseded.cancelled() => Err(AcmeError::ChallengeSuperseded),
            _ = cancel.cancelled() => Err(AcmeError::Canceled),
            _ = tokio::time::sleep(timeout) => Err(AcmeError::Timeout("HTTP-01 challenge delivery")),
        }
    }
}

impl ServedChallenge {
    /// The raw key-authorization bytes to return as the response body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Signal that the body was served to the validator.
    pub fn complete(self) {
        self.served.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_then_signal_completes_wait() {
        let map = ChallengeMap::new();
        let waiter = map.publish("tok", "tok.thumb");

        let served = map.try_get("tok").unwrap();
        assert_eq!(served.body(), b"tok.thumb");
        served.complete();

        waiter
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let map = ChallengeMap::new();
        let waiter = map.publish("tok", "tok.thumb");
        map.try_get("tok").unwrap().complete();

        // completion arrived before the flow started waiting
        waiter
            .wait(Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_republish_supersedes_stale_waiter() {
        let map = ChallengeMap::new();
        let stale = map.publish("tok", "old");
        let _fresh = map.publish("tok", "new");

        let err = stale
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::ChallengeSuperseded));
        assert_eq!(map.try_get("tok").unwrap().body(), b"new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let map = ChallengeMap::new();
        let waiter = map.publish("tok", "v");
        let err = waiter
            .wait(Duration::from_secs(120), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::Timeout(_)));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            ChallengeMap::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(ChallengeMap::extract_token("/.well-known/acme-challenge/"), None);
        assert_eq!(ChallengeMap::extract_token("/other"), None);
    }

    #[test]
    fn test_remove_clears_entry() {
        let map = ChallengeMap::new();
        let _waiter = map.publish("tok", "v");
        map.remove("tok");
        assert!(map.try_get("tok").is_none());
    }
}
