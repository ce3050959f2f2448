//! Per-recipient store-and-forward queues of signaling messages
//!
//! A deposited signal sits in exactly one mailbox until the recipient drains
//! it. Draining removes the whole queue in one map operation, so two
//! concurrent drains for the same peer can neither duplicate nor lose a
//! signal. Delivery is at-most-once: nothing is re-queued.

use crate::error::{Error, Result};
use crate::protocol::{now_millis, required, SendSignalRequest, SignalKind, SignalRecord};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Identifier assigned to a deposited signal
pub type SignalId = String;

/// A validated signal ready to be deposited
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub from: String,
    pub to: String,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

impl TryFrom<SendSignalRequest> for NewSignal {
    type Error = Error;

    fn try_from(req: SendSignalRequest) -> Result<Self> {
        let from = required("from", req.from)?;
        let to = required("to", req.to)?;
        let kind = required("type", req.kind)?.parse::<SignalKind>()?;
        let payload = match req.payload {
            Some(payload) if !is_blank_payload(&payload) => payload,
            _ => return Err(Error::InvalidArgument("payload is required".to_string())),
        };

        Ok(Self {
            from,
            to,
            kind,
            payload,
        })
    }
}

/// Null, `false`, zero and the empty string carry no signal
fn is_blank_payload(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(b) => !b,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => false,
    }
}

/// A signal held in a mailbox
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub id: SignalId,
    pub from: String,
    pub to: String,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
    pub created_at: Instant,
    /// Deposit time, epoch milliseconds
    pub created_at_ms: u64,
}

impl Signal {
    /// Wire representation
    pub fn to_record(&self) -> SignalRecord {
        SignalRecord {
            from: self.from.clone(),
            to: self.to.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            timestamp: self.created_at_ms,
        }
    }
}

/// Mapping from recipient peer id to its FIFO of pending signals
#[derive(Default)]
pub struct Mailbox {
    queues: DashMap<String, VecDeque<Signal>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a signal to the recipient's queue
    ///
    /// Unknown recipients are accepted; they may announce later.
    pub fn deposit(&self, signal: NewSignal) -> SignalId {
        self.deposit_at(signal, Instant::now())
    }

    /// Deposit with an explicit clock reading
    pub fn deposit_at(&self, signal: NewSignal, now: Instant) -> SignalId {
        let id = uuid::Uuid::new_v4().to_string();

        debug!(
            signal_id = %id,
            kind = %signal.kind,
            from = %signal.from,
            to = %signal.to,
            "Signal stored"
        );

        let NewSignal {
            from,
            to,
            kind,
            payload,
        } = signal;

        let stored = Signal {
            id: id.clone(),
            from,
            to: to.clone(),
            kind,
            payload,
            created_at: now,
            created_at_ms: now_millis(),
        };

        self.queues.entry(to).or_default().push_back(stored);

        id
    }

    /// Return and empty the recipient's queue
    ///
    /// Unknown peers yield an empty vector.
    pub fn drain(&self, peer_id: &str) -> Vec<Signal> {
        match self.queues.remove(peer_id) {
            Some((_, queue)) => {
                debug!(peer_id = %peer_id, count = queue.len(), "Mailbox drained");
                queue.into()
            }
            None => Vec::new(),
        }
    }

    /// Number of signals waiting for a peer
    pub fn pending(&self, peer_id: &str) -> usize {
        self.queues.get(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Total number of undelivered signals
    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drop undelivered signals older than `ttl`
    ///
    /// Returns the number of discarded signals.
    pub fn expire(&self, now: Instant, ttl: Duration) -> usize {
        let mut dropped = 0;

        self.queues.retain(|peer_id, queue| {
            let before = queue.len();
            queue.retain(|signal| now.saturating_duration_since(signal.created_at) <= ttl);
            let expired = before - queue.len();
            if expired > 0 {
                info!(peer_id = %peer_id, expired, "Expired undelivered signals");
            }
            dropped += expired;
            !queue.is_empty()
        });

        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn signal(from: &str, to: &str, kind: SignalKind, payload: &str) -> NewSignal {
        NewSignal {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            payload: serde_json::json!(payload),
        }
    }

    #[test]
    fn test_drain_returns_deposit_order_then_empty() {
        let mailbox = Mailbox::new();
        for i in 0..10 {
            mailbox.deposit(signal("b1", "a1", SignalKind::Candidate, &format!("c{}", i)));
        }

        let drained = mailbox.drain("a1");
        let payloads: Vec<String> = drained
            .iter()
            .map(|s| s.payload.as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
        assert_eq!(payloads, expected);

        assert!(mailbox.drain("a1").is_empty());
    }

    #[test]
    fn test_drain_unknown_peer_is_empty() {
        let mailbox = Mailbox::new();
        assert!(mailbox.drain("nobody").is_empty());
    }

    #[test]
    fn test_mailboxes_are_per_recipient() {
        let mailbox = Mailbox::new();
        mailbox.deposit(signal("b1", "a1", SignalKind::Offer, "to-a"));
        mailbox.deposit(signal("a1", "b1", SignalKind::Answer, "to-b"));

        let a = mailbox.drain("a1");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].kind, SignalKind::Offer);
        assert_eq!(mailbox.pending("b1"), 1);
    }

    #[test]
    fn test_signal_ids_are_unique() {
        let mailbox = Mailbox::new();
        let first = mailbox.deposit(signal("b1", "a1", SignalKind::Offer, "x"));
        let second = mailbox.deposit(signal("b1", "a1", SignalKind::Offer, "x"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_expire_drops_old_signals() {
        let mailbox = Mailbox::new();
        let t0 = Instant::now();
        mailbox.deposit_at(signal("b1", "a1", SignalKind::Offer, "old"), t0);
        mailbox.deposit_at(
            signal("b1", "a1", SignalKind::Candidate, "new"),
            t0 + Duration::from_secs(100),
        );

        let dropped = mailbox.expire(t0 + Duration::from_secs(150), Duration::from_secs(120));
        assert_eq!(dropped, 1);

        let remaining = mailbox.drain("a1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, serde_json::json!("new"));
    }

    #[test]
    fn test_try_from_request_validation() {
        let ok = NewSignal::try_from(SendSignalRequest::new(
            "b1",
            "a1",
            SignalKind::Offer,
            serde_json::json!("OFFER_BLOB"),
        ));
        assert!(ok.is_ok());

        let missing_payload = SendSignalRequest {
            payload: None,
            ..SendSignalRequest::new("b1", "a1", SignalKind::Offer, serde_json::json!("x"))
        };
        assert!(NewSignal::try_from(missing_payload).is_err());

        for blank in [
            serde_json::Value::Null,
            serde_json::json!(false),
            serde_json::json!(0),
            serde_json::json!(0.0),
            serde_json::json!(""),
        ] {
            let request = SendSignalRequest::new("b1", "a1", SignalKind::Offer, blank.clone());
            assert_err!(NewSignal::try_from(request), "accepted {}", blank);
        }
        assert_ok!(NewSignal::try_from(SendSignalRequest::new(
            "b1",
            "a1",
            SignalKind::Candidate,
            serde_json::json!({}),
        )));

        let unknown_kind = SendSignalRequest {
            kind: Some("bye".to_string()),
            ..SendSignalRequest::new("b1", "a1", SignalKind::Offer, serde_json::json!("x"))
        };
        assert!(NewSignal::try_from(unknown_kind).is_err());
    }

    #[test]
    fn test_concurrent_drains_never_duplicate_or_drop() {
        let mailbox = Arc::new(Mailbox::new());
        let total = 2_000;

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                for i in 0..total {
                    mailbox.deposit(signal("b1", "a1", SignalKind::Candidate, &i.to_string()));
                }
            })
        };

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..500 {
                        seen.extend(mailbox.drain("a1").into_iter().map(|s| s.id));
                    }
                    seen
                })
            })
            .collect();

        producer.join().unwrap();
        let mut all: Vec<String> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.extend(mailbox.drain("a1").into_iter().map(|s| s.id));

        assert_eq!(all.len(), total);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
