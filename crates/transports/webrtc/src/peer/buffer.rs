//! Remote candidates awaiting application to the transport
//!
//! Candidates can arrive before the remote description they belong to. They
//! wait here until the orchestrator flushes them, and each one reaches the
//! transport at most once.

use crate::session::{IceCandidate, TransportSession};
use crate::Error;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Candidates accepted by the transport
    pub applied: usize,
    /// Candidates dropped for belonging to another negotiation
    pub discarded: usize,
    /// Candidates kept for the next flush after a transient failure
    pub retained: usize,
}

/// Where a consumed candidate ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Waiting for a remote description or a later flush
    Buffered,
    /// Accepted by the transport
    Applied,
    /// Dropped for belonging to another negotiation
    Discarded,
}

/// Per-session candidate buffer
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    applied: HashSet<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate
    ///
    /// Duplicates of a pending or already applied candidate are ignored.
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        if self.applied.contains(&candidate) || self.pending.contains(&candidate) {
            trace!(candidate = %candidate.candidate, "Ignoring duplicate candidate");
            return;
        }
        self.pending.push_back(candidate);
    }

    /// Apply every pending candidate to `transport`
    ///
    /// A candidate whose username fragment differs from `fingerprint` is
    /// dropped without reaching the transport. Any other failure keeps the
    /// candidate for the next flush.
    pub async fn flush(
        &mut self,
        transport: &dyn TransportSession,
        fingerprint: Option<&str>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        let mut retained = VecDeque::new();

        while let Some(candidate) = self.pending.pop_front() {
            if !candidate.matches_fingerprint(fingerprint) {
                debug!(
                    candidate = %candidate.candidate,
                    expected = ?fingerprint,
                    actual = ?candidate.username_fragment,
                    "Discarding candidate from another negotiation"
                );
                report.discarded += 1;
                continue;
            }

            match transport.add_candidate(&candidate).await {
                Ok(()) => {
                    self.applied.insert(candidate);
                    report.applied += 1;
                }
                Err(Error::FingerprintMismatch { expected, actual }) => {
                    debug!(%expected, %actual, "Transport rejected candidate fingerprint");
                    report.discarded += 1;
                }
                Err(e) => {
                    debug!(candidate = %candidate.candidate, error = %e, "Retaining candidate");
                    retained.push_back(candidate);
                }
            }
        }

        report.retained = retained.len();
        self.pending = retained;

        if report != FlushReport::default() {
            debug!(
                applied = report.applied,
                discarded = report.discarded,
                retained = report.retained,
                "Candidate buffer flushed"
            );
        }

        report
    }

    /// Where `candidate` currently stands
    pub fn disposition(&self, candidate: &IceCandidate) -> CandidateDisposition {
        if self.applied.contains(candidate) {
            CandidateDisposition::Applied
        } else if self.pending.contains(candidate) {
            CandidateDisposition::Buffered
        } else {
            CandidateDisposition::Discarded
        }
    }

    /// Number of pending candidates
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of candidates applied over the buffer's lifetime
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.pending.clear();
        self.applied.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockTransportFactory;
    use crate::session::{Role, SessionDescription, TransportFactory};
    use tokio::sync::mpsc;

    async fn transport_with_remote(
        ufrag: &str,
    ) -> (MockTransportFactory, std::sync::Arc<dyn TransportSession>) {
        let factory = MockTransportFactory::isolated();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(1, Role::Initiator, tx).await.unwrap();
        transport
            .set_remote_description(&SessionDescription::answer(format!(
                "v=0\r\na=ice-ufrag:{}\r\n",
                ufrag
            )))
            .await
            .unwrap();
        (factory, transport)
    }

    fn candidate(n: usize, ufrag: &str) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
            .with_username_fragment(ufrag)
    }

    #[tokio::test]
    async fn test_each_candidate_applied_exactly_once() {
        let (factory, transport) = transport_with_remote("abcd").await;
        let mut buffer = CandidateBuffer::new();

        for n in 0..5 {
            buffer.enqueue(candidate(n, "abcd"));
        }
        // Duplicate deliveries of the same candidate
        buffer.enqueue(candidate(0, "abcd"));

        let report = buffer.flush(transport.as_ref(), Some("abcd")).await;
        assert_eq!(report.applied, 5);

        // Flushing again, and re-enqueueing an applied candidate, applies nothing
        buffer.enqueue(candidate(3, "abcd"));
        let report = buffer.flush(transport.as_ref(), Some("abcd")).await;
        assert_eq!(report, FlushReport::default());

        assert_eq!(factory.last().unwrap().applied_candidates().len(), 5);
    }

    #[tokio::test]
    async fn test_mismatched_fingerprint_is_never_applied() {
        let (factory, transport) = transport_with_remote("abcd").await;
        let mut buffer = CandidateBuffer::new();

        let stale = candidate(1, "old0");
        buffer.enqueue(stale.clone());
        buffer.enqueue(candidate(2, "abcd"));

        let report = buffer.flush(transport.as_ref(), Some("abcd")).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.discarded, 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.disposition(&stale), CandidateDisposition::Discarded);

        let applied = factory.last().unwrap().applied_candidates();
        assert!(!applied.contains(&stale));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retained() {
        let (factory, transport) = transport_with_remote("abcd").await;
        let mock = factory.last().unwrap();
        let mut buffer = CandidateBuffer::new();

        buffer.enqueue(candidate(1, "abcd"));
        buffer.enqueue(candidate(2, "abcd"));
        mock.fail_next_adds(1);

        let report = buffer.flush(transport.as_ref(), Some("abcd")).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.retained, 1);
        assert_eq!(buffer.disposition(&candidate(1, "abcd")), CandidateDisposition::Buffered);

        let report = buffer.flush(transport.as_ref(), Some("abcd")).await;
        assert_eq!(report.applied, 1);
        assert!(buffer.is_empty());
        assert_eq!(mock.applied_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_candidates_without_fragment_are_not_checked() {
        let (_factory, transport) = transport_with_remote("abcd").await;
        let mut buffer = CandidateBuffer::new();

        buffer.enqueue(IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host"));
        let report = buffer.flush(transport.as_ref(), Some("abcd")).await;
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn test_clear() {
        let mut buffer = CandidateBuffer::new();
        buffer.enqueue(candidate(1, "abcd"));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.applied_count(), 0);
    }
}
