//! Per-label latest-request-wins bookkeeping.
//!
//! Only the most recently sent request of each label is tracked. A
//! response is accepted only if it carries exactly that request id;
//! everything else is stale. The tracker is generic over the waiter
//! attached to each entry so it can be exercised without channels.

use std::collections::HashMap;
use std::time::Duration;

use segmark_core::types::{FrameNumber, LabelId, RequestId};
use tokio::time::Instant;

/// An outstanding request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub label_id: LabelId,
    pub frame_number: FrameNumber,
    pub sent_at: Instant,
}

pub struct RequestTracker<W> {
    entries: HashMap<LabelId, (PendingRequest, W)>,
}

impl<W> Default for RequestTracker<W> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<W> RequestTracker<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `request` as the latest for its label.
    ///
    /// Returns the entry it supersedes, if any.
    pub fn begin(&mut self, request: PendingRequest, waiter: W) -> Option<(PendingRequest, W)> {
        self.entries.insert(request.label_id, (request, waiter))
    }

    /// Whether `request_id` is the latest request of `label_id`.
    pub fn is_current(&self, label_id: LabelId, request_id: &str) -> bool {
        self.entries
            .get(&label_id)
            .is_some_and(|(p, _)| p.request_id == request_id)
    }

    /// Claim the entry a response belongs to.
    ///
    /// `None` means the response is stale: no request id, no entry for
    /// the label, or a newer request has been sent since.
    pub fn resolve(
        &mut self,
        label_id: LabelId,
        request_id: Option<&str>,
    ) -> Option<(PendingRequest, W)> {
        let request_id = request_id?;
        if !self.is_current(label_id, request_id) {
            return None;
        }
        self.entries.remove(&label_id)
    }

    /// Remove every entry older than `timeout` at `now`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(PendingRequest, W)> {
        let overdue: Vec<LabelId> = self
            .entries
            .iter()
            .filter(|(_, (p, _))| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(label, _)| *label)
            .collect();

        overdue
            .into_iter()
            .filter_map(|label| self.entries.remove(&label))
            .collect()
    }

    /// Drop tracking for a label; any in-flight response becomes stale.
    pub fn forget(&mut self, label_id: LabelId) -> Option<(PendingRequest, W)> {
        self.entries.remove(&label_id)
    }

    pub fn latest(&self, label_id: LabelId) -> Option<&PendingRequest> {
        self.entries.get(&label_id).map(|(p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<(PendingRequest, W)> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(label_id: LabelId, request_id: &str, sent_at: Instant) -> PendingRequest {
        PendingRequest {
            request_id: request_id.into(),
            label_id,
            frame_number: 0,
            sent_at,
        }
    }

    // -- staleness ---------------------------------------------------------

    #[test]
    fn newer_request_supersedes_older() {
        let mut tracker = RequestTracker::new();
        let label = uuid::Uuid::new_v4();
        let now = Instant::now();

        assert!(tracker.begin(pending(label, "r1", now), ()).is_none());
        let superseded = tracker.begin(pending(label, "r2", now), ());
        assert_eq!(superseded.map(|(p, _)| p.request_id), Some("r1".to_string()));

        // r2 arrives first, r1 afterwards: only r2 is accepted.
        assert!(tracker.resolve(label, Some("r2")).is_some());
        assert!(tracker.resolve(label, Some("r1")).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn old_response_before_new_is_stale() {
        let mut tracker = RequestTracker::new();
        let label = uuid::Uuid::new_v4();
        let now = Instant::now();
        tracker.begin(pending(label, "r1", now), ());
        tracker.begin(pending(label, "r2", now), ());

        assert!(tracker.resolve(label, Some("r1")).is_none());
        assert!(tracker.is_current(label, "r2"), "stale response must not clear the entry");
        assert!(tracker.resolve(label, Some("r2")).is_some());
    }

    #[test]
    fn response_without_request_id_is_stale() {
        let mut tracker = RequestTracker::new();
        let label = uuid::Uuid::new_v4();
        tracker.begin(pending(label, "r1", Instant::now()), ());
        assert!(tracker.resolve(label, None).is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn response_for_unknown_label_is_stale() {
        let mut tracker: RequestTracker<()> = RequestTracker::new();
        assert!(tracker.resolve(uuid::Uuid::new_v4(), Some("r1")).is_none());
    }

    #[test]
    fn labels_are_tracked_independently() {
        let mut tracker = RequestTracker::new();
        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let now = Instant::now();
        tracker.begin(pending(a, "a1", now), ());
        tracker.begin(pending(b, "b1", now), ());
        assert!(tracker.resolve(b, Some("b1")).is_some());
        assert!(tracker.is_current(a, "a1"));
    }

    // -- forget / expire ---------------------------------------------------

    #[test]
    fn forget_makes_in_flight_response_stale() {
        let mut tracker = RequestTracker::new();
        let label = uuid::Uuid::new_v4();
        tracker.begin(pending(label, "r1", Instant::now()), ());
        assert!(tracker.forget(label).is_some());
        assert!(tracker.resolve(label, Some("r1")).is_none());
    }

    #[test]
    fn expire_removes_only_overdue_entries() {
        let mut tracker = RequestTracker::new();
        let (old, fresh) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let start = Instant::now();
        tracker.begin(pending(old, "old", start), ());
        tracker.begin(pending(fresh, "fresh", start + Duration::from_secs(8)), ());

        let expired = tracker.expire(start + Duration::from_secs(10), Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0.request_id, "old");
        assert!(tracker.latest(fresh).is_some());
        assert!(tracker.latest(old).is_none());
    }

    #[test]
    fn drain_empties_tracker() {
        let mut tracker = RequestTracker::new();
        tracker.begin(pending(uuid::Uuid::new_v4(), "r1", Instant::now()), 1u8);
        tracker.begin(pending(uuid::Uuid::new_v4(), "r2", Instant::now()), 2u8);
        assert_eq!(tracker.drain().len(), 2);
        assert!(tracker.is_empty());
    }
}
