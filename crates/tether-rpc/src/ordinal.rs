//! Attribution by arrival order.
//!
//! For peers that answer with a business identifier (an entity title, say)
//! but never echo the caller's request id. Requests of one class are queued
//! by subject; a response naming its subject is matched directly, an
//! untagged one is assumed to answer the oldest unanswered request.
//!
//! The FIFO assumption cannot be checked from this side. If the peer ever
//! answers same-class requests out of order, untagged responses are
//! silently attributed to the wrong subject. Prefer a peer that echoes
//! `requestId` and [`RequestCorrelator`](crate::RequestCorrelator).

use std::collections::HashMap;

use parking_lot::Mutex;
use tether_core::Envelope;
use tether_settings::OrdinalSettings;
use tracing::{debug, warn};

/// Default bound before a queue is forcibly reset.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10;

/// Body field carrying the explicit subject.
pub const DEFAULT_SUBJECT_FIELD: &str = "subject";

/// Queue resets caused by exceeding the bound (counter).
pub const QUEUE_RESETS_TOTAL: &str = "tether_ordinal_queue_resets_total";

// ─────────────────────────────────────────────────────────────────────────────
// OrdinalQueue
// ─────────────────────────────────────────────────────────────────────────────

/// Subjects of one class, in send order.
#[derive(Clone, Debug)]
pub struct OrdinalQueue {
    entries: Vec<String>,
    cursor: usize,
    max_size: usize,
}

impl Default for OrdinalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_MAX_SIZE)
    }
}

impl OrdinalQueue {
    /// Empty queue bounded at `max_size` (at least 1).
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            max_size: max_size.max(1),
        }
    }

    /// Record a request for `subject`.
    ///
    /// Past the bound the oldest half is discarded and the cursor restarts.
    /// Responses still owed to discarded subjects will be misattributed.
    pub fn enqueue(&mut self, subject: impl Into<String>) {
        self.entries.push(subject.into());
        if self.entries.len() > self.max_size {
            let discard = self.entries.len() / 2;
            warn!(
                max_size = self.max_size,
                discarded = discard,
                cursor = self.cursor,
                "ordinal queue over bound, discarding oldest half"
            );
            metrics::counter!(QUEUE_RESETS_TOTAL).increment(1);
            let _ = self.entries.drain(..discard);
            self.cursor = 0;
        }
    }

    /// Attribute one response.
    ///
    /// An explicit subject is returned as is and its entry, if queued, is
    /// removed. Otherwise the entry at the cursor is returned and the cursor
    /// advances; once every entry has been answered the queue empties.
    pub fn on_response(&mut self, explicit: Option<&str>) -> Option<String> {
        if let Some(subject) = explicit {
            if let Some(index) = self.entries.iter().position(|e| e == subject) {
                let _ = self.entries.remove(index);
                if index < self.cursor {
                    self.cursor -= 1;
                }
                if self.cursor >= self.entries.len() {
                    self.reset();
                }
            }
            return Some(subject.to_owned());
        }

        let subject = self.entries.get(self.cursor)?.clone();
        self.cursor += 1;
        if self.cursor >= self.entries.len() {
            self.reset();
        }
        Some(subject)
    }

    /// Queued subjects, answered or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Untagged responses consumed since the last reset.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Configured bound.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OrdinalFallbackMatcher
// ─────────────────────────────────────────────────────────────────────────────

/// One [`OrdinalQueue`] per subject class.
#[derive(Debug)]
pub struct OrdinalFallbackMatcher {
    queues: Mutex<HashMap<String, OrdinalQueue>>,
    max_size: usize,
    subject_field: String,
}

impl Default for OrdinalFallbackMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_MAX_SIZE)
    }
}

impl OrdinalFallbackMatcher {
    /// Matcher whose queues are bounded at `max_size`, reading the subject
    /// from the `subject` body field.
    pub fn new(max_size: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_size,
            subject_field: DEFAULT_SUBJECT_FIELD.to_owned(),
        }
    }

    /// Read the explicit subject from `field` instead.
    #[must_use]
    pub fn with_subject_field(mut self, field: impl Into<String>) -> Self {
        self.subject_field = field.into();
        self
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &OrdinalSettings) -> Self {
        Self::new(settings.queue_max_size).with_subject_field(settings.subject_field.clone())
    }

    /// Body field holding the explicit subject.
    pub fn subject_field(&self) -> &str {
        &self.subject_field
    }

    /// Record a request for `subject` in `class`.
    pub fn enqueue(&self, class: &str, subject: impl Into<String>) {
        self.queues
            .lock()
            .entry(class.to_owned())
            .or_insert_with(|| OrdinalQueue::new(self.max_size))
            .enqueue(subject);
    }

    /// Attribute `response` to a subject of `class`.
    ///
    /// Returns `None` for an untagged response when nothing of that class
    /// is outstanding.
    pub fn on_response(&self, class: &str, response: &Envelope) -> Option<String> {
        let explicit = response.str_field(&self.subject_field);
        let mut queues = self.queues.lock();
        let subject = match queues.get_mut(class) {
            Some(queue) => queue.on_response(explicit),
            None => explicit.map(str::to_owned),
        };
        debug!(
            class,
            subject = subject.as_deref(),
            explicit = explicit.is_some(),
            "ordinal attribution"
        );
        subject
    }

    /// Queued subjects in `class`.
    pub fn len(&self, class: &str) -> usize {
        self.queues.lock().get(class).map_or(0, OrdinalQueue::len)
    }

    /// Untagged responses consumed in `class` since its last reset.
    pub fn cursor(&self, class: &str) -> usize {
        self.queues.lock().get(class).map_or(0, OrdinalQueue::cursor)
    }

    /// Forget `class`.
    pub fn clear(&self, class: &str) {
        let _ = self.queues.lock().remove(class);
    }

    /// Forget every class.
    pub fn clear_all(&self) {
        self.queues.lock().clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tether_logging::capture_logs;
    use tracing::Level;

    use super::*;

    fn untagged() -> Envelope {
        Envelope::new("metadata")
    }

    fn tagged(subject: &str) -> Envelope {
        Envelope::new("metadata").with_field("subject", subject)
    }

    #[test]
    fn untagged_responses_follow_send_order() {
        let matcher = OrdinalFallbackMatcher::default();
        for subject in ["A", "B", "C"] {
            matcher.enqueue("lookup", subject);
        }

        assert_eq!(matcher.on_response("lookup", &untagged()).as_deref(), Some("A"));
        assert_eq!(matcher.on_response("lookup", &untagged()).as_deref(), Some("B"));
        assert_eq!(matcher.on_response("lookup", &untagged()).as_deref(), Some("C"));
        // Fully answered: the queue resets.
        assert_eq!(matcher.len("lookup"), 0);
        assert_eq!(matcher.cursor("lookup"), 0);
        assert_eq!(matcher.on_response("lookup", &untagged()), None);
    }

    #[test]
    fn explicit_subject_removes_out_of_order() {
        let matcher = OrdinalFallbackMatcher::default();
        for subject in ["A", "B", "C"] {
            matcher.enqueue("lookup", subject);
        }

        assert_eq!(matcher.on_response("lookup", &tagged("B")).as_deref(), Some("B"));
        assert_eq!(matcher.len("lookup"), 2);
        assert_eq!(matcher.on_response("lookup", &untagged()).as_deref(), Some("A"));
        assert_eq!(matcher.on_response("lookup", &untagged()).as_deref(), Some("C"));
    }

    #[test]
    fn explicit_removal_before_cursor_keeps_alignment() {
        let mut queue = OrdinalQueue::new(10);
        for subject in ["A", "B", "C"] {
            queue.enqueue(subject);
        }
        assert_eq!(queue.on_response(None).as_deref(), Some("A"));
        // "A" was already answered; removing it must not skip "B".
        assert_eq!(queue.on_response(Some("A")).as_deref(), Some("A"));
        assert_eq!(queue.cursor(), 0);
        assert_eq!(queue.on_response(None).as_deref(), Some("B"));
        assert_eq!(queue.on_response(None).as_deref(), Some("C"));
        assert!(queue.is_empty());
    }

    #[test]
    fn explicit_subject_not_queued_is_returned() {
        let matcher = OrdinalFallbackMatcher::default();
        assert_eq!(matcher.on_response("lookup", &tagged("Z")).as_deref(), Some("Z"));
        matcher.enqueue("lookup", "A");
        assert_eq!(matcher.on_response("lookup", &tagged("Z")).as_deref(), Some("Z"));
        assert_eq!(matcher.len("lookup"), 1);
    }

    #[test]
    fn empty_queue_yields_none() {
        let matcher = OrdinalFallbackMatcher::default();
        assert_eq!(matcher.on_response("lookup", &untagged()), None);
        let mut queue = OrdinalQueue::default();
        assert_eq!(queue.on_response(None), None);
    }

    #[test]
    fn classes_are_independent() {
        let matcher = OrdinalFallbackMatcher::default();
        matcher.enqueue("lookup", "A");
        matcher.enqueue("thumbnail", "X");

        assert_eq!(matcher.on_response("thumbnail", &untagged()).as_deref(), Some("X"));
        assert_eq!(matcher.len("lookup"), 1);
        matcher.clear("lookup");
        assert_eq!(matcher.len("lookup"), 0);
    }

    #[test]
    fn custom_subject_field() {
        let matcher = OrdinalFallbackMatcher::new(4).with_subject_field("title");
        matcher.enqueue("lookup", "Dune");
        matcher.enqueue("lookup", "Emma");
        let response = Envelope::new("metadata").with_field("title", "Emma");
        assert_eq!(matcher.on_response("lookup", &response).as_deref(), Some("Emma"));
        assert_eq!(matcher.on_response("lookup", &untagged()).as_deref(), Some("Dune"));
    }

    #[test]
    fn from_settings_uses_configured_field() {
        let settings = OrdinalSettings {
            queue_max_size: 3,
            subject_field: "name".into(),
        };
        let matcher = OrdinalFallbackMatcher::from_settings(&settings);
        assert_eq!(matcher.subject_field(), "name");
        for subject in ["a", "b", "c", "d"] {
            matcher.enqueue("lookup", subject);
        }
        assert!(matcher.len("lookup") <= 3);
    }

    #[test]
    fn overflow_discards_oldest_half_and_warns() {
        let (logs, _guard) = capture_logs();
        let mut queue = OrdinalQueue::new(4);
        for subject in ["A", "B", "C", "D"] {
            queue.enqueue(subject);
        }
        assert_eq!(queue.on_response(None).as_deref(), Some("A"));
        assert_eq!(queue.cursor(), 1);

        queue.enqueue("E");
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.cursor(), 0);
        assert!(logs.has_event(Level::WARN, "ordinal queue over bound"));
        assert_eq!(logs.count_at_level(Level::WARN), 1);
        let resets: Vec<_> = logs
            .events_for_target("tether_rpc::ordinal")
            .into_iter()
            .filter(|e| e.level == Level::WARN)
            .collect();
        assert_eq!(resets[0].field("discarded"), Some("2"));
        assert_eq!(resets[0].field("cursor"), Some("1"));

        // Survivors are the newest entries.
        assert_eq!(queue.on_response(None).as_deref(), Some("C"));
        assert_eq!(queue.on_response(None).as_deref(), Some("D"));
        assert_eq!(queue.on_response(None).as_deref(), Some("E"));
    }

    proptest! {
        #[test]
        fn queue_never_exceeds_bound(
            max_size in 1_usize..16,
            ops in prop::collection::vec(
                prop_oneof![
                    "[a-e]".prop_map(Op::Enqueue),
                    Just(Op::Untagged),
                    "[a-e]".prop_map(Op::Tagged),
                ],
                0..200,
            ),
        ) {
            let mut queue = OrdinalQueue::new(max_size);
            for op in ops {
                match op {
                    Op::Enqueue(s) => queue.enqueue(s),
                    Op::Untagged => { let _ = queue.on_response(None); }
                    Op::Tagged(s) => { let _ = queue.on_response(Some(&s)); }
                }
                prop_assert!(queue.len() <= max_size);
                prop_assert!(queue.cursor() <= queue.len());
            }
        }
    }

    #[derive(Clone, Debug)]
    enum Op {
        Enqueue(String),
        Untagged,
        Tagged(String),
    }
}
