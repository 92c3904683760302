//! Ordered, deduplicating chat log.
//!
//! `id` is the dedup key: a message whose id was ever seen is discarded, no
//! matter how many times history replay or reconnect redelivers it. Display
//! order is `(timestamp, id)`, independent of arrival order, so out-of-order
//! delivery during reconciliation can never corrupt what the user sees.

use std::collections::{BTreeMap, HashSet};

use crate::signal::ChatMessage;

type OrderKey = (i64, String);

#[derive(Debug, Default)]
pub struct MessageLog {
    ordered: BTreeMap<OrderKey, ChatMessage>,
    seen_ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message at its ordering position. Returns `false` for a
    /// duplicate id; the existing entry is never re-appended or re-ordered.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if self.seen_ids.contains(&message.id) {
            return false;
        }
        self.seen_ids.insert(message.id.clone());
        self.ordered.insert(message.order_key(), message);
        true
    }

    /// Merge a batch (history fetch, reconnect replay). Returns the messages
    /// that were genuinely new, in display order.
    pub fn merge(&mut self, batch: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut fresh: Vec<ChatMessage> = batch
            .into_iter()
            .filter(|message| self.insert(message.clone()))
            .collect();
        fresh.sort_by_key(|m| m.order_key());
        fresh
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Messages in display order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.ordered.values().cloned().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(id: &str, timestamp: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Ada".to_string(),
            content: format!("msg {id}"),
            timestamp,
            attachment: None,
        }
    }

    #[test]
    fn test_duplicate_id_is_discarded() {
        let mut log = MessageLog::new();
        assert!(log.insert(message("a", 10)));
        assert!(!log.insert(message("a", 10)));
        // Same id with a different timestamp is still the same message.
        assert!(!log.insert(message("a", 99)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_out_of_order_arrival_sorts_by_timestamp() {
        let mut log = MessageLog::new();
        log.insert(message("late", 30));
        log.insert(message("early", 10));
        log.insert(message("mid", 20));

        let ids: Vec<_> = log.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_timestamp_ties_break_by_id() {
        let mut log = MessageLog::new();
        log.insert(message("b", 10));
        log.insert(message("a", 10));
        let ids: Vec<_> = log.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_merge_reports_only_fresh_messages() {
        let mut log = MessageLog::new();
        log.insert(message("a", 10));

        let fresh = log.merge(vec![message("a", 10), message("b", 5), message("c", 20)]);
        let ids: Vec<_> = fresh.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_repeated_history_merge_never_duplicates() {
        let mut log = MessageLog::new();
        let history = vec![message("a", 10), message("b", 20), message("c", 30)];
        assert_eq!(log.merge(history.clone()).len(), 3);
        assert_eq!(log.merge(history.clone()).len(), 0);
        assert_eq!(log.merge(history).len(), 0);
        assert_eq!(log.len(), 3);
    }

    proptest! {
        /// For any interleaving of delivery and reconciliation, the final
        /// ordering equals the message set sorted by (timestamp, id) and no
        /// id appears twice.
        #[test]
        fn prop_order_is_arrival_independent(
            entries in proptest::collection::vec((0u8..40, 0i64..50), 0..60)
        ) {
            let mut log = MessageLog::new();
            let mut expected: Vec<(i64, String)> = Vec::new();
            for (id_raw, timestamp) in &entries {
                let id = format!("id-{id_raw}");
                let fresh = log.insert(message(&id, *timestamp));
                let first_time = !expected.iter().any(|(_, i)| *i == id);
                prop_assert_eq!(fresh, first_time);
                if first_time {
                    expected.push((*timestamp, id));
                }
            }
            expected.sort();

            let got: Vec<(i64, String)> = log
                .messages()
                .into_iter()
                .map(|m| (m.timestamp, m.id))
                .collect();
            prop_assert_eq!(got, expected);
        }
    }
}
