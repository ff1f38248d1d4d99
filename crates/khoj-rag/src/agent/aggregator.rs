//! Tool-call fragment aggregation for streaming completions.
//!
//! A pure state machine keyed by call id: a fragment with a new id opens a
//! pending entry, a name sets it, and argument chunks append to a per-id
//! buffer. On stream end, entries with a name and JSON-parseable arguments
//! become complete tool calls; malformed ones are discarded.

use std::collections::HashMap;

use crate::provider::{ToolCall, ToolCallFragment};

#[derive(Debug, Default)]
struct PendingCall {
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    pending: HashMap<String, PendingCall>,
    /// Ids in first-seen order, so output order matches stream order.
    order: Vec<String>,
    current: Option<String>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Fragments without an id apply to the most recently
    /// started entry; fragments before any id are dropped.
    pub fn push(&mut self, fragment: &ToolCallFragment) {
        if let Some(id) = &fragment.id {
            if !self.pending.contains_key(id) {
                self.pending.insert(id.clone(), PendingCall::default());
                self.order.push(id.clone());
            }
            self.current = Some(id.clone());
        }

        let Some(current) = &self.current else {
            return;
        };
        let Some(entry) = self.pending.get_mut(current) else {
            return;
        };
        if let Some(name) = &fragment.name {
            entry.name = Some(name.clone());
        }
        if let Some(chunk) = &fragment.arguments {
            entry.arguments.push_str(chunk);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Assemble completed calls. An entry without argument chunks counts as
    /// an empty-object call; an unparseable buffer discards the entry.
    pub fn finish(mut self) -> Vec<ToolCall> {
        let mut calls = Vec::with_capacity(self.order.len());
        for id in self.order {
            let Some(entry) = self.pending.remove(&id) else {
                continue;
            };
            let Some(name) = entry.name else {
                tracing::debug!(id = %id, "discarding tool call without a name");
                continue;
            };
            let arguments = if entry.arguments.is_empty() {
                "{}".to_string()
            } else {
                entry.arguments
            };
            if serde_json::from_str::<serde_json::Value>(&arguments).is_err() {
                tracing::debug!(id = %id, name = %name, "discarding tool call with malformed arguments");
                continue;
            }
            calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: arguments.map(String::from),
        }
    }

    #[test]
    fn test_single_call_assembled_from_chunks() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.push(&fragment(Some("call_1"), Some("search"), None));
        aggregator.push(&fragment(None, None, Some("{\"query\":")));
        aggregator.push(&fragment(None, None, Some("\"rust\"}")));

        let calls = aggregator.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, "{\"query\":\"rust\"}");
    }

    #[test]
    fn test_interleaved_calls_keyed_by_id() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.push(&fragment(Some("a"), Some("first"), Some("{\"x\":")));
        aggregator.push(&fragment(Some("b"), Some("second"), Some("{}")));
        aggregator.push(&fragment(Some("a"), None, Some("1}")));

        let calls = aggregator.finish();
        assert_eq!(calls.len(), 2);
        // First-seen order is preserved.
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].arguments, "{\"x\":1}");
        assert_eq!(calls[1].id, "b");
    }

    #[test]
    fn test_malformed_arguments_discarded() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.push(&fragment(Some("bad"), Some("search"), Some("{\"unclosed\":")));
        aggregator.push(&fragment(Some("good"), Some("lookup"), Some("{\"k\":2}")));

        let calls = aggregator.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "good");
    }

    #[test]
    fn test_nameless_entry_discarded() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.push(&fragment(Some("x"), None, Some("{}")));
        assert_eq!(aggregator.pending_count(), 1);
        assert!(aggregator.finish().is_empty());
    }

    #[test]
    fn test_no_argument_chunks_means_empty_object() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.push(&fragment(Some("x"), Some("ping"), None));
        let calls = aggregator.finish();
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn test_fragment_before_any_id_is_dropped() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.push(&fragment(None, Some("orphan"), Some("{}")));
        assert_eq!(aggregator.pending_count(), 0);
        assert!(aggregator.finish().is_empty());
    }
}
