//! Consumption Guard
//!
//! Development-mode detection of the write-after-read hazard: dirtying a tag
//! that was already consumed earlier in the same still-open tracking
//! transaction. In production that hazard silently leaves memoized values
//! looking fresh until some unrelated dirtying happens to trigger a
//! recompute; here it fails loudly at the offending write, with the nested
//! transaction labels that were active when the tag was first read.
//!
//! The guard is a pure diagnostic overlay. Release builds skip every check,
//! which removes the loud failure and changes nothing else.

use indexmap::IndexMap;

use crate::error::Error;

use super::tag::{Tag, TagId};

/// The transaction stack and consumed-tag map for one engine.
///
/// Nested transactions share a single consumed map, created when the
/// outermost transaction opens and destroyed when it closes. Attribution is
/// first-write-wins: the labels recorded for a tag are the ones active the
/// first time it was consumed, so diagnostics point at the original read
/// site.
#[derive(Debug, Default)]
pub(crate) struct TransactionEnv {
    stack: Vec<String>,
    consumed: Option<IndexMap<TagId, Vec<String>>>,
}

impl TransactionEnv {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open a transaction context. The first open creates the consumed map.
    pub(crate) fn begin(&mut self, label: &str) {
        if self.stack.is_empty() {
            self.consumed = Some(IndexMap::new());
        }
        self.stack.push(label.to_owned());
    }

    /// Close the innermost transaction. Closing the outermost destroys the
    /// consumed map.
    pub(crate) fn end(&mut self) -> Result<(), Error> {
        if self.stack.pop().is_none() {
            return Err(Error::UnbalancedTransaction);
        }
        if self.stack.is_empty() {
            self.consumed = None;
        }
        Ok(())
    }

    pub(crate) fn in_transaction(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Record that `tag` was consumed under the currently open transaction
    /// stack. Recurses into combinator children and updatable subtags so a
    /// leaf write can be blamed even when only an aggregate was consumed
    /// directly. No-op outside a transaction or for already-seen tags.
    pub(crate) fn mark_consumed(&mut self, tag: &Tag) {
        if self.consumed.is_none() {
            return;
        }
        let labels = self.stack.clone();
        self.mark_consumed_inner(tag, &labels);
    }

    fn mark_consumed_inner(&mut self, tag: &Tag, labels: &[String]) {
        let Some(consumed) = &mut self.consumed else {
            return;
        };
        if consumed.contains_key(&tag.id()) {
            return;
        }
        consumed.insert(tag.id(), labels.to_vec());

        if let Some(subtag) = tag.subtag() {
            self.mark_consumed_inner(&subtag, labels);
        }
        if let Some(children) = tag.combinator_children() {
            for child in children {
                self.mark_consumed_inner(child, labels);
            }
        }
    }

    /// The transaction labels active when `tag` was first consumed, if it
    /// was consumed within the life of the current map.
    pub(crate) fn consumed_at(&self, id: TagId) -> Option<&[String]> {
        self.consumed.as_ref()?.get(&id).map(Vec::as_slice)
    }

    /// Render a nested-label view of a recorded transaction stack.
    pub(crate) fn render_labels(labels: &[String]) -> String {
        if labels.is_empty() {
            return "  (outside any labeled transaction)".to_owned();
        }
        let mut out = String::new();
        for (depth, label) in labels.iter().enumerate() {
            if depth > 0 {
                out.push('\n');
            }
            for _ in 0..=depth {
                out.push_str("  ");
            }
            out.push_str(label);
        }
        out
    }

    /// Clear all transaction state, returning a rendering of the stack at
    /// the moment of reset for diagnostics.
    pub(crate) fn reset(&mut self) -> String {
        let snapshot = Self::render_labels(&self.stack);
        self.stack.clear();
        self.consumed = None;
        snapshot
    }
}

/// Default rendering of a consumption-guard failure. Hosts can replace the
/// headline through the runtime's message formatter hook.
pub(crate) fn default_hazard_message(object: &str, key: &str) -> String {
    format!(
        "cannot update `{key}` on `{object}`: it was already read earlier in the \
         same tracking transaction, so the computation that read it would never \
         observe this write"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumed_map_lives_with_the_outermost_transaction() {
        let mut env = TransactionEnv::new();
        let tag = Tag::dirtyable();

        env.mark_consumed(&tag);
        assert!(env.consumed_at(tag.id()).is_none());

        env.begin("outer");
        env.begin("inner");
        env.mark_consumed(&tag);
        assert!(env.consumed_at(tag.id()).is_some());

        env.end().unwrap();
        // Still consumed: nested transactions share one map.
        assert!(env.consumed_at(tag.id()).is_some());

        env.end().unwrap();
        assert!(env.consumed_at(tag.id()).is_none());
    }

    #[test]
    fn attribution_is_first_write_wins() {
        let mut env = TransactionEnv::new();
        let tag = Tag::dirtyable();

        env.begin("first");
        env.mark_consumed(&tag);
        env.begin("second");
        env.mark_consumed(&tag);

        let labels = env.consumed_at(tag.id()).unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0], "first");
    }

    #[test]
    fn marking_an_aggregate_blames_its_leaves() {
        let mut env = TransactionEnv::new();
        let a = Tag::dirtyable();
        let b = Tag::dirtyable();
        let combined = Tag::combine(vec![a.clone(), b.clone()]);

        env.begin("render");
        env.mark_consumed(&combined);

        assert!(env.consumed_at(a.id()).is_some());
        assert!(env.consumed_at(b.id()).is_some());
    }

    #[test]
    fn ending_without_a_transaction_is_an_error() {
        let mut env = TransactionEnv::new();
        assert!(matches!(env.end(), Err(Error::UnbalancedTransaction)));
    }

    #[test]
    fn reset_clears_and_renders_the_stack() {
        let mut env = TransactionEnv::new();
        env.begin("outer");
        env.begin("inner");

        let snapshot = env.reset();
        assert!(snapshot.contains("outer"));
        assert!(snapshot.contains("inner"));
        assert!(!env.in_transaction());

        // Idempotent once cleared.
        let empty = env.reset();
        assert!(empty.contains("outside any labeled transaction"));
    }
}
