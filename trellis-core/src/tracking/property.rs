//! Property Tag Table
//!
//! Associates an updatable tag with every `(object, field)` pair the host
//! reads through the engine, so arbitrary objects gain trackable fields
//! without declaring them up front. Tags are created lazily: the object's
//! table on first access to the object, the field's tag on first access to
//! the field.
//!
//! The table is weak by contract: it must never keep a host object alive.
//! Objects are identified by the address of their `Arc` allocation, and
//! each entry carries a type-erased `Weak` probe. A dead probe means the
//! object is gone; its entry is fodder for the opportunistic prune pass,
//! and if the allocator reuses the address for a new object, the dead probe
//! is how the table tells the newcomer apart from the original.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use indexmap::IndexMap;

use super::tag::Tag;

/// Prune dead objects once per this many table operations.
const PRUNE_INTERVAL: usize = 64;

/// Per-field tags for one tracked object.
#[derive(Debug)]
struct ObjectTags {
    live: Weak<dyn Any + Send + Sync>,
    fields: IndexMap<String, Tag>,
}

/// The per-engine table of property tags.
#[derive(Debug, Default)]
pub(crate) struct PropertyTagTable {
    objects: DashMap<usize, ObjectTags>,
    ops: AtomicUsize,
}

fn address<T: Any + Send + Sync>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

fn probe<T: Any + Send + Sync>(object: &Arc<T>) -> Weak<dyn Any + Send + Sync> {
    let dyn_object: Arc<dyn Any + Send + Sync> = object.clone();
    let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&dyn_object);
    weak
}

impl PropertyTagTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Get the tag for `(object, key)`, creating it on first access.
    pub(crate) fn tag_for<T: Any + Send + Sync>(&self, object: &Arc<T>, key: &str) -> Tag {
        self.maybe_prune();

        let mut entry = self
            .objects
            .entry(address(object))
            .or_insert_with(|| ObjectTags {
                live: probe(object),
                fields: IndexMap::new(),
            });

        // A dead probe at this address means the allocator reused it for a
        // different object; the stale field tags belong to the old one.
        if entry.live.strong_count() == 0 {
            entry.live = probe(object);
            entry.fields.clear();
        }

        entry
            .fields
            .entry(key.to_owned())
            .or_insert_with(Tag::updatable)
            .clone()
    }

    /// Look up the tag for `(object, key)` without creating anything.
    pub(crate) fn lookup<T: Any + Send + Sync>(&self, object: &Arc<T>, key: &str) -> Option<Tag> {
        let entry = self.objects.get(&address(object))?;
        if entry.live.strong_count() == 0 {
            return None;
        }
        entry.fields.get(key).cloned()
    }

    /// Number of live tracked objects. Dead entries awaiting a prune pass
    /// are not counted.
    pub(crate) fn tracked_objects(&self) -> usize {
        self.objects
            .iter()
            .filter(|entry| entry.live.strong_count() > 0)
            .count()
    }

    fn maybe_prune(&self) {
        let ops = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops % PRUNE_INTERVAL != 0 {
            return;
        }
        let before = self.objects.len();
        self.objects.retain(|_, entry| entry.live.strong_count() > 0);
        let removed = before - self.objects.len();
        if removed > 0 {
            tracing::trace!(removed, "pruned dead property tag entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::revision::RevisionClock;

    struct Widget {
        #[allow(dead_code)]
        name: &'static str,
    }

    #[test]
    fn tags_are_created_lazily_and_stay_stable() {
        let table = PropertyTagTable::new();
        let widget = Arc::new(Widget { name: "a" });

        let first = table.tag_for(&widget, "size");
        let second = table.tag_for(&widget, "size");
        assert_eq!(first, second);

        let other_field = table.tag_for(&widget, "color");
        assert_ne!(first, other_field);
    }

    #[test]
    fn distinct_objects_get_distinct_tags() {
        let table = PropertyTagTable::new();
        let a = Arc::new(Widget { name: "a" });
        let b = Arc::new(Widget { name: "b" });

        assert_ne!(table.tag_for(&a, "size"), table.tag_for(&b, "size"));
    }

    #[test]
    fn lookup_misses_untracked_pairs() {
        let table = PropertyTagTable::new();
        let widget = Arc::new(Widget { name: "a" });

        assert!(table.lookup(&widget, "size").is_none());

        table.tag_for(&widget, "size");
        assert!(table.lookup(&widget, "size").is_some());
        assert!(table.lookup(&widget, "color").is_none());
    }

    #[test]
    fn table_does_not_keep_objects_alive() {
        let table = PropertyTagTable::new();
        let widget = Arc::new(Widget { name: "a" });
        let weak = Arc::downgrade(&widget);

        table.tag_for(&widget, "size");
        drop(widget);

        assert!(weak.upgrade().is_none());
        assert_eq!(table.tracked_objects(), 0);
    }

    #[test]
    fn prune_pass_collects_dead_entries() {
        let table = PropertyTagTable::new();
        {
            let short_lived = Arc::new(Widget { name: "gone" });
            table.tag_for(&short_lived, "size");
        }

        let keeper = Arc::new(Widget { name: "kept" });
        for _ in 0..(PRUNE_INTERVAL * 2) {
            table.tag_for(&keeper, "size");
        }

        assert_eq!(table.objects.len(), 1);
    }

    #[test]
    fn dirtying_a_looked_up_tag_invalidates_snapshots() {
        let table = PropertyTagTable::new();
        let clock = RevisionClock::new();
        let cycles = crate::tracking::tag::CycleAllowance::new();
        let widget = Arc::new(Widget { name: "a" });

        let tag = table.tag_for(&widget, "size");
        let snapshot = tag.compute(&clock, &cycles);
        assert!(snapshot.validates(tag.compute(&clock, &cycles)));

        tag.mark_dirty(&clock);
        assert!(!snapshot.validates(tag.compute(&clock, &cycles)));
    }
}
