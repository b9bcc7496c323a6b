//! Memo Implementation
//!
//! A Memo pairs a zero-argument computation with memoization: it stores the
//! last computed value, the aggregate tag of everything that computation
//! read, and the revision snapshot taken right after it ran.
//!
//! # How Memos Work
//!
//! 1. On first access, the memo runs its computation inside a tracking
//!    frame and caches the result.
//!
//! 2. When accessed again, if the stored snapshot still validates against
//!    the stored tag, the cached value is returned untouched.
//!
//! 3. Dirtying anything the computation read makes the snapshot stale, and
//!    the next access recomputes. Staleness is discovered lazily on access,
//!    never pushed eagerly.
//!
//! 4. Every access, cached or not, consumes the memo's own tag, so an
//!    enclosing tracked computation becomes dependent on the memo without
//!    seeing through to its individual dependencies.
//!
//! A memo whose computation read nothing mutable ends up with the constant
//! tag; [`Memo::is_const`] exposes that so callers can skip future validity
//! checks entirely.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

use super::revision::Revision;
use super::runtime::Runtime;
use super::tag::Tag;

struct CellState<T> {
    value: Option<T>,
    tag: Option<Tag>,
    snapshot: Revision,
}

/// A memoized cache cell.
///
/// # Type Parameters
///
/// - `T`: the computed value type. Must be Clone + Send + Sync.
///
/// Clones share state: two handles to the same memo see the same cached
/// value and revalidate together.
pub struct Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    label: Arc<str>,
    compute: Arc<dyn Fn() -> T + Send + Sync>,
    cell: Arc<RwLock<CellState<T>>>,
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a memo with the given computation function.
    ///
    /// The computation does not run until the first [`Memo::get`].
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::labeled("memo", compute)
    }

    /// Create a memo whose label names it in consumption-guard
    /// diagnostics.
    pub fn labeled<F>(label: &str, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            label: Arc::from(label),
            compute: Arc::new(compute),
            cell: Arc::new(RwLock::new(CellState {
                value: None,
                tag: None,
                // Stale against everything, so the first access always
                // computes even if the computation turns out constant.
                snapshot: Revision::INVALID,
            })),
        }
    }

    /// Get the memo's value, recomputing only if a dependency changed.
    pub fn get(&self, runtime: &Runtime) -> T {
        let needs_recompute = {
            let state = self.cell.read();
            match &state.tag {
                Some(tag) => !runtime.validate(tag, state.snapshot),
                None => true,
            }
        };

        if needs_recompute {
            runtime.begin_frame(&self.label);
            let value = (self.compute)();
            let tag = runtime.end_frame();
            let snapshot = runtime.value_of(&tag);
            tracing::debug!(label = &*self.label, snapshot = ?snapshot, "memo recomputed");

            let mut state = self.cell.write();
            state.value = Some(value);
            state.tag = Some(tag);
            state.snapshot = snapshot;
        }

        let state = self.cell.read();
        let tag = state
            .tag
            .clone()
            .expect("computed memo should have a tag");
        runtime.consume(&tag);
        state
            .value
            .clone()
            .expect("computed memo should have a value")
    }

    /// Whether this memo's value, once computed, can never become stale.
    ///
    /// Panics if the memo has never been computed: constness is a property
    /// of what the computation actually read, which is unknown until it has
    /// run once.
    pub fn is_const(&self) -> bool {
        match &self.cell.read().tag {
            Some(tag) => tag.is_constant(),
            None => panic!("{}", Error::UnevaluatedMemo),
        }
    }

    /// Whether the memo has computed at least once.
    pub fn has_value(&self) -> bool {
        self.cell.read().value.is_some()
    }

    /// The snapshot taken after the last computation, if any has run.
    pub fn snapshot(&self) -> Option<Revision> {
        let state = self.cell.read();
        state.tag.as_ref().map(|_| state.snapshot)
    }

    /// The aggregate tag of the last computation, if any has run.
    pub fn tag(&self) -> Option<Tag> {
        self.cell.read().tag.clone()
    }
}

impl<T> Clone for Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            label: Arc::clone(&self.label),
            compute: Arc::clone(&self.compute),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo")
            .field("label", &self.label)
            .field("has_value", &self.has_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn memo_computes_on_first_access_only() {
        let runtime = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let memo = Memo::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            42
        });

        assert!(!memo.has_value());
        assert_eq!(memo.get(&runtime), 42);
        assert_eq!(memo.get(&runtime), 42);
        assert_eq!(memo.get(&runtime), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(memo.has_value());
    }

    #[test]
    fn memo_recomputes_when_a_dependency_is_dirtied() {
        let runtime = Arc::new(Runtime::new());
        let tag = Tag::dirtyable();
        let calls = Arc::new(AtomicI32::new(0));

        let memo = {
            let runtime = runtime.clone();
            let tag = tag.clone();
            let calls = calls.clone();
            Memo::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                runtime.consume(&tag);
                7
            })
        };

        memo.get(&runtime);
        memo.get(&runtime);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        runtime.dirty(&tag);
        memo.get(&runtime);
        memo.get(&runtime);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unrelated_mutations_do_not_invalidate() {
        let runtime = Arc::new(Runtime::new());
        let read = Tag::dirtyable();
        let unrelated = Tag::dirtyable();
        let calls = Arc::new(AtomicI32::new(0));

        let memo = {
            let runtime = runtime.clone();
            let read = read.clone();
            let calls = calls.clone();
            Memo::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                runtime.consume(&read);
            })
        };

        memo.get(&runtime);
        runtime.dirty(&unrelated);
        memo.get(&runtime);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memo_with_no_mutable_reads_is_const() {
        let runtime = Runtime::new();
        let memo = Memo::new(|| "static");

        memo.get(&runtime);
        assert!(memo.is_const());
    }

    #[test]
    fn memo_with_mutable_reads_is_not_const() {
        let runtime = Arc::new(Runtime::new());
        let tag = Tag::dirtyable();

        let memo = {
            let runtime = runtime.clone();
            let tag = tag.clone();
            Memo::new(move || runtime.consume(&tag))
        };

        memo.get(&runtime);
        assert!(!memo.is_const());
    }

    #[test]
    #[should_panic(expected = "never been computed")]
    fn is_const_before_any_get_fails_fast() {
        let memo = Memo::new(|| 1);
        memo.is_const();
    }

    #[test]
    fn memo_clone_shares_state() {
        let runtime = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let memo = Memo::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            5
        });
        let clone = memo.clone();

        assert_eq!(memo.get(&runtime), 5);
        assert_eq!(clone.get(&runtime), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clone.has_value());
    }

    #[test]
    fn reading_a_memo_consumes_its_tag_in_the_outer_frame() {
        let runtime = Arc::new(Runtime::new());
        let tag = Tag::dirtyable();

        let memo = {
            let runtime = runtime.clone();
            let tag = tag.clone();
            Memo::new(move || runtime.consume(&tag))
        };

        let ((), outer_tag) = runtime.track("outer", || {
            memo.get(&runtime);
        });

        let snapshot = runtime.value_of(&outer_tag);
        runtime.dirty(&tag);
        assert!(!runtime.validate(&outer_tag, snapshot));
    }

    #[test]
    fn volatile_reads_force_recomputation_every_time() {
        let runtime = Arc::new(Runtime::new());
        let calls = Arc::new(AtomicI32::new(0));

        let memo = {
            let runtime = runtime.clone();
            let calls = calls.clone();
            Memo::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                runtime.consume(&Tag::volatile());
            })
        };

        memo.get(&runtime);
        memo.get(&runtime);
        memo.get(&runtime);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
