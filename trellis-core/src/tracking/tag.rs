//! Tags
//!
//! A Tag is the atomic unit of invalidation. It holds no value; it only
//! answers "what is the highest revision at which anything I represent last
//! changed". Consumers pair a tag with a snapshot revision and later ask the
//! engine whether the snapshot is still valid, which is how the entire
//! system decides what to recompute.
//!
//! # Variants
//!
//! Tags form a closed sum, dispatched through a single `compute` match:
//!
//! - *Dirtyable*: a leaf with its own revision, advanced by an explicit
//!   dirty operation.
//! - *Updatable*: a dirtyable leaf that can also delegate to a swappable
//!   child tag; its value is the max of its own revision and the child's.
//! - *Combinator*: aggregates two or more child tags by maximum revision.
//! - *Constant*: always reports [`Revision::CONSTANT`]; it can never
//!   invalidate anything.
//! - *Volatile*: always reports [`Revision::VOLATILE`]; every validity check
//!   against it fails.
//! - *Current*: always reports the clock's live value.
//!
//! # Memoization and cycles
//!
//! Computing an updatable or combinator tag is memoized per global revision:
//! repeated computes at a fixed revision return the cached aggregate without
//! walking children. A `computing` flag guards re-entrant computation; a tag
//! reachable from its own subtag graph either fails fast (development
//! builds, unless registered in the cycle allow-list) or short-circuits with
//! the provisional current revision.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::Error;

use super::revision::{Revision, RevisionClock};

/// Unique identifier for a tag.
///
/// Identity is what makes deduplication in tracking frames and attribution
/// in the consumption guard work: two handles to the same tag compare equal
/// through this ID no matter how often they were cloned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(u64);

impl TagId {
    /// Generate a new unique tag ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TagId {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a dirtyable leaf tag.
#[derive(Debug)]
struct DirtyableState {
    revision: Revision,
}

/// State of an updatable tag.
///
/// `subtag_buffer` holds the child's computed revision captured at swap
/// time. While the child still computes to exactly that value, the tag keeps
/// reporting its pre-swap aggregate; once the child advances past the
/// capture, the buffer is cleared and the live value takes over. Without
/// this, swapping in an already-advanced child would retroactively
/// invalidate computations that ran between the old and new child's
/// revisions.
#[derive(Debug)]
struct UpdatableState {
    revision: Revision,
    subtag: Option<Tag>,
    subtag_buffer: Option<Revision>,
    memo: ComputeMemo,
}

/// Per-revision compute memoization shared by updatable and combinator tags.
#[derive(Debug)]
struct ComputeMemo {
    /// Global revision at which `last_value` was computed.
    /// [`Revision::CONSTANT`] doubles as "never computed": the clock starts
    /// at [`Revision::INITIAL`] and never goes back down.
    last_checked: Revision,
    last_value: Revision,
    computing: bool,
}

impl ComputeMemo {
    fn new() -> Self {
        Self {
            last_checked: Revision::CONSTANT,
            last_value: Revision::INITIAL,
            computing: false,
        }
    }
}

/// The closed set of tag variants.
#[derive(Debug)]
enum TagKind {
    Dirtyable(RwLock<DirtyableState>),
    Updatable(RwLock<UpdatableState>),
    Combinator {
        children: SmallVec<[Tag; 3]>,
        memo: RwLock<ComputeMemo>,
    },
    Constant,
    Volatile,
    Current,
}

#[derive(Debug)]
struct TagInner {
    id: TagId,
    kind: TagKind,
}

/// An invalidation unit.
///
/// Cheap to clone; clones share state and identity, so hosts pass tags
/// around by handle. Equality and hashing go through [`TagId`].
#[derive(Clone)]
pub struct Tag {
    inner: Arc<TagInner>,
}

// Singletons for the stateless variants. They carry no per-runtime state,
// so one of each serves every engine instance in the process.
static CONSTANT_TAG: OnceLock<Tag> = OnceLock::new();
static VOLATILE_TAG: OnceLock<Tag> = OnceLock::new();
static CURRENT_TAG: OnceLock<Tag> = OnceLock::new();

impl Tag {
    fn with_kind(kind: TagKind) -> Self {
        Self {
            inner: Arc::new(TagInner {
                id: TagId::new(),
                kind,
            }),
        }
    }

    /// Create a dirtyable leaf tag at [`Revision::INITIAL`].
    pub fn dirtyable() -> Self {
        Self::with_kind(TagKind::Dirtyable(RwLock::new(DirtyableState {
            revision: Revision::INITIAL,
        })))
    }

    /// Create an updatable tag at [`Revision::INITIAL`] with no subtag.
    pub fn updatable() -> Self {
        Self::with_kind(TagKind::Updatable(RwLock::new(UpdatableState {
            revision: Revision::INITIAL,
            subtag: None,
            subtag_buffer: None,
            memo: ComputeMemo::new(),
        })))
    }

    /// The constant tag: computes [`Revision::CONSTANT`] forever.
    pub fn constant() -> Self {
        CONSTANT_TAG
            .get_or_init(|| Self::with_kind(TagKind::Constant))
            .clone()
    }

    /// The volatile tag: fails every validity check made against it.
    pub fn volatile() -> Self {
        VOLATILE_TAG
            .get_or_init(|| Self::with_kind(TagKind::Volatile))
            .clone()
    }

    /// The current tag: always computes to the clock's live value.
    pub fn current() -> Self {
        CURRENT_TAG
            .get_or_init(|| Self::with_kind(TagKind::Current))
            .clone()
    }

    /// Combine a sequence of tags into one.
    ///
    /// Zero tags yield the constant tag, one tag is returned as-is, two or
    /// more become a combinator. The sequence is taken verbatim: callers
    /// that want set semantics deduplicate first (tracking frames do).
    pub fn combine(mut tags: Vec<Tag>) -> Tag {
        if tags.is_empty() {
            return Tag::constant();
        }
        if tags.len() == 1 {
            return tags.remove(0);
        }
        Self::with_kind(TagKind::Combinator {
            children: tags.into_iter().collect(),
            memo: RwLock::new(ComputeMemo::new()),
        })
    }

    /// Get the tag's unique ID.
    pub fn id(&self) -> TagId {
        self.inner.id
    }

    /// Whether this is the constant tag.
    pub fn is_constant(&self) -> bool {
        matches!(self.inner.kind, TagKind::Constant)
    }

    pub(crate) fn subtag(&self) -> Option<Tag> {
        match &self.inner.kind {
            TagKind::Updatable(cell) => cell.read().subtag.clone(),
            _ => None,
        }
    }

    pub(crate) fn combinator_children(&self) -> Option<&[Tag]> {
        match &self.inner.kind {
            TagKind::Combinator { children, .. } => Some(children),
            _ => None,
        }
    }

    /// Set the tag's own revision to a fresh clock bump.
    ///
    /// Returns `false` for variants that do not accept writes; the runtime
    /// turns that into the fail-fast misuse error.
    pub(crate) fn mark_dirty(&self, clock: &RevisionClock) -> bool {
        match &self.inner.kind {
            TagKind::Dirtyable(cell) => {
                cell.write().revision = clock.bump();
                true
            }
            TagKind::Updatable(cell) => {
                cell.write().revision = clock.bump();
                true
            }
            _ => false,
        }
    }

    /// Swap the subtag of an updatable tag.
    ///
    /// Returns `false` for non-updatable variants. Swapping in the constant
    /// tag clears the subtag; anything else is captured together with its
    /// computed revision at swap time (see [`UpdatableState`]).
    pub(crate) fn swap_subtag(
        &self,
        subtag: &Tag,
        clock: &RevisionClock,
        cycles: &CycleAllowance,
    ) -> bool {
        let TagKind::Updatable(cell) = &self.inner.kind else {
            return false;
        };
        if subtag.is_constant() {
            let mut state = cell.write();
            state.subtag = None;
            state.subtag_buffer = None;
        } else {
            let captured = subtag.compute(clock, cycles);
            let mut state = cell.write();
            state.subtag = Some(subtag.clone());
            state.subtag_buffer = Some(captured);
        }
        true
    }

    /// Resolve this tag to the highest revision reachable through it.
    ///
    /// Idempotent within one global revision: the only side effect is the
    /// per-revision memoization of the max-aggregation.
    pub(crate) fn compute(&self, clock: &RevisionClock, cycles: &CycleAllowance) -> Revision {
        match &self.inner.kind {
            TagKind::Constant => Revision::CONSTANT,
            TagKind::Volatile => Revision::VOLATILE,
            TagKind::Current => clock.current(),
            TagKind::Dirtyable(cell) => cell.read().revision,
            TagKind::Updatable(cell) => self.compute_updatable(cell, clock, cycles),
            TagKind::Combinator { children, memo } => {
                self.compute_combinator(children, memo, clock, cycles)
            }
        }
    }

    fn compute_updatable(
        &self,
        cell: &RwLock<UpdatableState>,
        clock: &RevisionClock,
        cycles: &CycleAllowance,
    ) -> Revision {
        let now = clock.current();
        let (subtag, revision, buffer, prior) = {
            let mut state = cell.write();
            if state.memo.computing {
                drop(state);
                return self.cycle_value(clock, cycles);
            }
            if state.memo.last_checked == now {
                return state.memo.last_value;
            }
            state.memo.computing = true;
            state.memo.last_checked = now;
            (
                state.subtag.clone(),
                state.revision,
                state.subtag_buffer,
                state.memo.last_value,
            )
        };

        // The lock is released while the subtag computes, so a cyclic graph
        // re-enters through the `computing` flag instead of deadlocking.
        let _reset = ClearComputing(|| cell.write().memo.computing = false);

        let mut clear_buffer = false;
        let value = match subtag {
            None => prior.max(revision),
            Some(subtag) => {
                let subtag_value = subtag.compute(clock, cycles);
                if Some(subtag_value) == buffer {
                    // The swapped-in subtag has not advanced past its
                    // capture; keep reporting the pre-swap aggregate.
                    prior.max(revision)
                } else {
                    clear_buffer = true;
                    revision.max(subtag_value)
                }
            }
        };

        let mut state = cell.write();
        if clear_buffer {
            state.subtag_buffer = None;
        }
        state.memo.last_value = value;
        value
    }

    fn compute_combinator(
        &self,
        children: &[Tag],
        memo: &RwLock<ComputeMemo>,
        clock: &RevisionClock,
        cycles: &CycleAllowance,
    ) -> Revision {
        let now = clock.current();
        {
            let mut memo = memo.write();
            if memo.computing {
                drop(memo);
                return self.cycle_value(clock, cycles);
            }
            if memo.last_checked == now {
                return memo.last_value;
            }
            memo.computing = true;
            memo.last_checked = now;
        }

        let _reset = ClearComputing(|| memo.write().computing = false);

        let mut value = Revision::CONSTANT;
        for child in children {
            value = value.max(child.compute(clock, cycles));
        }

        memo.write().last_value = value;
        value
    }

    /// Re-entrant computation detected. Unregistered cycles fail fast in
    /// development builds; otherwise the tag reports the provisional current
    /// revision so the enclosing computation revalidates once the cycle
    /// settles.
    fn cycle_value(&self, clock: &RevisionClock, cycles: &CycleAllowance) -> Revision {
        if cfg!(debug_assertions) && !cycles.contains(self.id()) {
            panic!("{}", Error::TagCycle(self.id()));
        }
        clock.current()
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Tag {}

impl std::hash::Hash for Tag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner.kind {
            TagKind::Dirtyable(_) => "dirtyable",
            TagKind::Updatable(_) => "updatable",
            TagKind::Combinator { .. } => "combinator",
            TagKind::Constant => "constant",
            TagKind::Volatile => "volatile",
            TagKind::Current => "current",
        };
        f.debug_struct("Tag")
            .field("id", &self.inner.id)
            .field("kind", &kind)
            .finish()
    }
}

/// Tags registered as intentionally cyclic.
///
/// A tag in this set short-circuits re-entrant computation instead of
/// failing fast in development builds.
#[derive(Debug, Default)]
pub(crate) struct CycleAllowance {
    allowed: RwLock<HashSet<TagId>>,
}

impl CycleAllowance {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allow(&self, id: TagId) {
        self.allowed.write().insert(id);
    }

    pub(crate) fn contains(&self, id: TagId) -> bool {
        self.allowed.read().contains(&id)
    }
}

/// Resets a `computing` flag when dropped, so a panic while walking
/// children cannot leave a tag permanently marked as mid-computation.
struct ClearComputing<F: FnMut()>(F);

impl<F: FnMut()> Drop for ClearComputing<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}
