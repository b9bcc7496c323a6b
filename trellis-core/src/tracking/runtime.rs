//! Tracking Runtime
//!
//! The runtime is the engine context: it owns the revision clock, the
//! tracking frame stack, the property tag table, the cycle allow-list, and
//! (in development builds) the transaction state of the consumption guard.
//!
//! Every clock-touching operation lives here so the whole algorithm works
//! against an arbitrary instance: tests build as many independent engines
//! as they need, while a host application typically installs one runtime as
//! the process-wide default via [`Runtime::install`].
//!
//! # Concurrency
//!
//! The engine assumes a single logical thread of control. "Concurrency"
//! here means nested synchronous computation, never parallelism: no
//! operation blocks or yields, and ordering guarantees are structural (the
//! clock strictly increases; outer frames record inner frames' finished
//! aggregate tags). The interior locks exist so handles can be shared
//! freely, not to make concurrent mutation meaningful.

use std::any::{type_name, Any};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::error::Error;

use super::debug::{default_hazard_message, TransactionEnv};
use super::frame::FrameStack;
use super::property::PropertyTagTable;
use super::revision::{Revision, RevisionClock};
use super::tag::{CycleAllowance, Tag};

/// Renders the headline of a consumption-guard failure from an object
/// description and a property name.
pub type MessageFormatter = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

type RevalidateHook = Arc<dyn Fn() + Send + Sync>;

/// A tracking engine instance.
pub struct Runtime {
    clock: RevisionClock,
    frames: Mutex<FrameStack>,
    properties: PropertyTagTable,
    cycles: CycleAllowance,
    debug: Mutex<TransactionEnv>,
    revalidate: RwLock<Option<RevalidateHook>>,
    formatter: RwLock<Option<MessageFormatter>>,
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Runtime {
    /// Create an independent engine instance.
    pub fn new() -> Self {
        Self {
            clock: RevisionClock::new(),
            frames: Mutex::new(FrameStack::new()),
            properties: PropertyTagTable::new(),
            cycles: CycleAllowance::new(),
            debug: Mutex::new(TransactionEnv::new()),
            revalidate: RwLock::new(None),
            formatter: RwLock::new(None),
        }
    }

    /// Install the process-wide default engine.
    ///
    /// Fails with [`Error::AlreadyInstalled`] on any call after the first:
    /// two engines silently coexisting would mean two independent revision
    /// clocks, and every cross-cutting invalidation between them would be
    /// wrong.
    pub fn install() -> Result<&'static Runtime, Error> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInstalled);
        }
        tracing::info!("tracking engine installed as process default");
        Ok(GLOBAL.get_or_init(Runtime::new))
    }

    /// The process-wide default engine, if one has been installed.
    pub fn try_global() -> Option<&'static Runtime> {
        GLOBAL.get()
    }

    /// The process-wide default engine. Panics if none has been installed.
    pub fn global() -> &'static Runtime {
        match Self::try_global() {
            Some(runtime) => runtime,
            None => panic!("{}", Error::NotInstalled),
        }
    }

    // ------------------------------------------------------------------
    // Clock and tag algebra
    // ------------------------------------------------------------------

    /// The clock's current revision.
    pub fn current_revision(&self) -> Revision {
        self.clock.current()
    }

    /// Resolve a tag to the highest revision reachable through it.
    pub fn value_of(&self, tag: &Tag) -> Revision {
        tag.compute(&self.clock, &self.cycles)
    }

    /// Whether a snapshot taken of `tag` is still current.
    ///
    /// Monotonic: once this returns `false` for a pair, it stays `false`
    /// until the snapshot is retaken from a fresh [`Self::value_of`].
    pub fn validate(&self, tag: &Tag, snapshot: Revision) -> bool {
        snapshot.validates(self.value_of(tag))
    }

    /// Mark a dirtyable or updatable tag as changed now.
    ///
    /// Bumps the clock exactly once, then notifies the revalidation hook.
    /// Panics on any other tag variant, and in development builds when the
    /// tag was already consumed in the currently open tracking transaction.
    pub fn dirty(&self, tag: &Tag) {
        self.assert_not_consumed(tag, None, None);
        if !tag.mark_dirty(&self.clock) {
            panic!("{}", Error::NotDirtyable(tag.id()));
        }
        tracing::trace!(tag = ?tag.id(), "tag dirtied");
        self.notify_revalidate();
    }

    /// Swap the subtag of an updatable tag. Panics on any other variant.
    ///
    /// Not a dirtying operation: the clock does not advance and no
    /// revalidation is scheduled. The new subtag's revision is captured at
    /// swap time so that computations which ran before the swap are not
    /// retroactively invalidated by an already-advanced subtag.
    pub fn update(&self, tag: &Tag, subtag: &Tag) {
        if !tag.swap_subtag(subtag, &self.clock, &self.cycles) {
            panic!("{}", Error::NotUpdatable(tag.id()));
        }
    }

    /// Register a tag as intentionally cyclic: re-entrant computation will
    /// short-circuit instead of failing fast in development builds.
    pub fn allow_cycles(&self, tag: &Tag) {
        self.cycles.allow(tag.id());
    }

    // ------------------------------------------------------------------
    // Property tags
    // ------------------------------------------------------------------

    /// The tag for `(object, key)`, created lazily on first access.
    pub fn tag_for<T: Any + Send + Sync>(&self, object: &Arc<T>, key: &str) -> Tag {
        self.properties.tag_for(object, key)
    }

    /// Dirty the tag for `(object, key)`.
    ///
    /// Silently does nothing when the pair was never tracked: there is no
    /// dependency to invalidate.
    pub fn dirty_tag_for<T: Any + Send + Sync>(&self, object: &Arc<T>, key: &str) {
        let Some(tag) = self.properties.lookup(object, key) else {
            tracing::trace!(key, "dirtied an untracked property; ignoring");
            return;
        };
        self.assert_not_consumed(&tag, Some(type_name::<T>()), Some(key));
        tag.mark_dirty(&self.clock);
        tracing::trace!(tag = ?tag.id(), key, "property tag dirtied");
        self.notify_revalidate();
    }

    // ------------------------------------------------------------------
    // Tracking frames
    // ------------------------------------------------------------------

    /// Enter a tracked region. The label names the computation in
    /// consumption-guard diagnostics.
    pub fn begin_frame(&self, label: &str) {
        self.frames.lock().begin();
        if cfg!(debug_assertions) {
            self.debug.lock().begin(label);
        }
    }

    /// Exit the innermost tracked region, combining everything it consumed
    /// into one aggregate tag. Panics when no tracked region is open.
    pub fn end_frame(&self) -> Tag {
        let tracker = match self.frames.lock().end() {
            Ok(tracker) => tracker,
            Err(error) => panic!("{error}"),
        };
        if cfg!(debug_assertions) {
            if let Err(error) = self.debug.lock().end() {
                panic!("{error}");
            }
        }
        tracker.combine()
    }

    /// Enter an untracked region: reads inside it are recorded nowhere.
    pub fn begin_untracked(&self) {
        self.frames.lock().begin_untracked();
    }

    /// Exit the innermost untracked region. Panics when none is open.
    pub fn end_untracked(&self) {
        if let Err(error) = self.frames.lock().end_untracked() {
            panic!("{error}");
        }
    }

    /// Record that `tag` was read. Recorded into the current tracker when
    /// one is active; an open debug transaction also notes the read for the
    /// consumption guard. Reads inside untracked regions stay invisible to
    /// both.
    pub fn consume(&self, tag: &Tag) {
        if tag.is_constant() {
            return;
        }
        let suppressed = {
            let mut frames = self.frames.lock();
            frames.consume(tag);
            frames.in_untracked_region()
        };
        if cfg!(debug_assertions) && !suppressed {
            self.debug.lock().mark_consumed(tag);
        }
    }

    /// Run `f` in its own tracked region and return its result together
    /// with the aggregate tag of everything it consumed. The frame is
    /// closed even if `f` panics, so the stack stays balanced.
    pub fn track<T>(&self, label: &str, f: impl FnOnce() -> T) -> (T, Tag) {
        self.begin_frame(label);
        let mut guard = FrameGuard {
            runtime: self,
            untracked: false,
            armed: true,
        };
        let value = f();
        guard.armed = false;
        drop(guard);
        (value, self.end_frame())
    }

    /// Run `f` without recording any of its reads.
    pub fn untracked<T>(&self, f: impl FnOnce() -> T) -> T {
        self.begin_untracked();
        let mut guard = FrameGuard {
            runtime: self,
            untracked: true,
            armed: true,
        };
        let value = f();
        guard.armed = false;
        drop(guard);
        self.end_untracked();
        value
    }

    /// Whether a tracker is currently collecting reads.
    pub fn is_tracking(&self) -> bool {
        self.frames.lock().is_tracking()
    }

    /// Number of open frames, tracked and untracked.
    pub fn tracking_frame_depth(&self) -> usize {
        self.frames.lock().depth()
    }

    /// Forcibly empty the frame stack. Idempotent; intended for a top-level
    /// error handler recovering after an exception unwound past open
    /// frames.
    pub fn reset_tracking(&self) {
        tracing::warn!("tracking frame stack forcibly reset");
        self.frames.lock().reset();
    }

    // ------------------------------------------------------------------
    // Consumption guard (development builds)
    // ------------------------------------------------------------------

    /// Open a labeled tracking transaction. No-op in release builds.
    pub fn begin_transaction(&self, label: &str) {
        if cfg!(debug_assertions) {
            self.debug.lock().begin(label);
        }
    }

    /// Close the innermost tracking transaction. Panics when none is open.
    /// No-op in release builds.
    pub fn end_transaction(&self) {
        if cfg!(debug_assertions) {
            if let Err(error) = self.debug.lock().end() {
                panic!("{error}");
            }
        }
    }

    /// Clear all transaction state, returning a rendering of the stack at
    /// the moment of reset. Idempotent; returns an empty rendering in
    /// release builds.
    pub fn reset_transaction(&self) -> String {
        if !cfg!(debug_assertions) {
            return String::new();
        }
        let mut env = self.debug.lock();
        if env.in_transaction() {
            tracing::warn!("tracking transaction state forcibly reset");
        }
        env.reset()
    }

    fn assert_not_consumed(&self, tag: &Tag, object: Option<&str>, key: Option<&str>) {
        if !cfg!(debug_assertions) {
            return;
        }
        let rendered = {
            let env = self.debug.lock();
            match env.consumed_at(tag.id()) {
                Some(labels) => TransactionEnv::render_labels(labels),
                None => return,
            }
        };
        let object = object.unwrap_or("(unknown object)");
        let key = key.unwrap_or("(unknown property)");
        let formatter = self.formatter.read().clone();
        let headline = match formatter {
            Some(format) => format(object, key),
            None => default_hazard_message(object, key),
        };
        panic!("{headline}\nfirst read inside:\n{rendered}");
    }

    // ------------------------------------------------------------------
    // Host hooks
    // ------------------------------------------------------------------

    /// Register the callback fired synchronously on every dirtying
    /// mutation. This is a notification that something became stale, not a
    /// promise of immediate re-execution; the host scheduler decides when
    /// to revalidate.
    pub fn set_revalidate_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.revalidate.write() = Some(Arc::new(hook));
    }

    /// Replace the headline formatter used by consumption-guard failures,
    /// so the host can render object identities meaningfully.
    pub fn set_debug_message_formatter<F>(&self, format: F)
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        *self.formatter.write() = Some(Arc::new(format));
    }

    fn notify_revalidate(&self) {
        let hook = self.revalidate.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("revision", &self.current_revision())
            .field("frame_depth", &self.tracking_frame_depth())
            .field("tracked_objects", &self.properties.tracked_objects())
            .finish()
    }
}

/// Closes the frame opened by [`Runtime::track`]/[`Runtime::untracked`] if
/// the closure unwinds, so a panicking computation cannot leave the stack
/// permanently mismatched.
struct FrameGuard<'a> {
    runtime: &'a Runtime,
    untracked: bool,
    armed: bool,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut frames = self.runtime.frames.lock();
        let _ = if self.untracked {
            frames.end_untracked()
        } else {
            frames.end().map(|_| ())
        };
        drop(frames);
        if !self.untracked && cfg!(debug_assertions) {
            let _ = self.runtime.debug.lock().end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn dirty_advances_the_clock_once() {
        let runtime = Runtime::new();
        let tag = Tag::dirtyable();

        let before = runtime.current_revision();
        runtime.dirty(&tag);
        let after = runtime.current_revision();

        assert_eq!(after.raw(), before.raw() + 1);
        assert_eq!(runtime.value_of(&tag), after);
    }

    #[test]
    #[should_panic(expected = "cannot be dirtied")]
    fn dirtying_a_combinator_fails_fast() {
        let runtime = Runtime::new();
        let combined = Tag::combine(vec![Tag::dirtyable(), Tag::dirtyable()]);
        runtime.dirty(&combined);
    }

    #[test]
    #[should_panic(expected = "not updatable")]
    fn updating_a_dirtyable_fails_fast() {
        let runtime = Runtime::new();
        let tag = Tag::dirtyable();
        runtime.update(&tag, &Tag::dirtyable());
    }

    #[test]
    #[should_panic(expected = "no tracking frame is open")]
    fn ending_an_unopened_frame_fails_fast() {
        let runtime = Runtime::new();
        runtime.end_frame();
    }

    #[test]
    fn track_returns_the_aggregate_of_consumed_tags() {
        let runtime = Runtime::new();
        let a = Tag::dirtyable();
        let b = Tag::dirtyable();

        let ((), tag) = runtime.track("read both", || {
            runtime.consume(&a);
            runtime.consume(&b);
        });

        let snapshot = runtime.value_of(&tag);
        runtime.dirty(&a);
        assert!(!runtime.validate(&tag, snapshot));
    }

    #[test]
    fn untracked_reads_leave_no_dependency() {
        let runtime = Runtime::new();
        let hidden = Tag::dirtyable();

        let ((), tag) = runtime.track("outer", || {
            runtime.untracked(|| runtime.consume(&hidden));
        });

        assert!(tag.is_constant());
    }

    #[test]
    fn consume_outside_any_frame_is_a_no_op() {
        let runtime = Runtime::new();
        runtime.consume(&Tag::dirtyable());
        assert!(!runtime.is_tracking());
    }

    #[test]
    fn track_recovers_from_a_panicking_computation() {
        let runtime = Runtime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.track("explodes", || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(runtime.tracking_frame_depth(), 0);

        // The stack is balanced again; normal tracking still works.
        let ((), tag) = runtime.track("after", || {
            runtime.consume(&Tag::dirtyable());
        });
        assert!(!tag.is_constant());
    }

    #[test]
    fn reset_tracking_recovers_a_corrupted_stack() {
        let runtime = Runtime::new();
        runtime.begin_frame("left open");
        runtime.begin_untracked();

        runtime.reset_tracking();
        assert_eq!(runtime.tracking_frame_depth(), 0);
        runtime.reset_tracking();

        let ((), tag) = runtime.track("fresh", || {
            runtime.consume(&Tag::dirtyable());
        });
        assert!(!tag.is_constant());
    }

    #[test]
    fn dirtying_an_untracked_property_is_a_no_op() {
        let runtime = Runtime::new();
        let fired = Arc::new(AtomicI32::new(0));
        let fired_clone = fired.clone();
        runtime.set_revalidate_hook(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let object = Arc::new(42_u32);
        runtime.dirty_tag_for(&object, "never_read");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn revalidate_hook_fires_on_every_dirtying() {
        let runtime = Runtime::new();
        let fired = Arc::new(AtomicI32::new(0));
        let fired_clone = fired.clone();
        runtime.set_revalidate_hook(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let tag = Tag::dirtyable();
        runtime.dirty(&tag);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let object = Arc::new(7_u32);
        runtime.tag_for(&object, "value");
        runtime.dirty_tag_for(&object, "value");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "already read earlier in the same tracking transaction")]
    fn dirtying_a_consumed_tag_inside_a_transaction_fails_fast() {
        let runtime = Runtime::new();
        let tag = Tag::dirtyable();

        runtime.begin_transaction("render pass");
        runtime.consume(&tag);
        runtime.dirty(&tag);
    }

    #[test]
    fn dirtying_after_the_transaction_closes_succeeds() {
        let runtime = Runtime::new();
        let tag = Tag::dirtyable();

        runtime.begin_transaction("render pass");
        runtime.consume(&tag);
        runtime.end_transaction();

        runtime.dirty(&tag);
        assert!(runtime.value_of(&tag) > Revision::INITIAL);
    }

    #[test]
    fn custom_formatter_shapes_the_guard_message() {
        let runtime = Runtime::new();
        runtime.set_debug_message_formatter(|object, key| {
            format!("backflow on {object}.{key}")
        });

        let object = Arc::new(1_u8);
        runtime.tag_for(&object, "x");

        runtime.begin_transaction("update pass");
        runtime.consume(&runtime.tag_for(&object, "x"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.dirty_tag_for(&object, "x");
        }));
        let message = match result {
            Err(payload) => payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_default(),
            Ok(()) => String::new(),
        };
        assert!(message.contains("backflow on"));
        assert!(message.contains(".x"));
        assert!(message.contains("update pass"));
    }

    #[test]
    fn install_guard_rejects_a_second_engine() {
        let first = Runtime::install();
        assert!(first.is_ok());
        assert!(Runtime::try_global().is_some());

        let second = Runtime::install();
        assert!(matches!(second, Err(Error::AlreadyInstalled)));
    }
}
