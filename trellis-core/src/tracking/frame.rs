//! Tracking Frames
//!
//! While a tracked computation runs, every tag it reads is recorded into the
//! current tracker. On exit, the recorded tags collapse into one aggregate
//! tag that stands for "everything this computation depended on".
//!
//! # How Tracking Works
//!
//! 1. Entering a frame pushes the current tracker aside and installs a
//!    fresh, empty one.
//!
//! 2. Every tag read funnels through `consume`, which records the tag into
//!    the current tracker (a no-op when none is active).
//!
//! 3. Exiting the frame restores the previous tracker and combines the
//!    recorded tags into a single aggregate tag.
//!
//! Frames nest: an inner computation gets its own tracker, and its finished
//! aggregate tag flows into the outer tracker through the same `consume`
//! path. Untracked regions follow the identical stack discipline but
//! install no tracker at all, deliberately breaking the dependency chain.

use indexmap::IndexSet;

use crate::error::Error;

use super::tag::Tag;

/// Accumulates the tags consumed during one tracking frame.
///
/// Set semantics: a tag consumed many times counts once. The most recently
/// added tag is kept separately so the common single-dependency frame skips
/// the combinator allocation entirely.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    tags: IndexSet<Tag>,
    last: Option<Tag>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a consumed tag. The constant tag is never recorded; it cannot
    /// invalidate anything, so carrying it would only grow the set.
    pub(crate) fn add(&mut self, tag: &Tag) {
        if tag.is_constant() {
            return;
        }
        self.tags.insert(tag.clone());
        self.last = Some(tag.clone());
    }

    /// Collapse the recorded tags into one aggregate tag.
    pub(crate) fn combine(self) -> Tag {
        match self.tags.len() {
            0 => Tag::constant(),
            1 => self.last.unwrap_or_else(Tag::constant),
            _ => Tag::combine(self.tags.into_iter().collect()),
        }
    }
}

/// Whether a stack entry was opened as a tracked or untracked region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Tracked,
    Untracked,
}

#[derive(Debug)]
struct Frame {
    saved: Option<Tracker>,
    kind: RegionKind,
}

/// The stack of open tracking frames.
///
/// Exactly one "current tracker" slot is live at a time; entering a region
/// pushes the previous slot and exiting restores it, in strict LIFO order.
/// Mismatched exits are programming errors and surface as [`Error`]s for
/// the runtime to fail fast on.
#[derive(Debug, Default)]
pub(crate) struct FrameStack {
    stack: Vec<Frame>,
    current: Option<Tracker>,
}

impl FrameStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enter a tracked region: push the current tracker, install a new one.
    pub(crate) fn begin(&mut self) {
        self.stack.push(Frame {
            saved: self.current.take(),
            kind: RegionKind::Tracked,
        });
        self.current = Some(Tracker::new());
    }

    /// Exit the innermost tracked region, returning its tracker.
    pub(crate) fn end(&mut self) -> Result<Tracker, Error> {
        let Some(frame) = self.stack.pop() else {
            return Err(Error::UnbalancedTrackingFrame);
        };
        if frame.kind != RegionKind::Tracked {
            self.stack.push(frame);
            return Err(Error::UnbalancedTrackingFrame);
        }
        let tracker = self.current.take().unwrap_or_default();
        self.current = frame.saved;
        Ok(tracker)
    }

    /// Enter an untracked region: push the current tracker, install none.
    pub(crate) fn begin_untracked(&mut self) {
        self.stack.push(Frame {
            saved: self.current.take(),
            kind: RegionKind::Untracked,
        });
    }

    /// Exit the innermost untracked region.
    pub(crate) fn end_untracked(&mut self) -> Result<(), Error> {
        let Some(frame) = self.stack.pop() else {
            return Err(Error::UnbalancedUntrackedFrame);
        };
        if frame.kind != RegionKind::Untracked {
            self.stack.push(frame);
            return Err(Error::UnbalancedUntrackedFrame);
        }
        self.current = frame.saved;
        Ok(())
    }

    /// Record a consumed tag into the current tracker, if one is active.
    /// Returns whether the tag was recorded.
    pub(crate) fn consume(&mut self, tag: &Tag) -> bool {
        match &mut self.current {
            Some(tracker) => {
                tracker.add(tag);
                true
            }
            None => false,
        }
    }

    /// Whether a tracker is currently collecting reads.
    pub(crate) fn is_tracking(&self) -> bool {
        self.current.is_some()
    }

    /// Whether the innermost open region is untracked: reads here are
    /// deliberately invisible, including to the consumption guard.
    pub(crate) fn in_untracked_region(&self) -> bool {
        self.current.is_none() && !self.stack.is_empty()
    }

    /// Number of open frames, tracked and untracked.
    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Forcibly empty the stack and drop the current tracker. Idempotent;
    /// used to recover after an error unwound past open frames.
    pub(crate) fn reset(&mut self) {
        self.stack.clear();
        self.current = None;
    }
}
