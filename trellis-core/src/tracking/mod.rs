//! Autotracking Primitives
//!
//! This module implements the core invalidation engine: the revision clock,
//! tags, tracking frames, the property tag table, and memoized cache cells.
//!
//! # Concepts
//!
//! ## Revisions
//!
//! A single monotonically increasing counter is the engine's logical time.
//! Every mutation advances it exactly once.
//!
//! ## Tags
//!
//! A Tag answers "at which revision did the thing I represent last change".
//! Pairing a tag with a snapshot revision gives a constant-time staleness
//! check: the snapshot is valid as long as it is at least the tag's current
//! computed revision.
//!
//! ## Tracking frames
//!
//! While a computation runs inside a frame, every tag it reads is recorded;
//! closing the frame combines them into one aggregate tag that stands for
//! the whole computation's dependency set. Frames nest, and untracked
//! regions deliberately break the chain.
//!
//! ## Memos
//!
//! A Memo wraps a computation with its last value, aggregate tag, and
//! snapshot, recomputing only when the snapshot goes stale.
//!
//! # Implementation Notes
//!
//! All of this is pull-based: dirtying a tag only advances its revision and
//! pings the host's revalidation hook. Nothing recomputes until someone
//! reads it, which is what keeps invalidation cheap no matter how many
//! derived values exist.

mod cache;
mod debug;
mod frame;
mod property;
mod revision;
mod runtime;
mod tag;

pub use cache::Memo;
pub use revision::{Revision, RevisionClock};
pub use runtime::{MessageFormatter, Runtime};
pub use tag::{Tag, TagId};
