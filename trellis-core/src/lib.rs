//! Trellis Core
//!
//! This crate provides the core autotracking runtime for the Trellis
//! reactive UI framework: the machinery that lets the renderer know,
//! cheaply and correctly, whether a previously computed value is stale and
//! must be recomputed.
//!
//! # Architecture
//!
//! The crate is organized around two modules:
//!
//! - `tracking`: the revision clock, tags, tracking frames, the property
//!   tag table, memoized cache cells, and the engine runtime
//! - `error`: the fail-fast misuse taxonomy shared by all of them
//!
//! Higher layers (rendering, scheduling, component lifecycle) live in their
//! own crates and talk to this one through a narrow surface: consume tags
//! while computing, dirty tags on mutation, and let the revalidation hook
//! tell the scheduler that something went stale.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trellis_core::tracking::{Memo, Runtime};
//!
//! let runtime = Arc::new(Runtime::new());
//! let state = Arc::new(AppState::default());
//!
//! // Reads record dependencies; the memo revalidates in constant time.
//! let title = {
//!     let (runtime, state) = (runtime.clone(), state.clone());
//!     Memo::new(move || {
//!         runtime.consume(&runtime.tag_for(&state, "title"));
//!         state.title()
//!     })
//! };
//!
//! let first = title.get(&runtime);
//!
//! // Mutations advance the clock and invalidate exactly what read them.
//! runtime.dirty_tag_for(&state, "title");
//! let second = title.get(&runtime); // recomputes
//! ```

pub mod error;
pub mod tracking;
