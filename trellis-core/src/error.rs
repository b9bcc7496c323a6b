//! Engine error taxonomy.
//!
//! Every variant is a programming error: raised synchronously at the point
//! of misuse, never deferred, so the caller's own stack points at the
//! offending call. The enum separates detection from rendering; fail-fast
//! paths panic with the `Display` text of the matching variant.

use thiserror::Error;

use crate::tracking::TagId;

/// Misuses of the tracking engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A second engine was installed as the process default.
    #[error(
        "a tracking engine is already installed in this process; two engines \
         would keep independent revision clocks and break cross-cutting \
         invalidation"
    )]
    AlreadyInstalled,

    /// The process default engine was used before being installed.
    #[error("no tracking engine has been installed in this process")]
    NotInstalled,

    /// A tracked region was ended with no matching begin.
    #[error("ended a tracking frame, but no tracking frame is open")]
    UnbalancedTrackingFrame,

    /// An untracked region was ended with no matching begin.
    #[error("ended an untracked region, but no untracked region is open")]
    UnbalancedUntrackedFrame,

    /// A tracking transaction was ended with no matching begin.
    #[error("ended a tracking transaction, but no transaction is open")]
    UnbalancedTransaction,

    /// A write was attempted on a tag variant that does not accept writes.
    #[error("tag {0:?} cannot be dirtied: only dirtyable and updatable tags accept writes")]
    NotDirtyable(TagId),

    /// A subtag swap was attempted on a non-updatable tag.
    #[error("tag {0:?} is not updatable: only updatable tags carry a subtag")]
    NotUpdatable(TagId),

    /// A tag's computation re-entered itself without a cycle allowance.
    #[error(
        "cycle detected while computing tag {0:?}; register the tag with \
         allow_cycles if the cycle is intentional"
    )]
    TagCycle(TagId),

    /// `is_const` was asked about a memo that has never been computed.
    #[error("memo has never been computed; call get() before is_const()")]
    UnevaluatedMemo,
}
