//! Identity of stored rows.

/// A row with a stable, typed identifier.
///
/// Content items, exports, versions, locks, schedules and tasks all
/// implement this; the in-memory stores key their tables by `Entity::Id`
/// and use it as the final tie-breaker when ordering results.
pub trait Entity {
    type Id: Copy + Eq + Ord + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    fn id(&self) -> Self::Id;
}
