//! Tags identifying task buckets.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a group of tasks.
///
/// Tasks scheduled with the same tag run in submission order relative to
/// each other and can be waited on together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskTag(u64);

impl TaskTag {
    /// The tag that stands for "the scheduler's own bucket".
    pub const EMPTY: Self = Self(0);

    /// Returns a tag never handed out before.
    pub fn new() -> Self {
        Self(NEXT_TAG.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl Default for TaskTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        let a = TaskTag::new();
        let b = TaskTag::new();
        assert_ne!(a, b);
        assert!(!a.is_empty());
        assert!(TaskTag::EMPTY.is_empty());
    }
}
