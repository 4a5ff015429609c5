//! Byte-offset ranges within the source file that produced a unit.

use serde::{Deserialize, Serialize};

/// A byte offset range within a unit's source file.
///
/// Spans track the location of scopes, declarations, and diagnostics back to
/// their origin. The `start` is inclusive and `end` is exclusive. Unlike a
/// compiler-wide span there is no file component: every item already belongs
/// to exactly one unit, and the unit knows its path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the start of the span (inclusive).
    pub start: u32,
    /// Byte offset of the end of the span (exclusive).
    pub end: u32,
}

impl Span {
    /// A dummy span used when no source location is available.
    pub const DUMMY: Span = Span { start: 0, end: 0 };

    /// Creates a new span with the given byte range.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Merges two spans, producing a span that covers both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Returns the length of this span in bytes.
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Returns `true` if this span has zero length.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct() {
        let s = Span::new(10, 20);
        assert_eq!(s.start, 10);
        assert_eq!(s.end, 20);
        assert_eq!(s.len(), 10);
    }

    #[test]
    fn merge_spans() {
        let a = Span::new(5, 15);
        let b = Span::new(10, 25);
        let m = a.merge(b);
        assert_eq!(m.start, 5);
        assert_eq!(m.end, 25);
        assert_eq!(a.merge(b), b.merge(a));
    }

    #[test]
    fn len_and_empty() {
        assert!(Span::new(5, 5).is_empty());
        assert!(!Span::new(5, 6).is_empty());
    }

    #[test]
    fn serde_roundtrip() {
        let s = Span::new(10, 20);
        let json = serde_json::to_string(&s).unwrap();
        let back: Span = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
