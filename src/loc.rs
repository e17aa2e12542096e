//! Source locations
//!
//! Every AST node, K-form expression and diagnostic carries a `Loc`:
//! a file id plus a (line, column) pair for each end of the span.
//! File names are stored once in the `Compilation`'s file table; `Loc`
//! itself stays `Copy` so it can be threaded through every IR node.

use std::fmt;

/// Index into the compilation's file-name table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileId(pub u32);

/// A half-open source span: (line0, col0) .. (line1, col1), 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub file: FileId,
    pub line0: u32,
    pub col0: u32,
    pub line1: u32,
    pub col1: u32,
}

impl Loc {
    /// The "no location" marker used for synthesized nodes
    pub const NONE: Loc = Loc {
        file: FileId(0),
        line0: 0,
        col0: 0,
        line1: 0,
        col1: 0,
    };

    pub fn new(file: FileId, line0: u32, col0: u32, line1: u32, col1: u32) -> Self {
        Loc { file, line0, col0, line1, col1 }
    }

    /// A zero-width location at a single point
    pub fn point(file: FileId, line: u32, col: u32) -> Self {
        Loc::new(file, line, col, line, col)
    }

    pub fn is_none(&self) -> bool {
        *self == Loc::NONE
    }

    /// Combine two spans into the smallest span covering both.
    /// `NONE` acts as the identity.
    pub fn merge(self, other: Loc) -> Loc {
        if self.is_none() {
            return other;
        }
        if other.is_none() || self.file != other.file {
            return self;
        }
        let (line0, col0) = if (self.line0, self.col0) <= (other.line0, other.col0) {
            (self.line0, self.col0)
        } else {
            (other.line0, other.col0)
        };
        let (line1, col1) = if (self.line1, self.col1) >= (other.line1, other.col1) {
            (self.line1, self.col1)
        } else {
            (other.line1, other.col1)
        };
        Loc { file: self.file, line0, col0, line1, col1 }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<unknown>")
        } else if (self.line0, self.col0) == (self.line1, self.col1) {
            write!(f, "{}:{}", self.line0, self.col0)
        } else {
            write!(f, "{}:{}-{}:{}", self.line0, self.col0, self.line1, self.col1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_expands_span() {
        let a = Loc::new(FileId(1), 3, 5, 3, 9);
        let b = Loc::new(FileId(1), 2, 1, 3, 4);
        let m = a.merge(b);
        assert_eq!((m.line0, m.col0), (2, 1));
        assert_eq!((m.line1, m.col1), (3, 9));
    }

    #[test]
    fn merge_with_none_is_identity() {
        let a = Loc::new(FileId(1), 3, 5, 3, 9);
        assert_eq!(a.merge(Loc::NONE), a);
        assert_eq!(Loc::NONE.merge(a), a);
    }

    #[test]
    fn display_point_and_range() {
        let p = Loc::point(FileId(0), 7, 2);
        assert_eq!(format!("{}", p), "7:2");
        let r = Loc::new(FileId(0), 1, 1, 2, 4);
        assert_eq!(format!("{}", r), "1:1-2:4");
    }
}
