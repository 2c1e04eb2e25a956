//! Row/column positions within a source text.

use std::ops::{Add, Sub};

/// A position expressed as a zero-based row and a column measured in bytes
/// from the start of the row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub row: u32,
    pub column: u32,
}

impl Point {
    pub const ZERO: Point = Point { row: 0, column: 0 };
    pub const MAX: Point = Point {
        row: u32::MAX,
        column: u32::MAX,
    };

    pub const fn new(row: u32, column: u32) -> Self {
        Point { row, column }
    }
}

impl Add for Point {
    type Output = Point;

    // Adding a multi-row extent resets the column to the extent's own column.
    fn add(self, rhs: Point) -> Point {
        if rhs.row > 0 {
            Point::new(self.row + rhs.row, rhs.column)
        } else {
            Point::new(self.row, self.column + rhs.column)
        }
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        if self.row > rhs.row {
            Point::new(self.row - rhs.row, self.column)
        } else {
            Point::new(0, self.column.saturating_sub(rhs.column))
        }
    }
}

impl PartialOrd for Point {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Point {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.row, self.column).cmp(&(other.row, other.column))
    }
}

/// A change to a source text, described in both byte and row/column terms.
///
/// Apply to a previous [`crate::Tree`] with [`crate::Tree::edit`] before
/// reparsing so that unchanged subtrees can be located and reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputEdit {
    pub start_byte: u32,
    pub old_end_byte: u32,
    pub new_end_byte: u32,
    pub start_point: Point,
    pub old_end_point: Point,
    pub new_end_point: Point,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_stays_on_row() {
        assert_eq!(Point::new(2, 5) + Point::new(0, 3), Point::new(2, 8));
    }

    #[test]
    fn add_crosses_rows() {
        assert_eq!(Point::new(2, 5) + Point::new(3, 1), Point::new(5, 1));
    }

    #[test]
    fn sub_within_row_saturates() {
        assert_eq!(Point::new(1, 2) - Point::new(1, 5), Point::new(0, 0));
        assert_eq!(Point::new(1, 7) - Point::new(1, 5), Point::new(0, 2));
        assert_eq!(Point::new(4, 7) - Point::new(1, 5), Point::new(3, 7));
    }
}
