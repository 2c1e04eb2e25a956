//! Byte ranges of the input that should actually be parsed, and the
//! difference bookkeeping the incremental parser needs when those ranges
//! change between parses.

use crate::length::Length;
use crate::point::{InputEdit, Point};

/// A contiguous span of the source text, in both byte and row/column terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start_byte: u32,
    pub end_byte: u32,
    pub start_point: Point,
    pub end_point: Point,
}

impl Range {
    /// The range covering an entire document, used when no explicit included
    /// ranges have been set.
    pub const FULL: Range = Range {
        start_byte: 0,
        end_byte: u32::MAX,
        start_point: Point::ZERO,
        end_point: Point::MAX,
    };
}

/// Append `[start, end)` to a sorted range list, coalescing with the previous
/// range when they touch or overlap. Empty ranges are dropped.
pub(crate) fn add_range(ranges: &mut Vec<Range>, start: Length, end: Length) {
    if let Some(last) = ranges.last_mut() {
        if start.bytes <= last.end_byte {
            last.end_byte = end.bytes;
            last.end_point = end.extent;
            return;
        }
    }
    if start.bytes < end.bytes {
        ranges.push(Range {
            start_byte: start.bytes,
            end_byte: end.bytes,
            start_point: start.extent,
            end_point: end.extent,
        });
    }
}

/// Does any range at or after `start_index` intersect `[start_byte, end_byte)`?
pub(crate) fn intersects(
    ranges: &[Range],
    start_index: usize,
    start_byte: u32,
    end_byte: u32,
) -> bool {
    for range in &ranges[start_index.min(ranges.len())..] {
        if range.end_byte > start_byte {
            return range.start_byte < end_byte;
        }
    }
    false
}

/// The symmetric difference of two sorted included-range lists: the spans
/// covered by one list but not the other. Subtrees overlapping any of these
/// spans must not be reused when reparsing.
pub(crate) fn symmetric_difference(old_ranges: &[Range], new_ranges: &[Range]) -> Vec<Range> {
    let mut differences = Vec::new();
    let mut old_index = 0;
    let mut new_index = 0;
    let mut in_old = false;
    let mut in_new = false;
    let mut current = Length::ZERO;

    let boundary = |ranges: &[Range], index: usize, inside: bool| -> Length {
        match ranges.get(index) {
            Some(range) if inside => Length::new(range.end_byte, range.end_point),
            Some(range) => Length::new(range.start_byte, range.start_point),
            None => Length::MAX,
        }
    };

    while old_index < old_ranges.len() || new_index < new_ranges.len() {
        let next_old = boundary(old_ranges, old_index, in_old);
        let next_new = boundary(new_ranges, new_index, in_new);

        if next_old.bytes < next_new.bytes {
            if in_old != in_new {
                add_range(&mut differences, current, next_old);
            }
            if in_old {
                old_index += 1;
            }
            current = next_old;
            in_old = !in_old;
        } else if next_new.bytes < next_old.bytes {
            if in_old != in_new {
                add_range(&mut differences, current, next_new);
            }
            if in_new {
                new_index += 1;
            }
            current = next_new;
            in_new = !in_new;
        } else {
            if in_old != in_new {
                add_range(&mut differences, current, next_new);
            }
            if in_old {
                old_index += 1;
            }
            if in_new {
                new_index += 1;
            }
            current = next_new;
            in_old = !in_old;
            in_new = !in_new;
        }
    }

    differences
}

/// Shift a range to account for an edit to the text it describes.
pub(crate) fn edit_range(range: &mut Range, edit: &InputEdit) {
    if range.end_byte >= edit.old_end_byte {
        if range.end_byte != u32::MAX {
            range.end_byte = edit.new_end_byte + (range.end_byte - edit.old_end_byte);
            range.end_point = edit.new_end_point + (range.end_point - edit.old_end_point);
            if range.end_byte < edit.new_end_byte {
                range.end_byte = u32::MAX;
                range.end_point = Point::MAX;
            }
        }
    } else if range.end_byte > edit.start_byte {
        range.end_byte = edit.start_byte;
        range.end_point = edit.start_point;
    }

    if range.start_byte >= edit.old_end_byte {
        range.start_byte = edit.new_end_byte + (range.start_byte - edit.old_end_byte);
        range.start_point = edit.new_end_point + (range.start_point - edit.old_end_point);
        if range.start_byte < edit.new_end_byte {
            range.start_byte = u32::MAX;
            range.start_point = Point::MAX;
        }
    } else if range.start_byte > edit.start_byte {
        range.start_byte = edit.start_byte;
        range.start_point = edit.start_point;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u32, end: u32) -> Range {
        Range {
            start_byte: start,
            end_byte: end,
            start_point: Point::new(0, start),
            end_point: Point::new(0, end),
        }
    }

    #[test]
    fn difference_of_identical_lists_is_empty() {
        let ranges = [range(0, 10), range(20, 30)];
        assert!(symmetric_difference(&ranges, &ranges).is_empty());
    }

    #[test]
    fn difference_covers_added_and_removed_spans() {
        let old = [range(0, 10)];
        let new = [range(0, 5), range(8, 12)];
        let differences = symmetric_difference(&old, &new);
        assert_eq!(
            differences
                .iter()
                .map(|r| (r.start_byte, r.end_byte))
                .collect::<Vec<_>>(),
            vec![(5, 8), (10, 12)]
        );
    }

    #[test]
    fn intersects_respects_start_index() {
        let differences = [range(5, 8), range(10, 12)];
        assert!(intersects(&differences, 0, 6, 7));
        assert!(!intersects(&differences, 1, 6, 7));
        assert!(intersects(&differences, 1, 11, 20));
        assert!(!intersects(&differences, 0, 8, 10));
    }

    #[test]
    fn adjacent_ranges_coalesce() {
        let mut ranges = Vec::new();
        add_range(
            &mut ranges,
            Length::new(0, Point::ZERO),
            Length::new(4, Point::new(0, 4)),
        );
        add_range(
            &mut ranges,
            Length::new(4, Point::new(0, 4)),
            Length::new(9, Point::new(0, 9)),
        );
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].end_byte, 9);
    }
}
