//! Input buffering and character decoding.
//!
//! The [`Lexer`] owns the positional state of the scan: the current position,
//! the bounds of the token being recognized, the included ranges, and a copy
//! of the chunk of text most recently pulled from the caller's input. It is
//! persistent across `parse` calls so that a cancelled parse can resume.
//!
//! Grammar lex functions and external scanners never see the `Lexer`
//! directly; they receive a [`LexerRef`], which pairs the lexer with the
//! live input for the duration of one parse.

use tracing::trace;

use crate::language::Symbol;
use crate::length::Length;
use crate::point::Point;
use crate::ranges::Range;
use crate::unicode::{decode_utf8, decode_utf16_be, decode_utf16_le, DECODE_ERROR};

const BYTE_ORDER_MARK: i32 = 0xFEFF;

/// Distinguishes parser-level log events from lexer-level ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogType {
    Parse,
    Lex,
}

/// Callback sink for the engine's key-value text log events.
pub type Logger = Box<dyn FnMut(LogType, &str)>;

/// Text encodings the lexer can decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
}

/// Pull-based source of text. `read` returns the chunk of text beginning at
/// the given byte offset; an empty slice signals end of input. The lexer
/// copies each chunk, so implementations may reuse their buffers freely.
pub trait TextInput {
    fn read(&mut self, byte: u32, position: Point) -> &[u8];

    fn encoding(&self) -> InputEncoding {
        InputEncoding::Utf8
    }
}

// Byte slices read themselves in bounded chunks so that re-fetches after a
// jump stay cheap.
const SLICE_CHUNK_SIZE: usize = 4096;

impl TextInput for &[u8] {
    fn read(&mut self, byte: u32, _position: Point) -> &[u8] {
        let start = (byte as usize).min(self.len());
        let end = (start + SLICE_CHUNK_SIZE).min(self.len());
        &self[start..end]
    }
}

/// Rejection for out-of-order or overlapping included ranges; carries the
/// index of the offending range.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("included range {0} is out of order")]
pub struct IncludedRangesError(pub u32);

#[derive(Clone, Copy, Debug, Default)]
struct ColumnData {
    value: u32,
    valid: bool,
}

pub(crate) struct Lexer {
    pub(crate) current_position: Length,
    pub(crate) token_start_position: Length,
    pub(crate) token_end_position: Length,
    included_ranges: Vec<Range>,
    current_included_range_index: usize,
    chunk: Vec<u8>,
    chunk_start: u32,
    pub(crate) lookahead: i32,
    lookahead_size: u32,
    pub(crate) result_symbol: Symbol,
    column_data: ColumnData,
    encoding: InputEncoding,
    pub(crate) logger: Option<Logger>,
}

impl Lexer {
    pub(crate) fn new() -> Self {
        Lexer {
            current_position: Length::ZERO,
            token_start_position: Length::ZERO,
            token_end_position: Length::UNDEFINED,
            included_ranges: vec![Range::FULL],
            current_included_range_index: 0,
            chunk: Vec::new(),
            chunk_start: 0,
            lookahead: 0,
            lookahead_size: 0,
            result_symbol: 0,
            column_data: ColumnData::default(),
            encoding: InputEncoding::Utf8,
            logger: None,
        }
    }

    pub(crate) fn log(&mut self, log_type: LogType, message: &str) {
        if let Some(logger) = &mut self.logger {
            logger(log_type, message);
        }
    }

    fn set_column_data(&mut self, value: u32) {
        self.column_data = ColumnData { value, valid: true };
    }

    fn increment_column_data(&mut self) {
        if self.column_data.valid {
            self.column_data.value += 1;
        }
    }

    fn invalidate_column_data(&mut self) {
        self.column_data = ColumnData::default();
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.current_included_range_index == self.included_ranges.len()
    }

    fn clear_chunk(&mut self) {
        self.chunk.clear();
        self.chunk_start = 0;
    }

    /// Move to a position, snapping forward into the nearest included range.
    pub(crate) fn goto_position(&mut self, position: Length) {
        if position.bytes != self.current_position.bytes {
            self.invalidate_column_data();
        }
        self.current_position = position;

        let mut found_included_range = false;
        for (i, range) in self.included_ranges.iter().enumerate() {
            if range.end_byte > self.current_position.bytes && range.end_byte > range.start_byte {
                if range.start_byte >= self.current_position.bytes {
                    self.current_position = Length::new(range.start_byte, range.start_point);
                }
                self.current_included_range_index = i;
                found_included_range = true;
                break;
            }
        }

        if found_included_range {
            let chunk_end = self.chunk_start + self.chunk.len() as u32;
            if !self.chunk.is_empty()
                && (self.current_position.bytes < self.chunk_start
                    || self.current_position.bytes >= chunk_end)
            {
                self.clear_chunk();
            }
            self.lookahead_size = 0;
            self.lookahead = 0;
        } else {
            // Past every included range: park at the end of the last one.
            self.current_included_range_index = self.included_ranges.len();
            if let Some(last) = self.included_ranges.last() {
                self.current_position = Length::new(last.end_byte, last.end_point);
            }
            self.clear_chunk();
            self.lookahead_size = 1;
            self.lookahead = 0;
        }
    }

    pub(crate) fn reset(&mut self, position: Length) {
        if position.bytes != self.current_position.bytes {
            self.goto_position(position);
        }
    }

    /// Forget any buffered text from a previous input source.
    pub(crate) fn prepare_for_input(&mut self) {
        self.clear_chunk();
        self.lookahead = 0;
        self.lookahead_size = 0;
    }

    pub(crate) fn mark_end(&mut self) {
        if !self.at_eof() {
            // A token ending exactly at the start of an included range is
            // considered to end at the end of the previous range instead.
            let index = self.current_included_range_index;
            if index > 0 && self.current_position.bytes == self.included_ranges[index].start_byte {
                let previous = &self.included_ranges[index - 1];
                self.token_end_position = Length::new(previous.end_byte, previous.end_point);
                return;
            }
        }
        self.token_end_position = self.current_position;
    }

    pub(crate) fn finish(&mut self, lookahead_end_byte: &mut u32) {
        if self.token_end_position.is_undefined() {
            self.mark_end();
        }

        // A token that ended at an included-range boundary may have had its
        // end pulled before its recorded start.
        if self.token_end_position.bytes < self.token_start_position.bytes {
            self.token_start_position = self.token_end_position;
        }

        let mut current_lookahead_end_byte = self.current_position.bytes + 1;
        // Detecting an invalid byte sequence may have required peeking at the
        // bytes that follow it.
        if self.lookahead == DECODE_ERROR {
            current_lookahead_end_byte += 4;
        }
        if current_lookahead_end_byte > *lookahead_end_byte {
            *lookahead_end_byte = current_lookahead_end_byte;
        }
    }

    pub(crate) fn set_included_ranges(
        &mut self,
        ranges: &[Range],
    ) -> Result<(), IncludedRangesError> {
        if ranges.is_empty() {
            self.included_ranges = vec![Range::FULL];
        } else {
            let mut previous_byte = 0;
            for (i, range) in ranges.iter().enumerate() {
                if range.start_byte < previous_byte || range.end_byte < range.start_byte {
                    return Err(IncludedRangesError(i as u32));
                }
                previous_byte = range.end_byte;
            }
            self.included_ranges = ranges.to_vec();
        }
        self.goto_position(self.current_position);
        Ok(())
    }

    pub(crate) fn included_ranges(&self) -> &[Range] {
        &self.included_ranges
    }
}

/// The interface handed to grammar lex functions and external scanners: a
/// character cursor over the parser's input.
pub struct LexerRef<'a, 'i> {
    pub(crate) lexer: &'a mut Lexer,
    pub(crate) input: &'a mut (dyn TextInput + 'i),
}

impl<'a, 'i> LexerRef<'a, 'i> {
    pub(crate) fn new(lexer: &'a mut Lexer, input: &'a mut (dyn TextInput + 'i)) -> Self {
        lexer.encoding = input.encoding();
        LexerRef { lexer, input }
    }

    /// The code point under the cursor, or zero at end of input.
    pub fn lookahead(&self) -> i32 {
        self.lexer.lookahead
    }

    pub fn eof(&self) -> bool {
        self.lexer.at_eof()
    }

    /// Record which symbol the scan produced.
    pub fn set_result(&mut self, symbol: Symbol) {
        self.lexer.result_symbol = symbol;
    }

    /// Mark the current position as the end of the token being scanned.
    /// Further `advance` calls become lookahead beyond the token.
    pub fn mark_end(&mut self) {
        self.lexer.mark_end();
    }

    pub fn is_at_included_range_start(&self) -> bool {
        match self
            .lexer
            .included_ranges
            .get(self.lexer.current_included_range_index)
        {
            Some(range) => self.lexer.current_position.bytes == range.start_byte,
            None => false,
        }
    }

    /// Consume the current character. With `skip`, the character is treated
    /// as preceding whitespace and the token start moves past it.
    pub fn advance(&mut self, skip: bool) {
        if self.lexer.chunk.is_empty() {
            return;
        }

        let character = self.lexer.lookahead;
        if self.lexer.logger.is_some() {
            let printable = (32..127).contains(&character);
            let message = match (skip, printable) {
                (true, true) => format!("skip character:'{}'", character as u8 as char),
                (true, false) => format!("skip character:{character}"),
                (false, true) => format!("consume character:'{}'", character as u8 as char),
                (false, false) => format!("consume character:{character}"),
            };
            self.lexer.log(LogType::Lex, &message);
        }
        trace!(target: "arbor::lex", character, skip, "advance");

        self.do_advance(skip);
    }

    /// The column of the current position, counted in characters from the
    /// start of the row. May re-read the current line.
    pub fn get_column(&mut self) -> u32 {
        if !self.lexer.column_data.valid {
            let goal_byte = self.lexer.current_position.bytes;
            let start_of_row = Length::new(
                self.lexer.current_position.bytes - self.lexer.current_position.extent.column,
                Point::new(self.lexer.current_position.extent.row, 0),
            );
            self.lexer.goto_position(start_of_row);
            self.lexer.set_column_data(0);
            self.get_chunk();

            if !self.lexer.at_eof() {
                self.get_lookahead();
                while self.lexer.current_position.bytes < goal_byte
                    && !self.lexer.at_eof()
                    && !self.lexer.chunk.is_empty()
                {
                    self.do_advance(false);
                }
            }
        }

        self.lexer.column_data.value
    }

    /// Prepare to scan a token at the current position.
    pub(crate) fn start(&mut self) {
        self.lexer.token_start_position = self.lexer.current_position;
        self.lexer.token_end_position = Length::UNDEFINED;
        self.lexer.result_symbol = 0;
        if !self.lexer.at_eof() {
            if self.lexer.chunk.is_empty() {
                self.get_chunk();
            }
            if self.lexer.lookahead_size == 0 {
                self.get_lookahead();
            }
            if self.lexer.current_position.bytes == 0 {
                if self.lexer.lookahead == BYTE_ORDER_MARK {
                    self.advance(true);
                }
                self.lexer.set_column_data(0);
            }
        }
    }

    fn get_chunk(&mut self) {
        self.lexer.chunk_start = self.lexer.current_position.bytes;
        let chunk = self.input.read(
            self.lexer.current_position.bytes,
            self.lexer.current_position.extent,
        );
        if chunk.is_empty() {
            self.lexer.current_included_range_index = self.lexer.included_ranges.len();
            self.lexer.chunk.clear();
        } else {
            self.lexer.chunk.clear();
            self.lexer.chunk.extend_from_slice(chunk);
        }
    }

    fn get_lookahead(&mut self) {
        let position_in_chunk = (self.lexer.current_position.bytes - self.lexer.chunk_start) as usize;
        if position_in_chunk >= self.lexer.chunk.len() {
            self.lexer.lookahead_size = 1;
            self.lexer.lookahead = 0;
            return;
        }

        let decode = match self.lexer.encoding {
            InputEncoding::Utf8 => decode_utf8,
            InputEncoding::Utf16Le => decode_utf16_le,
            InputEncoding::Utf16Be => decode_utf16_be,
        };

        let (size, code_point) = decode(&self.lexer.chunk[position_in_chunk..]);
        self.lexer.lookahead_size = size;
        self.lexer.lookahead = code_point;

        // The chunk may have ended mid-character; retry with a fresh chunk
        // that starts at the current position.
        if self.lexer.lookahead == DECODE_ERROR
            && self.lexer.chunk.len() - position_in_chunk < 4
        {
            self.get_chunk();
            if !self.lexer.chunk.is_empty() {
                let (size, code_point) = decode(&self.lexer.chunk);
                self.lexer.lookahead_size = size;
                self.lexer.lookahead = code_point;
            }
        }

        if self.lexer.lookahead == DECODE_ERROR {
            self.lexer.lookahead_size = 1;
        }
    }

    fn do_advance(&mut self, skip: bool) {
        if self.lexer.lookahead_size != 0 {
            if self.lexer.lookahead == i32::from(b'\n') {
                self.lexer.current_position.extent.row += 1;
                self.lexer.current_position.extent.column = 0;
                self.lexer.set_column_data(0);
            } else {
                let is_bom = self.lexer.current_position.bytes == 0
                    && self.lexer.lookahead == BYTE_ORDER_MARK;
                if !is_bom {
                    self.lexer.increment_column_data();
                }
                self.lexer.current_position.extent.column += self.lexer.lookahead_size;
            }
            self.lexer.current_position.bytes += self.lexer.lookahead_size;
        }

        // Step across included-range boundaries.
        let mut in_range = true;
        loop {
            match self
                .lexer
                .included_ranges
                .get(self.lexer.current_included_range_index)
            {
                None => {
                    in_range = false;
                    break;
                }
                Some(range)
                    if self.lexer.current_position.bytes < range.end_byte
                        && range.end_byte > range.start_byte =>
                {
                    break;
                }
                Some(_) => {
                    self.lexer.current_included_range_index += 1;
                    match self
                        .lexer
                        .included_ranges
                        .get(self.lexer.current_included_range_index)
                    {
                        Some(next) => {
                            self.lexer.current_position =
                                Length::new(next.start_byte, next.start_point);
                        }
                        None => {
                            in_range = false;
                            break;
                        }
                    }
                }
            }
        }

        if skip {
            self.lexer.token_start_position = self.lexer.current_position;
        }

        if in_range {
            let chunk_end = self.lexer.chunk_start + self.lexer.chunk.len() as u32;
            if self.lexer.current_position.bytes < self.lexer.chunk_start
                || self.lexer.current_position.bytes >= chunk_end
            {
                self.get_chunk();
            }
            self.get_lookahead();
        } else {
            self.lexer.clear_chunk();
            self.lexer.lookahead = 0;
            self.lexer.lookahead_size = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance_all(lexer: &mut Lexer, text: &[u8]) -> Vec<(i32, u32)> {
        let mut input: &[u8] = text;
        let mut cursor = LexerRef::new(lexer, &mut input);
        cursor.start();
        let mut seen = Vec::new();
        while !cursor.eof() && cursor.lookahead() != 0 {
            seen.push((cursor.lookahead(), cursor.lexer.current_position.bytes));
            cursor.advance(false);
        }
        seen
    }

    #[test]
    fn advances_through_multibyte_text() {
        let mut lexer = Lexer::new();
        let seen = advance_all(&mut lexer, "aé€".as_bytes());
        assert_eq!(
            seen,
            vec![('a' as i32, 0), ('é' as i32, 1), ('€' as i32, 3)]
        );
        assert_eq!(lexer.current_position.bytes, 6);
    }

    #[test]
    fn newline_resets_column() {
        let mut lexer = Lexer::new();
        advance_all(&mut lexer, b"ab\ncd");
        assert_eq!(lexer.current_position.extent, Point::new(1, 2));
    }

    #[test]
    fn included_ranges_skip_excluded_text() {
        let mut lexer = Lexer::new();
        lexer
            .set_included_ranges(&[
                Range {
                    start_byte: 0,
                    end_byte: 2,
                    start_point: Point::new(0, 0),
                    end_point: Point::new(0, 2),
                },
                Range {
                    start_byte: 4,
                    end_byte: 6,
                    start_point: Point::new(0, 4),
                    end_point: Point::new(0, 6),
                },
            ])
            .unwrap();
        let seen = advance_all(&mut lexer, b"abXXcd");
        let characters: Vec<i32> = seen.iter().map(|(c, _)| *c).collect();
        assert_eq!(
            characters,
            vec!['a' as i32, 'b' as i32, 'c' as i32, 'd' as i32]
        );
    }

    #[test]
    fn rejects_out_of_order_ranges() {
        let mut lexer = Lexer::new();
        let result = lexer.set_included_ranges(&[
            Range {
                start_byte: 4,
                end_byte: 6,
                start_point: Point::new(0, 4),
                end_point: Point::new(0, 6),
            },
            Range {
                start_byte: 0,
                end_byte: 2,
                start_point: Point::new(0, 0),
                end_point: Point::new(0, 2),
            },
        ]);
        assert_eq!(result, Err(IncludedRangesError(1)));
    }

    #[test]
    fn get_column_counts_from_row_start() {
        let mut lexer = Lexer::new();
        let text = b"ab\ncde";
        {
            let mut input: &[u8] = text;
            let mut cursor = LexerRef::new(&mut lexer, &mut input);
            cursor.start();
            for _ in 0..5 {
                cursor.advance(false);
            }
            assert_eq!(cursor.get_column(), 2);
        }
    }
}
