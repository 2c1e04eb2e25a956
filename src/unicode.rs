//! Character decoding for the lexer's supported input encodings.
//!
//! Each decoder consumes at most one code point from the front of a byte
//! slice and reports `(bytes_consumed, code_point)`. A malformed sequence
//! yields [`DECODE_ERROR`] with a consumed length of one byte, so the lexer
//! always makes progress over garbage input.

/// Code point reported for undecodable byte sequences.
pub(crate) const DECODE_ERROR: i32 = -1;

pub(crate) fn decode_utf8(bytes: &[u8]) -> (u32, i32) {
    let Some(&lead) = bytes.first() else {
        return (0, DECODE_ERROR);
    };
    if lead < 0x80 {
        return (1, i32::from(lead));
    }
    let len = match lead {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return (1, DECODE_ERROR),
    };
    if bytes.len() < len {
        return (1, DECODE_ERROR);
    }
    match std::str::from_utf8(&bytes[..len]) {
        Ok(text) => match text.chars().next() {
            Some(ch) => (len as u32, ch as i32),
            None => (1, DECODE_ERROR),
        },
        Err(_) => (1, DECODE_ERROR),
    }
}

pub(crate) fn decode_utf16_le(bytes: &[u8]) -> (u32, i32) {
    decode_utf16(bytes, u16::from_le_bytes)
}

pub(crate) fn decode_utf16_be(bytes: &[u8]) -> (u32, i32) {
    decode_utf16(bytes, u16::from_be_bytes)
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> (u32, i32) {
    if bytes.len() < 2 {
        return (0, DECODE_ERROR);
    }
    let first = unit([bytes[0], bytes[1]]);
    if !(0xD800..=0xDFFF).contains(&first) {
        return (2, i32::from(first));
    }
    // Lead surrogate: a valid trail surrogate must follow.
    if (0xD800..=0xDBFF).contains(&first) && bytes.len() >= 4 {
        let second = unit([bytes[2], bytes[3]]);
        if (0xDC00..=0xDFFF).contains(&second) {
            let code_point =
                0x10000 + ((i32::from(first) - 0xD800) << 10) + (i32::from(second) - 0xDC00);
            return (4, code_point);
        }
    }
    (2, DECODE_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_and_multibyte_utf8() {
        assert_eq!(decode_utf8(b"a"), (1, 'a' as i32));
        assert_eq!(decode_utf8("é".as_bytes()), (2, 'é' as i32));
        assert_eq!(decode_utf8("€".as_bytes()), (3, '€' as i32));
        assert_eq!(decode_utf8("𝄞".as_bytes()), (4, '𝄞' as i32));
    }

    #[test]
    fn invalid_utf8_consumes_one_byte() {
        assert_eq!(decode_utf8(&[0xFF, b'a']), (1, DECODE_ERROR));
        // Truncated sequence.
        assert_eq!(decode_utf8(&[0xE2, 0x82]), (1, DECODE_ERROR));
    }

    #[test]
    fn utf16_surrogate_pairs() {
        let bytes: Vec<u8> = "𝄞".encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(decode_utf16_le(&bytes), (4, '𝄞' as i32));
        let bytes: Vec<u8> = "𝄞".encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(decode_utf16_be(&bytes), (4, '𝄞' as i32));
    }
}
