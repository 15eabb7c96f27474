//! UTF-8 utilities for the tokenizer and streaming layers
//!
//! Byte-level codepoint iteration (the segmenter works on byte offsets, not
//! `char` indices), Unicode whitespace classification for pretokenization,
//! and lossy sanitization for tokens that cross the SSE boundary.

/// Decode one UTF-8 codepoint starting at `pos`.
///
/// Returns `(codepoint, length_in_bytes)`, or `None` when the bytes at `pos`
/// are not a valid sequence (including truncation at end of input). Callers
/// advance one byte on `None` so scanning always terminates.
#[must_use]
pub fn next_codepoint(s: &[u8], pos: usize) -> Option<(u32, usize)> {
    let c0 = *s.get(pos)?;
    if c0 < 0x80 {
        return Some((u32::from(c0), 1));
    }
    if c0 >> 5 == 0b110 {
        let c1 = *s.get(pos + 1)?;
        if c1 & 0xC0 != 0x80 {
            return None;
        }
        let cp = (u32::from(c0 & 0x1F) << 6) | u32::from(c1 & 0x3F);
        return Some((cp, 2));
    }
    if c0 >> 4 == 0b1110 {
        let c1 = *s.get(pos + 1)?;
        let c2 = *s.get(pos + 2)?;
        if c1 & 0xC0 != 0x80 || c2 & 0xC0 != 0x80 {
            return None;
        }
        let cp = (u32::from(c0 & 0x0F) << 12) | (u32::from(c1 & 0x3F) << 6) | u32::from(c2 & 0x3F);
        return Some((cp, 3));
    }
    if c0 >> 3 == 0b11110 {
        let c1 = *s.get(pos + 1)?;
        let c2 = *s.get(pos + 2)?;
        let c3 = *s.get(pos + 3)?;
        if c1 & 0xC0 != 0x80 || c2 & 0xC0 != 0x80 || c3 & 0xC0 != 0x80 {
            return None;
        }
        let cp = (u32::from(c0 & 0x07) << 18)
            | (u32::from(c1 & 0x3F) << 12)
            | (u32::from(c2 & 0x3F) << 6)
            | u32::from(c3 & 0x3F);
        return Some((cp, 4));
    }
    None
}

/// Length in bytes of the codepoint at `pos`, or 1 for malformed bytes.
#[must_use]
pub fn codepoint_len_lossy(s: &[u8], pos: usize) -> usize {
    next_codepoint(s, pos).map_or(1, |(_, len)| len)
}

/// ASCII whitespace per the pretokenizer: space, tab, LF, CR, FF, VT.
#[must_use]
pub fn is_ascii_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | b'\x0C' | b'\x0B')
}

/// Unicode whitespace per the pretokenizer.
///
/// ASCII whitespace plus `U+00A0`, `U+1680`, `U+2000..U+200A`, `U+2028`,
/// `U+2029`, `U+202F`, `U+205F`, `U+3000`.
#[must_use]
pub fn is_unicode_space(cp: u32) -> bool {
    if cp <= 0x7F {
        return is_ascii_space(cp as u8);
    }
    matches!(
        cp,
        0x00A0 | 0x1680 | 0x2000..=0x200A | 0x2028 | 0x2029 | 0x202F | 0x205F | 0x3000
    )
}

/// Replace malformed UTF-8 sequences with `U+FFFD`.
///
/// Tokens emitted by a byte-level model may split multi-byte codepoints;
/// this keeps JSON encoding from failing mid-stream.
#[must_use]
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_codepoints() {
        assert_eq!(next_codepoint(b"abc", 0), Some((u32::from(b'a'), 1)));
        assert_eq!(next_codepoint(b"abc", 2), Some((u32::from(b'c'), 1)));
        assert_eq!(next_codepoint(b"abc", 3), None);
    }

    #[test]
    fn test_multibyte_codepoints() {
        let s = "é世🎉".as_bytes();
        assert_eq!(next_codepoint(s, 0), Some((0xE9, 2)));
        assert_eq!(next_codepoint(s, 2), Some((0x4E16, 3)));
        assert_eq!(next_codepoint(s, 5), Some((0x1F389, 4)));
    }

    #[test]
    fn test_malformed_sequences() {
        // Lone continuation byte
        assert_eq!(next_codepoint(&[0x80], 0), None);
        // Truncated two-byte sequence
        assert_eq!(next_codepoint(&[0xC3], 0), None);
        // Bad continuation
        assert_eq!(next_codepoint(&[0xE4, 0x41, 0x41], 0), None);
        assert_eq!(codepoint_len_lossy(&[0x80], 0), 1);
    }

    #[test]
    fn test_whitespace_classification() {
        assert!(is_unicode_space(u32::from(b' ')));
        assert!(is_unicode_space(u32::from(b'\t')));
        assert!(is_unicode_space(0x00A0));
        assert!(is_unicode_space(0x2003));
        assert!(is_unicode_space(0x3000));
        assert!(!is_unicode_space(u32::from(b'a')));
        assert!(!is_unicode_space(0x2581)); // the sentinel itself is not whitespace
        assert!(!is_unicode_space(0x200B)); // zero-width space is excluded
    }

    #[test]
    fn test_sanitize_replaces_malformed() {
        let out = sanitize_utf8(&[b'h', b'i', 0xFF]);
        assert_eq!(out, "hi\u{FFFD}");
        assert_eq!(sanitize_utf8("ok".as_bytes()), "ok");
    }
}
