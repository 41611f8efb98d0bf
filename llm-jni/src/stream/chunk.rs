//! Accumulator for streamed output and the rule for when to hand it over.

/// Buffers at least this long are flushed regardless of content.
pub const FLUSH_THRESHOLD: usize = 16;

const ASCII_TERMINATORS: [u8; 4] = [b'.', b'!', b'?', b'\n'];

/// Full-width `。` `！` `？` in UTF-8.
const WIDE_TERMINATORS: [[u8; 3]; 3] = [
    [0xE3, 0x80, 0x82],
    [0xEF, 0xBC, 0x81],
    [0xEF, 0xBC, 0x9F],
];

/// Whether `buffer`, which just had `written` appended, should be flushed.
pub fn should_flush(buffer: &[u8], written: &[u8]) -> bool {
    if buffer.len() >= FLUSH_THRESHOLD {
        return true;
    }
    if written.iter().any(|b| ASCII_TERMINATORS.contains(b)) {
        return true;
    }
    match buffer {
        [.., a, b, c] => WIDE_TERMINATORS.contains(&[*a, *b, *c]),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct ChunkBuffer {
    bytes: Vec<u8>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends and reports whether the buffer is now due for a flush.
    pub fn push(&mut self, written: &[u8]) -> bool {
        self.bytes.extend_from_slice(written);
        should_flush(&self.bytes, written)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Text that can be delivered now.
    ///
    /// An incomplete UTF-8 sequence at the very end stays behind for the next
    /// chunk. Invalid bytes anywhere else are replaced with U+FFFD.
    pub fn peek_text(&self) -> (String, usize) {
        match std::str::from_utf8(&self.bytes) {
            Ok(text) => (text.to_owned(), self.bytes.len()),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                (String::from_utf8_lossy(&self.bytes[..valid]).into_owned(), valid)
            }
            Err(_) => (String::from_utf8_lossy(&self.bytes).into_owned(), self.bytes.len()),
        }
    }

    /// Everything left, lossily decoded. Used once generation is over.
    pub fn peek_all(&self) -> (String, usize) {
        (String::from_utf8_lossy(&self.bytes).into_owned(), self.bytes.len())
    }

    /// Drops the first `consumed` bytes, as reported by a `peek_*` call.
    pub fn consume(&mut self, consumed: usize) {
        self.bytes.drain(..consumed.min(self.bytes.len()));
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixteen_letters_flush_once() {
        let mut buffer = ChunkBuffer::new();
        let letters = b"abcdefghijklmnop";
        let mut flushes = Vec::new();
        for (i, letter) in letters.iter().enumerate() {
            if buffer.push(std::slice::from_ref(letter)) {
                flushes.push(i);
            }
        }
        assert_eq!(flushes, vec![15]);
        assert_eq!(buffer.peek_text().0, "abcdefghijklmnop");
    }

    #[test]
    fn test_lone_terminators_flush() {
        for t in ["\n", ".", "!", "?"] {
            assert!(should_flush(t.as_bytes(), t.as_bytes()), "{:?}", t);
        }
        assert!(!should_flush(b"a", b"a"));
        assert!(!should_flush(b",", b","));
    }

    #[test]
    fn test_terminator_only_counts_in_new_bytes() {
        // the '.' was flushed already, so only the new write is scanned
        assert!(!should_flush(b"ok. next", b" next"));
        assert!(should_flush(b"ok. next.", b"."));
    }

    #[test]
    fn test_wide_terminators_flush() {
        for t in ["。", "！", "？"] {
            let buffer = format!("好{}", t);
            assert!(should_flush(buffer.as_bytes(), t.as_bytes()), "{}", t);
        }
        // arbitrary 3-byte sequences do not
        assert!(!should_flush("好".as_bytes(), "好".as_bytes()));
        assert!(!should_flush("，".as_bytes(), "，".as_bytes()));
        assert!(!should_flush(&[0xEF, 0xBC, 0x82], &[0xEF, 0xBC, 0x82]));
    }

    #[test]
    fn test_wide_terminator_split_across_writes() {
        let mut buffer = ChunkBuffer::new();
        let period = "。".as_bytes();
        assert!(!buffer.push(&period[..1]));
        assert!(!buffer.push(&period[1..2]));
        assert!(buffer.push(&period[2..]));
    }

    #[test]
    fn test_threshold_and_punctuation_flush_once() {
        let mut buffer = ChunkBuffer::new();
        assert!(!buffer.push(b"fifteen letters"));
        assert!(buffer.push(b"."));
    }

    #[test]
    fn test_incomplete_tail_is_carried() {
        let mut buffer = ChunkBuffer::new();
        let word = "ab好".as_bytes();
        buffer.push(&word[..3]);

        let (text, consumed) = buffer.peek_text();
        assert_eq!(text, "ab");
        buffer.consume(consumed);
        assert_eq!(buffer.len(), 1);

        buffer.push(&word[3..]);
        assert_eq!(buffer.peek_text().0, "好");
    }

    #[test]
    fn test_peek_all_is_lossy() {
        let mut buffer = ChunkBuffer::new();
        buffer.push(&[b'x', 0xE3, 0x80]);
        let (text, consumed) = buffer.peek_all();
        assert_eq!(consumed, 3);
        assert!(text.starts_with('x'));
        assert!(text.contains('\u{FFFD}'));
    }
}
