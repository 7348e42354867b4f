//! Message framing for the terminator-delimited text protocol
//!
//! Frames are text; fields inside a frame are split by [`SEPARATOR`] and
//! frames are split from each other by [`TERMINATOR`]. Both are reserved
//! control bytes that never appear inside a field.

use crate::config::TextEncoding;

/// Field separator inside one message
pub const SEPARATOR: u8 = 0x1F;
/// Frame terminator between messages
pub const TERMINATOR: u8 = 0x1E;
/// Keep-alive frame: a bare terminator
pub const POKE: [u8; 1] = [TERMINATOR];

/// Errors that can occur while reassembling frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Frame too large: {0} bytes pending (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("Frame is not valid {0:?} text")]
    Encoding(TextEncoding),
}

/// Append the terminator to a formatted message
pub fn encode_frame(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(TERMINATOR);
    bytes
}

/// True if the text contains one of the reserved bytes
#[inline]
pub fn contains_reserved(text: &str) -> bool {
    text.bytes().any(|b| b == SEPARATOR || b == TERMINATOR)
}

/// Per-transport reassembly state
///
/// Holds the bytes of the pending partial frame. Everything up to and
/// including a terminator is parsed; anything after it stays for the next read.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: Vec<u8>,
    encoding: TextEncoding,
    max_frame: usize,
}

impl FrameBuffer {
    pub fn new(encoding: TextEncoding, max_frame: usize) -> Self {
        Self {
            pending: Vec::with_capacity(256),
            encoding,
            max_frame,
        }
    }

    /// Feed raw bytes and collect every frame they complete
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, FramingError>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == TERMINATOR) {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let frame = if self.pending.is_empty() {
                self.decode(head)
            } else {
                self.pending.extend_from_slice(head);
                let bytes = std::mem::take(&mut self.pending);
                self.decode(&bytes)
            };

            match frame {
                // Pokes carry nothing
                Ok(text) if text.is_empty() => {}
                other => frames.push(other),
            }
        }

        if !rest.is_empty() {
            if self.pending.len() + rest.len() > self.max_frame {
                let size = self.pending.len() + rest.len();
                self.pending.clear();
                frames.push(Err(FramingError::FrameTooLarge(size, self.max_frame)));
            } else {
                self.pending.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Bytes waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, FramingError> {
        if bytes.len() > self.max_frame {
            return Err(FramingError::FrameTooLarge(bytes.len(), self.max_frame));
        }
        if self.encoding == TextEncoding::Ascii && !bytes.is_ascii() {
            return Err(FramingError::Encoding(self.encoding));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| FramingError::Encoding(self.encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn buffer() -> FrameBuffer {
        FrameBuffer::new(TextEncoding::Utf8, 1024)
    }

    fn ok_frames(results: Vec<Result<String, FramingError>>) -> Vec<String> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_single_frame() {
        let mut buf = buffer();
        let frames = ok_frames(buf.push(&encode_frame("World\x1fMove")));
        assert_eq!(frames, vec!["World\x1fMove".to_string()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut buf = buffer();
        assert!(buf.push(b"Wor").is_empty());
        assert_eq!(buf.pending_len(), 3);

        let frames = ok_frames(buf.push(b"ld\x1eNext"));
        assert_eq!(frames, vec!["World".to_string()]);
        assert_eq!(buf.pending_len(), 4);
    }

    #[test]
    fn test_poke_is_skipped() {
        let mut buf = buffer();
        let mut bytes = POKE.to_vec();
        bytes.extend(encode_frame("a"));
        bytes.extend_from_slice(&POKE);
        assert_eq!(ok_frames(buf.push(&bytes)), vec!["a".to_string()]);
    }

    #[test]
    fn test_arbitrary_chunking_preserves_sequence() {
        let messages: Vec<String> = (0..50)
            .map(|i| format!("Kind{}\x1fmethod\x1fAAAAAAAAAAA=\x1farg-{}-é", i % 3, i))
            .collect();
        let stream: Vec<u8> = messages.iter().flat_map(|m| encode_frame(m)).collect();

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut buf = buffer();
            let mut out = Vec::new();
            let mut offset = 0;
            while offset < stream.len() {
                let size = rng.gen_range(1..=17).min(stream.len() - offset);
                out.extend(ok_frames(buf.push(&stream[offset..offset + size])));
                offset += size;
            }
            assert_eq!(out, messages);
            assert_eq!(buf.pending_len(), 0);
        }
    }

    #[test]
    fn test_invalid_utf8_drops_only_that_frame() {
        let mut buf = buffer();
        let mut bytes = vec![0xFF, 0xFE, TERMINATOR];
        bytes.extend(encode_frame("ok"));
        let results = buf.push(&bytes);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(FramingError::Encoding(_))));
        assert_eq!(results[1].as_deref(), Ok("ok"));
    }

    #[test]
    fn test_ascii_mode_rejects_multibyte() {
        let mut buf = FrameBuffer::new(TextEncoding::Ascii, 1024);
        let results = buf.push(&encode_frame("héllo"));
        assert!(matches!(results[0], Err(FramingError::Encoding(TextEncoding::Ascii))));
    }

    #[test]
    fn test_oversized_partial_frame_is_discarded() {
        let mut buf = FrameBuffer::new(TextEncoding::Utf8, 8);
        let results = buf.push(b"0123456789");
        assert!(matches!(results[0], Err(FramingError::FrameTooLarge(10, 8))));
        assert_eq!(buf.pending_len(), 0);

        // Buffer keeps working afterwards
        assert_eq!(ok_frames(buf.push(&encode_frame("ok"))), vec!["ok".to_string()]);
    }

    #[test]
    fn test_contains_reserved() {
        assert!(contains_reserved("a\x1fb"));
        assert!(contains_reserved("a\x1e"));
        assert!(!contains_reserved("plain text"));
    }
}
