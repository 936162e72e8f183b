//! Byte-buffering helper for Server-Sent Events streams.
//!
//! Network chunks can split a multi-byte UTF-8 character, or a `data: ...\n\n`
//! frame, across two reads. This buffer accumulates bytes and only hands back
//! complete lines, so callers never see a half-decoded character.

use bytes::{BufMut, BytesMut};

use rag_core::Error;

/// Default cap on buffered-but-unparsed SSE bytes before a stream is
/// considered stuck and torn down.
const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub struct SseBuffer {
    buffer: BytesMut,
    max_capacity: usize,
}

impl Default for SseBuffer {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            max_capacity: MAX_BUFFER_BYTES,
        }
    }
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw bytes in and get back whatever is now valid UTF-8 text.
    /// Bytes that form an incomplete trailing character stay buffered for
    /// the next call.
    pub fn push_and_get_text(&mut self, bytes: &[u8]) -> Result<String, Error> {
        if self.buffer.len() + bytes.len() > self.max_capacity {
            return Err(Error::StreamInterrupted(format!(
                "SSE buffer exceeded max capacity of {} bytes",
                self.max_capacity
            )));
        }
        self.buffer.put_slice(bytes);

        match std::str::from_utf8(self.buffer.as_ref()) {
            Ok(s) => {
                let text = s.to_string();
                self.buffer.clear();
                Ok(text)
            }
            Err(err) => {
                let valid_len = err.valid_up_to();
                let valid_bytes = self.buffer.split_to(valid_len);
                Ok(String::from_utf8_lossy(&valid_bytes).to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_utf8_character_waits_for_next_chunk() {
        let mut buffer = SseBuffer::new();
        // "心" in UTF-8 is [0xE5, 0xBF, 0x83]
        let text1 = buffer.push_and_get_text(&[0xE5, 0xBF]).unwrap();
        assert_eq!(text1, "");
        let text2 = buffer.push_and_get_text(&[0x83]).unwrap();
        assert_eq!(text2, "心");
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buffer = SseBuffer {
            buffer: BytesMut::new(),
            max_capacity: 10,
        };
        let data = vec![0u8; 11];
        assert!(buffer.push_and_get_text(&data).is_err());
    }
}
