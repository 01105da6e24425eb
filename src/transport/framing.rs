//! Length-prefixed framing over a byte stream.
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────────┐
//! │ length: u32 (BE)     │ payload: `length` bytes       │
//! └──────────────────────┴───────────────────────────────┘
//! ```
//!
//! TCP delivers bytes, not messages: one read may hold half a frame or
//! several frames. [`FrameAssembler`] buffers whatever arrives and hands
//! back every frame that is complete, keeping the remainder for the next
//! read.

use thiserror::Error;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let len = u32::try_from(payload.len()).map_err(|_| FramingError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Per-connection reassembly buffer. Owned by the reading thread.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_frame_len: usize,
    violation: Option<FramingError>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameAssembler {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
            violation: None,
        }
    }

    /// Append `bytes` and extract every complete frame, in order.
    ///
    /// A declared length above the limit is a protocol violation; the
    /// stream cannot be resynchronised after it. Frames completed before
    /// the bad prefix are still returned, and the violation is kept: check
    /// [`violation`](Self::violation) after handling them. Once violated,
    /// every later call returns the error.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        if let Some(err) = &self.violation {
            return Err(err.clone());
        }
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.buffer.len() - offset >= LENGTH_PREFIX {
            let mut prefix = [0u8; LENGTH_PREFIX];
            prefix.copy_from_slice(&self.buffer[offset..offset + LENGTH_PREFIX]);
            let len = u32::from_be_bytes(prefix) as usize;

            if len > self.max_frame_len {
                let err = FramingError::TooLarge {
                    len,
                    max: self.max_frame_len,
                };
                self.buffer.clear();
                self.violation = Some(err.clone());
                if frames.is_empty() {
                    return Err(err);
                }
                return Ok(frames);
            }

            let start = offset + LENGTH_PREFIX;
            if self.buffer.len() - start < len {
                break;
            }
            frames.push(self.buffer[start..start + len].to_vec());
            offset = start + len;
        }

        self.buffer.drain(..offset);
        Ok(frames)
    }

    /// The protocol violation that ended this stream, if any.
    pub fn violation(&self) -> Option<&FramingError> {
        self.violation.as_ref()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prefix_is_big_endian() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(frame, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn frame_split_across_reads() {
        let frame = encode_frame(b"hello world").unwrap();
        let mut assembler = FrameAssembler::default();

        assert!(assembler.push(&frame[..2]).unwrap().is_empty());
        assert!(assembler.push(&frame[2..7]).unwrap().is_empty());
        assert_eq!(assembler.buffered(), 7);

        let frames = assembler.push(&frame[7..]).unwrap();
        assert_eq!(frames, vec![b"hello world".to_vec()]);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn several_frames_in_one_read_keep_the_remainder() {
        let mut bytes = encode_frame(b"one").unwrap();
        bytes.extend(encode_frame(b"two").unwrap());
        let third = encode_frame(b"three").unwrap();
        bytes.extend_from_slice(&third[..5]);

        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(&bytes).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(assembler.buffered(), 5);

        let frames = assembler.push(&third[5..]).unwrap();
        assert_eq!(frames, vec![b"three".to_vec()]);
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(&encode_frame(&[]).unwrap()).unwrap();
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut assembler = FrameAssembler::new(8);
        let err = assembler.push(&encode_frame(&[0u8; 9]).unwrap()).unwrap_err();
        assert_eq!(err, FramingError::TooLarge { len: 9, max: 8 });
        assert_eq!(assembler.violation(), Some(&err));
    }

    #[test]
    fn frames_before_an_oversized_prefix_are_kept() {
        let mut bytes = encode_frame(b"ok").unwrap();
        bytes.extend(encode_frame(&[0u8; 9]).unwrap());

        let mut assembler = FrameAssembler::new(8);
        let frames = assembler.push(&bytes).unwrap();
        assert_eq!(frames, vec![b"ok".to_vec()]);

        let expected = FramingError::TooLarge { len: 9, max: 8 };
        assert_eq!(assembler.violation(), Some(&expected));
        assert_eq!(assembler.buffered(), 0);
        assert_eq!(assembler.push(&encode_frame(b"late").unwrap()), Err(expected));
    }

    proptest! {
        #[test]
        fn any_chunking_yields_the_same_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..12),
            chunk in 1usize..64,
        ) {
            let mut stream = Vec::new();
            for payload in &payloads {
                stream.extend(encode_frame(payload).unwrap());
            }

            let mut assembler = FrameAssembler::default();
            let mut frames = Vec::new();
            for piece in stream.chunks(chunk) {
                frames.extend(assembler.push(piece).unwrap());
            }

            prop_assert_eq!(frames, payloads);
            prop_assert_eq!(assembler.buffered(), 0);
        }
    }
}
