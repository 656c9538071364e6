//! Stream framing for multi-frame messages.
//!
//! A message is written as a big-endian `u32` frame count, followed by each
//! frame as a big-endian `u32` length and the frame bytes. Decoded frames are
//! zero-copy slices of the read buffer.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{CodecError, Frames};

const HEADER_LEN: usize = std::mem::size_of::<u32>();

/// Upper bound on the number of frames in one message.
pub const MAX_FRAMES: usize = 16;

/// Upper bound on the size of one frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encodes [`Frames`] into a byte stream, and decodes them back.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Scan the buffered bytes for one complete message.
    ///
    /// Returns the total message length, or the number of bytes needed before
    /// another attempt is worthwhile.
    fn scan(src: &[u8]) -> Result<Scan, CodecError> {
        let mut cursor = src;
        if cursor.remaining() < HEADER_LEN {
            return Ok(Scan::Incomplete(HEADER_LEN));
        }

        let count = cursor.get_u32() as usize;
        if count == 0 {
            return Err(CodecError::Empty);
        }
        if count > MAX_FRAMES {
            return Err(CodecError::TooManyFrames(count));
        }

        let mut total = HEADER_LEN;
        for _ in 0..count {
            if cursor.remaining() < HEADER_LEN {
                return Ok(Scan::Incomplete(total + HEADER_LEN));
            }
            let len = cursor.get_u32() as usize;
            if len > MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLarge(len));
            }
            total += HEADER_LEN + len;
            if cursor.remaining() < len {
                return Ok(Scan::Incomplete(total));
            }
            cursor.advance(len);
        }

        Ok(Scan::Complete { total, count })
    }
}

enum Scan {
    Incomplete(usize),
    Complete { total: usize, count: usize },
}

impl Decoder for FrameCodec {
    type Item = Frames;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frames>, CodecError> {
        let (total, count) = match Self::scan(src)? {
            Scan::Incomplete(needed) => {
                src.reserve(needed.saturating_sub(src.len()));
                return Ok(None);
            }
            Scan::Complete { total, count } => (total, count),
        };

        let mut message = src.split_to(total).freeze();
        message.advance(HEADER_LEN);

        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = message.get_u32() as usize;
            frames.push(message.split_to(len));
        }
        Ok(Some(frames))
    }
}

impl Encoder<Frames> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frames: Frames, dst: &mut BytesMut) -> Result<(), CodecError> {
        if frames.is_empty() {
            return Err(CodecError::Empty);
        }
        if frames.len() > MAX_FRAMES {
            return Err(CodecError::TooManyFrames(frames.len()));
        }
        if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_LEN) {
            return Err(CodecError::FrameTooLarge(frame.len()));
        }

        let size = HEADER_LEN + frames.iter().map(|f| HEADER_LEN + f.len()).sum::<usize>();
        dst.reserve(size);
        dst.put_u32(frames.len() as u32);
        for frame in &frames {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(frame);
        }
        Ok(())
    }
}
