#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

fn check_len(len: usize, max_frame_size: usize) -> Result<(), FramingError> {
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(())
}

fn peek_len(src: &[u8]) -> Option<usize> {
	let prefix: [u8; PREFIX_LEN] = src.get(..PREFIX_LEN)?.try_into().ok()?;
	Some(u32::from_be_bytes(prefix) as usize)
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	let mut out = Vec::with_capacity(PREFIX_LEN + payload_len);
	out.put_u32(payload_len as u32);
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode a single frame from the start of `src`, returning the message and
/// the number of bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = peek_len(src) else {
		return Err(FramingError::InsufficientData {
			need: PREFIX_LEN,
			have: src.len(),
		});
	};
	check_len(len, max_frame_size)?;

	let need = PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
///
/// Feed bytes with [`FrameDecoder::extend`] as they arrive and drain complete
/// messages with [`FrameDecoder::next_frame`]. An oversized length prefix is
/// reported before the payload is buffered.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_size,
		}
	}

	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Bytes buffered but not yet returned as a message.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		let Some(len) = peek_len(&self.buf) else {
			return Ok(None);
		};
		check_len(len, self.max_frame_size)?;

		if self.buf.len() < PREFIX_LEN + len {
			return Ok(None);
		}

		self.buf.advance(PREFIX_LEN);
		let payload = self.buf.split_to(len);
		Ok(Some(M::decode(payload.freeze())?))
	}
}
