#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;
pub mod pb;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, decode_frame, encode_frame};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;

	/// ALPN identifier negotiated on every QUIC connection.
	pub const ALPN: &[u8] = b"helpdesk-v1";
}
