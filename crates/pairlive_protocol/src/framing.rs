#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB — text signaling frames, not media.

/// Closed set of frame-type tags (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
	Ping,
	Pong,
	Auth,
	AuthRes,
	StartPk,
	StartPkRes,
	AnswerPk,
	AnswerPkRes,
	EndPk,
	EndPkRes,
	OnPkOffer,
	OnPkAnswer,
	OnPkEnd,
	OnPkTimeout,
	Disconnect,
}

impl FrameType {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Ping => "ping",
			Self::Pong => "pong",
			Self::Auth => "auth",
			Self::AuthRes => "auth-res",
			Self::StartPk => "start-pk",
			Self::StartPkRes => "start-pk-res",
			Self::AnswerPk => "answer-pk",
			Self::AnswerPkRes => "answer-pk-res",
			Self::EndPk => "end-pk",
			Self::EndPkRes => "end-pk-res",
			Self::OnPkOffer => "on-pk-offer",
			Self::OnPkAnswer => "on-pk-answer",
			Self::OnPkEnd => "on-pk-end",
			Self::OnPkTimeout => "on-pk-timeout",
			Self::Disconnect => "disconnect",
		}
	}
}

impl fmt::Display for FrameType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for FrameType {
	type Err = FramingError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"ping" => Self::Ping,
			"pong" => Self::Pong,
			"auth" => Self::Auth,
			"auth-res" => Self::AuthRes,
			"start-pk" => Self::StartPk,
			"start-pk-res" => Self::StartPkRes,
			"answer-pk" => Self::AnswerPk,
			"answer-pk-res" => Self::AnswerPkRes,
			"end-pk" => Self::EndPk,
			"end-pk-res" => Self::EndPkRes,
			"on-pk-offer" => Self::OnPkOffer,
			"on-pk-answer" => Self::OnPkAnswer,
			"on-pk-end" => Self::OnPkEnd,
			"on-pk-timeout" => Self::OnPkTimeout,
			"disconnect" => Self::Disconnect,
			other => return Err(FramingError::UnknownType(other.to_string())),
		})
	}
}

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need a complete frame, have={have} bytes buffered")]
	InsufficientData { have: usize },

	#[error("malformed frame: missing '=' separator")]
	MissingSeparator,

	#[error("malformed frame: body does not start with '{{'")]
	NotAJsonObject,

	#[error("unknown frame type: {0}")]
	UnknownType(String),

	#[error("json decode error: {0}")]
	Decode(#[from] serde_json::Error),
}

/// A decoded frame: its type tag plus the raw JSON body bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
	pub frame_type: FrameType,
	pub body: Vec<u8>,
}

impl RawFrame {
	/// Deserialize the body into a typed struct.
	pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, FramingError> {
		Ok(serde_json::from_slice(&self.body)?)
	}
}

/// Encode a `T=B` frame, newline-terminated so frames on a byte-stream transport
/// (QUIC bidirectional stream) have an unambiguous boundary.
pub fn encode_frame<B: Serialize>(frame_type: FrameType, body: &B, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let body_json = serde_json::to_vec(body)?;
	let tag = frame_type.as_str();
	let total = tag.len() + 1 + body_json.len() + 1;
	if total > max_frame_size {
		return Err(FramingError::FrameTooLarge { len: total, max: max_frame_size });
	}

	let mut out = Vec::with_capacity(total);
	out.extend_from_slice(tag.as_bytes());
	out.push(b'=');
	out.extend_from_slice(&body_json);
	out.push(b'\n');
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<B: Serialize>(frame_type: FrameType, body: &B) -> Result<Vec<u8>, FramingError> {
	encode_frame(frame_type, body, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<B: Serialize>(
	buf: &mut BytesMut,
	frame_type: FrameType,
	body: &B,
	max_frame_size: usize,
) -> Result<(), FramingError> {
	let encoded = encode_frame(frame_type, body, max_frame_size)?;
	buf.reserve(encoded.len());
	buf.put_slice(&encoded);
	Ok(())
}

/// Parse a single already-delimited `T=B` frame (without its trailing newline).
pub fn decode_frame(line: &[u8], max_frame_size: usize) -> Result<RawFrame, FramingError> {
	if line.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: line.len(),
			max: max_frame_size,
		});
	}

	let sep = line
		.iter()
		.position(|&b| b == b'=')
		.ok_or(FramingError::MissingSeparator)?;

	let (tag_bytes, rest) = line.split_at(sep);
	let body = &rest[1..];

	if body.first() != Some(&b'{') {
		return Err(FramingError::NotAJsonObject);
	}

	let tag = std::str::from_utf8(tag_bytes).map_err(|_| FramingError::MissingSeparator)?;
	let frame_type = FrameType::from_str(tag)?;

	Ok(RawFrame {
		frame_type,
		body: body.to_vec(),
	})
}

/// Try to decode a single newline-delimited frame from a growable buffer.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<RawFrame>, FramingError> {
	let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
		if buf.len() > max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len: buf.len(),
				max: max_frame_size,
			});
		}
		return Ok(None);
	};

	if nl > max_frame_size {
		return Err(FramingError::FrameTooLarge { len: nl, max: max_frame_size });
	}

	let mut line = buf.split_to(nl + 1);
	line.truncate(nl); // drop the newline itself

	decode_frame(&line, max_frame_size).map(Some)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde::{Deserialize, Serialize};

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct TestBody {
		s: String,
		n: u32,
	}

	#[test]
	fn encode_decode_roundtrip() {
		let body = TestBody {
			s: "hello".to_string(),
			n: 42,
		};

		let frame = encode_frame_default(FrameType::Ping, &body).expect("encode");
		assert!(frame.starts_with(b"ping={"));
		assert!(frame.ends_with(b"\n"));

		let mut buf = BytesMut::from(&frame[..]);
		let decoded = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(decoded.frame_type, FrameType::Ping);
		assert_eq!(decoded.parse_body::<TestBody>().unwrap(), body);
		assert!(buf.is_empty());
	}

	#[test]
	fn incremental_buffer_fill() {
		let body = TestBody {
			s: "hi".to_string(),
			n: 1,
		};
		let frame = encode_frame_default(FrameType::Pong, &body).expect("encode");

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&frame[..3]);
		assert!(
			try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&frame[3..]);
		let decoded = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(decoded.frame_type, FrameType::Pong);
	}

	#[test]
	fn rejects_unknown_type() {
		let mut buf = BytesMut::from(&b"bogus-type={}\n"[..]);
		let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::UnknownType(_)));
	}

	#[test]
	fn rejects_non_object_body() {
		let mut buf = BytesMut::from(&b"ping=not-json\n"[..]);
		let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::NotAJsonObject));
	}

	#[test]
	fn encode_rejects_too_large() {
		let body = TestBody {
			s: "a".repeat(10_000),
			n: 1,
		};
		let err = encode_frame(FrameType::Ping, &body, 32).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { .. }));
	}

	#[test]
	fn decode_rejects_too_large_buffered_line() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&vec![b'a'; 100]);
		buf.extend_from_slice(b"\n");
		let err = try_decode_frame_from_buffer(&mut buf, 16).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { .. }));
	}
}
