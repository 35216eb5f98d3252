//! Binary wire frame codec.
//!
//! Frame layout: `[u32 BE header length][header JSON][payload]`. Control
//! messages normally travel as text frames, but a binary frame whose first
//! byte is `{` is treated as JSON and re-validated by the caller.

use serde_json::Value;
use thiserror::Error;

pub const HEADER_LEN_MIN: usize = 1;
pub const HEADER_LEN_MAX: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad frame")]
    BadFrame,

    #[error("frame of {size} bytes exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("header length {0} outside [1, 1024]")]
    HeaderTooLong(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_json_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 512 * 1024,
            max_json_bytes: 64 * 1024,
        }
    }
}

/// Encode a header object and payload into one binary frame.
pub fn encode(header: &Value, payload: &[u8], limits: FrameLimits) -> Result<Vec<u8>, CodecError> {
    let header_json = serde_json::to_vec(header).map_err(|_| CodecError::BadFrame)?;
    if header_json.len() < HEADER_LEN_MIN || header_json.len() > HEADER_LEN_MAX {
        return Err(CodecError::HeaderTooLong(header_json.len()));
    }
    let total = 4 + header_json.len() + payload.len();
    if total > limits.max_frame_bytes {
        return Err(CodecError::TooLarge { size: total, limit: limits.max_frame_bytes });
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header_json);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a binary frame into its header object and payload slice.
pub fn decode(frame: &[u8], limits: FrameLimits) -> Result<(Value, &[u8]), CodecError> {
    if frame.len() > limits.max_frame_bytes {
        return Err(CodecError::TooLarge { size: frame.len(), limit: limits.max_frame_bytes });
    }
    if frame.len() < 4 {
        return Err(CodecError::BadFrame);
    }
    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if !(HEADER_LEN_MIN..=HEADER_LEN_MAX).contains(&header_len) {
        return Err(CodecError::HeaderTooLong(header_len));
    }
    if frame.len() < 4 + header_len {
        return Err(CodecError::BadFrame);
    }
    let header: Value =
        serde_json::from_slice(&frame[4..4 + header_len]).map_err(|_| CodecError::BadFrame)?;
    Ok((header, &frame[4 + header_len..]))
}

/// Is this binary frame actually a JSON control message?
pub fn is_json_control(frame: &[u8]) -> bool {
    frame.first() == Some(&b'{')
}
