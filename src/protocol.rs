//! Length-prefixed binary framing.
//!
//! Every message on the wire starts with a little-endian `u32` length that
//! counts the bytes following it.
//!
//! ```text
//! Request:  total_len:u32 | argc:u32 | argc x (arg_len:u32 | arg bytes)
//! Response: total_len:u32 | status:u32 | payload bytes
//! ```
//!
//! `total_len` never exceeds [`MAX_MESSAGE_BYTES`] in either direction. The
//! functions here are pure: they work on byte slices and never touch a socket.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Upper bound for `total_len` of any frame.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest complete frame, prefix included.
pub const MAX_FRAME_BYTES: usize = LEN_PREFIX + MAX_MESSAGE_BYTES;

/// Largest response payload that still fits a frame.
pub const MAX_PAYLOAD_BYTES: usize = MAX_MESSAGE_BYTES - 4;

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Err = 1,
    NotFound = 2,
}

impl TryFrom<u32> for Status {
    type Error = FrameError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Err),
            2 => Ok(Status::NotFound),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

/// Framing errors. Any of these on an inbound stream means the frame
/// boundaries can no longer be trusted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body too short: {0} bytes")]
    TooShort(usize),

    #[error("frame length {len} exceeds maximum {max}")]
    Oversized { len: usize, max: usize },

    #[error("too many arguments: {0}")]
    TooManyArgs(u32),

    #[error("argument length header runs past the frame")]
    ArgHeaderOutOfBounds,

    #[error("argument data runs past the frame")]
    ArgOutOfBounds,

    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),

    #[error("output buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("unknown status code {0}")]
    UnknownStatus(u32),
}

/// Check whether `buf` starts with a complete frame.
///
/// Returns the full frame length (prefix included) when one is buffered,
/// `None` when more bytes are needed, and `Oversized` as soon as the prefix
/// advertises more than [`MAX_MESSAGE_BYTES`].
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let total_len = (&buf[..LEN_PREFIX]).get_u32_le() as usize;
    if total_len > MAX_MESSAGE_BYTES {
        return Err(FrameError::Oversized {
            len: total_len,
            max: MAX_MESSAGE_BYTES,
        });
    }

    let needed = LEN_PREFIX + total_len;
    if buf.len() < needed {
        Ok(None)
    } else {
        Ok(Some(needed))
    }
}

/// Decode a request body (the bytes after the length prefix) into its
/// arguments.
///
/// Every declared length is checked against the remaining body before any
/// bytes are sliced out. Bytes left over after the last argument are ignored.
pub fn decode_request(body: &[u8]) -> Result<Vec<&[u8]>, FrameError> {
    if body.len() < 4 {
        return Err(FrameError::TooShort(body.len()));
    }

    let mut cursor = body;
    let argc = cursor.get_u32_le();
    if argc as usize > MAX_MESSAGE_BYTES {
        return Err(FrameError::TooManyArgs(argc));
    }

    // Each argument costs at least its 4-byte header.
    let mut args = Vec::with_capacity((argc as usize).min(cursor.len() / 4));
    for _ in 0..argc {
        if cursor.remaining() < 4 {
            return Err(FrameError::ArgHeaderOutOfBounds);
        }
        let arg_len = cursor.get_u32_le() as usize;
        if arg_len > cursor.remaining() {
            return Err(FrameError::ArgOutOfBounds);
        }
        let (arg, rest) = cursor.split_at(arg_len);
        args.push(arg);
        cursor = rest;
    }

    Ok(args)
}

/// Encode a request frame, prefix included.
#[allow(dead_code)] // Client side of the codec
pub fn encode_request<A: AsRef<[u8]>>(args: &[A]) -> Result<Vec<u8>, FrameError> {
    let total_len = 4 + args.iter().map(|a| 4 + a.as_ref().len()).sum::<usize>();
    if total_len > MAX_MESSAGE_BYTES {
        return Err(FrameError::Oversized {
            len: total_len,
            max: MAX_MESSAGE_BYTES,
        });
    }

    let mut out = Vec::with_capacity(LEN_PREFIX + total_len);
    out.put_u32_le(total_len as u32);
    out.put_u32_le(args.len() as u32);
    for arg in args {
        let arg = arg.as_ref();
        out.put_u32_le(arg.len() as u32);
        out.put_slice(arg);
    }
    Ok(out)
}

/// Encode a response frame into `out`, returning the number of bytes written.
pub fn encode_response(status: Status, payload: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let total_len = 4 + payload.len();
    let need = LEN_PREFIX + total_len;
    if out.len() < need {
        return Err(FrameError::BufferTooSmall {
            need,
            have: out.len(),
        });
    }

    let mut dst = &mut out[..need];
    dst.put_u32_le(total_len as u32);
    dst.put_u32_le(status as u32);
    dst.put_slice(payload);
    Ok(need)
}

/// Decode a complete response frame, prefix included.
#[allow(dead_code)] // Client side of the codec
pub fn decode_response(frame: &[u8]) -> Result<(Status, &[u8]), FrameError> {
    let len = frame_len(frame)?.ok_or(FrameError::TooShort(frame.len()))?;
    if len < LEN_PREFIX + 4 {
        return Err(FrameError::TooShort(len - LEN_PREFIX));
    }

    let mut body = &frame[LEN_PREFIX..len];
    let status = Status::try_from(body.get_u32_le())?;
    Ok((status, body))
}
