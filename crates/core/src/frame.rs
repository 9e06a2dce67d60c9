//! Fixed-size binary data frames.
//!
//! Wire layout, all integers big-endian:
//!
//! ```ascii
//! 0:  magic        u16 = 0xA55A
//! 2:  run_id       u16
//! 4:  seq          u16
//! 6:  total        u16
//! 8:  payload_len  u16 = mtu - 14
//! 10: payload      [u8; payload_len]
//! *:  checksum     u32, CRC32 over every preceding byte
//! ```
//!
//! A frame is exactly `mtu` bytes long. Decoding never panics on hostile input; every defect
//! maps to a [`FrameError`] so the receiving side can count it and move on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::hash::crc32;
use crate::types::{payload_capacity, RunId, Seq, CHECKSUM_LEN, HEADER_LEN, MAGIC};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload is {actual} bytes, frame needs exactly {expected}")]
    InvalidPayloadSize { expected: usize, actual: usize },

    #[error("mtu {0} cannot carry a payload")]
    MtuTooSmall(u16),

    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    #[error("frame is {actual} bytes, negotiated mtu is {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("declared payload length {declared} does not match {expected}")]
    BadPayloadLength { declared: usize, expected: usize },

    #[error("checksum mismatch: computed {expected:#010x}, carried {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub run_id: RunId,
    pub seq: Seq,
    pub total: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(run_id: RunId, seq: Seq, total: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            run_id,
            seq,
            total,
            payload: payload.into(),
        }
    }

    pub fn encode(&self, mtu: u16) -> Result<Bytes, FrameError> {
        encode(self.run_id, self.seq, self.total, &self.payload, mtu)
    }
}

/// Encodes one frame of exactly `mtu` bytes.
pub fn encode(
    run_id: RunId,
    seq: Seq,
    total: u16,
    payload: &[u8],
    mtu: u16,
) -> Result<Bytes, FrameError> {
    let capacity = payload_capacity(mtu).ok_or(FrameError::MtuTooSmall(mtu))?;
    if payload.len() != capacity {
        return Err(FrameError::InvalidPayloadSize {
            expected: capacity,
            actual: payload.len(),
        });
    }

    let mut buf = BytesMut::with_capacity(mtu as usize);
    buf.put_u16(MAGIC);
    buf.put_u16(run_id);
    buf.put_u16(seq);
    buf.put_u16(total);
    buf.put_u16(capacity as u16);
    buf.put_slice(payload);
    let checksum = crc32(&buf);
    buf.put_u32(checksum);

    debug_assert_eq!(buf.len(), mtu as usize);
    Ok(buf.freeze())
}

/// Decodes a frame that must be exactly `mtu` bytes long.
pub fn decode(bytes: &[u8], mtu: u16) -> Result<Frame, FrameError> {
    let expected_len = mtu as usize;
    if bytes.len() < 2 {
        return Err(FrameError::BadLength {
            expected: expected_len,
            actual: bytes.len(),
        });
    }

    let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    if bytes.len() != expected_len {
        return Err(FrameError::BadLength {
            expected: expected_len,
            actual: bytes.len(),
        });
    }
    let capacity = payload_capacity(mtu).ok_or(FrameError::MtuTooSmall(mtu))?;

    let (body, mut trailer) = bytes.split_at(expected_len - CHECKSUM_LEN);
    let carried = trailer.get_u32();
    let computed = crc32(body);
    if carried != computed {
        return Err(FrameError::ChecksumMismatch {
            expected: computed,
            actual: carried,
        });
    }

    let mut header = &body[2..HEADER_LEN];
    let run_id = header.get_u16();
    let seq = header.get_u16();
    let total = header.get_u16();
    let declared = header.get_u16() as usize;
    if declared != capacity {
        return Err(FrameError::BadPayloadLength {
            declared,
            expected: capacity,
        });
    }

    Ok(Frame {
        run_id,
        seq,
        total,
        payload: Bytes::copy_from_slice(&body[HEADER_LEN..]),
    })
}
