//! Line-delimited control messages sharing the byte stream with binary frames.
//!
//! Each message is one JSON object on its own line, tagged by `"type"`:
//!
//! ```text
//! {"type":"SYNC","run_id":4711,"mtu":256,"count":10,"window":12}
//! {"type":"SYNC_ACK","run_id":4711}
//! {"type":"BURST","run_id":4711,"seqs":[0,1,2,3,4],"burst":1}
//! {"type":"REPORT","run_id":4711,"missing":[3],"received_total":4,"crc_fail":1,"timeouts":0,"burst":1}
//! {"type":"END","run_id":4711}
//! {"type":"FINAL","run_id":4711,"received":10,"expected":10,"loss_pct":0.0,"crc_fail":1,"timeouts":0}
//! ```
//!
//! Encoded lines always start with `{` and contain only printable ASCII, so they can never be
//! mistaken for a frame (which starts with `0xA5`). Unknown fields are ignored when decoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{RunId, Seq, LINE_TERMINATOR, MIN_MTU};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Malformed(String),

    #[error("failed to encode control message: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    Sync {
        run_id: RunId,
        mtu: u16,
        count: u16,
        window: u16,
        /// Present only when the run carries real data instead of filler.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_size: Option<u32>,
    },
    SyncAck {
        run_id: RunId,
    },
    Burst {
        run_id: RunId,
        seqs: Vec<Seq>,
        /// Running number of the burst within the run, echoed by its REPORT.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        burst: Option<u32>,
    },
    Report {
        run_id: RunId,
        missing: Vec<Seq>,
        received_total: u32,
        crc_fail: u32,
        timeouts: u32,
        /// The `burst` of the BURST this report answers. Absent from older receivers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        burst: Option<u32>,
    },
    End {
        run_id: RunId,
    },
    Final {
        run_id: RunId,
        received: u16,
        expected: u16,
        #[serde(alias = "loss")]
        loss_pct: f64,
        crc_fail: u32,
        timeouts: u32,
        /// Receiver-side milliseconds between the first and the last valid frame.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        span_ms: Option<u64>,
    },
}

impl ControlMessage {
    pub fn run_id(&self) -> RunId {
        match self {
            ControlMessage::Sync { run_id, .. }
            | ControlMessage::SyncAck { run_id }
            | ControlMessage::Burst { run_id, .. }
            | ControlMessage::Report { run_id, .. }
            | ControlMessage::End { run_id }
            | ControlMessage::Final { run_id, .. } => *run_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Sync { .. } => "SYNC",
            ControlMessage::SyncAck { .. } => "SYNC_ACK",
            ControlMessage::Burst { .. } => "BURST",
            ControlMessage::Report { .. } => "REPORT",
            ControlMessage::End { .. } => "END",
            ControlMessage::Final { .. } => "FINAL",
        }
    }

    /// Serializes the message as a single newline-terminated line.
    pub fn encode_line(&self) -> Result<Vec<u8>, ControlError> {
        let mut line = serde_json::to_vec(self).map_err(|e| ControlError::Encode(e.to_string()))?;
        line.push(LINE_TERMINATOR);
        Ok(line)
    }

    /// Parses one line, with or without its terminator. Surrounding whitespace is ignored.
    pub fn decode_line(line: &[u8]) -> Result<Self, ControlError> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return Err(ControlError::Malformed("empty line".into()));
        }
        let msg: ControlMessage =
            serde_json::from_slice(trimmed).map_err(|e| ControlError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<(), ControlError> {
        match self {
            ControlMessage::Sync {
                mtu, count, window, ..
            } => {
                if *mtu < MIN_MTU {
                    return Err(ControlError::Malformed(format!("mtu {mtu} below {MIN_MTU}")));
                }
                if *count == 0 || *window == 0 {
                    return Err(ControlError::Malformed(
                        "count and window must be positive".into(),
                    ));
                }
            }
            ControlMessage::Final { loss_pct, .. } if !loss_pct.is_finite() => {
                return Err(ControlError::Malformed("loss_pct is not finite".into()));
            }
            _ => {}
        }
        Ok(())
    }
}
