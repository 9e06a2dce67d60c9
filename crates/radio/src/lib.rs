//! selective-repeat ARQ over a shared serial byte stream

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rf433_core::{payload_capacity, ControlError, FrameError, DEFAULT_BAUD_RATE, MIN_MTU};

pub mod demux;
pub mod receiver;
pub mod results;
pub mod simulated;
pub mod transmitter;
pub mod transport;

pub use demux::{Inbound, Noise, StreamDemux};
pub use receiver::{ReceiverSession, ReceiverState, RunSummary};
pub use results::ResultRecord;
pub use simulated::{ChannelConfig, ChannelModel, LossyChannel, SimulatedEndpoint, SimulatedLink};
pub use transmitter::{AbortReason, RunIdAllocator, RunOutcome, TransmitterSession, TransmitterState};
pub use transport::{StreamTransport, Transport};

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the link")]
    Disconnected,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("control channel error: {0}")]
    Control(#[from] ControlError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// What goes into the payload of each frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadSource {
    /// Every payload byte set to the same value.
    Filler(u8),
    /// Fresh random bytes for every frame sent.
    Random,
    /// Real data, split into frame-sized chunks. The last chunk is zero padded.
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmitterConfig {
    pub mtu: u16,
    /// Frames in the run. Ignored for [`PayloadSource::Data`], which derives it from the data.
    pub count: u16,
    pub window: u16,
    /// Air gap inserted between consecutive frames of a burst.
    pub gap: Duration,
    pub max_rounds: u32,
    pub sync_timeout: Duration,
    pub sync_attempts: u32,
    pub report_timeout: Duration,
    pub final_timeout: Duration,
    /// Upper bound of a single transport read.
    pub poll_interval: Duration,
    /// Serial speed of the radio module. A write returns before its bytes are on the air, so
    /// every reply deadline is pushed back by the airtime of what was written. `None` when the
    /// transport only returns once the bytes are sent.
    pub baud_rate: Option<u32>,
    pub payload: PayloadSource,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            mtu: 256,
            count: 10,
            window: 12,
            gap: Duration::ZERO,
            max_rounds: 80,
            sync_timeout: Duration::from_secs(5),
            sync_attempts: 3,
            report_timeout: Duration::from_secs(5),
            final_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            baud_rate: Some(DEFAULT_BAUD_RATE),
            payload: PayloadSource::Filler(0xBB),
        }
    }
}

impl TransmitterConfig {
    pub fn frame_count(&self) -> Result<u16, RadioError> {
        match &self.payload {
            PayloadSource::Data(data) => {
                let capacity = payload_capacity(self.mtu).ok_or(FrameError::MtuTooSmall(self.mtu))?;
                u16::try_from(data.len().div_ceil(capacity)).map_err(|_| {
                    RadioError::InvalidConfig(format!(
                        "{} bytes need more than {} frames at mtu {}",
                        data.len(),
                        u16::MAX,
                        self.mtu
                    ))
                })
            }
            _ => Ok(self.count),
        }
    }

    pub fn validate(&self) -> Result<(), RadioError> {
        if self.mtu < MIN_MTU {
            return Err(RadioError::InvalidConfig(format!(
                "mtu {} below minimum {}",
                self.mtu, MIN_MTU
            )));
        }
        if self.window == 0 || self.max_rounds == 0 || self.sync_attempts == 0 {
            return Err(RadioError::InvalidConfig(
                "window, max_rounds and sync_attempts must be positive".into(),
            ));
        }
        if self.frame_count()? == 0 {
            return Err(RadioError::InvalidConfig("run has no frames".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(RadioError::InvalidConfig("poll_interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Upper bound of a single transport read.
    pub poll_interval: Duration,
    /// How long to wait for the next control message between bursts and between runs.
    pub sync_timeout: Duration,
    /// Silence inside a burst after which the remaining frames are given up on.
    pub frame_timeout: Duration,
    /// Stream buffer capacity, in frames of the negotiated MTU.
    pub buffer_frames: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            sync_timeout: Duration::from_secs(120),
            frame_timeout: Duration::from_millis(2500),
            buffer_frames: demux::DEFAULT_BUFFER_FRAMES,
        }
    }
}

/// Time the serial line needs to clock out `bytes` at `baud_rate` with 8N1 framing.
pub fn airtime(bytes: usize, baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(
        (bytes as f64 * rf433_core::BITS_PER_SERIAL_BYTE as f64) / baud_rate as f64,
    )
}
