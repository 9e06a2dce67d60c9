//! Splits the shared serial byte stream into frames, control lines and noise.
//!
//! There is no length prefix on the wire, so the front of the buffer is classified by its first
//! byte: `A5 5A` opens a frame of exactly `mtu` bytes, `{` opens a control line ending in `\n`,
//! anything else is noise. Every classification step that yields an item consumes at least one
//! byte, and the buffer never grows beyond `mtu * buffer_frames` bytes, so a misaligned or noisy
//! stream always makes progress and never exhausts memory.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, trace};
use tokio::time::Instant;

use rf433_core::{
    frame, ControlError, ControlMessage, Frame, FrameError, RunId, CONTROL_START, FRAME_OVERHEAD,
    HEADER_LEN, LINE_TERMINATOR, MAGIC_BYTES,
};

use crate::transport::Transport;
use crate::RadioError;

pub const DEFAULT_BUFFER_FRAMES: usize = 150;
/// Frame size assumed for buffer sizing before a run negotiated its MTU.
pub const UNSYNCED_MTU: u16 = 256;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),
    Control(ControlMessage),
    Noise(Noise),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Noise {
    /// A frame-shaped prefix that did not decode. One byte was discarded. `run_id` comes from
    /// the unverified header.
    BadFrame { run_id: RunId, error: FrameError },
    /// A complete line that is not a valid control message.
    BadLine { len: usize, error: ControlError },
    /// Bytes that open neither a frame nor a line.
    Garbage(usize),
    /// A frame or line cut short by a silent link. One byte was discarded.
    Truncated,
}

#[derive(Debug, Default, Clone)]
pub struct DemuxStats {
    pub bytes_in: u64,
    pub bytes_overflowed: u64,
    pub frames: u64,
    pub lines: u64,
    pub bad_frames: u64,
    pub bad_lines: u64,
    pub garbage_bytes: u64,
    pub truncated: u64,
}

pub struct StreamDemux {
    buffer: BytesMut,
    mtu: Option<u16>,
    buffer_frames: usize,
    /// Bytes still covered by the last reported bad frame.
    bad_window: usize,
    stats: DemuxStats,
}

impl Default for StreamDemux {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

impl StreamDemux {
    pub fn new(buffer_frames: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            mtu: None,
            buffer_frames: buffer_frames.max(1),
            bad_window: 0,
            stats: DemuxStats::default(),
        }
    }

    /// Sets the frame size to look for. Without one, frame-shaped bytes are treated as noise.
    pub fn set_mtu(&mut self, mtu: Option<u16>) {
        self.mtu = mtu;
        self.enforce_capacity();
    }

    pub fn capacity(&self) -> usize {
        self.mtu.unwrap_or(UNSYNCED_MTU) as usize * self.buffer_frames
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    /// Appends raw bytes, dropping the oldest bytes if the buffer would exceed its capacity.
    pub fn push(&mut self, data: &[u8]) {
        self.stats.bytes_in += data.len() as u64;
        self.buffer.extend_from_slice(data);
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        let capacity = self.capacity();
        if self.buffer.len() > capacity {
            let excess = self.buffer.len() - capacity;
            self.consume(excess);
            self.stats.bytes_overflowed += excess as u64;
            debug!("Stream buffer overflow, dropped {} oldest bytes", excess);
        }
    }

    fn consume(&mut self, n: usize) {
        self.buffer.advance(n);
        self.bad_window = self.bad_window.saturating_sub(n);
    }

    /// Classifies the front of the buffer. `None` means more bytes are needed.
    pub fn next_item(&mut self) -> Option<Inbound> {
        let front = *self.buffer.first()?;

        if front == MAGIC_BYTES[0] {
            let second = *self.buffer.get(1)?;
            if second == MAGIC_BYTES[1] {
                if let Some(mtu) = self.mtu {
                    return self.take_frame(mtu);
                }
            }
        } else if front == CONTROL_START {
            return self.take_line();
        }

        Some(self.skip_garbage())
    }

    fn take_frame(&mut self, mtu: u16) -> Option<Inbound> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        let mut header = &self.buffer[2..HEADER_LEN];
        let run_id = header.get_u16();
        header.advance(4);
        let declared = header
            .get_u16()
            .checked_add(FRAME_OVERHEAD as u16)
            .filter(|&len| len != mtu && len as usize <= self.buffer.len());

        // an intact frame of another MTU, typically left over from the previous run
        if let Some(other) = declared {
            if let Ok(frame) = frame::decode(&self.buffer[..other as usize], other) {
                self.consume(other as usize);
                self.bad_window = 0;
                self.stats.frames += 1;
                trace!("Frame run={} seq={} at foreign mtu {}", frame.run_id, frame.seq, other);
                return Some(Inbound::Frame(frame));
            }
        }

        let len = mtu as usize;
        if self.buffer.len() < len {
            return None;
        }
        match frame::decode(&self.buffer[..len], mtu) {
            Ok(frame) => {
                self.consume(len);
                self.bad_window = 0;
                self.stats.frames += 1;
                trace!("Frame run={} seq={}", frame.run_id, frame.seq);
                Some(Inbound::Frame(frame))
            }
            Err(error) => {
                // one report per corrupt frame: magic matches inside its span count as garbage
                let shadowed = self.bad_window > 0;
                self.consume(1);
                if shadowed {
                    self.stats.garbage_bytes += 1;
                    return Some(Inbound::Noise(Noise::Garbage(1)));
                }
                self.bad_window = len - 1;
                self.stats.bad_frames += 1;
                debug!("Dropped frame candidate of run {}: {}", run_id, error);
                Some(Inbound::Noise(Noise::BadFrame { run_id, error }))
            }
        }
    }

    fn take_line(&mut self) -> Option<Inbound> {
        let mut end = None;
        for (i, &b) in self.buffer.iter().enumerate().skip(1) {
            if b == LINE_TERMINATOR {
                end = Some(i);
                break;
            }
            if !is_line_byte(b) {
                self.consume(i);
                self.stats.garbage_bytes += i as u64;
                trace!("Line candidate broken by byte {:#04x} after {} bytes", b, i);
                return Some(Inbound::Noise(Noise::Garbage(i)));
            }
        }

        let Some(end) = end else {
            if self.buffer.len() >= self.capacity() {
                self.consume(1);
                self.stats.garbage_bytes += 1;
                return Some(Inbound::Noise(Noise::Garbage(1)));
            }
            return None;
        };

        let len = end + 1;
        match ControlMessage::decode_line(&self.buffer[..len]) {
            Ok(msg) => {
                self.consume(len);
                self.stats.lines += 1;
                trace!("Control {} run={}", msg.kind(), msg.run_id());
                Some(Inbound::Control(msg))
            }
            Err(error) => {
                // a stray `{` in front of a real line: restart at the opener that decodes
                if let Some(start) = line_resync_point(&self.buffer[..len]) {
                    self.consume(start);
                    self.stats.garbage_bytes += start as u64;
                    trace!("Skipped {} bytes in front of a control line", start);
                    return Some(Inbound::Noise(Noise::Garbage(start)));
                }
                self.consume(len);
                self.stats.bad_lines += 1;
                debug!("Dropped malformed control line: {}", error);
                Some(Inbound::Noise(Noise::BadLine { len, error }))
            }
        }
    }

    fn skip_garbage(&mut self) -> Inbound {
        let skip = self
            .buffer
            .iter()
            .skip(1)
            .position(|&b| b == MAGIC_BYTES[0] || b == CONTROL_START)
            .map(|p| p + 1)
            .unwrap_or(self.buffer.len());
        self.consume(skip);
        self.stats.garbage_bytes += skip as u64;
        trace!("Skipped {} noise bytes", skip);
        Inbound::Noise(Noise::Garbage(skip))
    }

    /// Gives up on an incomplete frame or line at the front of the buffer after the link went
    /// silent. Only meaningful when [`next_item`](Self::next_item) returned `None`.
    pub fn expire_partial(&mut self) -> Option<Inbound> {
        if self.buffer.is_empty() {
            return None;
        }
        self.consume(1);
        self.stats.truncated += 1;
        debug!("Link idle with {} buffered bytes, dropping truncated candidate", self.buffer.len() + 1);
        Some(Inbound::Noise(Noise::Truncated))
    }

    /// One poll cycle: yields a buffered item, or drains the transport (waiting at most `wait`)
    /// and classifies again. `Ok(None)` means nothing complete arrived.
    pub async fn poll<T>(&mut self, transport: &mut T, wait: Duration) -> Result<Option<Inbound>, RadioError>
    where
        T: Transport + ?Sized,
    {
        if let Some(item) = self.next_item() {
            return Ok(Some(item));
        }

        let mut bytes = transport.read_available(READ_CHUNK, wait).await?;
        if bytes.is_empty() {
            return Ok(self.expire_partial());
        }
        loop {
            self.push(&bytes);
            if self.buffer.len() >= self.capacity() {
                break;
            }
            bytes = match transport.read_available(READ_CHUNK, Duration::ZERO).await {
                Ok(more) if !more.is_empty() => more,
                _ => break,
            };
        }
        Ok(self.next_item())
    }

    /// Polls in steps of at most `poll_interval` until an item arrives or `deadline` passes.
    pub async fn next_until<T>(
        &mut self,
        transport: &mut T,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<Option<Inbound>, RadioError>
    where
        T: Transport + ?Sized,
    {
        loop {
            if let Some(item) = self.next_item() {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = poll_interval.min(deadline - now);
            if let Some(item) = self.poll(transport, wait).await? {
                return Ok(Some(item));
            }
        }
    }
}

fn is_line_byte(b: u8) -> bool {
    (0x20..0x7f).contains(&b) || b == b'\r' || b == b'\t'
}

/// Offset of the first later `{` in a malformed line from which the rest decodes.
fn line_resync_point(line: &[u8]) -> Option<usize> {
    line.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, b)| **b == CONTROL_START)
        .map(|(i, _)| i)
        .find(|&i| ControlMessage::decode_line(&line[i..]).is_ok())
}
