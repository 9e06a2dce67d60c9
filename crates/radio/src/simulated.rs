//! Simulated serial radio link for testing
//!
//! Two [`SimulatedEndpoint`]s joined by in-memory queues. Every write passes through a
//! [`ChannelModel`] of its direction, which may drop it, flip bits in it or prepend line noise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

use rf433_core::MAGIC_BYTES;

use crate::transport::Transport;
use crate::{airtime, RadioError};

/// Impairments applied to one direction of a simulated link.
pub trait ChannelModel: Send {
    /// Mutates one write in flight. Returns `false` if the write is lost entirely.
    fn impair(&mut self, bytes: &mut Vec<u8>) -> bool;
}

impl<F> ChannelModel for F
where
    F: FnMut(&mut Vec<u8>) -> bool + Send,
{
    fn impair(&mut self, bytes: &mut Vec<u8>) -> bool {
        self(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Probability that a binary frame vanishes.
    pub frame_loss: f64,
    /// Probability that a surviving frame has one bit flipped.
    pub frame_corruption: f64,
    /// Probability that a control line vanishes.
    pub control_loss: f64,
    /// Probability that random bytes are injected in front of a write.
    pub noise: f64,
    /// Upper bound on injected noise bytes.
    pub max_noise_bytes: usize,
    /// Serial speed used to delay writes by their airtime. `None` delivers instantly.
    pub baud_rate: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame_loss: 0.0,
            frame_corruption: 0.0,
            control_loss: 0.0,
            noise: 0.0,
            max_noise_bytes: 16,
            baud_rate: None,
            seed: None,
        }
    }
}

/// Random, independent per-write impairments.
pub struct LossyChannel {
    config: ChannelConfig,
    rng: StdRng,
}

impl LossyChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self { config, rng }
    }
}

impl ChannelModel for LossyChannel {
    fn impair(&mut self, bytes: &mut Vec<u8>) -> bool {
        let is_frame = bytes.starts_with(&MAGIC_BYTES);
        let loss = if is_frame {
            self.config.frame_loss
        } else {
            self.config.control_loss
        };
        if self.rng.random::<f64>() < loss {
            return false;
        }

        if is_frame && !bytes.is_empty() && self.rng.random::<f64>() < self.config.frame_corruption {
            let bit = self.rng.random_range(0..bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
        }

        if self.config.max_noise_bytes > 0 && self.rng.random::<f64>() < self.config.noise {
            let len = self.rng.random_range(1..=self.config.max_noise_bytes);
            let mut noisy: Vec<u8> = (0..len).map(|_| self.rng.random()).collect();
            noisy.append(bytes);
            *bytes = noisy;
        }
        true
    }
}

#[derive(Debug, Default, Clone)]
pub struct LinkStats {
    pub writes: u64,
    pub dropped: u64,
    pub altered: u64,
    pub bytes_delivered: u64,
}

pub struct SimulatedLink;

impl SimulatedLink {
    /// Two endpoints with independent random impairments in each direction.
    pub fn pair(config: ChannelConfig) -> (SimulatedEndpoint, SimulatedEndpoint) {
        let mut reverse = config.clone();
        reverse.seed = config.seed.map(|s| s.wrapping_add(1));
        let baud_rate = config.baud_rate;
        Self::pair_with(
            Box::new(LossyChannel::new(config)),
            Box::new(LossyChannel::new(reverse)),
            baud_rate,
        )
    }

    /// Two endpoints with caller-supplied models. `a_to_b` impairs what the first endpoint writes.
    pub fn pair_with(
        a_to_b: Box<dyn ChannelModel>,
        b_to_a: Box<dyn ChannelModel>,
        baud_rate: Option<u32>,
    ) -> (SimulatedEndpoint, SimulatedEndpoint) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            SimulatedEndpoint::new(a_tx, a_rx, a_to_b, baud_rate),
            SimulatedEndpoint::new(b_tx, b_rx, b_to_a, baud_rate),
        )
    }
}

pub struct SimulatedEndpoint {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: BytesMut,
    model: Box<dyn ChannelModel>,
    baud_rate: Option<u32>,
    stats: Arc<Mutex<LinkStats>>,
}

impl SimulatedEndpoint {
    fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        model: Box<dyn ChannelModel>,
        baud_rate: Option<u32>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            pending: BytesMut::new(),
            model,
            baud_rate,
            stats: Arc::new(Mutex::new(LinkStats::default())),
        }
    }

    pub async fn get_stats(&self) -> LinkStats {
        self.stats.lock().await.clone()
    }
}

#[async_trait]
impl Transport for SimulatedEndpoint {
    async fn read_available(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>, RadioError> {
        if self.pending.is_empty() {
            match timeout(wait, self.inbound.recv()).await {
                Err(_) => return Ok(Vec::new()),
                Ok(None) => return Err(RadioError::Disconnected),
                Ok(Some(chunk)) => self.pending.extend_from_slice(&chunk),
            }
            while let Ok(chunk) = self.inbound.try_recv() {
                self.pending.extend_from_slice(&chunk);
            }
        }
        let n = max.max(1).min(self.pending.len());
        Ok(self.pending.split_to(n).to_vec())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        if let Some(baud) = self.baud_rate {
            sleep(airtime(bytes.len(), baud)).await;
        }

        let mut data = bytes.to_vec();
        let delivered = self.model.impair(&mut data);

        let mut stats = self.stats.lock().await;
        stats.writes += 1;
        if !delivered {
            stats.dropped += 1;
            debug!("Simulated loss of {} byte write", bytes.len());
            return Ok(());
        }
        if data != bytes {
            stats.altered += 1;
            trace!("Simulated corruption of {} byte write", bytes.len());
        }
        stats.bytes_delivered += data.len() as u64;
        drop(stats);

        self.outbound.send(data).map_err(|_| RadioError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf433_core::{frame, ControlMessage};

    fn frame_bytes() -> Vec<u8> {
        frame::encode(1, 0, 1, &[0xBB; 18], 32).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_clean_link_delivers_bytes_in_order() {
        let (mut a, mut b) = SimulatedLink::pair(ChannelConfig::default());
        a.write_all(b"hello ").await.unwrap();
        a.write_all(b"world").await.unwrap();
        let got = b.read_available(64, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, b"hello world");

        b.write_all(b"back").await.unwrap();
        let got = a.read_available(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, b"ba");
        let got = a.read_available(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, b"ck");
    }

    #[tokio::test]
    async fn test_frame_loss_spares_control_lines() {
        let config = ChannelConfig {
            frame_loss: 1.0,
            seed: Some(7),
            ..Default::default()
        };
        let (mut a, mut b) = SimulatedLink::pair(config);
        let line = ControlMessage::End { run_id: 1 }.encode_line().unwrap();
        a.write_all(&frame_bytes()).await.unwrap();
        a.write_all(&line).await.unwrap();

        let got = b.read_available(1024, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, line);
        let stats = a.get_stats().await;
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_corruption_flips_exactly_one_bit() {
        let config = ChannelConfig {
            frame_corruption: 1.0,
            seed: Some(11),
            ..Default::default()
        };
        let (mut a, mut b) = SimulatedLink::pair(config);
        let clean = frame_bytes();
        a.write_all(&clean).await.unwrap();
        let got = b.read_available(1024, Duration::from_millis(10)).await.unwrap();
        let flipped: u32 = clean
            .iter()
            .zip(&got)
            .map(|(x, y)| (x ^ y).count_ones())
            .sum();
        assert_eq!(flipped, 1);
        assert_eq!(a.get_stats().await.altered, 1);
    }

    #[tokio::test]
    async fn test_scripted_model() {
        let mut writes = 0;
        let drop_second = move |_: &mut Vec<u8>| {
            writes += 1;
            writes != 2
        };
        let (mut a, mut b) =
            SimulatedLink::pair_with(Box::new(drop_second), Box::new(|_: &mut Vec<u8>| true), None);
        for chunk in [b"a", b"b", b"c"] {
            a.write_all(chunk).await.unwrap();
        }
        let got = b.read_available(16, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, b"ac");
    }

    #[tokio::test(start_paused = true)]
    async fn test_baud_rate_delays_writes() {
        let config = ChannelConfig {
            baud_rate: Some(9600),
            ..Default::default()
        };
        let (mut a, _b) = SimulatedLink::pair(config);
        let start = tokio::time::Instant::now();
        a.write_all(&[0u8; 960]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_dropped_peer_is_disconnect() {
        let (mut a, b) = SimulatedLink::pair(ChannelConfig::default());
        drop(b);
        assert!(matches!(
            a.read_available(8, Duration::from_millis(10)).await,
            Err(RadioError::Disconnected)
        ));
        assert!(matches!(a.write_all(b"x").await, Err(RadioError::Disconnected)));
    }
}
