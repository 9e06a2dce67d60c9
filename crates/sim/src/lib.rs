//! sweep tooling for the RF433 link benchmark

pub mod sweep;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rf433_core::DEFAULT_BAUD_RATE;
use rf433_radio::{ChannelConfig, TransmitterConfig};

pub use sweep::{simulate, Sweep, SweepError, SweepPoint, SweepResults};

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn clean_link() -> ChannelConfig {
        ChannelConfig {
            baud_rate: Some(DEFAULT_BAUD_RATE),
            ..Default::default()
        }
    }

    pub fn average_conditions() -> ChannelConfig {
        ChannelConfig {
            frame_loss: 0.05,
            frame_corruption: 0.05,
            control_loss: 0.01,
            noise: 0.05,
            max_noise_bytes: 8,
            baud_rate: Some(DEFAULT_BAUD_RATE),
            seed: None,
        }
    }

    pub fn poor_conditions() -> ChannelConfig {
        ChannelConfig {
            frame_loss: 0.15,
            frame_corruption: 0.10,
            control_loss: 0.03,
            noise: 0.20,
            max_noise_bytes: 32,
            baud_rate: Some(DEFAULT_BAUD_RATE),
            seed: None,
        }
    }

    /// Busy band with another 433 MHz transmitter keying up between our frames.
    pub fn extreme_conditions() -> ChannelConfig {
        ChannelConfig {
            frame_loss: 0.35,
            frame_corruption: 0.20,
            control_loss: 0.08,
            noise: 0.50,
            max_noise_bytes: 64,
            baud_rate: Some(DEFAULT_BAUD_RATE),
            seed: None,
        }
    }
}

/// The grid of runs to measure: every MTU with every gap, `repeats` times each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub mtus: Vec<u16>,
    pub gaps_ms: Vec<u64>,
    pub repeats: u32,
    /// Pause between runs so a late FINAL or REPORT drains before the next SYNC.
    pub cooldown: Duration,
    pub baud_rate: u32,
    /// Per-run settings. `mtu` and `gap` are overwritten for each point.
    pub run: TransmitterConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            mtus: vec![16, 32, 64, 128, 160, 192, 256, 384, 512, 768, 1024, 1280, 1492, 1500],
            gaps_ms: vec![0, 1, 2, 3, 5, 7, 10],
            repeats: 1,
            cooldown: Duration::from_millis(800),
            baud_rate: DEFAULT_BAUD_RATE,
            run: TransmitterConfig::default(),
        }
    }
}

impl SweepConfig {
    /// A small grid that finishes in a few minutes over a simulated 9600 baud link.
    pub fn quick() -> Self {
        Self {
            mtus: vec![32, 128, 256, 512],
            gaps_ms: vec![0, 5],
            ..Default::default()
        }
    }

    pub fn points(&self) -> Vec<SweepPoint> {
        let mut points = Vec::with_capacity(self.total_runs());
        for &mtu in &self.mtus {
            for &gap_ms in &self.gaps_ms {
                for repeat in 1..=self.repeats {
                    points.push(SweepPoint {
                        mtu,
                        gap: Duration::from_millis(gap_ms),
                        repeat,
                    });
                }
            }
        }
        points
    }

    pub fn total_runs(&self) -> usize {
        self.mtus.len() * self.gaps_ms.len() * self.repeats as usize
    }

    pub fn run_config(&self, point: &SweepPoint) -> TransmitterConfig {
        TransmitterConfig {
            mtu: point.mtu,
            gap: point.gap,
            baud_rate: Some(self.baud_rate),
            ..self.run.clone()
        }
    }
}
