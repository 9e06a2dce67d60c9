//! Runs the MTU x gap grid against one link and keeps the results file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;

use rf433_radio::{
    ChannelConfig, RadioError, ReceiverConfig, ReceiverSession, ResultRecord, RunIdAllocator,
    SimulatedLink, TransmitterSession, Transport,
};

use crate::SweepConfig;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("results file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("results file is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("receiver task failed: {0}")]
    Receiver(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub mtu: u16,
    pub gap: Duration,
    pub repeat: u32,
}

/// Result records keyed by MTU, in the layout of `rf433_results_fresh.json`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SweepResults {
    by_mtu: BTreeMap<String, Vec<ResultRecord>>,
}

impl SweepResults {
    /// Loads an existing results file. A missing file is an empty result set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SweepError> {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SweepError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn push(&mut self, mtu: u16, record: ResultRecord) {
        self.by_mtu.entry(mtu.to_string()).or_default().push(record);
    }

    pub fn records(&self, mtu: u16) -> &[ResultRecord] {
        self.by_mtu.get(&mtu.to_string()).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_records(&self) -> impl Iterator<Item = &ResultRecord> + '_ {
        self.by_mtu.values().flatten()
    }

    /// Appends every record of `other`, keeping what is already here.
    pub fn merge(&mut self, other: SweepResults) {
        for (mtu, records) in other.by_mtu {
            self.by_mtu.entry(mtu).or_default().extend(records);
        }
    }

    pub fn len(&self) -> usize {
        self.by_mtu.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drives one transmitter session per grid point, strictly one at a time on the link.
pub struct Sweep {
    config: SweepConfig,
    ids: RunIdAllocator,
}

impl Sweep {
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config,
            ids: RunIdAllocator::new(),
        }
    }

    pub fn with_run_ids(config: SweepConfig, ids: RunIdAllocator) -> Self {
        Self { config, ids }
    }

    /// Runs every point and appends its record to `results`, calling `on_result` after each.
    /// A run that fails on the link is recorded as aborted; a closed link ends the sweep.
    pub async fn run<T, F>(
        &mut self,
        transport: &mut T,
        results: &mut SweepResults,
        mut on_result: F,
    ) -> Result<(), SweepError>
    where
        T: Transport + ?Sized,
        F: FnMut(&SweepPoint, &ResultRecord, &SweepResults),
    {
        let points = self.config.points();
        info!("Sweep of {} runs", points.len());

        for (i, point) in points.iter().enumerate() {
            if i > 0 && !self.config.cooldown.is_zero() {
                sleep(self.config.cooldown).await;
            }

            let run = self.config.run_config(point);
            let count = run.frame_count()?;
            let session = TransmitterSession::new(&mut *transport, run, self.ids.next_id())?;
            let record = match session.run().await {
                Ok(outcome) => ResultRecord::from_outcome(&outcome, point.repeat, self.config.baud_rate),
                Err(RadioError::Disconnected) => return Err(RadioError::Disconnected.into()),
                Err(e) => {
                    warn!("Run mtu={} gap={:?} failed: {}", point.mtu, point.gap, e);
                    ResultRecord::failed(point.gap, point.repeat, count)
                }
            };

            results.push(point.mtu, record.clone());
            on_result(point, &record, results);
        }
        Ok(())
    }
}

/// Runs a sweep over a simulated link with a receiver serving the far end.
pub async fn simulate<F>(
    channel: ChannelConfig,
    config: SweepConfig,
    on_result: F,
) -> Result<SweepResults, SweepError>
where
    F: FnMut(&SweepPoint, &ResultRecord, &SweepResults),
{
    let (mut tx_link, rx_link) = SimulatedLink::pair(channel);
    let receiver = tokio::spawn(async move {
        let mut session = ReceiverSession::new(rx_link, ReceiverConfig::default());
        session.serve(|_| {}).await
    });

    let mut results = SweepResults::default();
    let mut sweep = Sweep::new(config);
    let swept = sweep.run(&mut tx_link, &mut results, on_result).await;
    drop(tx_link);

    match receiver.await {
        Ok(served) => served?,
        Err(e) => return Err(SweepError::Receiver(e.to_string())),
    }
    swept?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(repeat: u32) -> ResultRecord {
        ResultRecord::failed(Duration::from_millis(3), repeat, 10)
    }

    #[test]
    fn test_results_keyed_by_mtu_string() {
        let mut results = SweepResults::default();
        results.push(256, record(1));
        results.push(256, record(2));
        results.push(16, record(1));

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["256"].as_array().unwrap().len(), 2);
        assert_eq!(json["16"][0]["gap_ms"], 3);
        assert_eq!(results.records(256).len(), 2);
        assert!(results.records(512).is_empty());
    }

    #[test]
    fn test_save_load_and_merge() {
        let path = std::env::temp_dir().join(format!("rf433_results_{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        assert!(SweepResults::load(&path).unwrap().is_empty());

        let mut first = SweepResults::default();
        first.push(64, record(1));
        first.save(&path).unwrap();

        let mut loaded = SweepResults::load(&path).unwrap();
        assert_eq!(loaded, first);

        let mut second = SweepResults::default();
        second.push(64, record(2));
        second.push(128, record(1));
        loaded.merge(second);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.records(64).len(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_sweep_fills_every_point() {
        let config = SweepConfig {
            mtus: vec![32, 256],
            gaps_ms: vec![0, 3],
            repeats: 2,
            ..Default::default()
        };
        let channel = ChannelConfig {
            frame_loss: 0.1,
            seed: Some(17),
            ..Default::default()
        };
        let mut seen = 0;
        let results = simulate(channel, config, |_, _, _| seen += 1).await.unwrap();

        assert_eq!(seen, 8);
        assert_eq!(results.len(), 8);
        for mtu in [32, 256] {
            let records = results.records(mtu);
            assert_eq!(records.len(), 4);
            assert!(records.iter().all(|r| !r.aborted && r.packets_received == 10));
            assert!(records.iter().all(|r| r.expected_throughput > 0.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_records_aborted_runs() {
        let (mut link, _far_end) = SimulatedLink::pair(ChannelConfig::default());
        let config = SweepConfig {
            mtus: vec![64],
            gaps_ms: vec![0],
            repeats: 2,
            ..Default::default()
        };
        let mut results = SweepResults::default();
        Sweep::with_run_ids(config, RunIdAllocator::with_seed(1))
            .run(&mut link, &mut results, |_, _, _| {})
            .await
            .unwrap();

        let records = results.records(64);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.aborted && r.loss == 100.0));
    }
}
