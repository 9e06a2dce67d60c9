//! Receiving side of a benchmark run.
//!
//! The session answers SYNC, collects the frames announced by each BURST, reports what is still
//! missing and closes the run with a FINAL when the transmitter sends END. Everything it learns
//! comes through one [`StreamDemux`]; nothing else reads the transport.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde::Serialize;
use tokio::time::Instant;

use rf433_core::{ControlMessage, Frame, RunId, Seq};

use crate::demux::{Inbound, Noise, StreamDemux};
use crate::transport::Transport;
use crate::{RadioError, ReceiverConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    AwaitSync,
    Active,
    Closed,
}

/// What the receiver observed for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub mtu: u16,
    pub count: u16,
    pub received: u16,
    pub received_total: u32,
    pub crc_fail: u32,
    pub timeouts: u32,
    pub loss_pct: f64,
    pub bursts: u32,
    /// Time between the first and the last valid frame.
    pub span: Option<Duration>,
    /// `false` if the run was given up locally instead of being closed by END.
    pub completed: bool,
    /// Reassembled data of a data-mode run, present only if every chunk arrived.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

struct RunState {
    run_id: RunId,
    mtu: u16,
    count: u16,
    total_size: Option<u32>,
    received: BTreeSet<Seq>,
    received_total: u32,
    crc_fail: u32,
    timeouts: u32,
    bursts: u32,
    first_frame: Option<Instant>,
    last_frame: Option<Instant>,
    chunks: BTreeMap<Seq, Bytes>,
}

impl RunState {
    fn new(run_id: RunId, mtu: u16, count: u16, total_size: Option<u32>) -> Self {
        Self {
            run_id,
            mtu,
            count,
            total_size,
            received: BTreeSet::new(),
            received_total: 0,
            crc_fail: 0,
            timeouts: 0,
            bursts: 0,
            first_frame: None,
            last_frame: None,
            chunks: BTreeMap::new(),
        }
    }

    fn record(&mut self, frame: Frame) -> bool {
        if frame.seq >= self.count {
            debug!("Frame seq {} outside run of {} frames", frame.seq, self.count);
            return false;
        }
        let now = Instant::now();
        self.first_frame.get_or_insert(now);
        self.last_frame = Some(now);
        self.received_total += 1;
        if self.received.insert(frame.seq) && self.total_size.is_some() {
            self.chunks.insert(frame.seq, frame.payload);
        }
        true
    }

    fn missing_of(&self, seqs: &[Seq]) -> Vec<Seq> {
        let mut missing: Vec<Seq> = seqs
            .iter()
            .copied()
            .filter(|seq| !self.received.contains(seq))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    fn received(&self) -> u16 {
        self.received.len() as u16
    }

    fn loss_pct(&self) -> f64 {
        (self.count - self.received()) as f64 / self.count as f64 * 100.0
    }

    fn span(&self) -> Option<Duration> {
        Some(self.last_frame?.duration_since(self.first_frame?))
    }

    fn reassemble(&self) -> Option<Vec<u8>> {
        let total_size = self.total_size? as usize;
        if self.chunks.len() != self.count as usize {
            return None;
        }
        let mut data: Vec<u8> = self.chunks.values().flat_map(|c| c.iter().copied()).collect();
        data.truncate(total_size);
        Some(data)
    }

    fn final_message(&self) -> ControlMessage {
        ControlMessage::Final {
            run_id: self.run_id,
            received: self.received(),
            expected: self.count,
            loss_pct: self.loss_pct(),
            crc_fail: self.crc_fail,
            timeouts: self.timeouts,
            span_ms: self.span().map(|s| s.as_millis() as u64),
        }
    }

    fn summary(&self, completed: bool) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            mtu: self.mtu,
            count: self.count,
            received: self.received(),
            received_total: self.received_total,
            crc_fail: self.crc_fail,
            timeouts: self.timeouts,
            loss_pct: self.loss_pct(),
            bursts: self.bursts,
            span: self.span(),
            completed,
            data: self.reassemble(),
        }
    }
}

enum Step {
    Ignored,
    Handled,
    /// A control message cut a burst short and still has to be handled.
    Deferred(ControlMessage),
    Finished(RunSummary),
}

pub struct ReceiverSession<T> {
    transport: T,
    config: ReceiverConfig,
    demux: StreamDemux,
    state: ReceiverState,
    run: Option<RunState>,
}

impl<T: Transport> ReceiverSession<T> {
    pub fn new(transport: T, config: ReceiverConfig) -> Self {
        let demux = StreamDemux::new(config.buffer_frames);
        Self {
            transport,
            config,
            demux,
            state: ReceiverState::Idle,
            run: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.run.as_ref().map(|r| r.run_id)
    }

    /// Serves runs until the peer disconnects, handing each finished or abandoned run to
    /// `on_run`.
    pub async fn serve<F>(&mut self, mut on_run: F) -> Result<(), RadioError>
    where
        F: FnMut(RunSummary) + Send,
    {
        loop {
            match self.run_once().await {
                Ok(Some(summary)) => on_run(summary),
                Ok(None) => debug!("No SYNC within {:?}, still listening", self.config.sync_timeout),
                Err(RadioError::Disconnected) => {
                    info!("Link closed, receiver stopping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits for a SYNC and serves that run until END. Returns `None` if no run started within
    /// `sync_timeout`; an active run that goes silent for as long is returned as not completed.
    pub async fn run_once(&mut self) -> Result<Option<RunSummary>, RadioError> {
        self.state = ReceiverState::AwaitSync;
        self.run = None;

        let mut deferred: Option<ControlMessage> = None;
        let mut deadline = Instant::now() + self.config.sync_timeout;
        loop {
            let item = match deferred.take() {
                Some(msg) => Inbound::Control(msg),
                None => {
                    let next = self
                        .demux
                        .next_until(&mut self.transport, deadline, self.config.poll_interval)
                        .await?;
                    match next {
                        Some(item) => item,
                        None => return Ok(self.abandon()),
                    }
                }
            };

            let active = match item {
                Inbound::Control(msg) => match self.on_control(msg).await? {
                    Step::Ignored => false,
                    Step::Handled => true,
                    Step::Deferred(msg) => {
                        deferred = Some(msg);
                        true
                    }
                    Step::Finished(summary) => return Ok(Some(summary)),
                },
                Inbound::Frame(frame) => self.on_frame(frame),
                Inbound::Noise(noise) => {
                    self.on_noise(&noise);
                    false
                }
            };
            if active {
                deadline = Instant::now() + self.config.sync_timeout;
            }
        }
    }

    fn abandon(&mut self) -> Option<RunSummary> {
        let run = self.run.take()?;
        warn!(
            "Run {} silent for {:?}, abandoning with {}/{} frames",
            run.run_id,
            self.config.sync_timeout,
            run.received(),
            run.count
        );
        self.state = ReceiverState::AwaitSync;
        Some(run.summary(false))
    }

    async fn on_control(&mut self, msg: ControlMessage) -> Result<Step, RadioError> {
        let active = self.active_run_id();
        match msg {
            ControlMessage::Sync {
                run_id,
                mtu,
                count,
                window,
                total_size,
            } => {
                if active == Some(run_id) {
                    debug!("Repeated SYNC for run {}, acknowledging again", run_id);
                } else {
                    if let Some(old) = active {
                        warn!("Run {} superseded by SYNC for run {}", old, run_id);
                    }
                    info!(
                        "SYNC run={} mtu={} count={} window={}{}",
                        run_id,
                        mtu,
                        count,
                        window,
                        total_size.map(|s| format!(" total_size={s}")).unwrap_or_default()
                    );
                    self.run = Some(RunState::new(run_id, mtu, count, total_size));
                    self.demux.set_mtu(Some(mtu));
                    self.state = ReceiverState::Active;
                }
                self.send(&ControlMessage::SyncAck { run_id }).await?;
                Ok(Step::Handled)
            }
            msg if active != Some(msg.run_id()) => {
                trace!("Discarding {} for inactive run {}", msg.kind(), msg.run_id());
                Ok(Step::Ignored)
            }
            ControlMessage::Burst { seqs, burst, .. } => self.collect_burst(seqs, burst).await,
            ControlMessage::End { .. } => {
                let Some(run) = self.run.take() else {
                    return Ok(Step::Ignored);
                };
                self.send(&run.final_message()).await?;
                self.state = ReceiverState::Closed;
                info!(
                    "Run {} closed: {}/{} frames, {} crc failures, {} timeouts",
                    run.run_id,
                    run.received(),
                    run.count,
                    run.crc_fail,
                    run.timeouts
                );
                Ok(Step::Finished(run.summary(true)))
            }
            other => {
                debug!("Ignoring {} on the receiving side", other.kind());
                Ok(Step::Ignored)
            }
        }
    }

    /// Collects the frames of one burst, then reports. Settles early once as many frames (valid
    /// or corrupt) as announced have arrived, otherwise after `frame_timeout` of silence.
    async fn collect_burst(
        &mut self,
        seqs: Vec<Seq>,
        burst: Option<u32>,
    ) -> Result<Step, RadioError> {
        if let Some(run) = self.run.as_mut() {
            run.bursts += 1;
        }
        debug!("BURST of {} frames: {:?}", seqs.len(), seqs);

        let mut seen = 0usize;
        let mut timed_out = false;
        let mut interrupted = None;
        let mut deadline = Instant::now() + self.config.frame_timeout;
        while seen < seqs.len() {
            let next = self
                .demux
                .next_until(&mut self.transport, deadline, self.config.poll_interval)
                .await?;
            let counted = match next {
                None => {
                    timed_out = true;
                    break;
                }
                Some(Inbound::Frame(frame)) => self.on_frame(frame),
                Some(Inbound::Noise(noise)) => self.on_noise(&noise),
                Some(Inbound::Control(msg)) => {
                    interrupted = Some(msg);
                    break;
                }
            };
            if counted {
                seen += 1;
                deadline = Instant::now() + self.config.frame_timeout;
            }
        }

        let Some(run) = self.run.as_mut() else {
            return Ok(Step::Handled);
        };
        let missing = run.missing_of(&seqs);
        if timed_out || interrupted.is_some() {
            run.timeouts += missing.len() as u32;
        }
        if let Some(msg) = interrupted {
            // the transmitter already gave up on this burst, a late report would be misread
            warn!("Burst interrupted by {}, {} frames missing", msg.kind(), missing.len());
            return Ok(Step::Deferred(msg));
        }
        if timed_out {
            debug!("Burst timed out with {} frames missing", missing.len());
        }

        let report = ControlMessage::Report {
            run_id: run.run_id,
            missing,
            received_total: run.received_total,
            crc_fail: run.crc_fail,
            timeouts: run.timeouts,
            burst,
        };
        self.send(&report).await?;
        Ok(Step::Handled)
    }

    fn on_frame(&mut self, frame: Frame) -> bool {
        match self.run.as_mut() {
            Some(run) if run.run_id == frame.run_id => {
                trace!("Frame seq={} run={}", frame.seq, frame.run_id);
                run.record(frame)
            }
            _ => {
                trace!("Discarding frame seq={} of inactive run {}", frame.seq, frame.run_id);
                false
            }
        }
    }

    /// Counts a corrupt frame against the active run. Corrupt frames whose header names another
    /// run are left alone, like valid ones.
    fn on_noise(&mut self, noise: &Noise) -> bool {
        match (noise, self.run.as_mut()) {
            (Noise::BadFrame { run_id, error }, Some(run)) if *run_id == run.run_id => {
                run.crc_fail += 1;
                debug!("Corrupt frame in run {}: {}", run.run_id, error);
                true
            }
            (Noise::BadFrame { run_id, .. }, _) => {
                trace!("Discarding corrupt frame of inactive run {}", run_id);
                false
            }
            _ => false,
        }
    }

    async fn send(&mut self, msg: &ControlMessage) -> Result<(), RadioError> {
        let line = msg.encode_line()?;
        trace!("-> {}", String::from_utf8_lossy(&line).trim_end());
        self.transport.write_all(&line).await
    }
}
