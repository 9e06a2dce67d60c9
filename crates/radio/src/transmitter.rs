//! Transmitting side of a benchmark run: SYNC handshake, selective-repeat bursts, END/FINAL.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use rf433_core::{frame, payload_capacity, ControlMessage, FrameError, RunId, Seq};

use crate::demux::{Inbound, StreamDemux};
use crate::transport::Transport;
use crate::{airtime, PayloadSource, RadioError, TransmitterConfig};

/// How many recently issued run ids are never handed out again.
pub const RECENT_RUN_IDS: usize = 64;

/// Hands out random non-zero run ids without repeating any of the last [`RECENT_RUN_IDS`].
pub struct RunIdAllocator {
    recent: VecDeque<RunId>,
    rng: StdRng,
}

impl Default for RunIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunIdAllocator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_rng(&mut rand::rng()))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            recent: VecDeque::with_capacity(RECENT_RUN_IDS + 1),
            rng,
        }
    }

    pub fn next_id(&mut self) -> RunId {
        loop {
            let id = self.rng.random_range(1..=RunId::MAX);
            if self.recent.contains(&id) {
                continue;
            }
            self.recent.push_back(id);
            if self.recent.len() > RECENT_RUN_IDS {
                self.recent.pop_front();
            }
            return id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterState {
    Idle,
    SyncSent,
    Bursting,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The receiver never acknowledged SYNC.
    NoAck,
    /// Frames were still missing after `max_rounds`.
    RoundsExhausted,
}

/// Result of one run as seen by the transmitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub mtu: u16,
    pub gap: Duration,
    pub count: u16,
    pub received: u16,
    pub loss_pct: f64,
    pub crc_fail: u32,
    pub timeouts: u32,
    /// Passes over the pending frames.
    pub rounds: u32,
    pub bursts: u32,
    pub frames_sent: u32,
    pub aborted: bool,
    pub abort_reason: Option<AbortReason>,
    /// Whether the numbers above come from the receiver's FINAL rather than local bookkeeping.
    pub final_confirmed: bool,
    pub elapsed: Duration,
    /// Local time between the first and the last frame written.
    pub frame_span: Option<Duration>,
    /// Receiver time between its first and last valid frame, from FINAL.
    pub rx_span: Option<Duration>,
}

struct ReportView {
    missing: Vec<Seq>,
    crc_fail: u32,
    timeouts: u32,
}

pub struct TransmitterSession<'a, T: ?Sized> {
    transport: &'a mut T,
    config: TransmitterConfig,
    demux: StreamDemux,
    state: TransmitterState,
    run_id: RunId,
    count: u16,
    capacity: usize,
    /// Bytes written since the last reply deadline was set.
    in_flight: usize,
    rng: StdRng,
}

impl<'a, T> TransmitterSession<'a, T>
where
    T: Transport + ?Sized,
{
    pub fn new(transport: &'a mut T, config: TransmitterConfig, run_id: RunId) -> Result<Self, RadioError> {
        config.validate()?;
        let count = config.frame_count()?;
        let capacity = payload_capacity(config.mtu).ok_or(FrameError::MtuTooSmall(config.mtu))?;
        Ok(Self {
            transport,
            config,
            demux: StreamDemux::default(),
            state: TransmitterState::Idle,
            run_id,
            count,
            capacity,
            in_flight: 0,
            rng: StdRng::from_rng(&mut rand::rng()),
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> TransmitterState {
        self.state
    }

    /// Drives the run to completion. Lost messages and lost frames end up in the outcome;
    /// only transport failures are returned as errors.
    ///
    /// A round is one pass over the frames still pending when it starts, sent as consecutive
    /// bursts of at most `window` frames, each answered by its own REPORT.
    pub async fn run(mut self) -> Result<RunOutcome, RadioError> {
        let started = Instant::now();
        info!(
            "Run {}: mtu={} gap={:?} count={} window={}",
            self.run_id, self.config.mtu, self.config.gap, self.count, self.config.window
        );

        let mut tally = Tally::default();
        if !self.sync().await? {
            warn!("Run {}: no SYNC_ACK after {} attempts", self.run_id, self.config.sync_attempts);
            self.state = TransmitterState::Closed;
            return Ok(self.outcome(&tally, 0, Some(AbortReason::NoAck), None, started.elapsed()));
        }

        let mut pending: BTreeSet<Seq> = (0..self.count).collect();
        while !pending.is_empty() && tally.rounds < self.config.max_rounds {
            tally.rounds += 1;
            let round: Vec<Seq> = pending.iter().copied().collect();
            for burst in round.chunks(self.config.window as usize) {
                tally.bursts += 1;
                debug!("Run {} round {}: burst {:?}", self.run_id, tally.rounds, burst);
                self.send_burst(burst, &mut tally).await?;

                match self.await_report(burst, tally.bursts).await? {
                    Some(report) => {
                        for seq in burst {
                            if !report.missing.contains(seq) {
                                pending.remove(seq);
                            }
                        }
                        tally.crc_fail = report.crc_fail;
                        tally.timeouts = report.timeouts;
                        debug!(
                            "Run {} round {}: {} missing, {} pending",
                            self.run_id,
                            tally.rounds,
                            report.missing.len(),
                            pending.len()
                        );
                    }
                    None => warn!(
                        "Run {} round {}: no REPORT, burst stays pending",
                        self.run_id, tally.rounds
                    ),
                }
            }
        }

        let abort_reason = if pending.is_empty() {
            None
        } else {
            warn!(
                "Run {}: {} frames still missing after {} rounds",
                self.run_id,
                pending.len(),
                tally.rounds
            );
            Some(AbortReason::RoundsExhausted)
        };

        self.state = TransmitterState::Closing;
        self.send(&ControlMessage::End { run_id: self.run_id }).await?;
        let final_message = self.await_final().await?;
        if final_message.is_none() {
            warn!("Run {}: no FINAL, using local statistics", self.run_id);
        }
        self.state = TransmitterState::Closed;

        let received = self.count - pending.len() as u16;
        let outcome = self.outcome(&tally, received, abort_reason, final_message, started.elapsed());
        info!(
            "Run {} done: {}/{} received, loss {:.1}%, {} rounds{}",
            outcome.run_id,
            outcome.received,
            outcome.count,
            outcome.loss_pct,
            outcome.rounds,
            if outcome.aborted { ", aborted" } else { "" }
        );
        Ok(outcome)
    }

    async fn send_burst(&mut self, burst: &[Seq], tally: &mut Tally) -> Result<(), RadioError> {
        self.send(&ControlMessage::Burst {
            run_id: self.run_id,
            seqs: burst.to_vec(),
            burst: Some(tally.bursts),
        })
        .await?;

        for (i, seq) in burst.iter().enumerate() {
            if i > 0 && !self.config.gap.is_zero() {
                sleep(self.config.gap).await;
            }
            let bytes = self.encode_frame(*seq)?;
            self.transport.write_all(&bytes).await?;
            self.in_flight += bytes.len();
            let now = Instant::now();
            tally.first_write.get_or_insert(now);
            tally.last_write = Some(now);
            tally.frames_sent += 1;
        }
        Ok(())
    }

    async fn sync(&mut self) -> Result<bool, RadioError> {
        let total_size = match &self.config.payload {
            PayloadSource::Data(data) => Some(data.len() as u32),
            _ => None,
        };
        let sync = ControlMessage::Sync {
            run_id: self.run_id,
            mtu: self.config.mtu,
            count: self.count,
            window: self.config.window,
            total_size,
        };

        for attempt in 1..=self.config.sync_attempts {
            self.state = TransmitterState::SyncSent;
            self.send(&sync).await?;
            let deadline = self.reply_deadline(self.config.sync_timeout);
            while let Some(item) = self.next_until(deadline).await? {
                match item {
                    Inbound::Control(ControlMessage::SyncAck { run_id }) if run_id == self.run_id => {
                        debug!("Run {}: SYNC_ACK on attempt {}", self.run_id, attempt);
                        self.state = TransmitterState::Bursting;
                        return Ok(true);
                    }
                    other => trace!("Ignoring {:?} while awaiting SYNC_ACK", other),
                }
            }
            debug!("Run {}: SYNC attempt {} timed out", self.run_id, attempt);
        }
        Ok(false)
    }

    /// Waits for the REPORT answering burst number `number`. Reports of earlier bursts, which
    /// can trail in after their own timeout, are skipped.
    async fn await_report(
        &mut self,
        burst: &[Seq],
        number: u32,
    ) -> Result<Option<ReportView>, RadioError> {
        let deadline = self.reply_deadline(self.config.report_timeout);
        while let Some(item) = self.next_until(deadline).await? {
            match item {
                Inbound::Control(ControlMessage::Report {
                    run_id,
                    missing,
                    crc_fail,
                    timeouts,
                    burst: answered,
                    ..
                }) if run_id == self.run_id => {
                    // receivers that do not echo the burst number are matched on the seqs alone
                    let stale = answered.is_some_and(|n| n != number)
                        || missing.iter().any(|seq| !burst.contains(seq));
                    if stale {
                        debug!(
                            "Run {}: stale REPORT {:?} for burst {:?}, waiting for burst {}",
                            self.run_id, missing, answered, number
                        );
                        continue;
                    }
                    return Ok(Some(ReportView {
                        missing,
                        crc_fail,
                        timeouts,
                    }));
                }
                other => trace!("Ignoring {:?} while awaiting REPORT", other),
            }
        }
        Ok(None)
    }

    async fn await_final(&mut self) -> Result<Option<ControlMessage>, RadioError> {
        let deadline = self.reply_deadline(self.config.final_timeout);
        while let Some(item) = self.next_until(deadline).await? {
            match item {
                Inbound::Control(msg @ ControlMessage::Final { .. }) if msg.run_id() == self.run_id => {
                    return Ok(Some(msg));
                }
                other => trace!("Ignoring {:?} while awaiting FINAL", other),
            }
        }
        Ok(None)
    }

    /// `timeout` from now, plus the time the radio still needs to put the bytes written since the
    /// last deadline on the air.
    fn reply_deadline(&mut self, timeout: Duration) -> Instant {
        let written = std::mem::take(&mut self.in_flight);
        let draining = self
            .config
            .baud_rate
            .map(|baud| airtime(written, baud))
            .unwrap_or_default();
        Instant::now() + timeout + draining
    }

    async fn next_until(&mut self, deadline: Instant) -> Result<Option<Inbound>, RadioError> {
        self.demux
            .next_until(&mut *self.transport, deadline, self.config.poll_interval)
            .await
    }

    async fn send(&mut self, msg: &ControlMessage) -> Result<(), RadioError> {
        let line = msg.encode_line()?;
        trace!("-> {}", String::from_utf8_lossy(&line).trim_end());
        self.transport.write_all(&line).await?;
        self.in_flight += line.len();
        Ok(())
    }

    fn encode_frame(&mut self, seq: Seq) -> Result<Bytes, RadioError> {
        let payload = match &self.config.payload {
            PayloadSource::Filler(byte) => vec![*byte; self.capacity],
            PayloadSource::Random => {
                let mut payload = vec![0u8; self.capacity];
                self.rng.fill_bytes(&mut payload);
                payload
            }
            PayloadSource::Data(data) => {
                let start = (seq as usize * self.capacity).min(data.len());
                let end = (start + self.capacity).min(data.len());
                let mut payload = data[start..end].to_vec();
                payload.resize(self.capacity, 0);
                payload
            }
        };
        Ok(frame::encode(self.run_id, seq, self.count, &payload, self.config.mtu)?)
    }

    fn outcome(
        &self,
        tally: &Tally,
        received: u16,
        abort_reason: Option<AbortReason>,
        final_message: Option<ControlMessage>,
        elapsed: Duration,
    ) -> RunOutcome {
        let frame_span = match (tally.first_write, tally.last_write) {
            (Some(first), Some(last)) => Some(last.duration_since(first)),
            _ => None,
        };
        let mut outcome = RunOutcome {
            run_id: self.run_id,
            mtu: self.config.mtu,
            gap: self.config.gap,
            count: self.count,
            received,
            loss_pct: (self.count - received) as f64 / self.count as f64 * 100.0,
            crc_fail: tally.crc_fail,
            timeouts: tally.timeouts,
            rounds: tally.rounds,
            bursts: tally.bursts,
            frames_sent: tally.frames_sent,
            aborted: abort_reason.is_some(),
            abort_reason,
            final_confirmed: false,
            elapsed,
            frame_span,
            rx_span: None,
        };
        if let Some(ControlMessage::Final {
            received,
            loss_pct,
            crc_fail,
            timeouts,
            span_ms,
            ..
        }) = final_message
        {
            outcome.received = received.min(self.count);
            outcome.loss_pct = loss_pct;
            outcome.crc_fail = crc_fail;
            outcome.timeouts = timeouts;
            outcome.rx_span = span_ms.map(Duration::from_millis);
            outcome.final_confirmed = true;
        }
        outcome
    }
}

#[derive(Default)]
struct Tally {
    rounds: u32,
    bursts: u32,
    frames_sent: u32,
    crc_fail: u32,
    timeouts: u32,
    first_write: Option<Instant>,
    last_write: Option<Instant>,
}
