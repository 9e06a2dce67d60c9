//! End-to-end runs of a transmitter and a receiver over a simulated link.
//!
//! Both sides are spawned as separate tokio tasks and talk only through the byte stream. Time is
//! paused, so frame and report timeouts elapse instantly once both sides are idle.

use std::sync::{Arc, Mutex};

use rf433_core::{ControlMessage, MAGIC_BYTES};
use rf433_radio::{
    AbortReason, ChannelConfig, PayloadSource, ReceiverConfig, ReceiverSession, RunIdAllocator,
    RunOutcome, RunSummary, SimulatedEndpoint, SimulatedLink, TransmitterConfig,
    TransmitterSession,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn frame_seq(bytes: &[u8]) -> Option<u16> {
    if bytes.len() >= 6 && bytes.starts_with(&MAGIC_BYTES) {
        Some(u16::from_be_bytes([bytes[4], bytes[5]]))
    } else {
        None
    }
}

/// Control messages seen crossing one direction of the link.
#[derive(Clone, Default)]
struct Wiretap(Arc<Mutex<Vec<ControlMessage>>>);

impl Wiretap {
    fn record(&self, bytes: &[u8]) {
        if let Ok(msg) = ControlMessage::decode_line(bytes) {
            self.0.lock().unwrap().push(msg);
        }
    }

    fn bursts(&self) -> Vec<Vec<u16>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|msg| match msg {
                ControlMessage::Burst { seqs, .. } => Some(seqs.clone()),
                _ => None,
            })
            .collect()
    }

    fn reports(&self) -> Vec<(Vec<u16>, u32)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|msg| match msg {
                ControlMessage::Report {
                    missing, crc_fail, ..
                } => Some((missing.clone(), *crc_fail)),
                _ => None,
            })
            .collect()
    }
}

fn config(count: u16, window: u16) -> TransmitterConfig {
    TransmitterConfig {
        mtu: 256,
        count,
        window,
        payload: PayloadSource::Filler(0xBB),
        ..Default::default()
    }
}

async fn run_session(
    tx_link: SimulatedEndpoint,
    rx_link: SimulatedEndpoint,
    config: TransmitterConfig,
    run_id: u16,
) -> (RunOutcome, RunSummary) {
    let receiver = tokio::spawn(async move {
        let mut session = ReceiverSession::new(rx_link, ReceiverConfig::default());
        session.run_once().await
    });
    let transmitter = tokio::spawn(async move {
        let mut link = tx_link;
        TransmitterSession::new(&mut link, config, run_id)?.run().await
    });

    let (rx, tx) = tokio::join!(receiver, transmitter);
    let summary = rx
        .expect("receiver task")
        .expect("receiver session")
        .expect("receiver saw the run");
    let outcome = tx.expect("transmitter task").expect("transmitter session");
    (outcome, summary)
}

#[tokio::test(start_paused = true)]
async fn test_clean_link_single_round() {
    init_logging();
    let (tx_link, rx_link) = SimulatedLink::pair(ChannelConfig::default());
    let (outcome, summary) = run_session(tx_link, rx_link, config(10, 5), 4711).await;

    assert!(outcome.final_confirmed);
    assert!(!outcome.aborted);
    assert_eq!(outcome.received, 10);
    assert_eq!(outcome.count, 10);
    assert_eq!(outcome.loss_pct, 0.0);
    assert_eq!(outcome.crc_fail, 0);
    assert_eq!(outcome.timeouts, 0);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.bursts, 2);
    assert_eq!(outcome.frames_sent, 10);

    assert!(summary.completed);
    assert_eq!(summary.run_id, 4711);
    assert_eq!(summary.received_total, 10);
}

#[tokio::test(start_paused = true)]
async fn test_single_corruption_is_repaired_in_second_round() {
    init_logging();
    let forward = Wiretap::default();
    let backward = Wiretap::default();

    let tap = forward.clone();
    let mut corrupted = false;
    let corrupt_seq_3_once = move |bytes: &mut Vec<u8>| {
        tap.record(bytes);
        if !corrupted && frame_seq(bytes) == Some(3) {
            bytes[100] ^= 0x04;
            corrupted = true;
        }
        true
    };
    let tap = backward.clone();
    let record_replies = move |bytes: &mut Vec<u8>| {
        tap.record(bytes);
        true
    };
    let (tx_link, rx_link) =
        SimulatedLink::pair_with(Box::new(corrupt_seq_3_once), Box::new(record_replies), None);

    let (outcome, summary) = run_session(tx_link, rx_link, config(10, 5), 99).await;

    let reports = backward.reports();
    assert_eq!(reports[0].0, vec![3]);
    assert_eq!(reports[0].1, 1);
    assert_eq!(
        forward.bursts(),
        vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9], vec![3]]
    );

    assert!(!outcome.aborted);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.received, 10);
    assert!(outcome.crc_fail >= 1);
    assert_eq!(outcome.loss_pct, 0.0);
    assert_eq!(summary.received, 10);
}

#[tokio::test(start_paused = true)]
async fn test_unrecoverable_frame_aborts_after_max_rounds() {
    init_logging();
    let forward = Wiretap::default();
    let tap = forward.clone();
    let drop_seq_7 = move |bytes: &mut Vec<u8>| {
        tap.record(bytes);
        frame_seq(bytes) != Some(7)
    };
    let (tx_link, rx_link) =
        SimulatedLink::pair_with(Box::new(drop_seq_7), Box::new(|_: &mut Vec<u8>| true), None);

    let config = TransmitterConfig {
        max_rounds: 2,
        ..config(10, 5)
    };
    let (outcome, summary) = run_session(tx_link, rx_link, config, 7).await;

    assert!(outcome.aborted);
    assert_eq!(outcome.abort_reason, Some(AbortReason::RoundsExhausted));
    assert!(outcome.final_confirmed);
    assert_eq!(outcome.received, 9);
    assert_eq!(outcome.loss_pct, 10.0);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(forward.bursts().last(), Some(&vec![7]));

    // END was still sent, so the receiver closed the run with a partial FINAL
    assert!(summary.completed);
    assert_eq!(summary.timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_converges() {
    init_logging();
    let channel = ChannelConfig {
        frame_loss: 0.3,
        frame_corruption: 0.1,
        seed: Some(42),
        ..Default::default()
    };
    let (tx_link, rx_link) = SimulatedLink::pair(channel);
    let (outcome, summary) = run_session(tx_link, rx_link, config(40, 12), 1234).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.received, 40);
    assert_eq!(outcome.loss_pct, 0.0);
    assert!(outcome.rounds > 1);
    assert!(outcome.frames_sent > 40);
    assert_eq!(summary.received, 40);
    assert!(summary.received_total >= 40);
}

#[tokio::test(start_paused = true)]
async fn test_noise_between_frames_is_skipped() {
    init_logging();
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(5);
    let noisy_frames = move |bytes: &mut Vec<u8>| {
        if frame_seq(bytes).is_some() {
            let mut noisy: Vec<u8> = (0..rng.random_range(1..40)).map(|_| rng.random()).collect();
            noisy.append(bytes);
            *bytes = noisy;
        }
        true
    };
    let (tx_link, rx_link) =
        SimulatedLink::pair_with(Box::new(noisy_frames), Box::new(|_: &mut Vec<u8>| true), None);
    let (outcome, summary) = run_session(tx_link, rx_link, config(10, 5), 321).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.received, 10);
    assert_eq!(summary.received, 10);
}

#[tokio::test(start_paused = true)]
async fn test_lost_report_resends_burst() {
    init_logging();
    let mut dropped = false;
    let drop_first_report = move |bytes: &mut Vec<u8>| {
        if !dropped && bytes.starts_with(b"{\"type\":\"REPORT\"") {
            dropped = true;
            return false;
        }
        true
    };
    let (tx_link, rx_link) = SimulatedLink::pair_with(
        Box::new(|_: &mut Vec<u8>| true),
        Box::new(drop_first_report),
        None,
    );
    let (outcome, summary) = run_session(tx_link, rx_link, config(10, 5), 55).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.frames_sent, 15);
    // duplicates count towards received_total but not towards the received set
    assert_eq!(summary.received_total, 15);
    assert_eq!(summary.received, 10);
}

#[tokio::test(start_paused = true)]
async fn test_data_mode_reassembles_payload() {
    init_logging();
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
    let channel = ChannelConfig {
        frame_loss: 0.2,
        seed: Some(9),
        ..Default::default()
    };
    let (tx_link, rx_link) = SimulatedLink::pair(channel);
    let config = TransmitterConfig {
        mtu: 64,
        payload: PayloadSource::Data(data.clone()),
        ..Default::default()
    };
    let (outcome, summary) = run_session(tx_link, rx_link, config, 808).await;

    assert_eq!(outcome.count, 20);
    assert!(!outcome.aborted);
    assert_eq!(summary.data, Some(data));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_runs_on_one_link() {
    init_logging();
    let (tx_link, rx_link) = SimulatedLink::pair(ChannelConfig::default());

    let receiver = tokio::spawn(async move {
        let mut session = ReceiverSession::new(rx_link, ReceiverConfig::default());
        let mut runs = Vec::new();
        let served = session.serve(|summary| runs.push(summary)).await;
        served.map(|_| runs)
    });
    let transmitter = tokio::spawn(async move {
        let mut link = tx_link;
        let mut ids = RunIdAllocator::with_seed(3);
        let mut outcomes = Vec::new();
        for mtu in [32, 128, 1500] {
            let config = TransmitterConfig {
                mtu,
                ..config(10, 12)
            };
            let outcome = TransmitterSession::new(&mut link, config, ids.next_id())?.run().await?;
            outcomes.push(outcome);
        }
        Ok::<_, rf433_radio::RadioError>(outcomes)
    });

    let outcomes = transmitter.await.unwrap().unwrap();
    let runs = receiver.await.unwrap().unwrap();
    assert_eq!(runs.len(), 3);
    for (outcome, run) in outcomes.iter().zip(&runs) {
        assert_eq!(outcome.run_id, run.run_id);
        assert_eq!(outcome.mtu, run.mtu);
        assert!(run.completed);
        assert_eq!(outcome.received, 10);
    }
}
