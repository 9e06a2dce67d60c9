use std::time::Duration;

use serde::{Deserialize, Serialize};

use rf433_core::payload_capacity;

use crate::airtime;
use crate::transmitter::RunOutcome;

/// One measured point of a sweep, in the shape the analysis scripts read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub gap_ms: u64,
    pub repeat: u32,
    /// Payload bytes per second between the first and the last valid frame.
    pub rf_throughput: f64,
    /// Payload bytes per second the link could carry at this MTU and gap.
    pub expected_throughput: f64,
    pub loss: f64,
    pub packets_received: u16,
    pub packets_expected: u16,
    pub crc_failure_percent: f64,
    pub timeouts: u32,
    pub aborted: bool,
}

impl ResultRecord {
    pub fn from_outcome(outcome: &RunOutcome, repeat: u32, baud_rate: u32) -> Self {
        let payload = payload_capacity(outcome.mtu).unwrap_or(0) as f64;
        let received = outcome.received.min(outcome.count);
        let bytes_received = received as f64 * payload;

        let rf_throughput = outcome
            .rx_span
            .or(outcome.frame_span)
            .filter(|span| !span.is_zero())
            .map(|span| bytes_received / span.as_secs_f64())
            .unwrap_or(0.0);

        // time slot of one packet: serial airtime of the whole frame plus the configured gap
        let slot = airtime(outcome.mtu as usize, baud_rate) + outcome.gap;
        let expected_throughput = if received > 0 && !slot.is_zero() {
            bytes_received / (received as f64 * slot.as_secs_f64())
        } else {
            0.0
        };

        Self {
            gap_ms: outcome.gap.as_millis() as u64,
            repeat,
            rf_throughput,
            expected_throughput,
            loss: percent(outcome.count - received, outcome.count),
            packets_received: received,
            packets_expected: outcome.count,
            crc_failure_percent: percent_u32(outcome.crc_fail, outcome.count),
            timeouts: outcome.timeouts,
            aborted: outcome.aborted,
        }
    }

    /// Record for a run that never produced an outcome, e.g. because the link failed.
    pub fn failed(gap: Duration, repeat: u32, count: u16) -> Self {
        Self {
            gap_ms: gap.as_millis() as u64,
            repeat,
            rf_throughput: 0.0,
            expected_throughput: 0.0,
            loss: 100.0,
            packets_received: 0,
            packets_expected: count,
            crc_failure_percent: 0.0,
            timeouts: 0,
            aborted: true,
        }
    }
}

fn percent(part: u16, whole: u16) -> f64 {
    percent_u32(part as u32, whole)
}

fn percent_u32(part: u32, whole: u16) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> RunOutcome {
        RunOutcome {
            run_id: 1,
            mtu: 256,
            gap: Duration::from_millis(5),
            count: 10,
            received: 10,
            loss_pct: 0.0,
            crc_fail: 2,
            timeouts: 0,
            rounds: 2,
            bursts: 3,
            frames_sent: 12,
            aborted: false,
            abort_reason: None,
            final_confirmed: true,
            elapsed: Duration::from_secs(4),
            frame_span: Some(Duration::from_millis(2800)),
            rx_span: Some(Duration::from_millis(2420)),
        }
    }

    #[test]
    fn test_record_from_clean_run() {
        let record = ResultRecord::from_outcome(&outcome(), 3, 9600);
        assert_eq!(record.gap_ms, 5);
        assert_eq!(record.repeat, 3);
        assert_eq!(record.loss, 0.0);
        assert_eq!(record.packets_received, 10);
        assert_eq!(record.crc_failure_percent, 20.0);
        // 2420 payload bytes over the receiver's 2.42 s span
        assert!((record.rf_throughput - 1000.0).abs() < 1e-9);
        // 242 bytes per 266.67 ms airtime + 5 ms gap
        let slot = 256.0 * 10.0 / 9600.0 + 0.005;
        assert!((record.expected_throughput - 242.0 / slot).abs() < 1e-6);
    }

    #[test]
    fn test_local_span_used_without_final() {
        let mut run = outcome();
        run.rx_span = None;
        run.received = 7;
        let record = ResultRecord::from_outcome(&run, 0, 9600);
        assert!((record.rf_throughput - 7.0 * 242.0 / 2.8).abs() < 1e-9);
        assert!((record.loss - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_received_has_zero_throughput() {
        let mut run = outcome();
        run.received = 0;
        run.rx_span = None;
        run.frame_span = Some(Duration::ZERO);
        run.aborted = true;
        let record = ResultRecord::from_outcome(&run, 0, 9600);
        assert_eq!(record.rf_throughput, 0.0);
        assert_eq!(record.expected_throughput, 0.0);
        assert_eq!(record.loss, 100.0);
        assert!(record.aborted);
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(ResultRecord::failed(Duration::from_millis(7), 1, 10)).unwrap();
        for key in [
            "gap_ms",
            "repeat",
            "rf_throughput",
            "expected_throughput",
            "loss",
            "packets_received",
            "packets_expected",
            "crc_failure_percent",
            "timeouts",
            "aborted",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["gap_ms"], 7);
    }
}
