//! One end of a real RF433 benchmark.
//!
//! Each node talks to its radio module through a serial-over-TCP bridge (for example ser2net).
//! Start the receiving node first, then the transmitting node, which runs the sweep and writes
//! the results file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{info, warn};

use rf433_radio::{ReceiverConfig, ReceiverSession, StreamTransport};
use rf433_sim::{Sweep, SweepConfig, SweepResults};

/// RF433 selective-repeat link benchmark.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Answer benchmark runs until the bridge closes.
    Rx {
        /// Address of the serial bridge of the receiving module.
        #[arg(short, long, default_value = "127.0.0.1:7001")]
        bridge: String,
        /// Seconds to wait for the next control message.
        #[arg(long, default_value_t = 120)]
        sync_timeout: u64,
    },
    /// Run the MTU x gap sweep and record the results.
    Tx {
        /// Address of the serial bridge of the transmitting module.
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        bridge: String,
        /// Results file. Existing results are kept and extended.
        #[arg(short, long, default_value = "rf433_results_fresh.json")]
        output: PathBuf,
        /// Comma separated MTUs, overriding the default grid.
        #[arg(long, value_delimiter = ',')]
        mtus: Vec<u16>,
        /// Comma separated inter-frame gaps in milliseconds.
        #[arg(long, value_delimiter = ',')]
        gaps: Vec<u64>,
        #[arg(long, default_value_t = 1)]
        repeats: u32,
        /// Frames per run.
        #[arg(long, default_value_t = 10)]
        count: u16,
        #[arg(long, default_value_t = 12)]
        window: u16,
        #[arg(long, default_value_t = 80)]
        max_rounds: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.role {
        Role::Rx { bridge, sync_timeout } => {
            let transport = StreamTransport::connect_tcp(&bridge)
                .await
                .with_context(|| format!("connecting to {bridge}"))?;
            info!("Receiver listening on {}", bridge);
            let config = ReceiverConfig {
                sync_timeout: Duration::from_secs(sync_timeout),
                ..Default::default()
            };
            let mut session = ReceiverSession::new(transport, config);
            session
                .serve(|run| {
                    let line = format!(
                        "run={} mtu={} recv={}/{} loss={:.1}% crc={} to={} bursts={}",
                        run.run_id,
                        run.mtu,
                        run.received,
                        run.count,
                        run.loss_pct,
                        run.crc_fail,
                        run.timeouts,
                        run.bursts
                    );
                    if run.completed {
                        println!("{}", line.green());
                    } else {
                        println!("{}", line.yellow());
                    }
                })
                .await?;
        }
        Role::Tx {
            bridge,
            output,
            mtus,
            gaps,
            repeats,
            count,
            window,
            max_rounds,
        } => {
            let mut config = SweepConfig {
                repeats,
                ..Default::default()
            };
            if !mtus.is_empty() {
                config.mtus = mtus;
            }
            if !gaps.is_empty() {
                config.gaps_ms = gaps;
            }
            config.run.count = count;
            config.run.window = window;
            config.run.max_rounds = max_rounds;

            let mut results = SweepResults::load(&output)
                .with_context(|| format!("reading {}", output.display()))?;
            let mut transport = StreamTransport::connect_tcp(&bridge)
                .await
                .with_context(|| format!("connecting to {bridge}"))?;

            println!("{}", "RF433 Benchmark TX".bright_blue().bold());
            println!(
                "Bridge: {}  Output: {}  MTU: {:?}  Gap(ms): {:?}  Packets/test: {}  Repeats: {}",
                bridge,
                output.display(),
                config.mtus,
                config.gaps_ms,
                config.run.count,
                config.repeats
            );

            let mut sweep = Sweep::new(config);
            sweep
                .run(&mut transport, &mut results, |point, record, results| {
                    let status = if record.aborted {
                        "ABORT".red()
                    } else {
                        "OK".green()
                    };
                    println!(
                        "[{:<5}] mtu={:>4} gap={:>3}ms repeat={} recv={:>3}/{:<3} loss={:>5.1}% thr={:>7.1} B/s crc={:>5.1}% to={:>3}",
                        status,
                        point.mtu,
                        record.gap_ms,
                        point.repeat,
                        record.packets_received,
                        record.packets_expected,
                        record.loss,
                        record.rf_throughput,
                        record.crc_failure_percent,
                        record.timeouts
                    );
                    if let Err(e) = results.save(&output) {
                        warn!("Could not save {}: {}", output.display(), e);
                    }
                })
                .await?;

            println!("{}", format!("Results saved to {}", output.display()).bright_green());
        }
    }
    Ok(())
}
