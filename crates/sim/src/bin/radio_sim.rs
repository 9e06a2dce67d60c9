//! simulated RF433 benchmark sweep

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rf433_radio::ResultRecord;
use rf433_sim::{simulate, SimulationPresets, SweepConfig, SweepPoint};

fn describe(point: &SweepPoint, record: &ResultRecord) -> String {
    let status = if record.aborted {
        "ABORT".red().to_string()
    } else {
        "OK".green().to_string()
    };
    format!(
        "[{:<5}] mtu={:>4} gap={:>2}ms recv={:>2}/{:<2} loss={:>5.1}% thr={:>7.1} B/s crc={:>5.1}% to={:>3}",
        status,
        point.mtu,
        record.gap_ms,
        record.packets_received,
        record.packets_expected,
        record.loss,
        record.rf_throughput,
        record.crc_failure_percent,
        record.timeouts
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "RF433 Link Simulation".bright_blue().bold());
    println!("{}", "=====================".bright_blue());
    println!();

    let test_scenarios = vec![
        ("Clean Link", SimulationPresets::clean_link()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
        ("Extreme Conditions", SimulationPresets::extreme_conditions()),
    ];

    let style = ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("=> ");

    for (name, channel) in test_scenarios {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("Frame Loss: {:.0}%", channel.frame_loss * 100.0);
        println!("Frame Corruption: {:.0}%", channel.frame_corruption * 100.0);
        println!("Control Loss: {:.0}%", channel.control_loss * 100.0);
        println!("Noise Bursts: {:.0}%", channel.noise * 100.0);
        println!();

        let config = SweepConfig::quick();
        let progress = ProgressBar::new(config.total_runs() as u64);
        progress.set_style(style.clone());

        let results = simulate(channel, config, |point, record, _| {
            progress.println(describe(point, record));
            progress.set_message(format!("mtu {}", point.mtu));
            progress.inc(1);
        })
        .await?;
        progress.finish_and_clear();

        let aborted = results.all_records().filter(|record| record.aborted).count();
        println!(
            "{}",
            format!("{} runs, {} aborted", results.len(), aborted).bright_yellow()
        );
        println!("{}", "-".repeat(50));
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
