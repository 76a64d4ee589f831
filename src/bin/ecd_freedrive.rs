//! Freedrive walkthrough
//!
//! Takes external control of the robot, enters freedrive and holds the
//! mode open with NOOP keepalives until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use ecd::{Driver, DriverConfig, FreedriveAction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "ecd_freedrive")]
#[command(about = "External control driver - freedrive example")]
#[command(version)]
struct Args {
    /// IP address of the robot
    #[arg(long)]
    robot_ip: String,

    /// IP address of the local network interface
    #[arg(long)]
    local_ip: Option<String>,

    /// Push the control script through the primary port
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    headless: bool,

    /// Path to the control script template
    #[arg(long, default_value = "resources/external_control.script")]
    script: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = DriverConfig {
        robot_ip: args.robot_ip,
        local_ip: args.local_ip,
        script_file_path: args.script.into(),
        headless_mode: args.headless,
        ..Default::default()
    };

    let driver = Driver::new(config).context("Failed to create driver")?;

    info!("Waiting for the robot to connect back...");
    while !driver.is_robot_connected() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    info!("External control script is running");

    let running = Arc::new(AtomicBool::new(true));
    let stopper = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received exit signal, leaving freedrive");
            stopper.store(false, Ordering::Relaxed);
        }
    });

    info!("Starting freedrive mode");
    if !driver.write_freedrive(FreedriveAction::Start, 100) {
        anyhow::bail!("Failed to start freedrive mode");
    }
    while running.load(Ordering::Relaxed) {
        if !driver.write_freedrive(FreedriveAction::Noop, 100) {
            anyhow::bail!("Lost the robot during freedrive");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    info!("Ending freedrive mode");
    driver.write_freedrive(FreedriveAction::End, 100);
    driver.stop_control();
    Ok(())
}
