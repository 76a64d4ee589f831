//! Primary port monitor
//!
//! Connects to the robot broadcast, prints the kinematic parameters and
//! then streams robot exceptions to stdout as JSON lines until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use ecd::{KinematicsInfo, PrimaryPortClient, RobotException, PRIMARY_PORT};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ecd_monitor")]
#[command(about = "External control driver - primary port monitor")]
#[command(version)]
struct Args {
    /// IP address of the robot
    #[arg(long)]
    robot_ip: String,

    /// Robot broadcast port
    #[arg(long, default_value_t = PRIMARY_PORT)]
    port: u16,

    /// Timeout for the kinematics fetch in milliseconds
    #[arg(long, default_value_t = 200)]
    kinematics_timeout_ms: u64,
}

fn print_exception(exception: &RobotException) {
    let event = match exception {
        RobotException::Error(e) => json!({
            "type": "error",
            "timestamp": exception.timestamp_utc().to_rfc3339(),
            "source": format!("{:?}", e.source),
            "code": e.code,
            "sub_code": e.sub_code,
            "level": format!("{:?}", e.level),
            "data": format!("{:?}", e.data),
        }),
        RobotException::Runtime(e) => json!({
            "type": "runtime",
            "timestamp": exception.timestamp_utc().to_rfc3339(),
            "source": format!("{:?}", e.source),
            "line": e.line,
            "column": e.column,
            "message": e.message,
        }),
        RobotException::Unknown(e) => json!({
            "type": "unknown",
            "timestamp": exception.timestamp_utc().to_rfc3339(),
            "source": format!("{:?}", e.source),
            "kind": e.kind,
            "payload_len": e.payload.len(),
        }),
    };
    println!("{}", event);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = PrimaryPortClient::new();
    client.register_robot_exception_callback(|exception| print_exception(&exception));

    if !client.connect(&args.robot_ip, args.port) {
        anyhow::bail!("Failed to connect to {}:{}", args.robot_ip, args.port);
    }
    info!("Connected to robot broadcast at {}:{}", args.robot_ip, args.port);

    let kinematics = Arc::new(Mutex::new(KinematicsInfo::default()));
    if client.get_package(kinematics.clone(), args.kinematics_timeout_ms) {
        let info = kinematics.lock().unwrap();
        println!(
            "{}",
            json!({
                "type": "kinematics",
                "dh_a": info.dh_a,
                "dh_d": info.dh_d,
                "dh_alpha": info.dh_alpha,
            })
        );
    } else {
        warn!("No kinematics package within {} ms", args.kinematics_timeout_ms);
    }

    info!("Streaming robot exceptions; Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    client.disconnect();
    Ok(())
}
