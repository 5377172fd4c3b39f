use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{ArgAction, Parser};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use robot_voice_link_lib::config::RobotConfig;
use robot_voice_link_lib::core::RobotManager;
use robot_voice_link_lib::core::bluetooth::{LinkEvent, PeerIdentity, SessionTracker, Subscription};
use robot_voice_link_lib::logging;

/// How long the presenter gets to print the last notices after shutdown
const PRESENTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive the BLE robot with typed movement phrases
#[derive(Debug, Parser)]
#[command(name = "robot-voice-link", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hardware address of the robot, overrides the configuration
    #[arg(long, value_name = "XX:XX:XX:XX:XX:XX")]
    address: Option<PeerIdentity>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Presentation side: connection indicator and operator notices
async fn present(mut events: Subscription) {
    let mut tracker = SessionTracker::new();
    while let Some(event) = events.recv().await {
        if !tracker.accept(&event) {
            continue;
        }
        match event {
            LinkEvent::Connected { .. } => println!("[●] robot connected"),
            LinkEvent::Disconnected { .. } => println!("[○] robot disconnected"),
            LinkEvent::DataReceived { frame, .. } => {
                if let Some(text) = frame.display_text() {
                    println!("robot: {}", text);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if logging::init(logging::level_for_verbosity(args.verbose)).is_err() {
        eprintln!("Logger already initialized");
    }

    let mut config = match &args.config {
        Some(path) => RobotConfig::load_config(path).await?,
        None => RobotConfig::default(),
    };
    if let Some(address) = args.address {
        config.target_address = address;
    }

    let mut manager = RobotManager::new(config).await?;
    let presenter = tokio::spawn(present(manager.subscribe()));

    info!("Looking for robot {}...", manager.config().target_address);
    let peer = manager
        .find_robot()
        .await?
        .ok_or_else(|| anyhow!("robot {} not found", manager.config().target_address))?;
    manager.connect(peer).await?;

    println!("Type a movement phrase (e.g. \"jedź do przodu 50 cm\"), empty line to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let utterance = line.trim();
        if utterance.is_empty() {
            break;
        }
        match manager.say(utterance).await {
            Ok(command) => info!("Sent {}", command.encode()),
            Err(e) => warn!("{:#}", e),
        }
    }

    if let Err(e) = manager.shutdown().await {
        error!("Shutdown failed: {:#}", e);
    }
    // The bus is gone with the manager, so the presenter ends after the
    // notices still queued for it.
    if tokio::time::timeout(PRESENTER_DRAIN_TIMEOUT, presenter).await.is_err() {
        warn!("Presenter did not finish within {:?}", PRESENTER_DRAIN_TIMEOUT);
    }
    Ok(())
}
