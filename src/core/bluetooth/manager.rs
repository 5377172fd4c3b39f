//! Robot manager
//! This module provides the main interface for the robot link: finding the
//! robot, connecting to it, and turning spoken phrases into movement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use bluest::Adapter;
use log::info;
use tokio::task::JoinHandle;

use crate::config::RobotConfig;
use crate::core::bluetooth::codec::Command;
use crate::core::bluetooth::connection::BluestLink;
use crate::core::bluetooth::events::{EventBus, Subscription};
use crate::core::bluetooth::radio::BluestRadio;
use crate::core::bluetooth::scanner::{DeviceScanner, Radio, ScanError, ScanOutcome};
use crate::core::bluetooth::session::{GattTransport, PlatformEvents, SessionHandle, spawn_session};
use crate::core::bluetooth::types::{DiscoveredPeer, LinkState, SessionId};
use crate::core::phrase::PhraseParser;

/// Owns the scanner and the link session for the one robot
pub struct RobotManager<R: Radio> {
    config: RobotConfig,
    scanner: DeviceScanner<R>,
    session: SessionHandle,
    session_task: JoinHandle<()>,
    bus: Arc<EventBus>,
    parser: PhraseParser,
}

impl RobotManager<BluestRadio> {
    /// Creates a manager on the system's default Bluetooth adapter
    pub async fn new(config: RobotConfig) -> Result<Self> {
        let adapter = Adapter::default().await.ok_or(ScanError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let devices = Arc::new(Mutex::new(HashMap::new()));
        let radio = Arc::new(BluestRadio::new(adapter.clone(), devices.clone()));
        Ok(Self::from_parts(config, radio, move |events| {
            BluestLink::new(adapter, devices, events)
        }))
    }
}

impl<R: Radio> RobotManager<R> {
    pub fn from_parts<T, F>(config: RobotConfig, radio: Arc<R>, make_transport: F) -> Self
    where
        T: GattTransport,
        F: FnOnce(PlatformEvents) -> T,
    {
        let bus = Arc::new(EventBus::new());
        let (session, session_task) = spawn_session(make_transport, bus.clone(), config.link_config());
        let parser = PhraseParser::new(config.default_speed);
        Self {
            config,
            scanner: DeviceScanner::new(radio),
            session,
            session_task,
            bus,
            parser,
        }
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    /// Registers an observer for link events
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Scans for the configured robot; `None` if it did not show up in time
    pub async fn find_robot(&mut self) -> Result<Option<DiscoveredPeer>> {
        let handle = self
            .scanner
            .start_scan(self.config.target_address.clone(), self.config.scan_duration())
            .await?;
        match handle.outcome().await {
            Some(ScanOutcome::Found(peer)) => Ok(Some(peer)),
            Some(ScanOutcome::TimedOut) => Ok(None),
            None => Err(anyhow!("scan was cancelled")),
        }
    }

    /// Opens a session to `peer`, closing any previous one first
    pub async fn connect(&mut self, peer: DiscoveredPeer) -> Result<SessionId> {
        // The radio is not shared between scanning and connecting
        self.scanner.stop_scan().await;

        if self.session.state().await? != LinkState::Disconnected {
            info!("Closing the previous session before connecting again");
            self.session.close().await?;
        }
        let session = self.session.open(peer).await?;
        Ok(session)
    }

    /// Parses a recognized utterance and sends the resulting command
    pub async fn say(&self, utterance: &str) -> Result<Command> {
        let command = self.parser.parse(utterance)?;
        self.send(command).await?;
        Ok(command)
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.session
            .send(command)
            .await
            .with_context(|| format!("failed to send {}", command.encode()))
    }

    pub async fn link_state(&self) -> Result<LinkState> {
        Ok(self.session.state().await?)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.session.close().await?;
        Ok(())
    }

    /// Stops scanning, closes the session and waits for the control task to exit
    pub async fn shutdown(mut self) -> Result<()> {
        self.scanner.stop_scan().await;
        self.session.close().await?;
        let Self {
            session, session_task, ..
        } = self;
        drop(session);
        session_task.await?;
        info!("Robot manager shut down");
        Ok(())
    }
}
