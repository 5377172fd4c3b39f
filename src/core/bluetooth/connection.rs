//! Bluetooth connection handling for the robot
//! Implements the link session's platform requests on top of bluest. Each
//! request spawns the async work and reports its outcome as a platform event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::radio::DeviceRegistry;
use crate::core::bluetooth::session::{
    DiscoveredService, GattTransport, LinkError, PlatformEvent, PlatformEvents,
};
use crate::core::bluetooth::types::{DiscoveredPeer, SessionId};

type CharacteristicMap = Arc<Mutex<HashMap<(Uuid, Uuid), Characteristic>>>;

/// Handles held for the session currently using the radio connection
struct ActiveLink {
    session: SessionId,
    device: Device,
    cancel_token: CancellationToken,
    characteristics: CharacteristicMap,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Connection manager for the robot
pub struct BluestLink {
    adapter: Adapter,
    devices: DeviceRegistry,
    events: PlatformEvents,
    notification_handler: NotificationHandler,
    active: Option<ActiveLink>,
}

impl BluestLink {
    pub fn new(adapter: Adapter, devices: DeviceRegistry, events: PlatformEvents) -> Self {
        let notification_handler = NotificationHandler::new(events.clone());
        Self {
            adapter,
            devices,
            events,
            notification_handler,
            active: None,
        }
    }

    fn active_for(&mut self, session: SessionId) -> Result<&mut ActiveLink, LinkError> {
        self.active
            .as_mut()
            .filter(|active| active.session == session)
            .ok_or_else(|| LinkError::Transport(format!("no connection held for session {}", session)))
    }

    async fn try_connect(adapter: &Adapter, device: &Device) -> Result<()> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Device details - ID: {}, Name: {:?}", device.id(), name);

        if !device.is_connected().await {
            info!("Initiating connection to {}...", device.id());
            adapter.connect_device(device).await?;
        }
        Ok(())
    }

    /// Reports a connection loss once the platform sees the device drop
    async fn watch_connection(adapter: &Adapter, device: &Device, session: SessionId, events: &PlatformEvents) -> Result<()> {
        let mut connection_events = adapter.device_connection_events(device).await?;
        while let Some(event) = connection_events.next().await {
            match event {
                ConnectionEvent::Disconnected => {
                    warn!("Device {} disconnected", device.id());
                    events.deliver(PlatformEvent::ConnectionLost(session));
                    return Ok(());
                }
                ConnectionEvent::Connected => debug!("Device {} reports connected", device.id()),
            }
        }
        Err(anyhow!("connection event stream ended"))
    }

    async fn discover(device: &Device, characteristics: &CharacteristicMap) -> Result<Vec<DiscoveredService>> {
        info!("Connection successful, discovering services...");
        let mut discovered = Vec::new();
        for service in device.services().await? {
            let service_uuid = service.uuid();
            let mut uuids = Vec::new();
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid();
                debug!("Service {} exposes characteristic {}", service_uuid, uuid);
                uuids.push(uuid);
                characteristics
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert((service_uuid, uuid), characteristic);
            }
            discovered.push(DiscoveredService {
                uuid: service_uuid,
                characteristics: uuids,
            });
        }
        Ok(discovered)
    }

    /// Writes queued command lines one after another so they reach the robot in order
    async fn process_writes(
        channel: Characteristic,
        mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                payload = writes.recv() => match payload {
                    Some(payload) => {
                        if let Err(e) = channel.write(&payload).await {
                            // Transient; re-issuing the command is up to the operator
                            error!("Failed to write command to robot: {}", e);
                        }
                    }
                    None => break,
                }
            }
        }
        debug!("Command writer stopped");
    }
}

impl GattTransport for BluestLink {
    fn connect(&mut self, session: SessionId, peer: &DiscoveredPeer) -> Result<(), LinkError> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&peer.id)
            .cloned()
            .ok_or_else(|| LinkError::Transport(format!("Device not found with ID: {}", peer.id)))?;

        if let Some(previous) = self.active.as_ref().map(|active| active.session) {
            warn!("Connect for session {} while {} still holds the radio", session, previous);
            self.release(previous);
        }

        let cancel_token = CancellationToken::new();
        self.active = Some(ActiveLink {
            session,
            device: device.clone(),
            cancel_token: cancel_token.clone(),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            writer: None,
        });

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = cancel_token.cancelled() => return,
                result = Self::try_connect(&adapter, &device) => result,
            };
            if let Err(e) = connected {
                warn!("Connection attempt for session {} failed: {}", session, e);
                events.deliver(PlatformEvent::ConnectionLost(session));
                return;
            }
            events.deliver(PlatformEvent::Connected(session));

            tokio::select! {
                _ = cancel_token.cancelled() => {}
                result = Self::watch_connection(&adapter, &device, session, &events) => {
                    if let Err(e) = result {
                        warn!("Lost track of connection state: {}", e);
                    }
                }
            }
        });
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), LinkError> {
        let active = self.active_for(session)?;
        let device = active.device.clone();
        let characteristics = active.characteristics.clone();
        let cancel_token = active.cancel_token.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let discovered = tokio::select! {
                _ = cancel_token.cancelled() => return,
                result = Self::discover(&device, &characteristics) => result,
            };
            match discovered {
                Ok(services) => events.deliver(PlatformEvent::ServicesDiscovered(session, services)),
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    events.deliver(PlatformEvent::ConnectionLost(session));
                }
            }
        });
        Ok(())
    }

    fn enable_notifications(&mut self, session: SessionId, service: Uuid, characteristic: Uuid) -> Result<(), LinkError> {
        let notification_handler = self.notification_handler.clone();
        let active = self.active_for(session)?;
        let channel = active
            .characteristics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| LinkError::Transport(format!("characteristic {} was not resolved", characteristic)))?;

        notification_handler.setup_notifications(session, channel.clone(), active.cancel_token.clone());

        // The robot reads and writes through the same characteristic
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::process_writes(channel, writer_rx, active.cancel_token.clone()));
        active.writer = Some(writer_tx);
        Ok(())
    }

    fn write(&mut self, session: SessionId, payload: Vec<u8>) -> Result<(), LinkError> {
        let active = self.active_for(session)?;
        let writer = active
            .writer
            .as_ref()
            .ok_or_else(|| LinkError::Transport("robot channel is not writable yet".to_string()))?;
        writer
            .send(payload)
            .map_err(|_| LinkError::Transport("command writer has stopped".to_string()))
    }

    fn release(&mut self, session: SessionId) {
        let Some(active) = self.active.take() else {
            debug!("Release for session {}: nothing held", session);
            return;
        };
        info!("Releasing connection of session {}", active.session);
        active.cancel_token.cancel();

        let adapter = self.adapter.clone();
        let device = active.device;
        let disconnect = async move {
            if device.is_connected().await {
                info!("Disconnecting from device {}", device.id());
                match adapter.disconnect_device(&device).await {
                    Ok(()) => info!("Successfully disconnected"),
                    Err(e) => warn!("Disconnect from {} failed: {}", device.id(), e),
                }
            } else {
                info!("Device {} not connected", device.id());
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(disconnect);
            }
            Err(_) => warn!("No runtime available, connection left to the platform to reclaim"),
        }
    }
}
