//! bluest-backed discovery
//! Feeds advertisements from the system adapter into the device scanner and
//! remembers every device seen so the link can connect to it later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::constants::ADVERTISEMENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::scanner::{Radio, ScanError};
use crate::core::bluetooth::types::{Advertisement, DiscoveredPeer, PeerIdentity, ScanFilterSpec};

/// Live device handles by platform device id
pub type DeviceRegistry = Arc<Mutex<HashMap<String, Device>>>;

pub struct BluestRadio {
    adapter: Adapter,
    devices: DeviceRegistry,
}

impl BluestRadio {
    pub fn new(adapter: Adapter, devices: DeviceRegistry) -> Self {
        Self { adapter, devices }
    }

    async fn internal_discovery_task(
        adapter: Adapter,
        devices: DeviceRegistry,
        advertisements: mpsc::Sender<Advertisement>,
        started: oneshot::Sender<Result<(), ScanError>>,
    ) {
        info!("Starting bluetooth scan");
        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start bluetooth scan: {}", e);
                let _ = started.send(Err(ScanError::Radio(e.to_string())));
                return;
            }
        };
        let _ = started.send(Ok(()));

        // A robot still connected from a previous run does not advertise
        match adapter.connected_devices().await {
            Ok(connected) => {
                for device in connected {
                    let peer = Self::register(&devices, device, None);
                    if advertisements.send(Advertisement { peer }).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => debug!("Could not list connected devices: {}", e),
        }

        loop {
            tokio::select! {
                _ = advertisements.closed() => break,
                result = scan_stream.next() => match result {
                    Some(discovered) => {
                        debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                        let peer = Self::register(&devices, discovered.device, discovered.rssi);
                        if advertisements.send(Advertisement { peer }).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                }
            }
        }
        info!("Bluetooth scan stopped");
    }

    fn register(devices: &DeviceRegistry, device: Device, rssi: Option<i16>) -> DiscoveredPeer {
        let id = device.id().to_string();
        let peer = DiscoveredPeer::new(id.clone(), PeerIdentity::extract_from(&id), device.name().ok(), rssi);
        devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, device);
        peer
    }
}

#[async_trait]
impl Radio for BluestRadio {
    async fn is_available(&self) -> bool {
        self.adapter.is_available().await.unwrap_or(false)
    }

    async fn start_discovery(&self, filter: &ScanFilterSpec) -> Result<mpsc::Receiver<Advertisement>, ScanError> {
        debug!("Starting radio discovery for {}", filter.target);
        let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_CAPACITY);
        let (started_tx, started_rx) = oneshot::channel();

        tokio::spawn(Self::internal_discovery_task(
            self.adapter.clone(),
            self.devices.clone(),
            tx,
            started_tx,
        ));

        started_rx
            .await
            .map_err(|_| ScanError::Radio("discovery task exited before starting".to_string()))??;
        Ok(rx)
    }
}
