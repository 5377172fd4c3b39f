//! Notification handling for the robot channel
//! Subscribes to the robot's characteristic and forwards every pushed frame
//! into the session control task.

use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::session::{PlatformEvent, PlatformEvents};
use crate::core::bluetooth::types::SessionId;

/// Notification handler for robot telemetry
#[derive(Clone)]
pub struct NotificationHandler {
    events: PlatformEvents,
}

impl NotificationHandler {
    pub fn new(events: PlatformEvents) -> Self {
        Self { events }
    }

    /// Starts forwarding notifications of `channel` until `cancel_token` fires
    pub fn setup_notifications(&self, session: SessionId, channel: Characteristic, cancel_token: CancellationToken) {
        info!("Subscribing to notifications...");
        let events = self.events.clone();
        tokio::spawn(async move {
            Self::process_notifications(session, channel, events, cancel_token).await;
        });
    }

    async fn process_notifications(
        session: SessionId,
        channel: Characteristic,
        events: PlatformEvents,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for robot notifications...");

        let mut notification_stream = match channel.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                events.deliver(PlatformEvent::ConnectionLost(session));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                result = notification_stream.next() => match result {
                    Some(Ok(value)) => {
                        debug!("Received robot data: {:?}", value);
                        events.deliver(PlatformEvent::Notification(session, value));
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        events.deliver(PlatformEvent::ConnectionLost(session));
                        break;
                    }
                    None => break,
                }
            }
        }

        info!("Notification stream ended");
    }
}
