//! Link session with the robot
//! Drives the connect → resolve services → notifications-enabled handshake,
//! writes encoded commands and turns notifications into link events.
//!
//! All state changes happen on one control task: callers talk to it through
//! [`SessionHandle`] and the platform reports back through [`PlatformEvents`].

use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::bluetooth::codec::{Command, DecodeError, TelemetryFrame};
use crate::core::bluetooth::events::{EventBus, LinkEvent};
use crate::core::bluetooth::types::{DiscoveredPeer, LinkState, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("session is already open (state: {0})")]
    AlreadyOpen(LinkState),
    #[error("session is not ready (state: {0})")]
    NotReady(LinkState),
    #[error("robot does not expose service {service} with characteristic {characteristic}")]
    ProtocolMismatch { service: Uuid, characteristic: Uuid },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("session control task has stopped")]
    Terminated,
}

/// Service and characteristic the session resolves after connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

/// A GATT service as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Callbacks delivered by the platform, each tagged with the session that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Connected(SessionId),
    ServicesDiscovered(SessionId, Vec<DiscoveredService>),
    ConnectionLost(SessionId),
    Notification(SessionId, Vec<u8>),
}

impl PlatformEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Connected(session)
            | Self::ServicesDiscovered(session, _)
            | Self::ConnectionLost(session)
            | Self::Notification(session, _) => *session,
        }
    }
}

/// Sender the platform uses to deliver callbacks into the control task
#[derive(Clone)]
pub struct PlatformEvents {
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl PlatformEvents {
    pub fn new(tx: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        Self { tx }
    }

    pub fn deliver(&self, event: PlatformEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session control task gone, platform callback dropped");
        }
    }
}

/// Platform connection to the robot.
///
/// Every method is a non-blocking request. Outcomes of `connect`,
/// `discover_services` and of the notification subscription arrive later as
/// [`PlatformEvent`]s tagged with the session id passed in.
pub trait GattTransport: Send + 'static {
    fn connect(&mut self, session: SessionId, peer: &DiscoveredPeer) -> Result<(), LinkError>;

    fn discover_services(&mut self, session: SessionId) -> Result<(), LinkError>;

    fn enable_notifications(&mut self, session: SessionId, service: Uuid, characteristic: Uuid) -> Result<(), LinkError>;

    fn write(&mut self, session: SessionId, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Drops the connection and everything pending on it. Must tolerate being
    /// called when nothing is held.
    fn release(&mut self, session: SessionId);
}

/// The link state machine. Owned by exactly one control context.
pub struct LinkSession<T: GattTransport> {
    transport: T,
    bus: Arc<EventBus>,
    config: LinkConfig,
    state: LinkState,
    session: SessionId,
    peer: Option<DiscoveredPeer>,
}

impl<T: GattTransport> LinkSession<T> {
    pub fn new(transport: T, bus: Arc<EventBus>, config: LinkConfig) -> Self {
        Self {
            transport,
            bus,
            config,
            state: LinkState::Disconnected,
            session: SessionId(0),
            peer: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Id of the latest session, meaningful once `open` has been called
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn peer(&self) -> Option<&DiscoveredPeer> {
        self.peer.as_ref()
    }

    /// Starts connecting to `peer`
    pub fn open(&mut self, peer: DiscoveredPeer) -> Result<SessionId, LinkError> {
        if self.state != LinkState::Disconnected {
            return Err(LinkError::AlreadyOpen(self.state));
        }

        self.session = SessionId(self.session.0 + 1);
        info!("Opening session {} to {}", self.session, peer.id);
        self.transition(LinkState::Connecting);

        if let Err(e) = self.transport.connect(self.session, &peer) {
            warn!("Connection request for session {} rejected: {}", self.session, e);
            self.transport.release(self.session);
            self.transition(LinkState::Disconnected);
            return Err(e);
        }
        self.peer = Some(peer);
        Ok(self.session)
    }

    /// Encodes `command` and writes it to the robot
    pub fn send(&mut self, command: &Command) -> Result<(), LinkError> {
        if self.state != LinkState::Ready {
            return Err(LinkError::NotReady(self.state));
        }
        let line = command.encode();
        info!("Sending command to robot: {}", line);
        self.transport.write(self.session, line.into_bytes())
    }

    /// Tears the session down. A no-op when already disconnected.
    pub fn close(&mut self) {
        if self.state == LinkState::Disconnected {
            debug!("Close requested on a disconnected session");
            return;
        }
        info!("Closing session {}", self.session);
        self.transition(LinkState::Closing);
        self.teardown();
    }

    /// Applies a platform callback
    pub fn handle_platform_event(&mut self, event: PlatformEvent) -> Result<(), LinkError> {
        if let PlatformEvent::Notification(session, payload) = event {
            return self.on_notification(session, &payload);
        }

        if event.session() != self.session {
            debug!("Ignoring {:?} for stale session (current {})", event, self.session);
            return Ok(());
        }

        match event {
            PlatformEvent::Connected(session) => {
                if self.state != LinkState::Connecting {
                    debug!("Unexpected connect callback in state {}", self.state);
                    return Ok(());
                }
                info!("Session {} connected, discovering services...", session);
                self.transition(LinkState::ResolvingServices);
                self.bus.emit(LinkEvent::Connected { session });
                if let Err(e) = self.transport.discover_services(session) {
                    error!("Service discovery request failed: {}", e);
                    self.fail();
                    return Err(e);
                }
                Ok(())
            }
            PlatformEvent::ServicesDiscovered(session, services) => {
                if self.state != LinkState::ResolvingServices {
                    debug!("Unexpected service discovery callback in state {}", self.state);
                    return Ok(());
                }
                self.on_services_discovered(session, &services)
            }
            PlatformEvent::ConnectionLost(session) => {
                if self.state == LinkState::Disconnected {
                    return Ok(());
                }
                warn!("Session {} lost its connection in state {}", session, self.state);
                self.teardown();
                Ok(())
            }
            PlatformEvent::Notification(..) => Ok(()),
        }
    }

    fn on_services_discovered(&mut self, session: SessionId, services: &[DiscoveredService]) -> Result<(), LinkError> {
        let LinkConfig {
            service_uuid,
            characteristic_uuid,
        } = self.config;

        let found = services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .is_some_and(|s| s.characteristics.contains(&characteristic_uuid));
        if !found {
            for service in services {
                info!("Available service: {} {:?}", service.uuid, service.characteristics);
            }
            error!("Robot channel {}/{} not found", service_uuid, characteristic_uuid);
            self.fail();
            return Err(LinkError::ProtocolMismatch {
                service: service_uuid,
                characteristic: characteristic_uuid,
            });
        }

        info!("Found robot channel {}, enabling notifications...", characteristic_uuid);
        if let Err(e) = self
            .transport
            .enable_notifications(session, service_uuid, characteristic_uuid)
        {
            error!("Enabling notifications failed: {}", e);
            self.fail();
            return Err(e);
        }
        self.transition(LinkState::Ready);
        Ok(())
    }

    fn on_notification(&mut self, session: SessionId, payload: &[u8]) -> Result<(), LinkError> {
        debug!("Received robot data for session {}: {:?}", session, payload);
        let frame = TelemetryFrame::decode(payload).inspect_err(|e| warn!("Dropping notification: {}", e))?;
        if session != self.session || self.state == LinkState::Disconnected {
            debug!("Notification for session {} arrived after teardown", session);
        }
        self.bus.emit(LinkEvent::DataReceived { session, frame });
        Ok(())
    }

    /// Session-fatal error path: Closing then Disconnected
    fn fail(&mut self) {
        self.transition(LinkState::Closing);
        self.teardown();
    }

    fn teardown(&mut self) {
        self.transport.release(self.session);
        self.transition(LinkState::Disconnected);
        self.bus.emit(LinkEvent::Disconnected { session: self.session });
    }

    fn transition(&mut self, next: LinkState) {
        debug!("Session {}: {} -> {}", self.session, self.state, next);
        self.state = next;
    }
}

impl<T: GattTransport> Drop for LinkSession<T> {
    fn drop(&mut self) {
        if self.state != LinkState::Disconnected {
            self.transport.release(self.session);
        }
    }
}

enum ControlRequest {
    Open {
        peer: DiscoveredPeer,
        reply: oneshot::Sender<Result<SessionId, LinkError>>,
    },
    Send {
        command: Command,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<(SessionId, LinkState)>,
    },
}

/// Cloneable handle to a session running on its control task
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl SessionHandle {
    pub async fn open(&self, peer: DiscoveredPeer) -> Result<SessionId, LinkError> {
        self.request(|reply| ControlRequest::Open { peer, reply }).await?
    }

    pub async fn send(&self, command: Command) -> Result<(), LinkError> {
        self.request(|reply| ControlRequest::Send { command, reply }).await?
    }

    pub async fn close(&self) -> Result<(), LinkError> {
        self.request(|reply| ControlRequest::Close { reply }).await
    }

    pub async fn state(&self) -> Result<LinkState, LinkError> {
        Ok(self.request(|reply| ControlRequest::State { reply }).await?.1)
    }

    pub async fn current_session(&self) -> Result<SessionId, LinkError> {
        Ok(self.request(|reply| ControlRequest::State { reply }).await?.0)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> ControlRequest) -> Result<R, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).map_err(|_| LinkError::Terminated)?;
        reply_rx.await.map_err(|_| LinkError::Terminated)
    }
}

/// Spawns the control task for a new session.
///
/// `make_transport` receives the [`PlatformEvents`] sender its callbacks must
/// go through. The task closes the session and exits once every
/// [`SessionHandle`] has been dropped.
pub fn spawn_session<T, F>(make_transport: F, bus: Arc<EventBus>, config: LinkConfig) -> (SessionHandle, JoinHandle<()>)
where
    T: GattTransport,
    F: FnOnce(PlatformEvents) -> T,
{
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (platform_tx, platform_rx) = mpsc::unbounded_channel();
    let transport = make_transport(PlatformEvents::new(platform_tx));
    let session = LinkSession::new(transport, bus, config);

    let task = tokio::spawn(run_control_loop(session, control_rx, platform_rx));
    (SessionHandle { tx: control_tx }, task)
}

async fn run_control_loop<T: GattTransport>(
    mut session: LinkSession<T>,
    mut control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    mut platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
) {
    info!("Link session control task started");
    loop {
        tokio::select! {
            request = control_rx.recv() => match request {
                Some(ControlRequest::Open { peer, reply }) => {
                    let _ = reply.send(session.open(peer));
                }
                Some(ControlRequest::Send { command, reply }) => {
                    let _ = reply.send(session.send(&command));
                }
                Some(ControlRequest::Close { reply }) => {
                    session.close();
                    let _ = reply.send(());
                }
                Some(ControlRequest::State { reply }) => {
                    let _ = reply.send((session.session(), session.state()));
                }
                None => break,
            },
            Some(event) = platform_rx.recv() => {
                if let Err(e) = session.handle_platform_event(event) {
                    warn!("Platform callback failed: {}", e);
                }
            }
        }
    }
    session.close();
    info!("Link session control task stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_ROBOT_CHANNEL_CHAR, UUID_ROBOT_SERVICE};
    use std::sync::Mutex;

    /// Requests a session made to the platform, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Connect(SessionId, String),
        DiscoverServices(SessionId),
        EnableNotifications(SessionId, Uuid, Uuid),
        Write(SessionId, Vec<u8>),
        Release(SessionId),
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        pub(crate) calls: Arc<Mutex<Vec<Call>>>,
        pub(crate) fail_writes: Arc<Mutex<bool>>,
    }

    impl FakeTransport {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Write(_, payload) => Some(payload),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl GattTransport for FakeTransport {
        fn connect(&mut self, session: SessionId, peer: &DiscoveredPeer) -> Result<(), LinkError> {
            self.record(Call::Connect(session, peer.id.clone()));
            Ok(())
        }

        fn discover_services(&mut self, session: SessionId) -> Result<(), LinkError> {
            self.record(Call::DiscoverServices(session));
            Ok(())
        }

        fn enable_notifications(&mut self, session: SessionId, service: Uuid, characteristic: Uuid) -> Result<(), LinkError> {
            self.record(Call::EnableNotifications(session, service, characteristic));
            Ok(())
        }

        fn write(&mut self, session: SessionId, payload: Vec<u8>) -> Result<(), LinkError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(LinkError::Transport("write rejected".to_string()));
            }
            self.record(Call::Write(session, payload));
            Ok(())
        }

        fn release(&mut self, session: SessionId) {
            self.record(Call::Release(session));
        }
    }

    pub(crate) fn robot_peer() -> DiscoveredPeer {
        DiscoveredPeer::new("robot".to_string(), "00:15:86:13:DF:F3".parse().ok(), None, None)
    }

    pub(crate) fn robot_services() -> Vec<DiscoveredService> {
        vec![
            DiscoveredService {
                uuid: Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb),
                characteristics: vec![Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb)],
            },
            DiscoveredService {
                uuid: UUID_ROBOT_SERVICE,
                characteristics: vec![UUID_ROBOT_CHANNEL_CHAR],
            },
        ]
    }

    pub(crate) fn robot_config() -> LinkConfig {
        LinkConfig {
            service_uuid: UUID_ROBOT_SERVICE,
            characteristic_uuid: UUID_ROBOT_CHANNEL_CHAR,
        }
    }

    fn new_session() -> (LinkSession<FakeTransport>, FakeTransport, Arc<EventBus>) {
        let transport = FakeTransport::default();
        let bus = Arc::new(EventBus::new());
        let session = LinkSession::new(transport.clone(), bus.clone(), robot_config());
        (session, transport, bus)
    }

    fn drive_to_ready(session: &mut LinkSession<FakeTransport>) -> SessionId {
        let id = session.open(robot_peer()).unwrap();
        session.handle_platform_event(PlatformEvent::Connected(id)).unwrap();
        session
            .handle_platform_event(PlatformEvent::ServicesDiscovered(id, robot_services()))
            .unwrap();
        id
    }

    fn forward(distance_cm: u32) -> Command {
        Command {
            forward: true,
            distance_cm,
            speed: 255,
            ..Command::default()
        }
    }

    #[test]
    fn test_handshake_passes_through_every_state_in_order() {
        let (mut session, transport, bus) = new_session();
        let mut sub = bus.subscribe();
        assert_eq!(session.state(), LinkState::Disconnected);

        let id = session.open(robot_peer()).unwrap();
        assert_eq!(session.state(), LinkState::Connecting);

        session.handle_platform_event(PlatformEvent::Connected(id)).unwrap();
        assert_eq!(session.state(), LinkState::ResolvingServices);
        // Connected is announced before notifications are enabled
        assert_eq!(sub.events.try_recv().unwrap(), LinkEvent::Connected { session: id });

        session
            .handle_platform_event(PlatformEvent::ServicesDiscovered(id, robot_services()))
            .unwrap();
        assert_eq!(session.state(), LinkState::Ready);

        assert_eq!(
            transport.calls(),
            vec![
                Call::Connect(id, "robot".to_string()),
                Call::DiscoverServices(id),
                Call::EnableNotifications(id, UUID_ROBOT_SERVICE, UUID_ROBOT_CHANNEL_CHAR),
            ]
        );
    }

    #[test]
    fn test_services_before_connect_do_not_reach_ready() {
        let (mut session, transport, _bus) = new_session();
        let id = session.open(robot_peer()).unwrap();
        session
            .handle_platform_event(PlatformEvent::ServicesDiscovered(id, robot_services()))
            .unwrap();
        assert_eq!(session.state(), LinkState::Connecting);
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::EnableNotifications(..))));
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let (mut session, _transport, _bus) = new_session();
        session.open(robot_peer()).unwrap();
        assert_eq!(
            session.open(robot_peer()),
            Err(LinkError::AlreadyOpen(LinkState::Connecting))
        );
    }

    #[test]
    fn test_send_while_disconnected_produces_no_traffic() {
        let (mut session, transport, _bus) = new_session();
        assert_eq!(
            session.send(&forward(10)),
            Err(LinkError::NotReady(LinkState::Disconnected))
        );
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_send_while_resolving_is_rejected() {
        let (mut session, transport, _bus) = new_session();
        let id = session.open(robot_peer()).unwrap();
        session.handle_platform_event(PlatformEvent::Connected(id)).unwrap();
        assert_eq!(
            session.send(&forward(10)),
            Err(LinkError::NotReady(LinkState::ResolvingServices))
        );
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn test_send_when_ready_writes_wire_line() {
        let (mut session, transport, _bus) = new_session();
        drive_to_ready(&mut session);
        let command = Command {
            forward: true,
            right: true,
            distance_cm: 50,
            speed: 255,
            ..Command::default()
        };
        session.send(&command).unwrap();
        assert_eq!(transport.writes(), vec![b"MTR;50;255;\n".to_vec()]);
    }

    #[test]
    fn test_transport_write_failure_is_surfaced() {
        let (mut session, transport, _bus) = new_session();
        drive_to_ready(&mut session);
        *transport.fail_writes.lock().unwrap() = true;
        assert!(matches!(session.send(&forward(5)), Err(LinkError::Transport(_))));
        // Transient: the session stays usable
        assert_eq!(session.state(), LinkState::Ready);
    }

    #[test]
    fn test_missing_characteristic_is_protocol_mismatch() {
        let (mut session, transport, bus) = new_session();
        let mut sub = bus.subscribe();
        let id = session.open(robot_peer()).unwrap();
        session.handle_platform_event(PlatformEvent::Connected(id)).unwrap();

        let services = vec![DiscoveredService {
            uuid: UUID_ROBOT_SERVICE,
            characteristics: vec![Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb)],
        }];
        let result = session.handle_platform_event(PlatformEvent::ServicesDiscovered(id, services));
        assert!(matches!(result, Err(LinkError::ProtocolMismatch { .. })));
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(transport.calls().last(), Some(&Call::Release(id)));

        assert_eq!(sub.events.try_recv().unwrap(), LinkEvent::Connected { session: id });
        assert_eq!(sub.events.try_recv().unwrap(), LinkEvent::Disconnected { session: id });

        // Not retried; a fresh open is required
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::EnableNotifications(..))));
        let reopened = session.open(robot_peer()).unwrap();
        assert_ne!(reopened, id);
    }

    #[test]
    fn test_missing_service_is_protocol_mismatch() {
        let (mut session, _transport, _bus) = new_session();
        let id = session.open(robot_peer()).unwrap();
        session.handle_platform_event(PlatformEvent::Connected(id)).unwrap();
        let result = session.handle_platform_event(PlatformEvent::ServicesDiscovered(id, Vec::new()));
        assert_eq!(
            result,
            Err(LinkError::ProtocolMismatch {
                service: UUID_ROBOT_SERVICE,
                characteristic: UUID_ROBOT_CHANNEL_CHAR,
            })
        );
    }

    #[test]
    fn test_connection_lost_while_ready() {
        let (mut session, transport, bus) = new_session();
        let id = drive_to_ready(&mut session);
        let mut sub = bus.subscribe();

        session.handle_platform_event(PlatformEvent::ConnectionLost(id)).unwrap();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(sub.events.try_recv().unwrap(), LinkEvent::Disconnected { session: id });
        assert_eq!(transport.calls().last(), Some(&Call::Release(id)));

        // Nothing buffered survives
        assert!(matches!(session.send(&forward(1)), Err(LinkError::NotReady(_))));
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn test_connection_lost_while_connecting() {
        let (mut session, _transport, bus) = new_session();
        let mut sub = bus.subscribe();
        let id = session.open(robot_peer()).unwrap();
        session.handle_platform_event(PlatformEvent::ConnectionLost(id)).unwrap();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(sub.events.try_recv().unwrap(), LinkEvent::Disconnected { session: id });
    }

    #[test]
    fn test_notifications_become_data_events() {
        let (mut session, _transport, bus) = new_session();
        let id = drive_to_ready(&mut session);
        let mut sub = bus.subscribe();

        session
            .handle_platform_event(PlatformEvent::Notification(id, b"F1".to_vec()))
            .unwrap();
        session
            .handle_platform_event(PlatformEvent::Notification(id, b"battery low".to_vec()))
            .unwrap();

        assert_eq!(
            sub.events.try_recv().unwrap(),
            LinkEvent::DataReceived {
                session: id,
                frame: TelemetryFrame::Acknowledgement("F1".to_string())
            }
        );
        assert_eq!(
            sub.events.try_recv().unwrap(),
            LinkEvent::DataReceived {
                session: id,
                frame: TelemetryFrame::StatusMessage("battery low".to_string())
            }
        );
    }

    #[test]
    fn test_invalid_utf8_notification_is_a_decode_error() {
        let (mut session, _transport, bus) = new_session();
        let id = drive_to_ready(&mut session);
        let mut sub = bus.subscribe();

        let result = session.handle_platform_event(PlatformEvent::Notification(id, vec![0xc3, 0x28]));
        assert!(matches!(result, Err(LinkError::Decode(DecodeError::InvalidEncoding(_)))));
        assert!(sub.events.try_recv().is_err());
        assert_eq!(session.state(), LinkState::Ready);
    }

    #[test]
    fn test_late_notification_after_disconnect_is_still_emitted() {
        let (mut session, _transport, bus) = new_session();
        let id = drive_to_ready(&mut session);
        session.handle_platform_event(PlatformEvent::ConnectionLost(id)).unwrap();
        let mut sub = bus.subscribe();

        session
            .handle_platform_event(PlatformEvent::Notification(id, b"late".to_vec()))
            .unwrap();
        assert_eq!(
            sub.events.try_recv().unwrap(),
            LinkEvent::DataReceived {
                session: id,
                frame: TelemetryFrame::StatusMessage("late".to_string())
            }
        );
    }

    #[test]
    fn test_stale_callbacks_do_not_touch_new_session() {
        let (mut session, _transport, _bus) = new_session();
        let old = drive_to_ready(&mut session);
        session.close();
        let new = session.open(robot_peer()).unwrap();

        session.handle_platform_event(PlatformEvent::ConnectionLost(old)).unwrap();
        session.handle_platform_event(PlatformEvent::Connected(old)).unwrap();
        assert_eq!(session.state(), LinkState::Connecting);

        session.handle_platform_event(PlatformEvent::Connected(new)).unwrap();
        assert_eq!(session.state(), LinkState::ResolvingServices);
    }

    #[test]
    fn test_close_is_idempotent_and_releases() {
        let (mut session, transport, bus) = new_session();
        let id = drive_to_ready(&mut session);
        let mut sub = bus.subscribe();

        session.close();
        session.close();
        assert_eq!(session.state(), LinkState::Disconnected);

        let releases = transport.calls().iter().filter(|c| **c == Call::Release(id)).count();
        assert_eq!(releases, 1);
        assert_eq!(sub.events.try_recv().unwrap(), LinkEvent::Disconnected { session: id });
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn test_drop_releases_open_connection() {
        let (mut session, transport, _bus) = new_session();
        let id = session.open(robot_peer()).unwrap();
        drop(session);
        assert_eq!(transport.calls().last(), Some(&Call::Release(id)));
    }

    #[tokio::test]
    async fn test_control_task_funnels_requests_and_callbacks() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe();
        let transport = FakeTransport::default();
        let mut platform = None;
        let (handle, task) = spawn_session(
            |events| {
                platform = Some(events);
                transport.clone()
            },
            bus.clone(),
            robot_config(),
        );
        let platform = platform.unwrap();

        assert!(matches!(handle.send(forward(1)).await, Err(LinkError::NotReady(_))));

        let id = handle.open(robot_peer()).await.unwrap();
        platform.deliver(PlatformEvent::Connected(id));
        assert_eq!(sub.recv().await, Some(LinkEvent::Connected { session: id }));
        platform.deliver(PlatformEvent::ServicesDiscovered(id, robot_services()));
        platform.deliver(PlatformEvent::Notification(id, b"F".to_vec()));
        assert!(matches!(sub.recv().await, Some(LinkEvent::DataReceived { .. })));
        assert_eq!(handle.state().await.unwrap(), LinkState::Ready);

        handle.send(forward(30)).await.unwrap();
        assert_eq!(transport.writes(), vec![b"MT;30;255;\n".to_vec()]);

        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), LinkState::Disconnected);
        assert_eq!(sub.recv().await, Some(LinkEvent::Disconnected { session: id }));

        drop(handle);
        task.await.unwrap();
    }
}
