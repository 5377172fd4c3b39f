//! Time-bounded discovery of the robot
//! A scan looks for exactly one hardware address, delivers the first match
//! and stops the radio, or gives up once the scan duration elapses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::types::{Advertisement, DiscoveredPeer, PeerIdentity, ScanFilterSpec};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Bluetooth adapter is absent or disabled")]
    AdapterUnavailable,
    #[error("a scan is already in progress")]
    AlreadyScanning,
    #[error("radio failed to start discovery: {0}")]
    Radio(String),
}

/// The platform side of discovery.
///
/// Discovery runs for as long as the returned receiver is alive; dropping it
/// stops the radio scan.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Returns true if the adapter is present and powered
    async fn is_available(&self) -> bool;

    /// Starts a radio scan restricted to `filter` where the platform supports it
    async fn start_discovery(&self, filter: &ScanFilterSpec) -> Result<mpsc::Receiver<Advertisement>, ScanError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Found,
    TimedOut,
}

/// How a scan ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(DiscoveredPeer),
    TimedOut,
}

/// Handle to a running scan
pub struct ScanHandle {
    outcome: oneshot::Receiver<ScanOutcome>,
    cancel_token: CancellationToken,
    state: Arc<Mutex<ScanState>>,
}

impl ScanHandle {
    /// Waits for the scan to end; `None` if it was cancelled
    pub async fn outcome(self) -> Option<ScanOutcome> {
        self.outcome.await.ok()
    }

    /// Stops the scan without reporting a result and puts the scanner back to
    /// `Idle` right away. Safe to call repeatedly or after the scan already ended.
    pub fn cancel(&self) {
        cancel_scan(&self.cancel_token, &self.state);
    }

    pub fn canceller(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

struct ActiveScan {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DeviceScanner<R: Radio> {
    radio: Arc<R>,
    state: Arc<Mutex<ScanState>>,
    active: Option<ActiveScan>,
}

impl<R: Radio> DeviceScanner<R> {
    pub fn new(radio: Arc<R>) -> Self {
        Self {
            radio,
            state: Arc::new(Mutex::new(ScanState::Idle)),
            active: None,
        }
    }

    pub fn state(&self) -> ScanState {
        *lock_state(&self.state)
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Scanning
    }

    /// Starts looking for `target` for at most `duration`
    pub async fn start_scan(&mut self, target: PeerIdentity, duration: Duration) -> Result<ScanHandle, ScanError> {
        if self.is_scanning() {
            return Err(ScanError::AlreadyScanning);
        }
        if !self.radio.is_available().await {
            warn!("Cannot scan for {}: adapter unavailable", target);
            return Err(ScanError::AdapterUnavailable);
        }

        let filter = ScanFilterSpec::new(target, duration);
        let advertisements = self.radio.start_discovery(&filter).await?;

        let cancel_token = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        *lock_state(&self.state) = ScanState::Scanning;

        info!("Scanning for {} for {:?}", filter.target, filter.duration);
        let task = tokio::spawn(Self::internal_scan_task(
            filter,
            advertisements,
            outcome_tx,
            cancel_token.clone(),
            self.state.clone(),
        ));
        self.active = Some(ActiveScan {
            cancel_token: cancel_token.clone(),
            task,
        });

        Ok(ScanHandle {
            outcome: outcome_rx,
            cancel_token,
            state: self.state.clone(),
        })
    }

    /// Cancels the running scan, if any, and waits for the radio to stop
    pub async fn stop_scan(&mut self) {
        let Some(active) = self.active.take() else {
            debug!("No active scan to stop");
            return;
        };
        cancel_scan(&active.cancel_token, &self.state);
        if let Err(e) = active.task.await {
            if !e.is_cancelled() {
                warn!("Scan task ended abnormally: {:?}", e);
            }
        }
    }

    async fn internal_scan_task(
        filter: ScanFilterSpec,
        mut advertisements: mpsc::Receiver<Advertisement>,
        outcome_tx: oneshot::Sender<ScanOutcome>,
        cancel_token: CancellationToken,
        state: Arc<Mutex<ScanState>>,
    ) {
        let deadline = tokio::time::sleep(filter.duration);
        tokio::pin!(deadline);
        let mut radio_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    // State was already reset by whoever cancelled; a newer
                    // scan may own it by now.
                    info!("Scan for {} cancelled", filter.target);
                    return;
                }
                _ = &mut deadline => {
                    info!("No advertisement from {} within {:?}", filter.target, filter.duration);
                    break ScanOutcome::TimedOut;
                }
                advertisement = advertisements.recv(), if radio_open => match advertisement {
                    Some(advertisement) if filter.matches(&advertisement.peer) => {
                        info!("Found robot {} ({})", filter.target, advertisement.peer.id);
                        break ScanOutcome::Found(advertisement.peer);
                    }
                    Some(advertisement) => {
                        debug!("Ignoring advertisement from {:?}", advertisement.peer);
                    }
                    None => {
                        debug!("Radio ended discovery early, waiting out the scan window");
                        radio_open = false;
                    }
                }
            }
        };

        // Stop the radio before anyone hears about the result; advertisements
        // still queued behind the match are discarded with the receiver.
        drop(advertisements);
        {
            let mut state = lock_state(&state);
            if cancel_token.is_cancelled() {
                debug!("Scan for {} cancelled before its outcome was reported", filter.target);
                return;
            }
            *state = match outcome {
                ScanOutcome::Found(_) => ScanState::Found,
                ScanOutcome::TimedOut => ScanState::TimedOut,
            };
        }
        if outcome_tx.send(outcome).is_err() {
            debug!("Scan outcome dropped, handle no longer held");
        }
    }
}

impl<R: Radio> Drop for DeviceScanner<R> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            cancel_scan(&active.cancel_token, &self.state);
        }
    }
}

/// Fires the token and moves a running scan to `Idle`; a scan that already
/// ended keeps its `Found`/`TimedOut` state.
fn cancel_scan(cancel_token: &CancellationToken, state: &Mutex<ScanState>) {
    // Checked under the state lock by the scan task before it reports
    cancel_token.cancel();
    let mut state = lock_state(state);
    if *state == ScanState::Scanning {
        *state = ScanState::Idle;
    }
}

fn lock_state(state: &Mutex<ScanState>) -> std::sync::MutexGuard<'_, ScanState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
