//! Peripheral role coordinator.
//!
//! Owns the "I am discoverable and accept connections" side: advertising
//! lifecycle, serving the discovery record for read, and the long-lived
//! accept loop that turns incoming connection-oriented channels into
//! [`ChannelSession`]s for the application boundary.

use crate::adapter::{
    AdapterError, BleAdapter, ChannelListener, RecordReadRequest, DISCOVERY_CHARACTERISTIC_UUID,
    DISCOVERY_SERVICE_UUID,
};
use crate::radio::RadioMonitor;
use crate::record::{build_record, EndpointHint};
use crate::session::{ChannelSession, SessionRole};
use crate::{CoordinatorError, NearbyDelegate};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

/// How long `start()` waits for the platform to assign the listener port.
const PORT_ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Peripheral coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Idle,
    Starting,
    Advertising,
    Stopping,
}

#[derive(Default)]
struct Lifecycle {
    listener: Option<Arc<dyn ChannelListener>>,
    read_task: Option<JoinHandle<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl Lifecycle {
    /// Drop handles without touching the adapter. Used when the resources
    /// are already gone (lost listener) or were never fully acquired.
    fn discard(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.listener = None;
    }
}

/// The advertising/listening side of a rendezvous.
///
/// At most one instance may be active per process; the radio adapter is a
/// process-wide resource.
pub struct PeripheralCoordinator {
    adapter: Arc<dyn BleAdapter>,
    delegate: Arc<dyn NearbyDelegate>,
    monitor: Arc<RadioMonitor>,
    state: Arc<RwLock<PeripheralState>>,
    // Linearizes start()/stop() and the accept loop's loss teardown.
    lifecycle: Arc<Mutex<Lifecycle>>,
    failure_tx: watch::Sender<Option<CoordinatorError>>,
}

impl PeripheralCoordinator {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        delegate: Arc<dyn NearbyDelegate>,
        monitor: Arc<RadioMonitor>,
    ) -> Self {
        let (failure_tx, _) = watch::channel(None);
        Self {
            adapter,
            delegate,
            monitor,
            state: Arc::new(RwLock::new(PeripheralState::Idle)),
            lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
            failure_tx,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeripheralState {
        *self.state.read()
    }

    /// Observe fatal advertising-session failures (`ListenerLost`). Reset to
    /// `None` on each successful `start()`.
    pub fn subscribe_failures(&self) -> watch::Receiver<Option<CoordinatorError>> {
        self.failure_tx.subscribe()
    }

    /// Become discoverable: open the channel listener, expose the discovery
    /// record for read, and begin advertising.
    ///
    /// Suspends until advertising begins or a sub-step fails. Any sub-step
    /// failure rolls the coordinator back to idle and surfaces a single
    /// composite failure naming the sub-step. Calling `start()` while
    /// already advertising is a no-op.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        // Linearizes concurrent start()/stop() calls.
        let mut lifecycle = self.lifecycle.lock().await;
        if *self.state.read() != PeripheralState::Idle {
            return Ok(());
        }
        lifecycle.discard();

        self.monitor.ensure_powered_on()?;
        self.set_state(PeripheralState::Starting);

        // (a) Channel listener and its assigned port.
        let listener = match self.adapter.listen_for_channel().await {
            Ok(listener) => listener,
            Err(error) => {
                self.set_state(PeripheralState::Idle);
                return Err(CoordinatorError::ListenerSetupFailed(error.to_string()));
            }
        };

        let port = match await_port(&listener).await {
            Ok(port) => port,
            Err(error) => {
                listener.close().await;
                self.set_state(PeripheralState::Idle);
                return Err(error);
            }
        };
        tracing::info!(port, "channel listener ready");

        // (b) The record must be buildable with the assigned port before we
        // become visible.
        let identity = self.delegate.on_record_needed();
        if let Err(error) = build_record(&identity, &[EndpointHint::for_port(port)]) {
            listener.close().await;
            self.set_state(PeripheralState::Idle);
            return Err(error);
        }

        // (c) Discovery service with the read characteristic.
        let reads = match self
            .adapter
            .register_discovery_service(DISCOVERY_SERVICE_UUID, DISCOVERY_CHARACTERISTIC_UUID)
            .await
        {
            Ok(reads) => reads,
            Err(error) => {
                listener.close().await;
                self.set_state(PeripheralState::Idle);
                return Err(CoordinatorError::ServiceRegistrationFailed(error.to_string()));
            }
        };

        // (d) Advertise the service.
        if let Err(error) = self.adapter.start_advertising(DISCOVERY_SERVICE_UUID).await {
            self.adapter.unregister_discovery_service().await;
            listener.close().await;
            self.set_state(PeripheralState::Idle);
            return Err(CoordinatorError::AdvertiseFailed(error.to_string()));
        }

        // Read-serving and channel-accepting run as independent tasks;
        // neither may block the other.
        let read_task = tokio::spawn(serve_reads(
            reads,
            self.delegate.clone(),
            listener.port(),
        ));
        let accept_task = tokio::spawn(accept_loop(
            listener.clone(),
            self.adapter.clone(),
            self.delegate.clone(),
            self.state.clone(),
            self.lifecycle.clone(),
            self.failure_tx.clone(),
            read_task.abort_handle(),
        ));

        lifecycle.listener = Some(listener);
        lifecycle.read_task = Some(read_task);
        lifecycle.accept_task = Some(accept_task);
        // send_replace stores the value even with no subscriber attached.
        self.failure_tx.send_replace(None);
        self.set_state(PeripheralState::Advertising);
        tracing::info!("peripheral advertising");
        Ok(())
    }

    /// Stop advertising and release the service and listener.
    ///
    /// Idempotent: calling stop while already idle is a no-op and releases
    /// nothing twice.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *self.state.read() == PeripheralState::Idle {
            // A lost listener already released the adapter-side resources.
            lifecycle.discard();
            return;
        }

        self.set_state(PeripheralState::Stopping);
        if let Some(task) = lifecycle.accept_task.take() {
            task.abort();
        }
        if let Some(task) = lifecycle.read_task.take() {
            task.abort();
        }
        self.adapter.stop_advertising().await;
        self.adapter.unregister_discovery_service().await;
        if let Some(listener) = lifecycle.listener.take() {
            listener.close().await;
        }
        self.set_state(PeripheralState::Idle);
        tracing::info!("peripheral stopped");
    }

    fn set_state(&self, state: PeripheralState) {
        *self.state.write() = state;
    }
}

async fn await_port(listener: &Arc<dyn ChannelListener>) -> Result<u32, CoordinatorError> {
    let mut port_rx = listener.port();
    // Copy the port out of the watch guard; the guard must not outlive the
    // receiver it borrows.
    let assigned = tokio::time::timeout(PORT_ASSIGNMENT_TIMEOUT, port_rx.wait_for(|p| p.is_some()))
        .await
        .map(|result| result.map(|value| *value));

    match assigned {
        Ok(Ok(port)) => port.ok_or_else(|| {
            CoordinatorError::ListenerSetupFailed("listener reported an empty port".to_string())
        }),
        Ok(Err(_)) => Err(CoordinatorError::ListenerSetupFailed(
            "listener went away before assigning a port".to_string(),
        )),
        Err(_) => Err(CoordinatorError::ListenerSetupFailed(
            "timed out waiting for the listener port".to_string(),
        )),
    }
}

/// Answer discovery reads with the record computed at request time.
///
/// The endpoint hint may not be known yet when a read arrives (the platform
/// assigns the listener port asynchronously); such reads are deferred until
/// the port resolves, never answered with an empty or placeholder hint.
async fn serve_reads(
    mut requests: mpsc::Receiver<RecordReadRequest>,
    delegate: Arc<dyn NearbyDelegate>,
    mut port: watch::Receiver<Option<u32>>,
) {
    while let Some(request) = requests.recv().await {
        let assigned = match port.wait_for(|p| p.is_some()).await {
            Ok(value) => *value,
            Err(_) => break,
        };
        let Some(assigned) = assigned else {
            continue;
        };

        // Identity is re-fetched per request so display-name changes are
        // reflected immediately.
        let identity = delegate.on_record_needed();
        match build_record(&identity, &[EndpointHint::for_port(assigned)]) {
            Ok(bytes) => {
                let _ = request.responder.send(bytes);
            }
            Err(error) => {
                // Dropping the responder fails the read on the remote side.
                tracing::warn!(%error, "could not build discovery record for read");
            }
        }
    }
}

/// Accept incoming channels indefinitely while advertising.
///
/// Per-connection failures are absorbed; only loss of the listener itself
/// tears the session down.
async fn accept_loop(
    listener: Arc<dyn ChannelListener>,
    adapter: Arc<dyn BleAdapter>,
    delegate: Arc<dyn NearbyDelegate>,
    state: Arc<RwLock<PeripheralState>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    failure_tx: watch::Sender<Option<CoordinatorError>>,
    read_task: AbortHandle,
) {
    loop {
        match listener.accept().await {
            Ok(raw) => {
                let session = ChannelSession::new(SessionRole::Peripheral, raw);
                tracing::info!(session = %session.id(), "incoming channel accepted");
                // Published before the loop resumes, keeping acceptance order.
                delegate.on_session_established(session, SessionRole::Peripheral);
            }
            Err(AdapterError::ListenerInvalid) => {
                // Teardown runs under the lifecycle lock so it cannot
                // interleave with a concurrent stop(); whichever gets the
                // lock first releases the resources, the other finds Idle.
                let mut lifecycle = lifecycle.lock().await;
                if *state.read() != PeripheralState::Advertising {
                    break;
                }
                tracing::error!("channel listener lost, leaving advertising state");
                *state.write() = PeripheralState::Idle;
                read_task.abort();
                adapter.stop_advertising().await;
                adapter.unregister_discovery_service().await;
                listener.close().await;
                lifecycle.listener = None;
                failure_tx.send_replace(Some(CoordinatorError::ListenerLost));
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to accept incoming channel");
            }
        }
    }
}
