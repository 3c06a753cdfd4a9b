//! Loopback test harness: a shared "air" that connects two in-process
//! adapters, so a peripheral and a central can rendezvous without a radio.

// Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use nearlink_core::{
    AdapterError, BleAdapter, ChannelListener, ChannelSession, DeviceIdentity, DeviceType,
    NearbyDelegate, RadioState, RawChannel, RecordReadRequest, SessionRole, Sighting,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

type AcceptResult = Result<Box<dyn RawChannel>, AdapterError>;

/// One advertising device as seen over the air.
#[derive(Default)]
struct Presence {
    port: Option<u32>,
    advertising: bool,
    read_tx: Option<mpsc::Sender<RecordReadRequest>>,
    accept_tx: Option<mpsc::Sender<AcceptResult>>,
}

#[derive(Default)]
struct AirInner {
    presences: HashMap<String, Presence>,
    next_port: u32,
    /// When set, `open_channel` never completes. Models a stuck handshake.
    stall_connects: bool,
}

/// The shared medium. Every adapter registers its advertising state here and
/// resolves peers through it.
#[derive(Default)]
pub struct Air {
    inner: Mutex<AirInner>,
}

impl Air {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(AirInner {
                next_port: 0x0080,
                ..AirInner::default()
            }),
        })
    }

    pub fn set_stall_connects(&self, stall: bool) {
        self.inner.lock().stall_connects = stall;
    }
}

/// In-memory bidirectional pipe standing in for an L2CAP channel. The read
/// side keeps its own lock, so reads never block writes.
pub struct PipeChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

pub fn pipe_pair() -> (PipeChannel, PipeChannel) {
    let (a_tx, a_rx) = mpsc::channel(32);
    let (b_tx, b_rx) = mpsc::channel(32);
    (
        PipeChannel {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
        },
        PipeChannel {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl RawChannel for PipeChannel {
    async fn read(&self) -> Result<Vec<u8>, AdapterError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(AdapterError::ChannelClosed)
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| AdapterError::ChannelClosed)
    }

    async fn close(&self) {
        self.rx.lock().await.close();
    }
}

struct LoopListener {
    port_tx: watch::Sender<Option<u32>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<AcceptResult>>,
}

#[async_trait]
impl ChannelListener for LoopListener {
    fn port(&self) -> watch::Receiver<Option<u32>> {
        self.port_tx.subscribe()
    }

    async fn accept(&self) -> Result<Box<dyn RawChannel>, AdapterError> {
        match self.accept_rx.lock().await.recv().await {
            Some(result) => result,
            None => Err(AdapterError::ListenerInvalid),
        }
    }

    async fn close(&self) {}
}

/// One device's view of the air.
pub struct HarnessAdapter {
    device_id: String,
    air: Arc<Air>,
    radio_tx: watch::Sender<RadioState>,
}

impl HarnessAdapter {
    pub fn new(air: &Arc<Air>, device_id: &str, initial: RadioState) -> Arc<Self> {
        let (radio_tx, _) = watch::channel(initial);
        air.inner
            .lock()
            .presences
            .insert(device_id.to_string(), Presence::default());
        Arc::new(Self {
            device_id: device_id.to_string(),
            air: air.clone(),
            radio_tx,
        })
    }

    pub fn set_radio(&self, state: RadioState) {
        // send_replace stores the value even while nobody is subscribed.
        self.radio_tx.send_replace(state);
    }
}

#[async_trait]
impl BleAdapter for HarnessAdapter {
    fn radio_state(&self) -> RadioState {
        *self.radio_tx.borrow()
    }

    fn subscribe_radio_state(&self) -> watch::Receiver<RadioState> {
        self.radio_tx.subscribe()
    }

    async fn listen_for_channel(&self) -> Result<Arc<dyn ChannelListener>, AdapterError> {
        let mut inner = self.air.inner.lock();
        inner.next_port += 1;
        let port = inner.next_port;

        let (port_tx, _) = watch::channel(Some(port));
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let presence = inner.presences.entry(self.device_id.clone()).or_default();
        presence.port = Some(port);
        presence.accept_tx = Some(accept_tx);

        Ok(Arc::new(LoopListener {
            port_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }))
    }

    async fn register_discovery_service(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<mpsc::Receiver<RecordReadRequest>, AdapterError> {
        let (read_tx, read_rx) = mpsc::channel(16);
        let mut inner = self.air.inner.lock();
        let presence = inner.presences.entry(self.device_id.clone()).or_default();
        presence.read_tx = Some(read_tx);
        Ok(read_rx)
    }

    async fn unregister_discovery_service(&self) {
        let mut inner = self.air.inner.lock();
        if let Some(presence) = inner.presences.get_mut(&self.device_id) {
            presence.read_tx = None;
        }
    }

    async fn start_advertising(&self, _service: Uuid) -> Result<(), AdapterError> {
        let mut inner = self.air.inner.lock();
        let presence = inner.presences.entry(self.device_id.clone()).or_default();
        presence.advertising = true;
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut inner = self.air.inner.lock();
        if let Some(presence) = inner.presences.get_mut(&self.device_id) {
            presence.advertising = false;
        }
    }

    async fn scan(&self) -> Result<mpsc::Receiver<Sighting>, AdapterError> {
        let (tx, rx) = mpsc::channel(32);
        let inner = self.air.inner.lock();
        for (id, presence) in &inner.presences {
            if *id != self.device_id && presence.advertising {
                let _ = tx.try_send(Sighting {
                    peripheral_id: id.clone(),
                    record_bytes: None,
                });
            }
        }
        Ok(rx)
    }

    async fn stop_scan(&self) {}

    async fn read_record(&self, peripheral_id: &str) -> Result<Vec<u8>, AdapterError> {
        let read_tx = {
            let inner = self.air.inner.lock();
            inner
                .presences
                .get(peripheral_id)
                .filter(|p| p.advertising)
                .and_then(|p| p.read_tx.clone())
                .ok_or_else(|| AdapterError::PeripheralNotFound(peripheral_id.to_string()))?
        };

        let (responder, response) = oneshot::channel();
        read_tx
            .send(RecordReadRequest { responder })
            .await
            .map_err(|_| AdapterError::Read("peer stopped serving reads".to_string()))?;
        response
            .await
            .map_err(|_| AdapterError::Read("read was not answered".to_string()))
    }

    async fn open_channel(
        &self,
        peripheral_id: &str,
        _address: Option<&str>,
        port: u32,
    ) -> Result<Box<dyn RawChannel>, AdapterError> {
        let accept_tx = {
            let inner = self.air.inner.lock();
            if inner.stall_connects {
                None
            } else {
                let presence = inner
                    .presences
                    .get(peripheral_id)
                    .filter(|p| p.advertising)
                    .ok_or_else(|| AdapterError::PeripheralNotFound(peripheral_id.to_string()))?;
                if presence.port != Some(port) {
                    return Err(AdapterError::Connect(format!(
                        "no listener on port {port}"
                    )));
                }
                presence.accept_tx.clone()
            }
        };

        let Some(accept_tx) = accept_tx else {
            if self.air.inner.lock().stall_connects {
                std::future::pending::<()>().await;
            }
            return Err(AdapterError::Connect("listener gone".to_string()));
        };

        let (near, far) = pipe_pair();
        accept_tx
            .send(Ok(Box::new(far)))
            .await
            .map_err(|_| AdapterError::Connect("listener gone".to_string()))?;
        Ok(Box::new(near))
    }
}

/// Delegate that records everything the boundary receives.
pub struct TestDelegate {
    pub identity: DeviceIdentity,
    pub sessions: Mutex<Vec<(ChannelSession, SessionRole)>>,
    pub radio_states: Mutex<Vec<RadioState>>,
}

impl TestDelegate {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            identity: DeviceIdentity::new(format!("{name}-id"), name, DeviceType::Mobile),
            sessions: Mutex::new(Vec::new()),
            radio_states: Mutex::new(Vec::new()),
        })
    }

    pub async fn wait_for_sessions(&self, count: usize, timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.sessions.lock().len() < count {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "Timed out waiting for {} sessions, saw {}",
                    count,
                    self.sessions.lock().len()
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl NearbyDelegate for TestDelegate {
    fn on_session_established(&self, session: ChannelSession, role: SessionRole) {
        self.sessions.lock().push((session, role));
    }

    fn on_record_needed(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn on_radio_state_changed(&self, state: RadioState) {
        self.radio_states.lock().push(state);
    }
}
