use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundle_model::{dtn_now, NULL_ENDPOINT_ID};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Delivery, Engine, EngineHandle, EngineStatus, InboundPayload, ReceiveError};

/// Payload as observed by the loopback engine at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentPayload {
    Bytes(Bytes),
    /// File payloads are read when sent so callers can inspect the content
    /// after the file has been removed.
    File { path: PathBuf, contents: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub endpoint_id: String,
    pub priority: u8,
    pub time_to_live: u32,
    pub handle: Option<EngineHandle>,
    pub payload: SentPayload,
    pub code: i32,
}

struct LoopbackEndpoint {
    endpoint_id: String,
    inbox_tx: mpsc::UnboundedSender<Delivery>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    closed: CancellationToken,
}

/// In-process engine for tests, development, and the demo binary.
///
/// Bundles sent to an endpoint identifier that is open on this engine are
/// delivered to it. The engine also counts handle misuse: sends on a handle
/// that is not open, and closes that race an in-flight send.
pub struct LoopbackEngine {
    status: RwLock<EngineStatus>,
    next_handle: AtomicU64,
    endpoints: RwLock<HashMap<EngineHandle, Arc<LoopbackEndpoint>>>,
    rejected: RwLock<HashSet<String>>,
    in_flight: Mutex<HashMap<EngineHandle, usize>>,
    sent: Mutex<Vec<SentRecord>>,
    send_code: AtomicI32,
    send_latency: Mutex<Duration>,
    violations: AtomicUsize,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self {
            status: RwLock::new(EngineStatus::NotStarted),
            next_handle: AtomicU64::new(1),
            endpoints: RwLock::new(HashMap::new()),
            rejected: RwLock::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            send_code: AtomicI32::new(0),
            send_latency: Mutex::new(Duration::ZERO),
            violations: AtomicUsize::new(0),
        }
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine already in the `Started` state.
    pub fn started() -> Arc<Self> {
        let engine = Arc::new(Self::new());
        engine.start();
        engine
    }

    pub fn start(&self) {
        *self.status.write() = EngineStatus::Started;
        debug!(target: "engine.loopback", "loopback engine started");
    }

    /// Stops the engine and invalidates every open handle.
    pub fn stop(&self) {
        *self.status.write() = EngineStatus::Stopped;
        let drained: Vec<Arc<LoopbackEndpoint>> =
            self.endpoints.write().drain().map(|(_, ep)| ep).collect();
        for endpoint in &drained {
            endpoint.closed.cancel();
        }
        debug!(
            target: "engine.loopback",
            invalidated = drained.len(),
            "loopback engine stopped"
        );
    }

    /// Makes future opens of `endpoint_id` fail.
    pub fn reject_opens(&self, endpoint_id: &str) {
        self.rejected.write().insert(endpoint_id.to_string());
    }

    /// Result code returned by subsequent sends.
    pub fn set_send_code(&self, code: i32) {
        self.send_code.store(code, Ordering::SeqCst);
    }

    /// Delay applied inside every send, to widen race windows in tests.
    pub fn set_send_latency(&self, latency: Duration) {
        *self.send_latency.lock() = latency;
    }

    /// Queues a delivery for the endpoint open under `endpoint_id`.
    /// Returns false when no such endpoint is open.
    pub fn inject(&self, endpoint_id: &str, delivery: Delivery) -> bool {
        match self.endpoint_by_id(endpoint_id) {
            Some(endpoint) => endpoint.inbox_tx.send(delivery).is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    pub fn open_handles(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_open(&self, handle: EngineHandle) -> bool {
        self.endpoints.read().contains_key(&handle)
    }

    /// Number of handle-consistency violations observed so far.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    fn endpoint_by_id(&self, endpoint_id: &str) -> Option<Arc<LoopbackEndpoint>> {
        self.endpoints
            .read()
            .values()
            .find(|ep| ep.endpoint_id == endpoint_id)
            .cloned()
    }

    fn source_for(&self, handle: Option<EngineHandle>) -> Option<String> {
        match handle {
            None => Some(NULL_ENDPOINT_ID.to_string()),
            Some(handle) => self
                .endpoints
                .read()
                .get(&handle)
                .map(|ep| ep.endpoint_id.clone()),
        }
    }

    fn enter(&self, handle: Option<EngineHandle>) {
        if let Some(handle) = handle {
            *self.in_flight.lock().entry(handle).or_insert(0) += 1;
        }
    }

    fn leave(&self, handle: Option<EngineHandle>) {
        if let Some(handle) = handle {
            let mut guard = self.in_flight.lock();
            if let Some(count) = guard.get_mut(&handle) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    guard.remove(&handle);
                }
            }
        }
    }

    fn record_violation(&self, what: &str, handle: EngineHandle) {
        self.violations.fetch_add(1, Ordering::SeqCst);
        warn!(
            target: "engine.loopback",
            handle = %handle,
            "handle consistency violation: {what}"
        );
    }

    async fn transmit(
        &self,
        endpoint_id: &str,
        priority: u8,
        time_to_live: u32,
        payload: SentPayload,
        handle: Option<EngineHandle>,
    ) -> i32 {
        let Some(source) = self.source_for(handle) else {
            if let Some(handle) = handle {
                self.record_violation("send on a handle that is not open", handle);
            }
            return -1;
        };

        self.enter(handle);
        let latency = *self.send_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let code = self.send_code.load(Ordering::SeqCst);

        if code >= 0 {
            let bytes = match &payload {
                SentPayload::Bytes(bytes) => bytes.clone(),
                SentPayload::File { contents, .. } => contents.clone(),
            };
            if let Some(destination) = self.endpoint_by_id(endpoint_id) {
                let _ = destination.inbox_tx.send(Delivery {
                    source_endpoint_id: source,
                    creation_time: dtn_now(),
                    time_to_live,
                    payload: InboundPayload::Bytes(bytes),
                });
            }
        }

        self.sent.lock().push(SentRecord {
            endpoint_id: endpoint_id.to_string(),
            priority,
            time_to_live,
            handle,
            payload,
            code,
        });
        self.leave(handle);
        code
    }
}

#[async_trait]
impl Engine for LoopbackEngine {
    fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    async fn open(&self, endpoint_id: &str) -> Option<EngineHandle> {
        if !self.status().is_started() || endpoint_id.is_empty() {
            return None;
        }
        if self.rejected.read().contains(endpoint_id) {
            return None;
        }

        let mut endpoints = self.endpoints.write();
        if endpoints.values().any(|ep| ep.endpoint_id == endpoint_id) {
            return None;
        }
        let handle = EngineHandle::from_raw(self.next_handle.fetch_add(1, Ordering::SeqCst))?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        endpoints.insert(
            handle,
            Arc::new(LoopbackEndpoint {
                endpoint_id: endpoint_id.to_string(),
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
                closed: CancellationToken::new(),
            }),
        );
        Some(handle)
    }

    async fn close(&self, handle: EngineHandle) -> bool {
        let Some(endpoint) = self.endpoints.write().remove(&handle) else {
            return false;
        };
        if self.in_flight.lock().get(&handle).copied().unwrap_or(0) > 0 {
            self.record_violation("close while a send is in flight", handle);
        }
        endpoint.closed.cancel();
        true
    }

    async fn send_bytes(
        &self,
        endpoint_id: &str,
        priority: u8,
        time_to_live: u32,
        payload: Bytes,
        handle: Option<EngineHandle>,
    ) -> i32 {
        if !self.status().is_started() || payload.is_empty() {
            return -1;
        }
        self.transmit(
            endpoint_id,
            priority,
            time_to_live,
            SentPayload::Bytes(payload),
            handle,
        )
        .await
    }

    async fn send_file(
        &self,
        endpoint_id: &str,
        priority: u8,
        time_to_live: u32,
        path: &Path,
        handle: Option<EngineHandle>,
    ) -> i32 {
        if !self.status().is_started() {
            return -1;
        }
        let contents = match tokio::fs::read(path).await {
            Ok(contents) if !contents.is_empty() => Bytes::from(contents),
            Ok(_) => return -1,
            Err(err) => {
                warn!(
                    target: "engine.loopback",
                    path = %path.display(),
                    error = %err,
                    "cannot read file payload"
                );
                return -1;
            }
        };
        self.transmit(
            endpoint_id,
            priority,
            time_to_live,
            SentPayload::File {
                path: path.to_path_buf(),
                contents,
            },
            handle,
        )
        .await
    }

    async fn receive(&self, handle: EngineHandle) -> Result<Delivery, ReceiveError> {
        let endpoint = self
            .endpoints
            .read()
            .get(&handle)
            .cloned()
            .ok_or(ReceiveError::HandleInvalidated)?;
        let mut inbox = endpoint.inbox_rx.lock().await;
        tokio::select! {
            biased;
            _ = endpoint.closed.cancelled() => Err(ReceiveError::HandleInvalidated),
            delivery = inbox.recv() => delivery.ok_or(ReceiveError::HandleInvalidated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(text: &'static str) -> Delivery {
        Delivery {
            source_endpoint_id: "ipn:9.1".into(),
            creation_time: 7,
            time_to_live: 30,
            payload: InboundPayload::Bytes(Bytes::from_static(text.as_bytes())),
        }
    }

    #[tokio::test]
    async fn open_requires_started_engine() {
        let engine = LoopbackEngine::new();
        assert_eq!(engine.status(), EngineStatus::NotStarted);
        assert!(engine.open("ipn:1.1").await.is_none());

        engine.start();
        let handle = engine.open("ipn:1.1").await.expect("handle");
        assert!(engine.open("ipn:1.1").await.is_none(), "eid already open");
        assert!(engine.open("").await.is_none());
        assert!(engine.close(handle).await);
        assert!(!engine.close(handle).await);
    }

    #[tokio::test]
    async fn rejected_endpoint_is_not_opened() {
        let engine = LoopbackEngine::started();
        engine.reject_opens("ipn:4.4");
        assert!(engine.open("ipn:4.4").await.is_none());
        assert_eq!(engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn sends_are_recorded_and_looped_back() {
        let engine = LoopbackEngine::started();
        let handle = engine.open("ipn:1.1").await.expect("handle");

        let code = engine
            .send_bytes("ipn:1.1", 2, 120, Bytes::from_static(b"ping"), Some(handle))
            .await;
        assert_eq!(code, 0);

        let received = engine.receive(handle).await.expect("delivery");
        assert_eq!(received.source_endpoint_id, "ipn:1.1");
        assert_eq!(received.time_to_live, 120);
        assert_eq!(
            received.payload,
            InboundPayload::Bytes(Bytes::from_static(b"ping"))
        );

        let sent = engine.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].priority, 2);
        assert_eq!(sent[0].handle, Some(handle));
    }

    #[tokio::test]
    async fn anonymous_sends_use_null_source() {
        let engine = LoopbackEngine::started();
        let handle = engine.open("ipn:2.1").await.expect("handle");
        assert_eq!(
            engine
                .send_bytes("ipn:2.1", 1, 10, Bytes::from_static(b"x"), None)
                .await,
            0
        );
        let received = engine.receive(handle).await.expect("delivery");
        assert_eq!(received.source_endpoint_id, NULL_ENDPOINT_ID);
    }

    #[tokio::test]
    async fn file_sends_capture_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"file body").expect("write");

        let engine = LoopbackEngine::started();
        assert_eq!(engine.send_file("ipn:5.1", 0, 60, &path, None).await, 0);
        match &engine.sent()[0].payload {
            SentPayload::File { path: sent_path, contents } => {
                assert_eq!(sent_path, &path);
                assert_eq!(contents, &Bytes::from_static(b"file body"));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let missing = dir.path().join("missing.bin");
        assert_eq!(engine.send_file("ipn:5.1", 0, 60, &missing, None).await, -1);
    }

    #[tokio::test]
    async fn stale_handle_send_counts_as_violation() {
        let engine = LoopbackEngine::started();
        let handle = engine.open("ipn:1.1").await.expect("handle");
        assert!(engine.close(handle).await);
        let code = engine
            .send_bytes("ipn:1.1", 1, 10, Bytes::from_static(b"late"), Some(handle))
            .await;
        assert_eq!(code, -1);
        assert_eq!(engine.violations(), 1);
    }

    #[tokio::test]
    async fn configured_failure_code_is_returned() {
        let engine = LoopbackEngine::started();
        engine.set_send_code(-3);
        let code = engine
            .send_bytes("ipn:1.1", 1, 10, Bytes::from_static(b"x"), None)
            .await;
        assert_eq!(code, -3);
        assert_eq!(engine.sent()[0].code, -3);
    }

    #[tokio::test]
    async fn stop_invalidates_pending_receive() {
        let engine = LoopbackEngine::started();
        let handle = engine.open("ipn:1.1").await.expect("handle");
        assert!(engine.inject("ipn:1.1", delivery("queued")));
        assert_eq!(
            engine.receive(handle).await.map(|d| d.time_to_live),
            Ok(30)
        );

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.receive(handle).await })
        };
        tokio::task::yield_now().await;
        engine.stop();
        let outcome = waiter.await.expect("join");
        assert_eq!(outcome, Err(ReceiveError::HandleInvalidated));
        assert_eq!(engine.status(), EngineStatus::Stopped);
        assert!(!engine.inject("ipn:1.1", delivery("dropped")));
    }
}
