use std::path::PathBuf;
use std::sync::Arc;

use bundle_model::{Bundle, Payload};
use engine_boundary::{Engine, EngineHandle};
use metrics::counter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{EndpointError, EndpointResult};
use crate::listener::BundleListener;
use crate::lock::{AcquirePolicy, SessionLock};
use crate::receive::{ReceiveLoop, ReceiveTask};
use crate::spool::PayloadSpooler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Non-negative engine result code.
    pub code: i32,
    /// Temporary copy handed to the engine for file payloads.
    pub spooled: Option<PathBuf>,
}

/// What a close actually did. Close always finishes its teardown; the
/// report carries the parts that went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// The engine acknowledged closing the handle.
    pub engine_closed: bool,
    /// The close ran without holding the session lock.
    pub forced: bool,
    pub artifacts_removed: usize,
    pub artifact_failures: usize,
}

struct SessionInner {
    state: SessionState,
    endpoint_id: String,
    handle: Option<EngineHandle>,
    receive: Option<ReceiveTask>,
}

/// One open endpoint: its engine handle, receive loop and spooled artifacts.
///
/// Sends serialize on the session lock. Close takes the same lock, so a close
/// never invalidates the handle while a send holding the lock is using it.
pub struct EndpointSession {
    id: Uuid,
    engine: Arc<dyn Engine>,
    config: Arc<ServiceConfig>,
    lock: SessionLock,
    inner: Mutex<SessionInner>,
    spooler: Arc<PayloadSpooler>,
}

impl EndpointSession {
    pub(crate) async fn open(
        engine: Arc<dyn Engine>,
        config: Arc<ServiceConfig>,
        endpoint_id: &str,
        listener: Arc<dyn BundleListener>,
    ) -> EndpointResult<Arc<Self>> {
        ensure_started(engine.as_ref())?;

        let id = Uuid::new_v4();
        let spooler = Arc::new(PayloadSpooler::create(config.spool_root.join(id.to_string())).await?);
        let session = Arc::new(Self {
            id,
            engine: Arc::clone(&engine),
            config: Arc::clone(&config),
            lock: SessionLock::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Opening,
                endpoint_id: endpoint_id.to_string(),
                handle: None,
                receive: None,
            }),
            spooler: Arc::clone(&spooler),
        });

        let Some(handle) = engine.open(endpoint_id).await else {
            session.inner.lock().state = SessionState::Closed;
            spooler.purge().await;
            warn!(
                target: "bundle.session",
                %endpoint_id,
                "engine refused to open endpoint"
            );
            return Err(EndpointError::OpenRejected {
                endpoint_id: endpoint_id.to_string(),
            });
        };

        let receive = ReceiveTask::spawn(ReceiveLoop {
            engine,
            handle,
            endpoint_id: endpoint_id.to_string(),
            listener,
            spooler,
            threshold: config.inbound_file_threshold,
            backoff: config.receive_error_backoff,
            cancel: CancellationToken::new(),
        });
        {
            let mut inner = session.inner.lock();
            inner.handle = Some(handle);
            inner.receive = Some(receive);
            inner.state = SessionState::Open;
        }
        debug!(
            target: "bundle.session",
            session_id = %id,
            %endpoint_id,
            %handle,
            "endpoint session open"
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoint identifier while open; empty once closed.
    pub fn endpoint_id(&self) -> String {
        self.inner.lock().endpoint_id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn handle(&self) -> Option<EngineHandle> {
        self.inner.lock().handle
    }

    /// Whether a send or close currently holds the session lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    pub fn artifact_count(&self) -> usize {
        self.spooler.len()
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.spooler.artifacts()
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.spooler.dir().to_path_buf()
    }

    pub async fn send(&self, bundle: &Bundle) -> EndpointResult<SendReceipt> {
        self.send_with(bundle, &CancellationToken::new()).await
    }

    /// Sends `bundle` from this endpoint. `interrupt` aborts the wait for the
    /// session lock; it has no effect once the engine call has started.
    pub async fn send_with(
        &self,
        bundle: &Bundle,
        interrupt: &CancellationToken,
    ) -> EndpointResult<SendReceipt> {
        ensure_started(self.engine.as_ref())?;
        validate(bundle)?;

        let acquired = self
            .lock
            .acquire(
                AcquirePolicy::AbortOnTimeout(self.config.send_acquire_timeout),
                interrupt,
            )
            .await
            .map_err(|err| {
                counter!("bundle_service_sends_total", 1, "outcome" => "lock_failed");
                err
            })?;

        let handle = {
            let inner = self.inner.lock();
            match (inner.state, inner.handle) {
                (SessionState::Open, Some(handle)) => handle,
                _ => return Err(EndpointError::EndpointNotOpen),
            }
        };

        let receipt = transmit(self.engine.as_ref(), &self.spooler, bundle, Some(handle)).await;
        drop(acquired);
        receipt
    }

    pub(crate) async fn close_with(
        &self,
        interrupt: &CancellationToken,
    ) -> EndpointResult<CloseReport> {
        ensure_started(self.engine.as_ref())?;
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Open {
                return Err(EndpointError::EndpointNotOpen);
            }
            inner.state = SessionState::Closing;
        }

        let acquired = match self
            .lock
            .acquire(
                AcquirePolicy::ProceedOnTimeout(self.config.close_acquire_timeout),
                interrupt,
            )
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                self.inner.lock().state = SessionState::Open;
                return Err(err);
            }
        };

        let forced = acquired.is_forced();
        if forced {
            counter!("bundle_service_forced_closes_total", 1);
            warn!(
                target: "bundle.session",
                session_id = %self.id,
                waited_ms = self.config.close_acquire_timeout.as_millis() as u64,
                "session lock not acquired; closing without it"
            );
        }

        let (endpoint_id, handle, receive) = {
            let mut inner = self.inner.lock();
            (
                inner.endpoint_id.clone(),
                inner.handle.take(),
                inner.receive.take(),
            )
        };

        if let Some(receive) = receive {
            if let Some(summary) = receive.stop(self.config.receive_cancel_grace).await {
                debug!(
                    target: "bundle.session",
                    session_id = %self.id,
                    delivered = summary.delivered,
                    listener_failures = summary.listener_failures,
                    "receive loop stopped"
                );
            }
        }

        let purge = self.spooler.purge().await;

        let engine_closed = match handle {
            Some(handle) => self.engine.close(handle).await,
            None => false,
        };
        if !engine_closed {
            warn!(
                target: "bundle.session",
                session_id = %self.id,
                %endpoint_id,
                "engine did not confirm closing the endpoint handle"
            );
        }

        {
            let mut inner = self.inner.lock();
            inner.endpoint_id.clear();
            inner.state = SessionState::Closed;
        }
        drop(acquired);

        info!(
            target: "bundle.session",
            session_id = %self.id,
            %endpoint_id,
            forced,
            artifacts_removed = purge.removed,
            artifact_failures = purge.failed,
            "endpoint session closed"
        );
        Ok(CloseReport {
            engine_closed,
            forced,
            artifacts_removed: purge.removed,
            artifact_failures: purge.failed,
        })
    }
}

pub(crate) fn ensure_started(engine: &dyn Engine) -> EndpointResult<()> {
    if engine.status().is_started() {
        Ok(())
    } else {
        Err(EndpointError::EngineUnavailable)
    }
}

pub(crate) fn validate(bundle: &Bundle) -> EndpointResult<()> {
    if bundle.endpoint_id.trim().is_empty() {
        return Err(EndpointError::InvalidBundle("destination endpoint is empty".into()));
    }
    if !bundle.priority.is_sendable() {
        return Err(EndpointError::InvalidBundle(format!(
            "priority {:?} cannot be sent",
            bundle.priority
        )));
    }
    Ok(())
}

/// Hands `bundle` to the engine, on `handle` or from the null endpoint.
///
/// File payloads are first copied into `spooler`; the copy stays tracked
/// whether or not the engine accepts it.
pub(crate) async fn transmit(
    engine: &dyn Engine,
    spooler: &PayloadSpooler,
    bundle: &Bundle,
    handle: Option<EngineHandle>,
) -> EndpointResult<SendReceipt> {
    let priority = bundle.priority.ordinal();
    let (code, spooled) = match bundle.payload() {
        Payload::Bytes(bytes) => {
            let code = engine
                .send_bytes(
                    &bundle.endpoint_id,
                    priority,
                    bundle.time_to_live,
                    bytes.clone(),
                    handle,
                )
                .await;
            (code, None)
        }
        Payload::File(source) => {
            let spooled = spooler.spool_file(source).await.map_err(|err| {
                counter!("bundle_service_sends_total", 1, "outcome" => "io_failed");
                err
            })?;
            let code = engine
                .send_file(
                    &bundle.endpoint_id,
                    priority,
                    bundle.time_to_live,
                    &spooled,
                    handle,
                )
                .await;
            (code, Some(spooled))
        }
    };

    if code < 0 {
        counter!("bundle_service_sends_total", 1, "outcome" => "engine_failed");
        warn!(
            target: "bundle.session",
            destination = %bundle.endpoint_id,
            code,
            "engine rejected bundle"
        );
        return Err(EndpointError::EngineSendFailure { code });
    }

    counter!("bundle_service_sends_total", 1, "outcome" => "ok");
    debug!(
        target: "bundle.session",
        destination = %bundle.endpoint_id,
        priority,
        ttl = bundle.time_to_live,
        code,
        "bundle handed to engine"
    );
    Ok(SendReceipt { code, spooled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelListener;
    use bundle_model::Priority;
    use engine_boundary::LoopbackEngine;

    async fn open_session(
        engine: &Arc<LoopbackEngine>,
        root: &tempfile::TempDir,
    ) -> Arc<EndpointSession> {
        let config = Arc::new(ServiceConfig::default().with_spool_root(root.path()));
        let (listener, _rx) = ChannelListener::new();
        EndpointSession::open(engine.clone(), config, "ipn:1.1", Arc::new(listener))
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn open_allocates_private_spool_dir() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let session = open_session(&engine, &root).await;

        assert!(session.is_open());
        assert_eq!(session.endpoint_id(), "ipn:1.1");
        assert_eq!(session.spool_dir(), root.path().join(session.id().to_string()));
        assert!(session.spool_dir().is_dir());
        assert!(engine.is_open(session.handle().expect("handle")));
    }

    #[tokio::test]
    async fn rejected_open_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        engine.reject_opens("ipn:1.1");
        let config = Arc::new(ServiceConfig::default().with_spool_root(root.path()));
        let (listener, _rx) = ChannelListener::new();

        let err = EndpointSession::open(engine.clone(), config, "ipn:1.1", Arc::new(listener))
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, EndpointError::OpenRejected { ref endpoint_id } if endpoint_id == "ipn:1.1"));
        let mut entries = tokio::fs::read_dir(root.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_bundles_never_reach_the_engine() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let session = open_session(&engine, &root).await;

        let mut bundle = Bundle::new("ipn:2.1", Priority::Invalid, 10, "x");
        let err = session.send(&bundle).await.expect_err("invalid priority");
        assert!(matches!(err, EndpointError::InvalidBundle(_)));

        bundle.priority = Priority::Bulk;
        bundle.endpoint_id = " ".into();
        let err = session.send(&bundle).await.expect_err("empty destination");
        assert!(matches!(err, EndpointError::InvalidBundle(_)));
        assert!(engine.sent().is_empty());
    }

    #[tokio::test]
    async fn close_resets_and_second_close_is_not_open() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let session = open_session(&engine, &root).await;
        let handle = session.handle().expect("handle");

        let report = session
            .close_with(&CancellationToken::new())
            .await
            .expect("closed");
        assert!(report.engine_closed);
        assert!(!report.forced);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.endpoint_id(), "");
        assert!(session.handle().is_none());
        assert!(!engine.is_open(handle));
        assert!(!session.spool_dir().exists());

        let err = session
            .close_with(&CancellationToken::new())
            .await
            .expect_err("already closed");
        assert!(matches!(err, EndpointError::EndpointNotOpen));

        let err = session
            .send(&Bundle::new("ipn:2.1", Priority::Standard, 10, "late"))
            .await
            .expect_err("closed session");
        assert!(matches!(err, EndpointError::EndpointNotOpen));
    }

    #[tokio::test]
    async fn close_requires_running_engine() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let session = open_session(&engine, &root).await;
        engine.stop();

        let err = session
            .close_with(&CancellationToken::new())
            .await
            .expect_err("engine stopped");
        assert!(matches!(err, EndpointError::EngineUnavailable));
        assert!(session.is_open());
    }
}
