use std::sync::Arc;

use bundle_model::Bundle;
use dashmap::{DashMap, DashSet};
use engine_boundary::Engine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{EndpointError, EndpointResult};
use crate::listener::BundleListener;
use crate::session::{self, CloseReport, EndpointSession, SendReceipt};
use crate::spool::PayloadSpooler;

const ANONYMOUS_SPOOL_DIR: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub endpoint_id: String,
    pub session_id: Uuid,
    pub artifact_count: usize,
}

/// Process-wide table of open endpoints, at most one session per identifier.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    engine: Arc<dyn Engine>,
    config: Arc<ServiceConfig>,
    sessions: DashMap<String, Arc<EndpointSession>>,
    /// Identifiers with an open in progress.
    reservations: DashSet<String>,
    anonymous: Mutex<Option<Arc<PayloadSpooler>>>,
}

struct Reservation<'a> {
    reservations: &'a DashSet<String>,
    endpoint_id: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reservations.remove(self.endpoint_id);
    }
}

impl EndpointRegistry {
    pub fn new(engine: Arc<dyn Engine>, config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                engine,
                config: Arc::new(config),
                sessions: DashMap::new(),
                reservations: DashSet::new(),
                anonymous: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.inner.engine)
    }

    /// Opens `endpoint_id` and starts delivering its bundles to `listener`.
    ///
    /// Concurrent opens of the same identifier race on a reservation; the
    /// loser fails with `EndpointInUse` before touching the engine.
    pub async fn open(
        &self,
        endpoint_id: &str,
        listener: Arc<dyn BundleListener>,
    ) -> EndpointResult<Arc<EndpointSession>> {
        session::ensure_started(self.inner.engine.as_ref())?;

        if !self.inner.reservations.insert(endpoint_id.to_string()) {
            return Err(EndpointError::EndpointInUse {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        let _reservation = Reservation {
            reservations: &self.inner.reservations,
            endpoint_id,
        };
        if self.inner.sessions.contains_key(endpoint_id) {
            return Err(EndpointError::EndpointInUse {
                endpoint_id: endpoint_id.to_string(),
            });
        }

        let session = EndpointSession::open(
            Arc::clone(&self.inner.engine),
            Arc::clone(&self.inner.config),
            endpoint_id,
            listener,
        )
        .await?;
        self.inner
            .sessions
            .insert(endpoint_id.to_string(), Arc::clone(&session));

        info!(
            target: "bundle.registry",
            %endpoint_id,
            session_id = %session.id(),
            open_sessions = self.inner.sessions.len(),
            "endpoint opened"
        );
        Ok(session)
    }

    pub async fn close(&self, session: &Arc<EndpointSession>) -> EndpointResult<CloseReport> {
        self.close_with(session, &CancellationToken::new()).await
    }

    /// Closes `session` and drops its registry entry. A forced close still
    /// releases the identifier.
    pub async fn close_with(
        &self,
        session: &Arc<EndpointSession>,
        interrupt: &CancellationToken,
    ) -> EndpointResult<CloseReport> {
        let endpoint_id = session.endpoint_id();
        let report = session.close_with(interrupt).await?;

        let removed = self
            .inner
            .sessions
            .remove_if(&endpoint_id, |_, registered| Arc::ptr_eq(registered, session))
            .is_some();
        if report.forced {
            warn!(
                target: "bundle.registry",
                %endpoint_id,
                session_id = %session.id(),
                "endpoint released after forced close"
            );
        }
        info!(
            target: "bundle.registry",
            %endpoint_id,
            session_id = %session.id(),
            removed,
            open_sessions = self.inner.sessions.len(),
            "endpoint released"
        );
        Ok(report)
    }

    /// Closes every registered session and purges anonymous spool artifacts.
    /// Returns how many sessions were closed.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<EndpointSession>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0usize;
        for session in &sessions {
            match self.close(session).await {
                Ok(_) => closed += 1,
                Err(EndpointError::EndpointNotOpen) => {}
                Err(err) => warn!(
                    target: "bundle.registry",
                    session_id = %session.id(),
                    error = %err,
                    "failed to close endpoint during shutdown"
                ),
            }
        }

        let anonymous = self.inner.anonymous.lock().await.take();
        if let Some(spooler) = anonymous {
            spooler.purge().await;
        }
        closed
    }

    /// Sends `bundle` from the null endpoint, without any open session.
    pub async fn send_anonymous(&self, bundle: &Bundle) -> EndpointResult<SendReceipt> {
        session::ensure_started(self.inner.engine.as_ref())?;
        session::validate(bundle)?;
        warn!(
            target: "bundle.registry",
            destination = %bundle.endpoint_id,
            "no endpoint open; sending from the null endpoint"
        );

        let spooler = self.anonymous_spooler().await?;
        session::transmit(self.inner.engine.as_ref(), &spooler, bundle, None).await
    }

    async fn anonymous_spooler(&self) -> EndpointResult<Arc<PayloadSpooler>> {
        let mut slot = self.inner.anonymous.lock().await;
        if let Some(spooler) = slot.as_ref() {
            return Ok(Arc::clone(spooler));
        }
        let spooler = Arc::new(
            PayloadSpooler::create(self.inner.config.spool_root.join(ANONYMOUS_SPOOL_DIR)).await?,
        );
        *slot = Some(Arc::clone(&spooler));
        Ok(spooler)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshot: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| SessionSnapshot {
                endpoint_id: entry.key().clone(),
                session_id: entry.value().id(),
                artifact_count: entry.value().artifact_count(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        snapshot
    }

    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.inner.sessions.contains_key(endpoint_id)
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<EndpointSession>> {
        self.inner
            .sessions
            .get(endpoint_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}
