use std::sync::Arc;

use bundle_model::Bundle;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EndpointError, EndpointResult};
use crate::listener::BundleListener;
use crate::registry::EndpointRegistry;
use crate::session::{self, CloseReport, EndpointSession, SendReceipt, SessionState};

/// Per-client binding to the registry. Holds at most one open endpoint.
pub struct BundleClient {
    registry: EndpointRegistry,
    session: Mutex<Option<Arc<EndpointSession>>>,
}

impl BundleClient {
    pub fn new(registry: EndpointRegistry) -> Self {
        Self {
            registry,
            session: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Option<Arc<EndpointSession>> {
        self.session.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    /// Drops the binding to `session` if it is still the one held.
    fn release(&self, session: &Arc<EndpointSession>) {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, session)) {
            *slot = None;
        }
    }

    pub async fn open_endpoint<L>(&self, endpoint_id: &str, listener: L) -> EndpointResult<()>
    where
        L: BundleListener + 'static,
    {
        if let Some(current) = self.session() {
            if current.state() != SessionState::Closed {
                return Err(EndpointError::EndpointInUse {
                    endpoint_id: current.endpoint_id(),
                });
            }
            // Closed through the registry, not through this client.
            self.release(&current);
        }

        let session = self.registry.open(endpoint_id, Arc::new(listener)).await?;
        let raced = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|held| held.state() != SessionState::Closed) {
                true
            } else {
                *slot = Some(Arc::clone(&session));
                false
            }
        };
        if raced {
            // Another open on this client won; release the endpoint we just took.
            if let Err(err) = self.registry.close(&session).await {
                warn!(
                    target: "bundle.registry",
                    %endpoint_id,
                    error = %err,
                    "failed to release endpoint after losing open race"
                );
            }
            return Err(EndpointError::EndpointInUse {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn close_endpoint(&self) -> EndpointResult<CloseReport> {
        self.close_endpoint_with(&CancellationToken::new()).await
    }

    /// Closes the held endpoint. The binding is released even when the
    /// engine fails to confirm the close, which is then reported as
    /// `EngineCloseFailure`.
    pub async fn close_endpoint_with(
        &self,
        interrupt: &CancellationToken,
    ) -> EndpointResult<CloseReport> {
        session::ensure_started(self.registry.engine().as_ref())?;
        let session = self.session().ok_or(EndpointError::EndpointNotOpen)?;

        let report = match self.registry.close_with(&session, interrupt).await {
            Ok(report) => report,
            Err(EndpointError::EndpointNotOpen) => {
                self.release(&session);
                return Err(EndpointError::EndpointNotOpen);
            }
            Err(err) => return Err(err),
        };
        self.release(&session);

        if !report.engine_closed {
            return Err(EndpointError::EngineCloseFailure);
        }
        Ok(report)
    }

    /// Sends from the held endpoint, or from the null endpoint when none is
    /// held and the service allows it.
    pub async fn send_bundle(&self, bundle: &Bundle) -> EndpointResult<SendReceipt> {
        self.send_bundle_with(bundle, &CancellationToken::new()).await
    }

    pub async fn send_bundle_with(
        &self,
        bundle: &Bundle,
        interrupt: &CancellationToken,
    ) -> EndpointResult<SendReceipt> {
        let held = match self.session() {
            Some(session) if session.state() == SessionState::Closed => {
                self.release(&session);
                None
            }
            held => held,
        };
        match held {
            Some(session) => session.send_with(bundle, interrupt).await,
            None if self.registry.config().allow_anonymous_send => {
                self.registry.send_anonymous(bundle).await
            }
            None => {
                session::ensure_started(self.registry.engine().as_ref())?;
                Err(EndpointError::EndpointNotOpen)
            }
        }
    }
}

impl Drop for BundleClient {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().take() else {
            return;
        };
        if !session.is_open() {
            return;
        }

        let registry = self.registry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(
                    target: "bundle.registry",
                    session_id = %session.id(),
                    "client dropped with an open endpoint; closing"
                );
                runtime.spawn(async move {
                    if let Err(err) = registry.close(&session).await {
                        warn!(
                            target: "bundle.registry",
                            session_id = %session.id(),
                            error = %err,
                            "failed to close endpoint of dropped client"
                        );
                    }
                });
            }
            Err(_) => warn!(
                target: "bundle.registry",
                session_id = %session.id(),
                "client dropped outside a runtime; endpoint left open"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::listener::ChannelListener;
    use bundle_model::Priority;
    use engine_boundary::LoopbackEngine;

    fn client(engine: &Arc<LoopbackEngine>, config: ServiceConfig) -> BundleClient {
        BundleClient::new(EndpointRegistry::new(engine.clone(), config))
    }

    #[tokio::test]
    async fn second_open_on_same_client_is_in_use() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let client = client(&engine, ServiceConfig::default().with_spool_root(root.path()));

        let (first, _rx1) = ChannelListener::new();
        client.open_endpoint("ipn:1.1", first).await.expect("open");
        let (second, _rx2) = ChannelListener::new();
        let err = client
            .open_endpoint("ipn:1.2", second)
            .await
            .expect_err("already bound");
        assert!(matches!(err, EndpointError::EndpointInUse { ref endpoint_id } if endpoint_id == "ipn:1.1"));
        assert_eq!(engine.open_handles(), 1);
    }

    #[tokio::test]
    async fn close_without_open_is_not_open() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let client = client(&engine, ServiceConfig::default().with_spool_root(root.path()));

        let err = client.close_endpoint().await.expect_err("nothing open");
        assert!(matches!(err, EndpointError::EndpointNotOpen));
        assert_eq!(engine.open_handles(), 0);
        assert!(engine.sent().is_empty());
    }

    #[tokio::test]
    async fn send_without_endpoint_depends_on_anonymous_setting() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let bundle = Bundle::new("ipn:2.1", Priority::Standard, 30, "hi");

        let strict = client(&engine, ServiceConfig::default().with_spool_root(root.path()));
        let err = strict.send_bundle(&bundle).await.expect_err("no endpoint");
        assert!(matches!(err, EndpointError::EndpointNotOpen));

        let mut config = ServiceConfig::default().with_spool_root(root.path());
        config.allow_anonymous_send = true;
        let lenient = client(&engine, config);
        lenient.send_bundle(&bundle).await.expect("anonymous send");
        assert_eq!(engine.sent()[0].handle, None);
    }

    #[tokio::test]
    async fn engine_not_started_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(LoopbackEngine::new());
        let client = client(&engine, ServiceConfig::default().with_spool_root(root.path()));

        let (listener, _rx) = ChannelListener::new();
        let err = client
            .open_endpoint("ipn:1.1", listener)
            .await
            .expect_err("not started");
        assert!(matches!(err, EndpointError::EngineUnavailable));
        let err = client.close_endpoint().await.expect_err("not started");
        assert!(matches!(err, EndpointError::EngineUnavailable));
        let err = client
            .send_bundle(&Bundle::new("ipn:2.1", Priority::Bulk, 1, "x"))
            .await
            .expect_err("not started");
        assert!(matches!(err, EndpointError::EngineUnavailable));
    }

    #[tokio::test]
    async fn registry_shutdown_releases_the_client_binding() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let registry = EndpointRegistry::new(
            engine.clone(),
            ServiceConfig::default().with_spool_root(root.path()),
        );
        let client = BundleClient::new(registry.clone());

        let (listener, _rx) = ChannelListener::new();
        client.open_endpoint("ipn:1.1", listener).await.expect("open");
        assert!(client.is_open());
        assert_eq!(registry.close_all().await, 1);
        assert!(!client.is_open());

        let err = client.close_endpoint().await.expect_err("already closed");
        assert!(matches!(err, EndpointError::EndpointNotOpen));
        assert!(client.session().is_none());

        let (listener, _rx) = ChannelListener::new();
        client.open_endpoint("ipn:1.1", listener).await.expect("reopen");
        assert!(client.is_open());
        assert_eq!(engine.open_handles(), 1);
    }

    #[tokio::test]
    async fn direct_registry_close_frees_the_client_for_reopen() {
        let root = tempfile::tempdir().unwrap();
        let engine = LoopbackEngine::started();
        let registry = EndpointRegistry::new(
            engine.clone(),
            ServiceConfig::default().with_spool_root(root.path()),
        );
        let client = BundleClient::new(registry.clone());

        let (listener, _rx) = ChannelListener::new();
        client.open_endpoint("ipn:1.1", listener).await.expect("open");
        let session = client.session().expect("bound");
        registry.close(&session).await.expect("close through registry");

        let err = client
            .send_bundle(&Bundle::new("ipn:2.1", Priority::Bulk, 1, "x"))
            .await
            .expect_err("no endpoint");
        assert!(matches!(err, EndpointError::EndpointNotOpen));

        let (listener, _rx) = ChannelListener::new();
        client.open_endpoint("ipn:1.2", listener).await.expect("open another");
        assert_eq!(client.session().map(|s| s.endpoint_id()), Some("ipn:1.2".into()));
        client.close_endpoint().await.expect("close");
        assert!(!client.is_open());
    }
}
