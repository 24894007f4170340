use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bundle_model::{Bundle, Payload};
use engine_boundary::{Delivery, Engine, EngineHandle, InboundPayload, ReceiveError};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::EndpointResult;
use crate::listener::BundleListener;
use crate::spool::PayloadSpooler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveExit {
    /// Stopped by the owning session.
    Cancelled,
    /// The engine stopped handing out deliveries for the handle.
    HandleInvalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub delivered: u64,
    pub listener_failures: u64,
    pub malformed: u64,
    pub exit: ReceiveExit,
}

/// Pulls deliveries for one handle and hands them to the listener in order.
pub struct ReceiveLoop {
    pub engine: Arc<dyn Engine>,
    pub handle: EngineHandle,
    pub endpoint_id: String,
    pub listener: Arc<dyn BundleListener>,
    pub spooler: Arc<PayloadSpooler>,
    /// Inbound byte payloads at least this large are spooled to files; zero disables.
    pub threshold: usize,
    pub backoff: Duration,
    pub cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(self) -> ReceiveSummary {
        let mut summary = ReceiveSummary {
            delivered: 0,
            listener_failures: 0,
            malformed: 0,
            exit: ReceiveExit::Cancelled,
        };
        debug!(
            target: "bundle.receive",
            endpoint_id = %self.endpoint_id,
            handle = %self.handle,
            "receive loop started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.engine.receive(self.handle) => next,
            };

            let delivery = match next {
                Ok(delivery) => delivery,
                Err(ReceiveError::HandleInvalidated) => {
                    summary.exit = if self.cancel.is_cancelled() {
                        ReceiveExit::Cancelled
                    } else {
                        ReceiveExit::HandleInvalidated
                    };
                    break;
                }
                Err(ReceiveError::Malformed(reason)) => {
                    summary.malformed += 1;
                    warn!(
                        target: "bundle.receive",
                        endpoint_id = %self.endpoint_id,
                        %reason,
                        "dropping malformed delivery"
                    );
                    if !self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            let bundle = match self.translate(delivery).await {
                Ok(bundle) => bundle,
                Err(err) => {
                    summary.malformed += 1;
                    warn!(
                        target: "bundle.receive",
                        endpoint_id = %self.endpoint_id,
                        error = %err,
                        "failed to materialize delivery"
                    );
                    if !self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            if self.dispatch(bundle) {
                summary.delivered += 1;
            } else {
                summary.listener_failures += 1;
            }
        }

        debug!(
            target: "bundle.receive",
            endpoint_id = %self.endpoint_id,
            delivered = summary.delivered,
            listener_failures = summary.listener_failures,
            exit = ?summary.exit,
            "receive loop finished"
        );
        summary
    }

    /// Backs off after a bad delivery. Returns false when cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }

    async fn translate(&self, delivery: Delivery) -> EndpointResult<Bundle> {
        let payload = match delivery.payload {
            InboundPayload::Bytes(bytes) if self.threshold > 0 && bytes.len() >= self.threshold => {
                Payload::File(self.spooler.spool_bytes(&bytes).await?)
            }
            InboundPayload::Bytes(bytes) => Payload::Bytes(bytes),
            InboundPayload::File(path) => Payload::File(self.spooler.spool_file(&path).await?),
        };
        Ok(Bundle::delivered(
            delivery.source_endpoint_id,
            delivery.creation_time,
            delivery.time_to_live,
            payload,
        ))
    }

    fn dispatch(&self, bundle: Bundle) -> bool {
        let source = bundle.endpoint_id.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.listener.deliver(bundle)));
        match outcome {
            Ok(Ok(())) => {
                counter!("bundle_service_deliveries_total", 1);
                trace!(
                    target: "bundle.receive",
                    endpoint_id = %self.endpoint_id,
                    %source,
                    "bundle delivered"
                );
                true
            }
            Ok(Err(err)) => {
                counter!("bundle_service_listener_failures_total", 1);
                warn!(
                    target: "bundle.receive",
                    endpoint_id = %self.endpoint_id,
                    %source,
                    error = %err,
                    "listener failed to accept bundle"
                );
                false
            }
            Err(_) => {
                counter!("bundle_service_listener_failures_total", 1);
                warn!(
                    target: "bundle.receive",
                    endpoint_id = %self.endpoint_id,
                    %source,
                    "listener panicked while accepting bundle"
                );
                false
            }
        }
    }
}

/// A spawned [`ReceiveLoop`] and the token that stops it.
pub struct ReceiveTask {
    cancel: CancellationToken,
    join: JoinHandle<ReceiveSummary>,
}

impl ReceiveTask {
    pub fn spawn(receive: ReceiveLoop) -> Self {
        let cancel = receive.cancel.clone();
        let join = tokio::spawn(receive.run());
        Self { cancel, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the loop and waits up to `grace` for it to exit. A loop that
    /// does not exit in time is aborted and `None` is returned.
    pub async fn stop(self, grace: Duration) -> Option<ReceiveSummary> {
        self.cancel.cancel();
        let mut join = self.join;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(err)) => {
                warn!(target: "bundle.receive", error = %err, "receive task failed");
                None
            }
            Err(_) => {
                warn!(
                    target: "bundle.receive",
                    grace_ms = grace.as_millis() as u64,
                    "receive loop ignored cancellation; aborting"
                );
                join.abort();
                None
            }
        }
    }
}
