use bundle_model::Bundle;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("listener is unreachable")]
    Unreachable,
    #[error("listener rejected bundle: {0}")]
    Rejected(String),
}

/// Receives bundles delivered to an open endpoint.
///
/// Called from the session's receive loop, one bundle at a time in arrival
/// order. An error only drops that bundle; later deliveries still arrive.
pub trait BundleListener: Send + Sync {
    fn deliver(&self, bundle: Bundle) -> Result<(), ListenerError>;
}

impl<F> BundleListener for F
where
    F: Fn(Bundle) -> Result<(), ListenerError> + Send + Sync,
{
    fn deliver(&self, bundle: Bundle) -> Result<(), ListenerError> {
        (self)(bundle)
    }
}

/// Listener that forwards deliveries into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Bundle>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bundle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BundleListener for ChannelListener {
    fn deliver(&self, bundle: Bundle) -> Result<(), ListenerError> {
        self.tx.send(bundle).map_err(|_| ListenerError::Unreachable)
    }
}
