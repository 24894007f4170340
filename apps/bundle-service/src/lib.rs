//! Endpoint session manager for a store-and-forward bundle engine.
//!
//! [`EndpointRegistry`] owns the process-wide table of open endpoints. Each
//! [`EndpointSession`] binds an identifier to an engine handle, a receive
//! loop feeding a [`BundleListener`], and the temporary files spooled for it.
//! [`BundleClient`] is the per-client view: open, send, close.

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod lock;
pub mod receive;
pub mod registry;
pub mod session;
pub mod spool;

pub use client::BundleClient;
pub use config::ServiceConfig;
pub use error::{EndpointError, EndpointResult};
pub use listener::{BundleListener, ChannelListener, ListenerError};
pub use lock::{AcquirePolicy, Acquired, SessionLock};
pub use receive::{ReceiveExit, ReceiveSummary};
pub use registry::{EndpointRegistry, SessionSnapshot};
pub use session::{CloseReport, EndpointSession, SendReceipt, SessionState};
pub use spool::{PayloadSpooler, PurgeReport};
