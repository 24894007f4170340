//! Contract between the endpoint service and the bundle transport engine.
//!
//! The engine owns the bundle protocol, routing and convergence layers. This
//! crate only describes the primitives the service needs from it: a
//! process-wide status, opening and closing endpoints, sending bytes or files,
//! and a pull-style receive keyed by the endpoint handle.

use std::fmt;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod loopback;

pub use loopback::{LoopbackEngine, SentPayload, SentRecord};

/// Opaque reference to an endpoint opened inside the engine.
///
/// The native contract reports failure as a zero handle; here that case is
/// `None` wherever a handle may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineHandle(NonZeroU64);

impl EngineHandle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    NotStarted,
    Started,
    Stopped,
}

impl EngineStatus {
    pub fn is_started(self) -> bool {
        matches!(self, EngineStatus::Started)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineStatus::NotStarted => "NOT_STARTED",
            EngineStatus::Started => "STARTED",
            EngineStatus::Stopped => "STOPPED",
        };
        f.write_str(label)
    }
}

/// Payload of an inbound delivery as the engine hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    Bytes(Bytes),
    File(PathBuf),
}

/// One bundle delivered to an open endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source_endpoint_id: String,
    /// Seconds since the DTN epoch.
    pub creation_time: u64,
    pub time_to_live: u32,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// The handle was closed or the engine stopped; no further deliveries.
    #[error("endpoint handle invalidated")]
    HandleInvalidated,
    #[error("malformed delivery: {0}")]
    Malformed(String),
}

/// Primitives exposed by the transport engine.
///
/// Send calls return the native result code: non-negative on success,
/// negative on failure.
#[async_trait]
pub trait Engine: Send + Sync {
    fn status(&self) -> EngineStatus;

    async fn open(&self, endpoint_id: &str) -> Option<EngineHandle>;

    async fn close(&self, handle: EngineHandle) -> bool;

    async fn send_bytes(
        &self,
        endpoint_id: &str,
        priority: u8,
        time_to_live: u32,
        payload: Bytes,
        handle: Option<EngineHandle>,
    ) -> i32;

    async fn send_file(
        &self,
        endpoint_id: &str,
        priority: u8,
        time_to_live: u32,
        path: &Path,
        handle: Option<EngineHandle>,
    ) -> i32;

    /// Waits for the next delivery on `handle`.
    async fn receive(&self, handle: EngineHandle) -> Result<Delivery, ReceiveError>;
}
