/// Transport seam for bridge operations
///
/// The bridge never talks to sockets itself. A `Transport` opens a response
/// stream; the bridge pulls chunks and wraps the stream in a `TransportLease`
/// so the connection is released exactly once on every exit path.
use crate::config::types::Result;
use crate::observability::metrics::get_metrics;
use futures::future::BoxFuture;
use log::debug;
use serde::{Deserialize, Serialize};

/// An outbound request as handed over by script code
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            body,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Status line and headers, available once the stream is open
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// An open response body
pub trait ResponseStream: Send {
    fn head(&self) -> &ResponseHead;

    /// Next body chunk; `None` at end of body
    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Give the underlying connection back. Called exactly once by the lease.
    fn release(&mut self);
}

pub trait Transport: Send + Sync {
    /// Start the request. Errors map to `TransportFailure`.
    fn open(&self, request: Request) -> BoxFuture<'_, Result<Box<dyn ResponseStream>>>;
}

/// Exclusive hold on an open stream; releases it once, explicitly or on drop
pub struct TransportLease {
    operation_id: u64,
    stream: Option<Box<dyn ResponseStream>>,
}

impl TransportLease {
    pub fn new(operation_id: u64, stream: Box<dyn ResponseStream>) -> Self {
        Self {
            operation_id,
            stream: Some(stream),
        }
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    pub fn head(&self) -> Option<&ResponseHead> {
        self.stream.as_deref().map(|s| s.head())
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next_chunk().await,
            None => Ok(None),
        }
    }

    /// Release the stream. Returns false if it was already released.
    pub fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.release();
                get_metrics().transport_leases_released.inc();
                debug!("Released transport for operation {}", self.operation_id);
                true
            }
            None => false,
        }
    }
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        self.release();
    }
}
