/// In-memory transport for bridge tests
///
/// Serves scripted responses per URL and counts opens, releases and streams
/// dropped without release, so tests can assert that no connection leaks on
/// any abort path.
use crate::bridge::transport::{Request, ResponseHead, ResponseStream, Transport};
use crate::config::types::{HostError, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the mock answers one URL
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub chunks: Vec<Vec<u8>>,
    /// Delay before the stream opens
    pub open_delay: Duration,
    /// Delay before every chunk
    pub chunk_delay: Duration,
    /// After this many chunks the stream hangs forever
    pub stall_after: Option<usize>,
    /// Fail the open with this message
    pub fail_open: Option<String>,
    /// Fail the body read after this many chunks
    pub fail_after: Option<usize>,
}

impl MockResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            chunks: vec![body.to_vec()],
            open_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            stall_after: None,
            fail_open: None,
            fail_after: None,
        }
    }

    pub fn chunked(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            ..Self::ok(b"")
        }
    }

    /// Sends `served` chunks then never finishes
    pub fn stalling(served: usize) -> Self {
        Self {
            chunks: vec![vec![0u8; 16]; served + 1],
            stall_after: Some(served),
            ..Self::ok(b"")
        }
    }

    pub fn failing_open(message: &str) -> Self {
        Self {
            fail_open: Some(message.to_string()),
            ..Self::ok(b"")
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_fail_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }
}

#[derive(Debug, Default)]
pub struct MockCounters {
    pub opens: AtomicUsize,
    pub releases: AtomicUsize,
    pub leaked: AtomicUsize,
    pub chunks_served: AtomicUsize,
}

impl MockCounters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Streams opened and not yet released
    pub fn open_streams(&self) -> usize {
        self.opens().saturating_sub(self.releases())
    }
}

pub struct MockTransport {
    responses: Mutex<HashMap<String, MockResponse>>,
    fallback: MockResponse,
    counters: Arc<MockCounters>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            fallback: MockResponse::ok(b"ok"),
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn with_response(self, url: &str, response: MockResponse) -> Self {
        self.set_response(url, response);
        self
    }

    pub fn set_response(&self, url: &str, response: MockResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.to_string(), response);
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    fn response_for(&self, url: &str) -> MockResponse {
        self.responses
            .lock()
            .ok()
            .and_then(|r| r.get(url).cloned())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn open(&self, request: Request) -> BoxFuture<'_, Result<Box<dyn ResponseStream>>> {
        let script = self.response_for(&request.url);
        let counters = Arc::clone(&self.counters);
        Box::pin(async move {
            if !script.open_delay.is_zero() {
                tokio::time::sleep(script.open_delay).await;
            }
            if let Some(message) = &script.fail_open {
                return Err(HostError::TransportFailure(message.clone()));
            }
            counters.opens.fetch_add(1, Ordering::SeqCst);
            let stream: Box<dyn ResponseStream> = Box::new(MockStream {
                head: ResponseHead {
                    status: script.status,
                    headers: vec![("content-type".to_string(), "application/octet-stream".to_string())],
                },
                chunks: script.chunks.iter().cloned().collect(),
                served: 0,
                script,
                counters,
                released: false,
            });
            Ok(stream)
        })
    }
}

struct MockStream {
    head: ResponseHead,
    chunks: VecDeque<Vec<u8>>,
    served: usize,
    script: MockResponse,
    counters: Arc<MockCounters>,
    released: bool,
}

impl ResponseStream for MockStream {
    fn head(&self) -> &ResponseHead {
        &self.head
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            if self.script.stall_after == Some(self.served) {
                futures::future::pending::<()>().await;
            }
            if self.script.fail_after == Some(self.served) {
                return Err(HostError::TransportFailure("connection reset".to_string()));
            }
            if !self.script.chunk_delay.is_zero() {
                tokio::time::sleep(self.script.chunk_delay).await;
            }
            let chunk = self.chunks.pop_front();
            if chunk.is_some() {
                self.served += 1;
                self.counters.chunks_served.fetch_add(1, Ordering::SeqCst);
            }
            Ok(chunk)
        })
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        if !self.released {
            self.counters.leaked.fetch_add(1, Ordering::SeqCst);
        }
    }
}
