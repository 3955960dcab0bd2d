//! Integration tests for the cancellation bridge
//!
//! Aborting before, during and after transport work, racing explicit aborts
//! against timeouts, and confirming that every opened stream is released.

use hostpool::bridge::{
    CancellationBridge, CompletionEvent, ContextEvent, EventQueue, OperationState, Request,
};
use hostpool::config::config::BridgeConfig;
use hostpool::testing::race_proof::{prove_abort_timeout, RaceProofConfig};
use hostpool::testing::{MockResponse, MockTransport};
use hostpool::{AbortReason, ContextId, HostError};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn bridge(transport: MockTransport) -> CancellationBridge {
    CancellationBridge::new(BridgeConfig::default(), Arc::new(transport)).unwrap()
}

fn completions(queue: &EventQueue) -> Vec<CompletionEvent> {
    let mut found = Vec::new();
    while let Some(event) = queue.next_timeout(Duration::from_millis(100)) {
        if let ContextEvent::Completion(done) = event {
            found.push(done);
        }
    }
    found
}

#[test]
fn test_abort_before_start_never_opens_transport() {
    let transport = MockTransport::new();
    let counters = transport.counters();
    let bridge = bridge(transport);
    let queue = EventQueue::new();

    let handle = bridge.prepare(ContextId::new(), queue.sender(), Request::get("mock://never"));
    assert_eq!(handle.state(), OperationState::Pending);
    assert!(handle.abort(AbortReason::Explicit));
    bridge.launch(&handle, None);

    assert!(handle.wait_settled(WAIT));
    let done = completions(&queue);
    assert_eq!(done.len(), 1);
    assert_eq!(
        done[0].outcome.clone().into_result().unwrap_err(),
        HostError::Aborted(AbortReason::Explicit)
    );
    assert_eq!(counters.opens(), 0);
}

#[test]
fn test_abort_mid_transfer_releases_connection() {
    let transport = MockTransport::new().with_response("mock://stall", MockResponse::stalling(2));
    let counters = transport.counters();
    let bridge = bridge(transport);
    let queue = EventQueue::new();

    let handle = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://stall"));
    // Wait for the body to start flowing
    for _ in 0..500 {
        if counters.chunks_served.load(std::sync::atomic::Ordering::SeqCst) >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(handle.state(), OperationState::InFlight);

    assert!(handle.abort(AbortReason::Explicit));
    assert!(handle.wait_settled(WAIT));

    let done = completions(&queue);
    assert_eq!(done.len(), 1);
    assert!(matches!(
        done[0].outcome.clone().into_result(),
        Err(HostError::Aborted(AbortReason::Explicit))
    ));
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.releases(), 1);
    assert_eq!(counters.leaked(), 0);
}

#[test]
fn test_abort_after_completion_is_noop() {
    let transport = MockTransport::new().with_response("mock://ok", MockResponse::ok(b"done"));
    let counters = transport.counters();
    let bridge = bridge(transport);
    let queue = EventQueue::new();

    let handle = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://ok"));
    let first = match queue.next_timeout(WAIT) {
        Some(ContextEvent::Completion(done)) => done,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(handle.wait_settled(WAIT));

    assert!(!handle.abort(AbortReason::Explicit));
    assert_eq!(handle.state(), OperationState::Completed);
    assert!(!handle.signal().is_aborted());
    assert_eq!(first.outcome.into_result().unwrap().body, b"done");
    assert!(completions(&queue).is_empty());
    assert_eq!(counters.open_streams(), 0);
}

#[test]
fn test_explicit_and_timeout_settle_once() {
    let transport = MockTransport::new().with_response("mock://stall", MockResponse::stalling(0));
    let counters = transport.counters();
    let bridge = bridge(transport);
    let queue = EventQueue::new();

    let handle = bridge.begin_with_timeout(
        ContextId::new(),
        queue.sender(),
        Request::get("mock://stall"),
        Duration::from_millis(20),
    );
    // Only the timeout can settle a stalled stream
    assert!(handle.wait_settled(WAIT));
    assert!(!handle.abort(AbortReason::Explicit));

    let done = completions(&queue);
    assert_eq!(done.len(), 1);
    assert_eq!(
        done[0].outcome.clone().into_result().unwrap_err(),
        HostError::Aborted(AbortReason::Timeout)
    );
    assert_eq!(handle.signal().reason(), Some(AbortReason::Timeout));
    assert_eq!(counters.open_streams(), 0);
}

#[test]
fn test_abort_timeout_race_proof() {
    let transport = MockTransport::new().with_response("mock://stall", MockResponse::stalling(1));
    let counters = transport.counters();
    let bridge = bridge(transport);

    let config = RaceProofConfig {
        iterations: 100,
        ..Default::default()
    };
    let result = prove_abort_timeout(&bridge, &counters, "mock://stall", &config);
    assert!(result.is_pass(), "violations: {:?}", result.violations);
    assert_eq!(counters.leaked(), 0);
}

#[test]
fn test_abort_listeners_posted_once_each() {
    let transport = MockTransport::new().with_response("mock://stall", MockResponse::stalling(0));
    let bridge = bridge(transport);
    let queue = EventQueue::new();

    let handle = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://stall"));
    assert!(handle.signal().on_abort(10));
    assert!(handle.signal().on_abort(11));
    assert!(handle.abort(AbortReason::Explicit));
    assert!(!handle.abort(AbortReason::Explicit));
    assert!(handle.wait_settled(WAIT));

    let mut listeners = Vec::new();
    let mut completed = 0;
    while let Some(event) = queue.next_timeout(Duration::from_millis(100)) {
        match event {
            ContextEvent::Aborted { listener, .. } => listeners.push(listener),
            ContextEvent::Completion(_) => completed += 1,
        }
    }
    listeners.sort_unstable();
    assert_eq!(listeners, vec![10, 11]);
    assert_eq!(completed, 1);
}

#[test]
fn test_transport_failure_is_not_an_abort() {
    let transport = MockTransport::new()
        .with_response("mock://refused", MockResponse::failing_open("connection refused"))
        .with_response("mock://reset", MockResponse::chunked(vec![b"a".to_vec(); 3]).with_fail_after(1));
    let counters = transport.counters();
    let bridge = bridge(transport);
    let queue = EventQueue::new();

    let refused = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://refused"));
    let reset = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://reset"));
    assert!(refused.wait_settled(WAIT));
    assert!(reset.wait_settled(WAIT));

    assert_eq!(refused.state(), OperationState::Failed);
    assert_eq!(reset.state(), OperationState::Failed);
    let done = completions(&queue);
    assert_eq!(done.len(), 2);
    for done in done {
        assert!(matches!(
            done.outcome.into_result(),
            Err(HostError::TransportFailure(_))
        ));
    }
    assert_eq!(counters.open_streams(), 0);
}

#[test]
fn test_oversized_body_fails_and_releases() {
    let transport = MockTransport::new()
        .with_response("mock://big", MockResponse::chunked(vec![vec![0u8; 1024]; 8]));
    let counters = transport.counters();
    let bridge = CancellationBridge::new(
        BridgeConfig {
            max_response_bytes: 4096,
            ..Default::default()
        },
        Arc::new(transport),
    )
    .unwrap();
    let queue = EventQueue::new();

    let handle = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://big"));
    assert!(handle.wait_settled(WAIT));
    assert_eq!(handle.state(), OperationState::Failed);
    assert_eq!(counters.open_streams(), 0);
}

#[test]
fn test_bridge_can_be_dropped_inside_async_context() {
    let transport = MockTransport::new().with_response("mock://stall", MockResponse::stalling(0));
    let counters = transport.counters();
    let bridge = bridge(transport);
    let queue = EventQueue::new();
    let handle = bridge.begin(ContextId::new(), queue.sender(), Request::get("mock://stall"));

    let host = tokio::runtime::Builder::new_current_thread().build().unwrap();
    host.block_on(async move {
        drop(bridge);
    });

    // Dropped tasks release their transport on the way out
    assert!(handle.wait_settled(WAIT));
    for _ in 0..500 {
        if counters.open_streams() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(counters.open_streams(), 0);
    assert_eq!(counters.leaked(), 0);
}
