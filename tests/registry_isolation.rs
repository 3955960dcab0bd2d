//! Integration tests for blob registry isolation across contexts and resets

use hostpool::config::config::{AllocatorConfig, HostConfig, PoolConfig};
use hostpool::memory::AllocationHint;
use hostpool::registry::{BlobPayload, BlobRegistry, BlobToken};
use hostpool::testing::MockTransport;
use hostpool::{ContextId, ContextPool, HostError};
use std::sync::Arc;

fn pool(max_contexts: usize) -> ContextPool {
    let config = HostConfig {
        allocator: AllocatorConfig {
            inline_threshold_bytes: 1024,
            max_allocation_bytes: 4 << 20,
            process_budget_bytes: 64 << 20,
        },
        pool: PoolConfig {
            min_idle: max_contexts,
            max_contexts,
            acquire_timeout_ms: 500,
            max_reuse: 0,
            max_errors: 0,
        },
        ..Default::default()
    };
    ContextPool::from_config(&config, Arc::new(MockTransport::new())).unwrap()
}

#[test]
fn test_token_dies_with_its_generation_on_same_context() {
    let pool = pool(1);
    let (id, generation, token) = {
        let mut lease = pool.acquire().unwrap();
        let token = lease.create_blob(b"first lending", "text/plain").unwrap();
        assert_eq!(lease.resolve_blob(&token).unwrap().size(), 13);
        (lease.id(), lease.generation(), token)
    };

    let mut lease = pool.acquire().unwrap();
    assert_eq!(lease.id(), id, "single-context pool must hand back the same context");
    assert!(lease.generation() > generation);
    assert_eq!(lease.resolve_blob(&token).unwrap_err(), HostError::NotFound);

    // The fresh generation can mint its own handles
    let fresh = lease.create_blob(b"second lending", "text/plain").unwrap();
    assert_ne!(fresh, token);
    assert!(lease.resolve_blob(&fresh).is_ok());
}

#[test]
fn test_unrevoked_entries_gone_after_reset() {
    let pool = pool(1);
    let tokens: Vec<BlobToken> = {
        let mut lease = pool.acquire().unwrap();
        let buf = lease.allocate_buffer(4096, AllocationHint::Auto).unwrap();
        let mut tokens: Vec<_> = (0..50)
            .map(|i| lease.create_blob(format!("entry {}", i).as_bytes(), "text/plain").unwrap())
            .collect();
        tokens.push(lease.create_blob_from_buffer(&buf, "application/octet-stream").unwrap());
        tokens.push(lease.create_file(b"name,age\n", "text/csv", "people.csv", Some(0)).unwrap());
        assert_eq!(lease.registry().len(), 52);
        tokens
    };

    let lease = pool.acquire().unwrap();
    assert!(lease.registry().is_empty());
    for token in &tokens {
        assert_eq!(lease.resolve_blob(token).unwrap_err(), HostError::NotFound);
    }
    assert_eq!(pool.factory().allocator().outstanding_bytes(), 0);
}

#[test]
fn test_foreign_context_tokens_are_not_found() {
    let pool = pool(2);
    let mut a = pool.acquire().unwrap();
    let mut b = pool.acquire().unwrap();
    assert_ne!(a.id(), b.id());

    let token = a.create_blob(b"private", "text/plain").unwrap();
    assert_eq!(b.resolve_blob(&token).unwrap_err(), HostError::NotFound);

    // Revoking someone else's token is a silent no-op
    b.revoke_blob(&token);
    assert!(a.resolve_blob(&token).is_ok());
}

#[test]
fn test_every_miss_looks_the_same() {
    let mut registry = BlobRegistry::new(ContextId::new());
    let live = registry.create(BlobPayload::Bytes(Arc::from(&b"x"[..])), "text/plain");
    let revoked = registry.create(BlobPayload::Bytes(Arc::from(&b"y"[..])), "text/plain");
    registry.revoke(&revoked);

    let forged = BlobToken::from_string(live.as_str().replace(
        live.parse().unwrap().nonce.simple().to_string().as_str(),
        "00000000000000000000000000000000",
    ));
    let misses = [
        revoked,
        forged,
        BlobToken::from_string("blob:garbage"),
        BlobToken::from_string(""),
    ];
    for token in &misses {
        assert_eq!(registry.resolve(token).unwrap_err(), HostError::NotFound);
    }
    assert!(registry.resolve(&live).is_ok());
}

#[test]
fn test_slice_survives_revoking_parent() {
    let mut registry = BlobRegistry::new(ContextId::new());
    let parent = registry.create(BlobPayload::Bytes(Arc::from(&b"hello world"[..])), "Text/Plain");
    let child = registry.slice(&parent, 6, 100, None).unwrap();
    registry.revoke(&parent);

    let view = registry.resolve(&child).unwrap();
    assert_eq!(view.payload.to_vec().unwrap(), b"world");
    assert_eq!(view.mime_type, "text/plain");
}

#[test]
fn test_blob_bytes_count_against_budget() {
    let config = HostConfig {
        allocator: AllocatorConfig {
            inline_threshold_bytes: 1024,
            max_allocation_bytes: 64 << 10,
            process_budget_bytes: 64 << 10,
        },
        pool: PoolConfig {
            min_idle: 1,
            max_contexts: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let pool = ContextPool::from_config(&config, Arc::new(MockTransport::new())).unwrap();
    let payload = vec![7u8; 40 << 10];

    {
        let mut lease = pool.acquire().unwrap();
        let token = lease.create_blob(&payload, "application/octet-stream").unwrap();
        assert_eq!(pool.factory().allocator().outstanding_bytes(), 40 << 10);

        let err = lease.create_blob(&payload, "application/octet-stream").unwrap_err();
        assert!(matches!(err, HostError::ResourceExhausted { .. }));
        let err = lease.create_file(&payload, "text/plain", "big.txt", None).unwrap_err();
        assert!(matches!(err, HostError::ResourceExhausted { .. }));

        assert_eq!(lease.resolve_blob(&token).unwrap().payload.to_vec().unwrap(), payload);
    }

    // Reset returns the blob's bytes to the budget
    assert_eq!(pool.factory().allocator().outstanding_bytes(), 0);
    let mut lease = pool.acquire().unwrap();
    assert!(lease.create_blob(&payload, "application/octet-stream").is_ok());
}
