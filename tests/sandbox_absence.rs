//! Integration tests for capability reduction
//!
//! Forbidden globals and every pivot chain that leads back to them must read
//! as `undefined`, on a fresh context and on the same context after it has
//! been lent out and reset.

use hostpool::config::config::HostConfig;
use hostpool::sandbox::{typeof_global, typeof_path, ObjectGraph, PivotPath, PivotStart, SandboxPolicy};
use hostpool::testing::MockTransport;
use hostpool::{ContextPool, ExecutionContext, HostError};
use std::sync::Arc;

fn single_context_pool() -> ContextPool {
    let mut config = HostConfig::default();
    config.pool.min_idle = 1;
    config.pool.max_contexts = 1;
    ContextPool::from_config(&config, Arc::new(MockTransport::new())).unwrap()
}

fn assert_reduced(ctx: &ExecutionContext) {
    let policy = ctx.policy().clone();
    for name in &policy.forbidden_globals {
        assert_eq!(ctx.typeof_global(name), "undefined", "typeof {}", name);
    }
    for pivot in &policy.pivots {
        assert_eq!(typeof_path(ctx.realm(), pivot), "undefined", "typeof {}", pivot);
    }
}

#[test]
fn test_unreduced_realm_exposes_escape_hatches() {
    // Sanity check on the realm model itself
    let realm = ObjectGraph::standard();
    assert_eq!(typeof_global(&realm, "eval"), "function");
    assert_eq!(typeof_global(&realm, "Function"), "function");
    let pivot = PivotPath::new(PivotStart::ObjectLiteral, &["constructor", "constructor"]);
    assert_eq!(typeof_path(&realm, &pivot), "function");
}

#[test]
fn test_forbidden_globals_absent_on_fresh_context() {
    let pool = single_context_pool();
    let lease = pool.acquire().unwrap();
    assert_reduced(&lease);
}

#[test]
fn test_absence_survives_lend_reset_cycles() {
    let pool = single_context_pool();

    let first = pool.acquire().unwrap();
    let id = first.id();
    let generation = first.generation();
    assert_reduced(&first);
    first.release();

    for cycle in 1..=3u64 {
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.id(), id, "cycle {}", cycle);
        assert_eq!(lease.generation(), generation + cycle);
        assert_reduced(&lease);
    }
}

#[test]
fn test_ordinary_globals_stay_usable() {
    let pool = single_context_pool();
    let lease = pool.acquire().unwrap();
    assert_eq!(lease.typeof_global("Object"), "function");
    assert_eq!(lease.typeof_global("Array"), "function");
    assert_eq!(lease.typeof_global("Promise"), "function");
}

#[test]
fn test_tampered_context_is_replaced_not_repaired() {
    let pool = single_context_pool();

    let mut lease = pool.acquire().unwrap();
    let tampered = lease.id();
    assert!(lease.realm_mut().remove_global("Object"));
    lease.release();

    let stats = pool.stats();
    assert_eq!(stats.discarded, 1);

    let lease = pool.acquire().unwrap();
    assert_ne!(lease.id(), tampered);
    assert_reduced(&lease);
    assert_eq!(lease.typeof_global("Object"), "function");
}

#[test]
fn test_permissive_policy_reduces_nothing() {
    let mut config = HostConfig::default();
    config.pool.min_idle = 1;
    config.pool.max_contexts = 1;
    config.sandbox = SandboxPolicy::permissive();
    let pool = ContextPool::from_config(&config, Arc::new(MockTransport::new())).unwrap();

    let lease = pool.acquire().unwrap();
    assert_eq!(lease.typeof_global("eval"), "function");
}

#[test]
fn test_sandbox_violation_is_never_script_visible() {
    let err = HostError::SandboxViolation("drift".to_string());
    assert!(!err.is_script_visible());
    assert_eq!(err.kind(), "sandbox_violation");
}
