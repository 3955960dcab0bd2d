/// Capability reduction and re-verification
///
/// `apply` removes forbidden bindings and severs pivots once, at context
/// creation, then seals a fingerprint of the shared surface. `verify` runs
/// after every reset and only reports: a context that drifted is discarded by
/// the pool, never patched.
use crate::config::types::{HostError, Result};
use crate::observability::metrics::get_metrics;
use crate::sandbox::policy::{PivotPath, SandboxPolicy};
use crate::sandbox::realm::{ScriptRealm, Value};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// A pivot needing more severs than this is treated as unsealable
const MAX_SEVER_ROUNDS: usize = 8;

/// State recorded right after the sandbox was applied
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedBaseline {
    /// Digest of the reachable built-in surface
    pub fingerprint: String,
    pub removed_globals: Vec<String>,
    pub severed_edges: usize,
}

fn is_forbidden(realm: &dyn ScriptRealm, policy: &SandboxPolicy, value: Value) -> bool {
    realm
        .intrinsic_of(value)
        .map(|i| policy.is_forbidden(i))
        .unwrap_or(false)
}

/// Reduce `realm` to what `policy` allows and seal the result
pub fn apply(realm: &mut dyn ScriptRealm, policy: &SandboxPolicy) -> Result<SealedBaseline> {
    let mut removed_globals = Vec::new();

    for name in &policy.forbidden_globals {
        if realm.remove_global(name) {
            removed_globals.push(name.clone());
        }
    }

    // Aliases: any other binding that still hands out a forbidden intrinsic
    for name in realm.global_names() {
        if is_forbidden(realm, policy, realm.global(&name)) && realm.remove_global(&name) {
            debug!("Removed alias global {}", name);
            removed_globals.push(name);
        }
    }

    let mut severed_edges = 0;
    for pivot in &policy.pivots {
        let mut rounds = 0;
        while is_forbidden(realm, policy, realm.evaluate_path(pivot)) {
            if rounds == MAX_SEVER_ROUNDS || !realm.sever(pivot) {
                return Err(HostError::SandboxViolation(format!(
                    "pivot {} still reaches a forbidden intrinsic",
                    pivot
                )));
            }
            rounds += 1;
            severed_edges += 1;
        }
    }

    check_absence(realm, policy)?;

    let baseline = SealedBaseline {
        fingerprint: realm.fingerprint(),
        removed_globals,
        severed_edges,
    };
    get_metrics().sandbox_applied.inc();
    debug!(
        "Sandbox sealed: {} globals removed, {} edges severed",
        baseline.removed_globals.len(),
        baseline.severed_edges
    );
    Ok(baseline)
}

fn check_absence(realm: &dyn ScriptRealm, policy: &SandboxPolicy) -> Result<()> {
    for name in &policy.forbidden_globals {
        if realm.has_global(name) {
            return Err(HostError::SandboxViolation(format!(
                "forbidden global {} is bound",
                name
            )));
        }
    }

    for name in realm.global_names() {
        if let Some(intrinsic) = realm.intrinsic_of(realm.global(&name)) {
            if policy.is_forbidden(intrinsic) {
                return Err(HostError::SandboxViolation(format!(
                    "global {} exposes {}",
                    name, intrinsic
                )));
            }
        }
    }

    for pivot in &policy.pivots {
        let value = realm.evaluate_path(pivot);
        if let Some(intrinsic) = realm.intrinsic_of(value) {
            if policy.is_forbidden(intrinsic) {
                return Err(HostError::SandboxViolation(format!(
                    "pivot {} reaches {}",
                    pivot, intrinsic
                )));
            }
        }
    }
    Ok(())
}

/// Re-check a sealed realm. Reports drift, never repairs it.
pub fn verify(
    realm: &dyn ScriptRealm,
    policy: &SandboxPolicy,
    baseline: &SealedBaseline,
) -> Result<()> {
    let result = check_absence(realm, policy).and_then(|()| {
        let current = realm.fingerprint();
        if current != baseline.fingerprint {
            return Err(HostError::SandboxViolation(format!(
                "shared surface fingerprint drifted ({} != {})",
                short_digest(&current),
                short_digest(&baseline.fingerprint)
            )));
        }
        Ok(())
    });

    if let Err(e) = &result {
        get_metrics().sandbox_violations.inc();
        warn!("Sandbox verification failed: {}", e);
    }
    result
}

/// Leading characters of a fingerprint, for messages
fn short_digest(fingerprint: &str) -> &str {
    let end = fingerprint
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(fingerprint.len());
    &fingerprint[..end]
}

/// `typeof name` as script code would observe it
pub fn typeof_global(realm: &dyn ScriptRealm, name: &str) -> &'static str {
    realm.type_of(realm.global(name))
}

/// `typeof <pivot expression>` as script code would observe it
pub fn typeof_path(realm: &dyn ScriptRealm, path: &PivotPath) -> &'static str {
    realm.type_of(realm.evaluate_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::{Intrinsic, PivotStart, PROTO_STEP};
    use crate::sandbox::realm::ObjectGraph;

    fn sealed() -> (ObjectGraph, SandboxPolicy, SealedBaseline) {
        let mut realm = ObjectGraph::standard();
        let policy = SandboxPolicy::default();
        let baseline = apply(&mut realm, &policy).unwrap();
        (realm, policy, baseline)
    }

    #[test]
    fn test_forbidden_names_absent_after_apply() {
        let (realm, policy, baseline) = sealed();
        for name in &policy.forbidden_globals {
            assert_eq!(typeof_global(&realm, name), "undefined", "{name}");
        }
        assert_eq!(typeof_global(&realm, "JSON"), "object");
        assert_eq!(typeof_global(&realm, "Array"), "function");
        assert!(baseline.removed_globals.contains(&"eval".to_string()));
        assert!(baseline.severed_edges > 0);
    }

    #[test]
    fn test_every_pivot_absent_after_apply() {
        let (realm, policy, _) = sealed();
        for pivot in &policy.pivots {
            assert_eq!(typeof_path(&realm, pivot), "undefined", "{pivot}");
        }
    }

    #[test]
    fn test_verify_passes_on_untouched_realm() {
        let (realm, policy, baseline) = sealed();
        verify(&realm, &policy, &baseline).unwrap();
    }

    #[test]
    fn test_verify_detects_restored_global() {
        let (mut realm, policy, baseline) = sealed();
        realm.define_global("eval", Value::Intrinsic(Intrinsic::Eval));
        assert!(matches!(
            verify(&realm, &policy, &baseline),
            Err(HostError::SandboxViolation(_))
        ));
        // Still bound: verify reports, it does not repair
        assert!(realm.has_global("eval"));
    }

    #[test]
    fn test_verify_detects_alias_under_new_name() {
        let (mut realm, policy, baseline) = sealed();
        realm.define_global("e", Value::Intrinsic(Intrinsic::Eval));
        assert!(verify(&realm, &policy, &baseline).is_err());
    }

    #[test]
    fn test_verify_detects_prototype_pollution() {
        let (mut realm, policy, baseline) = sealed();
        let proto = realm.literal_prototype(&PivotStart::ArrayLiteral).unwrap();
        realm.set_property(proto, "injected", Value::Undefined);

        let err = verify(&realm, &policy, &baseline).unwrap_err();
        assert!(err.to_string().contains("fingerprint"));
    }

    #[test]
    fn test_verify_detects_reconnected_pivot() {
        let mut fresh = ObjectGraph::standard();
        let function_ctor = fresh.evaluate_path(&PivotPath::new(PivotStart::Function, &["constructor"]));

        let (mut realm, policy, baseline) = sealed();
        let proto = realm.literal_prototype(&PivotStart::Function).unwrap();
        realm.set_property(proto, "constructor", function_ctor);
        assert!(verify(&realm, &policy, &baseline).is_err());

        // An unsealed realm fails the absence check outright
        let empty = SealedBaseline {
            fingerprint: fresh.fingerprint(),
            removed_globals: vec![],
            severed_edges: 0,
        };
        assert!(verify(&fresh, &policy, &empty).is_err());
        assert!(apply(&mut fresh, &policy).is_ok());
    }

    #[test]
    fn test_permissive_policy_keeps_everything() {
        let mut realm = ObjectGraph::standard();
        let baseline = apply(&mut realm, &SandboxPolicy::permissive()).unwrap();
        assert!(baseline.removed_globals.is_empty());
        assert_eq!(typeof_global(&realm, "eval"), "function");
        let pivot = PivotPath::new(PivotStart::GeneratorFunction, &[PROTO_STEP, "constructor"]);
        assert_eq!(typeof_path(&realm, &pivot), "function");
    }

    /// Realm whose digest is a short tag chosen by the test
    struct TaggedRealm {
        inner: ObjectGraph,
        tag: String,
    }

    impl ScriptRealm for TaggedRealm {
        fn has_global(&self, name: &str) -> bool {
            self.inner.has_global(name)
        }
        fn global_names(&self) -> Vec<String> {
            self.inner.global_names()
        }
        fn remove_global(&mut self, name: &str) -> bool {
            self.inner.remove_global(name)
        }
        fn global(&self, name: &str) -> Value {
            self.inner.global(name)
        }
        fn evaluate_path(&self, path: &PivotPath) -> Value {
            self.inner.evaluate_path(path)
        }
        fn sever(&mut self, path: &PivotPath) -> bool {
            self.inner.sever(path)
        }
        fn intrinsic_of(&self, value: Value) -> Option<Intrinsic> {
            self.inner.intrinsic_of(value)
        }
        fn type_of(&self, value: Value) -> &'static str {
            self.inner.type_of(value)
        }
        fn fingerprint(&self) -> String {
            self.tag.clone()
        }
    }

    #[test]
    fn test_short_fingerprint_drift_is_reported() {
        let policy = SandboxPolicy::default();
        let mut realm = TaggedRealm {
            inner: ObjectGraph::standard(),
            tag: "a".to_string(),
        };
        let baseline = apply(&mut realm, &policy).unwrap();
        assert_eq!(baseline.fingerprint, "a");

        realm.tag = "b".to_string();
        let err = verify(&realm, &policy, &baseline).unwrap_err();
        assert_eq!(
            err,
            HostError::SandboxViolation("shared surface fingerprint drifted (b != a)".to_string())
        );
    }

    #[test]
    fn test_short_digest_truncates_on_char_boundary() {
        assert_eq!(short_digest(""), "");
        assert_eq!(short_digest("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("ééééééééééééé"), "éééééééééééé");
    }
}
