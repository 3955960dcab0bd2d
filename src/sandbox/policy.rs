/// Capability reduction policy
///
/// Names what must be absent from a context's global surface: global
/// bindings, the intrinsics they point at, and the prototype pivots that
/// could otherwise lead back to a removed intrinsic.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host intrinsics a policy can forbid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intrinsic {
    /// Global `eval`
    Eval,
    /// `Function`, reachable as `(function(){}).constructor`
    FunctionConstructor,
    AsyncFunctionConstructor,
    GeneratorFunctionConstructor,
    AsyncGeneratorFunctionConstructor,
    Reflect,
    Proxy,
    /// The process-wide global object (`globalThis`)
    GlobalObject,
    WebAssembly,
}

impl Intrinsic {
    pub fn name(&self) -> &'static str {
        match self {
            Intrinsic::Eval => "eval",
            Intrinsic::FunctionConstructor => "Function",
            Intrinsic::AsyncFunctionConstructor => "AsyncFunction",
            Intrinsic::GeneratorFunctionConstructor => "GeneratorFunction",
            Intrinsic::AsyncGeneratorFunctionConstructor => "AsyncGeneratorFunction",
            Intrinsic::Reflect => "Reflect",
            Intrinsic::Proxy => "Proxy",
            Intrinsic::GlobalObject => "globalThis",
            Intrinsic::WebAssembly => "WebAssembly",
        }
    }

    pub fn all() -> &'static [Intrinsic] {
        &[
            Intrinsic::Eval,
            Intrinsic::FunctionConstructor,
            Intrinsic::AsyncFunctionConstructor,
            Intrinsic::GeneratorFunctionConstructor,
            Intrinsic::AsyncGeneratorFunctionConstructor,
            Intrinsic::Reflect,
            Intrinsic::Proxy,
            Intrinsic::GlobalObject,
            Intrinsic::WebAssembly,
        ]
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a pivot expression starts
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PivotStart {
    /// `{}`
    ObjectLiteral,
    /// `[]`
    ArrayLiteral,
    /// `""`
    StringLiteral,
    /// `function(){}`
    Function,
    /// `async function(){}`
    AsyncFunction,
    /// `function*(){}`
    GeneratorFunction,
    /// `async function*(){}`
    AsyncGeneratorFunction,
    /// A named global binding
    Global(String),
}

impl fmt::Display for PivotStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PivotStart::ObjectLiteral => f.write_str("({})"),
            PivotStart::ArrayLiteral => f.write_str("[]"),
            PivotStart::StringLiteral => f.write_str("\"\""),
            PivotStart::Function => f.write_str("(function(){})"),
            PivotStart::AsyncFunction => f.write_str("(async function(){})"),
            PivotStart::GeneratorFunction => f.write_str("(function*(){})"),
            PivotStart::AsyncGeneratorFunction => f.write_str("(async function*(){})"),
            PivotStart::Global(name) => f.write_str(name),
        }
    }
}

/// Property step meaning `Object.getPrototypeOf(..)`
pub const PROTO_STEP: &str = "__proto__";

/// A property chain from a literal or global, e.g. `{}.constructor.constructor`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PivotPath {
    pub start: PivotStart,
    pub properties: Vec<String>,
}

impl PivotPath {
    pub fn new(start: PivotStart, properties: &[&str]) -> Self {
        Self {
            start,
            properties: properties.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl fmt::Display for PivotPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)?;
        for prop in &self.properties {
            write!(f, ".{}", prop)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Global names that must not be bound
    pub forbidden_globals: Vec<String>,
    /// Intrinsics no pivot may reach
    pub forbidden_intrinsics: Vec<Intrinsic>,
    /// Known escape chains to sever and re-check
    pub pivots: Vec<PivotPath>,
}

impl SandboxPolicy {
    pub fn is_forbidden(&self, intrinsic: Intrinsic) -> bool {
        self.forbidden_intrinsics.contains(&intrinsic)
    }

    /// Policy that removes nothing; useful for realms that are already reduced
    pub fn permissive() -> Self {
        Self {
            forbidden_globals: Vec::new(),
            forbidden_intrinsics: Vec::new(),
            pivots: Vec::new(),
        }
    }
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        use PivotStart::*;

        let forbidden_globals = [
            "eval",
            "Function",
            "Reflect",
            "Proxy",
            "globalThis",
            "global",
            "WebAssembly",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let pivots = vec![
            PivotPath::new(ObjectLiteral, &["constructor", "constructor"]),
            PivotPath::new(ArrayLiteral, &["constructor", "constructor"]),
            PivotPath::new(StringLiteral, &["constructor", "constructor"]),
            PivotPath::new(Function, &["constructor"]),
            PivotPath::new(AsyncFunction, &["constructor"]),
            PivotPath::new(GeneratorFunction, &["constructor"]),
            PivotPath::new(AsyncGeneratorFunction, &["constructor"]),
            PivotPath::new(GeneratorFunction, &[PROTO_STEP, "constructor"]),
            PivotPath::new(AsyncGeneratorFunction, &[PROTO_STEP, "constructor"]),
            PivotPath::new(Global("Object".to_string()), &["constructor"]),
            PivotPath::new(Global("Promise".to_string()), &["constructor"]),
        ];

        Self {
            forbidden_globals,
            forbidden_intrinsics: Intrinsic::all().to_vec(),
            pivots,
        }
    }
}
