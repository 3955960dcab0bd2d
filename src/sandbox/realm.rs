/// Script realm seam and an in-memory object graph realm
///
/// `ScriptRealm` is the part of an embedded interpreter the sandbox needs:
/// the global-binding mutation API plus enough reflection to walk a property
/// chain. `ObjectGraph` implements it over an arena of objects with
/// prototypes, which is enough to model the escape pivots that matter
/// (`constructor` links through shared prototypes).
use crate::sandbox::policy::{Intrinsic, PivotPath, PivotStart, PROTO_STEP};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Arena index of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

/// A property value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Undefined,
    Object(ObjectId),
    /// A native function with no modelled properties (e.g. `eval`)
    Intrinsic(Intrinsic),
}

/// What the sandbox needs from an interpreter realm
pub trait ScriptRealm: Send {
    fn has_global(&self, name: &str) -> bool;

    fn global_names(&self) -> Vec<String>;

    /// Delete a global binding. Returns false if it was not bound.
    fn remove_global(&mut self, name: &str) -> bool;

    /// Value a global binding holds
    fn global(&self, name: &str) -> Value;

    /// Evaluate a pivot expression without running script code
    fn evaluate_path(&self, path: &PivotPath) -> Value;

    /// Shadow the last edge of `path` with `undefined` on the object that
    /// currently supplies it. Returns false if there was nothing to sever.
    fn sever(&mut self, path: &PivotPath) -> bool;

    /// Which intrinsic a value is, if any
    fn intrinsic_of(&self, value: Value) -> Option<Intrinsic>;

    /// `typeof` of a value
    fn type_of(&self, value: Value) -> &'static str;

    /// Digest over the shared built-in surface reachable from the realm
    fn fingerprint(&self) -> String;
}

#[derive(Debug, Clone)]
struct Object {
    label: String,
    intrinsic: Option<Intrinsic>,
    callable: bool,
    proto: Option<ObjectId>,
    properties: BTreeMap<String, Value>,
}

/// Prototype objects of the literal kinds a pivot can start from
#[derive(Debug, Clone, Copy)]
struct LiteralProtos {
    object: ObjectId,
    array: ObjectId,
    string: ObjectId,
    function: ObjectId,
    async_function: ObjectId,
    generator_function: ObjectId,
    async_generator_function: ObjectId,
}

/// Lookup cursor: a fresh literal instance has no own properties, only a
/// prototype, so it is tracked by that prototype alone.
#[derive(Clone, Copy, Debug)]
enum Cursor {
    Instance { proto: ObjectId },
    Value(Value),
}

#[derive(Debug, Clone)]
pub struct ObjectGraph {
    objects: Vec<Object>,
    global: ObjectId,
    literals: LiteralProtos,
}

/// Maximum prototype chain length walked during lookup
const MAX_CHAIN: usize = 64;

impl ObjectGraph {
    /// A realm with the standard built-in surface
    pub fn standard() -> Self {
        let mut g = ObjectGraph {
            objects: Vec::new(),
            global: ObjectId(0),
            literals: LiteralProtos {
                object: ObjectId(0),
                array: ObjectId(0),
                string: ObjectId(0),
                function: ObjectId(0),
                async_function: ObjectId(0),
                generator_function: ObjectId(0),
                async_generator_function: ObjectId(0),
            },
        };

        let object_proto = g.alloc("Object.prototype", None, false, None);
        let function_proto = g.alloc("Function.prototype", None, true, Some(object_proto));

        let object_ctor = g.constructor("Object", None, function_proto, object_proto);
        let function_ctor = g.constructor(
            "Function",
            Some(Intrinsic::FunctionConstructor),
            function_proto,
            function_proto,
        );

        // AsyncFunction and friends are not globals; only reachable by pivot
        let async_proto = g.alloc("AsyncFunction.prototype", None, false, Some(function_proto));
        g.constructor(
            "AsyncFunction",
            Some(Intrinsic::AsyncFunctionConstructor),
            function_ctor,
            async_proto,
        );
        let generator_proto =
            g.alloc("GeneratorFunction.prototype", None, false, Some(function_proto));
        g.constructor(
            "GeneratorFunction",
            Some(Intrinsic::GeneratorFunctionConstructor),
            function_ctor,
            generator_proto,
        );
        let async_generator_proto =
            g.alloc("AsyncGeneratorFunction.prototype", None, false, Some(function_proto));
        g.constructor(
            "AsyncGeneratorFunction",
            Some(Intrinsic::AsyncGeneratorFunctionConstructor),
            function_ctor,
            async_generator_proto,
        );

        let array_proto = g.alloc("Array.prototype", None, false, Some(object_proto));
        let array_ctor = g.constructor("Array", None, function_proto, array_proto);
        let string_proto = g.alloc("String.prototype", None, false, Some(object_proto));
        let string_ctor = g.constructor("String", None, function_proto, string_proto);
        let number_proto = g.alloc("Number.prototype", None, false, Some(object_proto));
        let number_ctor = g.constructor("Number", None, function_proto, number_proto);
        let promise_proto = g.alloc("Promise.prototype", None, false, Some(object_proto));
        let promise_ctor = g.constructor("Promise", None, function_proto, promise_proto);
        let proxy_ctor = g.alloc("Proxy", Some(Intrinsic::Proxy), true, Some(function_proto));

        let json = g.alloc("JSON", None, false, Some(object_proto));
        let math = g.alloc("Math", None, false, Some(object_proto));
        let reflect = g.alloc("Reflect", Some(Intrinsic::Reflect), false, Some(object_proto));
        let wasm = g.alloc(
            "WebAssembly",
            Some(Intrinsic::WebAssembly),
            false,
            Some(object_proto),
        );

        let global = g.alloc(
            "globalThis",
            Some(Intrinsic::GlobalObject),
            false,
            Some(object_proto),
        );
        g.global = global;

        for (name, value) in [
            ("Object", Value::Object(object_ctor)),
            ("Function", Value::Object(function_ctor)),
            ("Array", Value::Object(array_ctor)),
            ("String", Value::Object(string_ctor)),
            ("Number", Value::Object(number_ctor)),
            ("Promise", Value::Object(promise_ctor)),
            ("Proxy", Value::Object(proxy_ctor)),
            ("JSON", Value::Object(json)),
            ("Math", Value::Object(math)),
            ("Reflect", Value::Object(reflect)),
            ("WebAssembly", Value::Object(wasm)),
            ("eval", Value::Intrinsic(Intrinsic::Eval)),
            ("globalThis", Value::Object(global)),
            ("global", Value::Object(global)),
        ] {
            g.set_property(global, name, value);
        }

        g.literals = LiteralProtos {
            object: object_proto,
            array: array_proto,
            string: string_proto,
            function: function_proto,
            async_function: async_proto,
            generator_function: generator_proto,
            async_generator_function: async_generator_proto,
        };
        g
    }

    fn alloc(
        &mut self,
        label: &str,
        intrinsic: Option<Intrinsic>,
        callable: bool,
        proto: Option<ObjectId>,
    ) -> ObjectId {
        let id = ObjectId(self.objects.len());
        self.objects.push(Object {
            label: label.to_string(),
            intrinsic,
            callable,
            proto,
            properties: BTreeMap::new(),
        });
        id
    }

    /// A callable constructor with `prototype`/`constructor` links to `prototype`
    fn constructor(
        &mut self,
        label: &str,
        intrinsic: Option<Intrinsic>,
        proto: ObjectId,
        prototype: ObjectId,
    ) -> ObjectId {
        let ctor = self.alloc(label, intrinsic, true, Some(proto));
        self.set_property(ctor, "prototype", Value::Object(prototype));
        self.set_property(prototype, "constructor", Value::Object(ctor));
        ctor
    }

    pub fn global_object(&self) -> ObjectId {
        self.global
    }

    /// Prototype a fresh literal of this kind would get
    pub fn literal_prototype(&self, start: &PivotStart) -> Option<ObjectId> {
        let l = &self.literals;
        Some(match start {
            PivotStart::ObjectLiteral => l.object,
            PivotStart::ArrayLiteral => l.array,
            PivotStart::StringLiteral => l.string,
            PivotStart::Function => l.function,
            PivotStart::AsyncFunction => l.async_function,
            PivotStart::GeneratorFunction => l.generator_function,
            PivotStart::AsyncGeneratorFunction => l.async_generator_function,
            PivotStart::Global(_) => return None,
        })
    }

    /// Own-property write, as a tenant script assigning to a built-in would do
    pub fn set_property(&mut self, holder: ObjectId, name: &str, value: Value) {
        if let Some(obj) = self.objects.get_mut(holder.0) {
            obj.properties.insert(name.to_string(), value);
        }
    }

    /// Bind a global, as a tenant script assigning to `globalThis.x` would do
    pub fn define_global(&mut self, name: &str, value: Value) {
        let global = self.global;
        self.set_property(global, name, value);
    }

    /// Look `name` up along the prototype chain starting at `start`.
    ///
    /// Returns the object that supplies the property and its value.
    pub fn lookup(&self, start: ObjectId, name: &str) -> Option<(ObjectId, Value)> {
        let mut current = Some(start);
        for _ in 0..MAX_CHAIN {
            let id = current?;
            let obj = self.objects.get(id.0)?;
            if let Some(value) = obj.properties.get(name) {
                return Some((id, *value));
            }
            current = obj.proto;
        }
        None
    }

    fn proto_of_value(&self, value: Value) -> Option<ObjectId> {
        match value {
            Value::Undefined => None,
            Value::Object(id) => self.objects.get(id.0).and_then(|o| o.proto),
            Value::Intrinsic(_) => Some(self.literals.function),
        }
    }

    fn lookup_root(&self, cursor: Cursor) -> Option<ObjectId> {
        match cursor {
            Cursor::Instance { proto } => Some(proto),
            Cursor::Value(Value::Object(id)) => Some(id),
            Cursor::Value(Value::Intrinsic(_)) => Some(self.literals.function),
            Cursor::Value(Value::Undefined) => None,
        }
    }

    fn start_cursor(&self, start: &PivotStart) -> Cursor {
        match start {
            PivotStart::Global(name) => Cursor::Value(self.global(name)),
            literal => match self.literal_prototype(literal) {
                Some(proto) => Cursor::Instance { proto },
                None => Cursor::Value(Value::Undefined),
            },
        }
    }

    /// Resolve one step. Also reports which object supplied a named property.
    fn step(&self, cursor: Cursor, prop: &str) -> (Option<ObjectId>, Value) {
        if prop == PROTO_STEP {
            let proto = match cursor {
                Cursor::Instance { proto } => Some(proto),
                Cursor::Value(value) => self.proto_of_value(value),
            };
            return (None, proto.map(Value::Object).unwrap_or(Value::Undefined));
        }
        match self.lookup_root(cursor).and_then(|root| self.lookup(root, prop)) {
            Some((holder, value)) => (Some(holder), value),
            None => (None, Value::Undefined),
        }
    }

    /// Walk all but the last step, returning the cursor the last step runs on
    fn walk_prefix<'p>(&self, path: &'p PivotPath) -> Option<(Cursor, &'p str)> {
        let (last, prefix) = path.properties.split_last()?;
        let mut cursor = self.start_cursor(&path.start);
        for prop in prefix {
            let (_, value) = self.step(cursor, prop);
            if value == Value::Undefined {
                return None;
            }
            cursor = Cursor::Value(value);
        }
        Some((cursor, last.as_str()))
    }

    fn describe(&self, value: Value, index: &HashMap<ObjectId, usize>) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Intrinsic(i) => format!("intrinsic:{}", i),
            Value::Object(id) => match index.get(&id) {
                Some(n) => format!("#{}", n),
                None => "#?".to_string(),
            },
        }
    }
}

impl ScriptRealm for ObjectGraph {
    fn has_global(&self, name: &str) -> bool {
        self.objects[self.global.0].properties.contains_key(name)
    }

    fn global_names(&self) -> Vec<String> {
        self.objects[self.global.0].properties.keys().cloned().collect()
    }

    fn remove_global(&mut self, name: &str) -> bool {
        self.objects[self.global.0].properties.remove(name).is_some()
    }

    fn global(&self, name: &str) -> Value {
        self.objects[self.global.0]
            .properties
            .get(name)
            .copied()
            .unwrap_or(Value::Undefined)
    }

    fn evaluate_path(&self, path: &PivotPath) -> Value {
        match self.walk_prefix(path) {
            Some((cursor, last)) => self.step(cursor, last).1,
            None => Value::Undefined,
        }
    }

    fn sever(&mut self, path: &PivotPath) -> bool {
        let Some((cursor, last)) = self.walk_prefix(path) else {
            return false;
        };

        if last == PROTO_STEP {
            // Cut the prototype link itself
            return match cursor {
                Cursor::Value(Value::Object(id)) => match self.objects.get_mut(id.0) {
                    Some(obj) if obj.proto.is_some() => {
                        obj.proto = None;
                        true
                    }
                    _ => false,
                },
                _ => false,
            };
        }

        let last = last.to_string();
        match self.step(cursor, &last) {
            (Some(holder), value) if value != Value::Undefined => {
                self.set_property(holder, &last, Value::Undefined);
                true
            }
            _ => false,
        }
    }

    fn intrinsic_of(&self, value: Value) -> Option<Intrinsic> {
        match value {
            Value::Undefined => None,
            Value::Intrinsic(i) => Some(i),
            Value::Object(id) => self.objects.get(id.0).and_then(|o| o.intrinsic),
        }
    }

    fn type_of(&self, value: Value) -> &'static str {
        match value {
            Value::Undefined => "undefined",
            Value::Intrinsic(_) => "function",
            Value::Object(id) => match self.objects.get(id.0) {
                Some(obj) if obj.callable => "function",
                Some(_) => "object",
                None => "undefined",
            },
        }
    }

    fn fingerprint(&self) -> String {
        // Breadth-first from the global object and every literal prototype,
        // numbering objects in visit order so the digest is layout independent.
        let l = &self.literals;
        let roots = [
            self.global,
            l.object,
            l.array,
            l.string,
            l.function,
            l.async_function,
            l.generator_function,
            l.async_generator_function,
        ];

        let mut order = Vec::new();
        let mut index = HashMap::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjectId> = roots.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            index.insert(id, order.len());
            order.push(id);
            let Some(obj) = self.objects.get(id.0) else {
                continue;
            };
            if let Some(proto) = obj.proto {
                queue.push_back(proto);
            }
            for value in obj.properties.values() {
                if let Value::Object(next) = value {
                    queue.push_back(*next);
                }
            }
        }

        let mut hasher = Sha256::new();
        for id in &order {
            let obj = &self.objects[id.0];
            hasher.update(format!(
                "obj:{}|{}|{:?}|{}|",
                index[id], obj.label, obj.intrinsic, obj.callable
            ));
            hasher.update(match obj.proto {
                Some(p) => format!("proto:{};", self.describe(Value::Object(p), &index)),
                None => "proto:null;".to_string(),
            });
            for (name, value) in &obj.properties {
                hasher.update(format!("{}={};", name, self.describe(*value, &index)));
            }
        }
        format!("{:x}", hasher.finalize())
    }
}
