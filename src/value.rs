//! Tagged value representation shared by the interpreter, GC, and JIT helpers.
//!
//! `Value` is a small fixed-tag discriminated union. Primitives and strings
//! compare by content; every heap-backed variant compares by identity
//! (`Arc::ptr_eq`), never by structural equality, matching the object model's
//! reference semantics.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::channel::Channel;
use crate::class::{Closure, Function};
use crate::object::Object;

/// One of the fourteen tags a `Value` may carry. Kept distinct from the
/// `Value` enum itself so inline caches and the profiler can key on a cheap
/// `Copy` type instead of cloning payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Map,
    FixedArray,
    NativeArray,
    Object,
    Function,
    Closure,
    Channel,
    Iterator,
    SuperArray,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Null => "null",
            Tag::Bool => "bool",
            Tag::Int => "int",
            Tag::Float => "float",
            Tag::String => "string",
            Tag::Array => "array",
            Tag::Map => "map",
            Tag::FixedArray => "fixed_array",
            Tag::NativeArray => "native_array",
            Tag::Object => "object",
            Tag::Function => "function",
            Tag::Closure => "closure",
            Tag::Channel => "channel",
            Tag::Iterator => "iterator",
            Tag::SuperArray => "superarray",
        };
        write!(f, "{name}")
    }
}

/// A key usable in a `Map`. Any `Value` can be a key; this wrapper gives it a
/// canonical `Hash`/`Eq` so it can live in an `IndexMap`. Heap keys hash and
/// compare by identity, mirroring `Value`'s own equality rule.
#[derive(Clone)]
pub struct MapKey(pub Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.value_eq(&other.0)
    }
}
impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Str(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            other => {
                5u8.hash(state);
                (other.heap_identity() as usize).hash(state);
            }
        }
    }
}

pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
pub type MapRef = Arc<RwLock<IndexMap<MapKey, Value>>>;
pub type FixedArrayRef = Arc<Box<[RwLock<Value>]>>;
pub type NativeArrayRef = Arc<RwLock<Vec<Value>>>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SuperKey {
    Index(i64),
    Name(Arc<str>),
}

impl From<i64> for SuperKey {
    fn from(i: i64) -> Self {
        SuperKey::Index(i)
    }
}

/// A unified sequence/map container admitting both integer and string keys,
/// insertion-order iterable.
#[derive(Default)]
pub struct SuperArray {
    entries: IndexMap<SuperKeyHashable, Value>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum SuperKeyHashable {
    Index(i64),
    Name(Arc<str>),
}

impl SuperArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_index(&self, i: i64) -> Option<&Value> {
        self.entries.get(&SuperKeyHashable::Index(i))
    }

    pub fn get_name(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, SuperKeyHashable::Name(n) if n.as_ref() == name))
            .map(|(_, v)| v)
    }

    pub fn set_index(&mut self, i: i64, v: Value) {
        self.entries.insert(SuperKeyHashable::Index(i), v);
    }

    pub fn set_name(&mut self, name: Arc<str>, v: Value) {
        self.entries.insert(SuperKeyHashable::Name(name), v);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All values in insertion order, walked by the GC mark phase and by
    /// `IterSource::SuperArray` iteration.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    /// The key at insertion-order position `pos`, for positional iteration
    /// (as opposed to `get_index`/`get_name`, which look up by key value).
    pub fn key_at(&self, pos: usize) -> Option<SuperKey> {
        self.entries.get_index(pos).map(|(k, _)| match k {
            SuperKeyHashable::Index(i) => SuperKey::Index(*i),
            SuperKeyHashable::Name(n) => SuperKey::Name(n.clone()),
        })
    }

    /// The value at insertion-order position `pos`.
    pub fn value_at(&self, pos: usize) -> Option<&Value> {
        self.entries.get_index(pos).map(|(_, v)| v)
    }
}

pub type SuperArrayRef = Arc<RwLock<SuperArray>>;

/// An active iteration over an `Array`, `Map`, or `SuperArray`.
pub struct Iterator_ {
    pub source: IterSource,
    pub position: usize,
}

pub enum IterSource {
    Array(ArrayRef),
    Map(MapRef),
    SuperArray(SuperArrayRef),
}

pub type IteratorRef = Arc<Mutex<Iterator_>>;

/// The runtime value type. Heap variants hold `Arc`s so identity equality is
/// `Arc::ptr_eq` and cloning a `Value` never deep-copies the referent.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Array(ArrayRef),
    Map(MapRef),
    FixedArray(FixedArrayRef),
    NativeArray(NativeArrayRef),
    Object(Arc<Object>),
    Function(Arc<Function>),
    Closure(Arc<Closure>),
    Channel(Arc<Channel>),
    Iterator(IteratorRef),
    SuperArray(SuperArrayRef),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tag(), self.display())
    }
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::Null,
            Value::Bool(_) => Tag::Bool,
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Str(_) => Tag::String,
            Value::Array(_) => Tag::Array,
            Value::Map(_) => Tag::Map,
            Value::FixedArray(_) => Tag::FixedArray,
            Value::NativeArray(_) => Tag::NativeArray,
            Value::Object(_) => Tag::Object,
            Value::Function(_) => Tag::Function,
            Value::Closure(_) => Tag::Closure,
            Value::Channel(_) => Tag::Channel,
            Value::Iterator(_) => Tag::Iterator,
            Value::SuperArray(_) => Tag::SuperArray,
        }
    }

    /// Opaque identity for heap values, used by `MapKey` hashing and by the
    /// inline cache's receiver-class keying. Primitives return 0.
    pub fn heap_identity(&self) -> u64 {
        match self {
            Value::Array(a) => Arc::as_ptr(a) as u64,
            Value::Map(m) => Arc::as_ptr(m) as u64,
            Value::FixedArray(a) => Arc::as_ptr(a) as u64,
            Value::NativeArray(a) => Arc::as_ptr(a) as u64,
            Value::Object(o) => Arc::as_ptr(o) as u64,
            Value::Function(f) => Arc::as_ptr(f) as u64,
            Value::Closure(c) => Arc::as_ptr(c) as u64,
            Value::Channel(c) => Arc::as_ptr(c) as u64,
            Value::Iterator(i) => Arc::as_ptr(i) as u64,
            Value::SuperArray(s) => Arc::as_ptr(s) as u64,
            _ => 0,
        }
    }

    /// `false`, integer/float zero, null, and empty string/array/map are
    /// falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.read().is_empty(),
            Value::Map(m) => !m.read().is_empty(),
            Value::SuperArray(s) => !s.read().is_empty(),
            _ => true,
        }
    }

    /// Content equality for primitives and strings; identity equality for
    /// every heap variant.
    pub fn value_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => self.tag() == other.tag() && self.heap_identity() == other.heap_identity(),
        }
    }

    /// Heap values reachable in one step from this one, walked by the GC
    /// mark phase. Primitives and `Function`/`Channel` (opaque to tracing
    /// here) return empty.
    pub fn children(&self) -> Vec<Value> {
        match self {
            Value::Array(a) => a.read().clone(),
            Value::Map(m) => m
                .read()
                .iter()
                .flat_map(|(k, v)| [k.0.clone(), v.clone()])
                .collect(),
            Value::FixedArray(a) => a.iter().map(|cell| cell.read().clone()).collect(),
            Value::NativeArray(a) => a.read().clone(),
            Value::Object(o) => o.field_values(),
            Value::Closure(c) => c
                .upvalues
                .iter()
                .filter_map(|uv| match &*uv.read().unwrap() {
                    crate::class::Upvalue::Closed(v) => Some(v.clone()),
                    crate::class::Upvalue::Open { .. } => None,
                })
                .collect(),
            Value::SuperArray(s) => s.read().values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Array(a) => {
                let items: Vec<String> = a.read().iter().map(Value::display).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Map(m) => {
                let items: Vec<String> = m
                    .read()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.0.display(), v.display()))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::FixedArray(a) => {
                let items: Vec<String> = a.iter().map(|cell| cell.read().display()).collect();
                format!("[{}]", items.join(", "))
            }
            Value::NativeArray(a) => {
                let items: Vec<String> = a.read().iter().map(Value::display).collect();
                format!("native[{}]", items.join(", "))
            }
            Value::Object(o) => format!("<{} instance>", o.class.name),
            Value::Function(fun) => format!("<function {}>", fun.name),
            Value::Closure(c) => format!("<closure {}>", c.function.name),
            Value::Channel(_) => "<channel>".to_string(),
            Value::Iterator(_) => "<iterator>".to_string(),
            Value::SuperArray(_) => "<superarray>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_spec() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::Str(Arc::from("")).is_truthy());
        assert!(Value::Int(1).is_truthy());
        assert!(Value::Str(Arc::from("x")).is_truthy());
    }

    #[test]
    fn primitives_compare_by_content() {
        assert!(Value::Int(3).value_eq(&Value::Int(3)));
        assert!(Value::Str(Arc::from("hi")).value_eq(&Value::Str(Arc::from("hi"))));
        assert!(Value::Int(2).value_eq(&Value::Float(2.0)));
    }

    #[test]
    fn heap_values_compare_by_identity() {
        let a: ArrayRef = Arc::new(RwLock::new(vec![Value::Int(1)]));
        let b: ArrayRef = Arc::new(RwLock::new(vec![Value::Int(1)]));
        assert!(!Value::Array(a.clone()).value_eq(&Value::Array(b)));
        assert!(Value::Array(a.clone()).value_eq(&Value::Array(a)));
    }
}
