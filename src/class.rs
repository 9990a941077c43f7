//! The object model: classes, methods, functions, closures, and upvalues.
//!
//! Method lookup is deliberately a plain function from `(Class, name, arity)`
//! to `Option<Method>` rather than a vtable — inheritance is chain walking,
//! not layout inheritance, matching the model the bytecode interpreter and
//! the inline cache both assume.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::bytecode::CodeRef;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// Monotonically increasing identity assigned to every `Function` at
/// registration; used as the JIT helper-registry and installed-code-cache
/// key instead of anything derived from the function's name.
static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_function_id() -> u64 {
    NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct Function {
    pub id: u64,
    pub name: String,
    pub param_count: usize,
    pub min_arity: usize,
    pub defaults: Vec<Value>,
    pub variadic: bool,
    pub code: Option<CodeRef>,
    pub local_slot_count: usize,
    pub upvalue_count: usize,
    pub native: Option<NativeFn>,
    /// The class this function is a method body of, if any. Consulted by
    /// method-call visibility checks; `None` for free functions.
    pub owning_class: Option<String>,
}

pub type NativeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

impl Function {
    pub fn max_arity(&self) -> usize {
        self.param_count
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }
}

/// A stack-slot reference that starts open (pointing at a live frame slot)
/// and is closed exactly once, when the frame that owns the slot is popped.
#[derive(Debug)]
pub enum Upvalue {
    Open { frame_depth: usize, slot: usize },
    Closed(Value),
}

impl Upvalue {
    pub fn close(&mut self, value: Value) {
        if matches!(self, Upvalue::Open { .. }) {
            *self = Upvalue::Closed(value);
        }
    }
}

#[derive(Debug)]
pub struct Closure {
    pub function: Arc<Function>,
    pub upvalues: Vec<Arc<RwLock<Upvalue>>>,
}

#[derive(Debug)]
pub struct Method {
    pub name: String,
    pub owning_class: String,
    pub param_count: usize,
    pub min_arity: usize,
    pub defaults: Vec<Value>,
    pub code: Option<CodeRef>,
    pub local_slot_count: usize,
    pub visibility: Visibility,
    function: RwLock<Option<Arc<Function>>>,
}

impl Method {
    pub fn new(
        name: String,
        owning_class: String,
        param_count: usize,
        min_arity: usize,
        defaults: Vec<Value>,
        code: Option<CodeRef>,
        local_slot_count: usize,
        visibility: Visibility,
    ) -> Self {
        Method {
            name,
            owning_class,
            param_count,
            min_arity,
            defaults,
            code,
            local_slot_count,
            visibility,
            function: RwLock::new(None),
        }
    }

    /// Lazily materializes a `Function` wrapper for invocation through the
    /// same call path as a free function.
    pub fn as_function(&self) -> Arc<Function> {
        if let Some(f) = self.function.read().unwrap().clone() {
            return f;
        }
        let mut slot = self.function.write().unwrap();
        if let Some(f) = slot.clone() {
            return f;
        }
        let f = Arc::new(Function {
            id: next_function_id(),
            name: self.name.clone(),
            param_count: self.param_count,
            min_arity: self.min_arity,
            defaults: self.defaults.clone(),
            variadic: false,
            code: self.code.clone(),
            local_slot_count: self.local_slot_count,
            upvalue_count: 0,
            native: None,
            owning_class: Some(self.owning_class.clone()),
        });
        *slot = Some(f.clone());
        f
    }

    pub fn is_applicable(&self, argc: usize) -> bool {
        argc >= self.min_arity && argc <= self.param_count
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub default: Value,
    pub visibility: Visibility,
}

/// A class as registered from a program image. Overloads of the same method
/// name are kept ordered by parameter count so dispatch picks the first
/// arity-compatible entry.
pub struct Class {
    pub name: String,
    pub parent: Option<Arc<Class>>,
    pub interfaces: Vec<String>,
    pub is_abstract: bool,
    pub is_interface: bool,
    pub is_exception: bool,
    methods: DashMap<String, Vec<Arc<Method>>>,
    pub properties: Vec<PropertyDescriptor>,
    pub constants: DashMap<String, Value>,
    pub statics: DashMap<String, Value>,
}

impl Class {
    pub fn new(name: String, parent: Option<Arc<Class>>) -> Self {
        Class {
            name,
            parent,
            interfaces: Vec::new(),
            is_abstract: false,
            is_interface: false,
            is_exception: false,
            methods: DashMap::new(),
            properties: Vec::new(),
            constants: DashMap::new(),
            statics: DashMap::new(),
        }
    }

    pub fn define_method(&self, method: Arc<Method>) {
        let mut overloads = self.methods.entry(method.name.clone()).or_default();
        overloads.push(method);
        overloads.sort_by_key(|m| m.param_count);
    }

    /// `(class, name, arity) -> Method?`. Picks the first overload in `C`
    /// whose arity matches; if none, walks to the parent; if the whole chain
    /// yields no arity match, falls back to the first method of that name
    /// found anywhere on the chain.
    pub fn resolve_method(self: &Arc<Self>, name: &str, argc: usize) -> Option<Arc<Method>> {
        let mut cur = Some(self.clone());
        while let Some(class) = cur {
            if let Some(overloads) = class.methods.get(name) {
                if let Some(m) = overloads.iter().find(|m| m.is_applicable(argc)) {
                    return Some(m.clone());
                }
            }
            cur = class.parent.clone();
        }
        let mut cur = Some(self.clone());
        while let Some(class) = cur {
            if let Some(overloads) = class.methods.get(name) {
                if let Some(m) = overloads.first() {
                    return Some(m.clone());
                }
            }
            cur = class.parent.clone();
        }
        None
    }

    pub fn is_subclass_of(self: &Arc<Self>, parent_name: &str) -> bool {
        let mut cur = self.parent.clone();
        while let Some(class) = cur {
            if class.name == parent_name {
                return true;
            }
            cur = class.parent.clone();
        }
        false
    }

    /// Visibility check for a method access from `accessor_class` (the class
    /// lexically enclosing the call site, or `None` at top level). `protected`
    /// additionally admits any subclass of the defining class, which needs
    /// the full class table (`registry`) to resolve since a `Class` only
    /// knows its own parent chain, not an arbitrary named class's.
    pub fn check_visibility(
        &self,
        method: &Method,
        accessor_class: Option<&str>,
        registry: &crate::loader::Registry,
    ) -> bool {
        match method.visibility {
            Visibility::Public => true,
            Visibility::Private => accessor_class == Some(method.owning_class.as_str()),
            Visibility::Protected => match accessor_class {
                Some(name) => registry.is_descendant(name, &method.owning_class),
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(name: &str, owning: &str, params: usize, min: usize) -> Arc<Method> {
        Arc::new(Method::new(
            name.to_string(),
            owning.to_string(),
            params,
            min,
            vec![],
            None,
            params,
            Visibility::Public,
        ))
    }

    #[test]
    fn dispatch_picks_matching_arity_then_falls_back() {
        let parent = Arc::new(Class::new("Base".into(), None));
        parent.define_method(method("greet", "Base", 0, 0));
        let child = Arc::new(Class::new("Child".into(), Some(parent.clone())));
        child.define_method(method("greet", "Child", 1, 1));

        let m = child.resolve_method("greet", 1).unwrap();
        assert_eq!(m.owning_class, "Child");

        let m = child.resolve_method("greet", 0).unwrap();
        assert_eq!(m.owning_class, "Base");

        // No exact arity anywhere: falls back to first found along the chain.
        let m = child.resolve_method("greet", 9).unwrap();
        assert_eq!(m.owning_class, "Child");
    }

    #[test]
    fn subclass_check_walks_chain() {
        let grandparent = Arc::new(Class::new("A".into(), None));
        let parent = Arc::new(Class::new("B".into(), Some(grandparent)));
        let child = Arc::new(Class::new("C".into(), Some(parent)));
        assert!(child.is_subclass_of("A"));
        assert!(child.is_subclass_of("B"));
        assert!(!child.is_subclass_of("C"));
    }

    #[test]
    fn protected_method_is_callable_from_subclass_but_not_strangers() {
        use crate::loader::Registry;

        let base = Arc::new(Class::new("Base".into(), None));
        let child = Arc::new(Class::new("Child".into(), Some(base.clone())));

        let registry = Registry::new();
        registry.register_class("Base".into(), base.clone());
        registry.register_class("Child".into(), child.clone());

        let protected = Method::new("secret".into(), "Base".into(), 0, 0, vec![], None, 0, Visibility::Protected);

        assert!(base.check_visibility(&protected, Some("Base"), &registry));
        assert!(base.check_visibility(&protected, Some("Child"), &registry));
        assert!(!base.check_visibility(&protected, Some("Stranger"), &registry));
        assert!(!base.check_visibility(&protected, None, &registry));
    }
}
