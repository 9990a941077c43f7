//! Program image loading: the serde-deserializable descriptor shapes a
//! compiled program arrives in, and the `Registry` that turns them into the
//! live `Function`/`Class`/`Enum` tables the interpreter runs against.
//!
//! The core never depends on the JSON encoding itself — `serde_json` lives
//! at the loader boundary only; everything past `Registry::load_image`
//! works with the in-memory descriptor and runtime types.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytecode::{Chunk, ConstValue, UpvalDesc};
use crate::class::{Class, Method, PropertyDescriptor, Visibility};
use crate::error::RuntimeError;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    pub param_count: usize,
    pub min_arity: usize,
    pub defaults: Vec<ConstValue>,
    pub variadic: bool,
    pub local_slot_count: usize,
    pub upvalues: Vec<UpvalDesc>,
    pub code: Vec<u8>,
    pub constants: Vec<ConstValue>,
    /// Name of a registered native builtin to bind instead of interpreting
    /// `code`; `code` is still present (possibly empty) for introspection.
    pub native_binding: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyImageDescriptor {
    pub name: String,
    pub default: ConstValue,
    pub visibility: VisibilityDescriptor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityDescriptor {
    Public,
    Protected,
    Private,
}

impl From<VisibilityDescriptor> for Visibility {
    fn from(v: VisibilityDescriptor) -> Self {
        match v {
            VisibilityDescriptor::Public => Visibility::Public,
            VisibilityDescriptor::Protected => Visibility::Protected,
            VisibilityDescriptor::Private => Visibility::Private,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub param_count: usize,
    pub min_arity: usize,
    pub defaults: Vec<ConstValue>,
    pub local_slot_count: usize,
    pub code: Vec<u8>,
    pub constants: Vec<ConstValue>,
    pub visibility: VisibilityDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub name: String,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub is_abstract: bool,
    pub is_interface: bool,
    pub is_exception: bool,
    pub properties: Vec<PropertyImageDescriptor>,
    pub constants: HashMap<String, ConstValue>,
    pub statics: HashMap<String, ConstValue>,
    /// Methods grouped by name; each entry may hold multiple arity overloads.
    pub methods: HashMap<String, Vec<MethodDescriptor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumDescriptor {
    pub name: String,
    pub members: Vec<(String, ConstValue)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramImage {
    pub functions: Vec<FunctionDescriptor>,
    pub classes: Vec<ClassDescriptor>,
    pub enums: Vec<EnumDescriptor>,
    pub entry_function: String,
}

/// A deserialized enum's runtime form: name-keyed constant members, frozen
/// alongside the class table.
#[derive(Debug)]
pub struct EnumType {
    pub name: String,
    pub members: Vec<(String, Value)>,
}

impl EnumType {
    pub fn member(&self, name: &str) -> Option<&Value> {
        self.members.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

fn const_to_value(c: &ConstValue, functions: &DashMap<String, Arc<crate::class::Function>>) -> Value {
    match c {
        ConstValue::Null => Value::Null,
        ConstValue::Bool(b) => Value::Bool(*b),
        ConstValue::Int(i) => Value::Int(*i),
        ConstValue::Float(f) => Value::Float(*f),
        ConstValue::Str(s) => Value::Str(Arc::from(s.as_str())),
        ConstValue::FunctionRef(id) => functions
            .iter()
            .find(|e| e.value().id == *id as u64)
            .map(|e| Value::Function(e.value().clone()))
            .unwrap_or(Value::Null),
    }
}

/// Owns the live Function/Class/Enum tables for one VM instance. Registries
/// must not be shared across VM instances in the same process.
///
/// Before `freeze()`, registration takes an exclusive path through
/// `DashMap`; reads of a frozen registry bypass locking entirely by reading
/// out of the `ArcSwap`-published snapshot instead.
pub struct Registry {
    functions: DashMap<String, Arc<crate::class::Function>>,
    classes: DashMap<String, Arc<Class>>,
    enums: DashMap<String, Arc<EnumType>>,
    entry: ArcSwap<Option<String>>,
    frozen: AtomicBool,
}

/// Every builtin fault `RuntimeError` can raise, named to match
/// `RuntimeError::exception_class_name` exactly — these are the classes a
/// `catch` clause matches against when the VM itself raises rather than
/// user code. All inherit from the `Exception` root.
const BUILTIN_EXCEPTION_CLASSES: &[&str] = &[
    "DivisionByZero",
    "ModuloByZero",
    "BadCast",
    "TypeMismatch",
    "ChannelTypeMismatch",
    "UndefinedClass",
    "UndefinedMethod",
    "UndefinedField",
    "UnknownImport",
    "AccessViolation",
    "StackOverflow",
    "CallStackOverflow",
    "TaskLimitExceeded",
    "ArityBelowMinimum",
    "ArityAboveMaximum",
    "AbstractInstantiation",
    "MissingInterfaceMethod",
    "UnhandledException",
    "CorruptBytecode",
    "NotCallable",
];

impl Registry {
    pub fn new() -> Self {
        let registry = Registry {
            functions: DashMap::new(),
            classes: DashMap::new(),
            enums: DashMap::new(),
            entry: ArcSwap::from_pointee(None),
            frozen: AtomicBool::new(false),
        };
        registry.register_builtin_exceptions();
        registry
    }

    /// Populates the `Exception` root and one marker subclass per
    /// `RuntimeError` variant, so a VM-raised fault can be represented as a
    /// first-class `Object` of the matching class rather than a bare string.
    fn register_builtin_exceptions(&self) {
        let mut root = Class::new("Exception".to_string(), None);
        root.is_exception = true;
        let root = Arc::new(root);
        self.classes.insert("Exception".to_string(), root.clone());

        for name in BUILTIN_EXCEPTION_CLASSES {
            let mut class = Class::new(name.to_string(), Some(root.clone()));
            class.is_exception = true;
            self.classes.insert(name.to_string(), Arc::new(class));
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Registers a function under `name`. Returns `false` without mutating
    /// anything if the registry is frozen.
    pub fn register_function(&self, name: String, function: Arc<crate::class::Function>) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.functions.insert(name, function);
        true
    }

    pub fn register_class(&self, name: String, class: Arc<Class>) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.classes.insert(name, class);
        true
    }

    pub fn register_enum(&self, name: String, enum_type: Arc<EnumType>) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.enums.insert(name, enum_type);
        true
    }

    pub fn set_entry(&self, name: String) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.entry.store(Arc::new(Some(name)));
        true
    }

    pub fn entry_function(&self) -> Option<Arc<crate::class::Function>> {
        let name = self.entry.load();
        let name = name.as_ref().as_ref()?;
        self.lookup_function(name)
    }

    pub fn lookup_function(&self, name: &str) -> Option<Arc<crate::class::Function>> {
        self.functions.get(name).map(|e| e.value().clone())
    }

    /// Resolves a `ConstValue::FunctionRef` encountered mid-bytecode (e.g. by
    /// `Op::Closure`) against the live function table.
    pub fn lookup_function_by_id(&self, id: u64) -> Option<Arc<crate::class::Function>> {
        self.functions.iter().find(|e| e.value().id == id).map(|e| e.value().clone())
    }

    pub fn lookup_class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.get(name).map(|e| e.value().clone())
    }

    /// Whether `descendant` is `ancestor` or inherits from it, transitively.
    /// Used by `Class::check_visibility` to resolve `protected` access from
    /// a subclass, which a single `Class`'s own parent chain can't answer
    /// since it only walks upward from itself, not from an arbitrary name.
    pub fn is_descendant(&self, descendant: &str, ancestor: &str) -> bool {
        if descendant == ancestor {
            return true;
        }
        match self.lookup_class(descendant) {
            Some(class) => class.is_subclass_of(ancestor),
            None => false,
        }
    }

    pub fn lookup_enum(&self, name: &str) -> Option<Arc<EnumType>> {
        self.enums.get(name).map(|e| e.value().clone())
    }

    /// One-way transition. After this call `register_*`/`set_entry` are
    /// no-ops returning `false`; reads remain available from the caller's
    /// perspective without contending on a writer path again.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
        debug!(
            functions = self.functions.len(),
            classes = self.classes.len(),
            enums = self.enums.len(),
            "registry frozen"
        );
    }

    /// Deserializes a `ProgramImage` and registers every function, class,
    /// and enum it describes, then sets the entry point. Does not freeze —
    /// the caller decides when registration is done (e.g. after loading
    /// multiple image fragments).
    pub fn load_image(&self, image: &ProgramImage) -> Result<(), RuntimeError> {
        if self.is_frozen() {
            return Err(RuntimeError::CorruptBytecode {
                detail: "cannot load into a frozen registry".to_string(),
            });
        }

        for fd in &image.functions {
            let chunk = Chunk {
                code: fd.code.clone(),
                constants: fd.constants.clone(),
                upvalues: fd.upvalues.clone(),
                line_info: Vec::new(),
            };
            let defaults = fd.defaults.iter().map(|c| const_to_value(c, &self.functions)).collect();
            let function = Arc::new(crate::class::Function {
                id: crate::class::next_function_id(),
                name: fd.name.clone(),
                param_count: fd.param_count,
                min_arity: fd.min_arity,
                defaults,
                variadic: fd.variadic,
                code: Some(Arc::new(chunk)),
                local_slot_count: fd.local_slot_count,
                upvalue_count: fd.upvalues.len(),
                native: None,
                owning_class: None,
            });
            if fd.native_binding.is_some() {
                warn!(name = %fd.name, "native binding requested but no builtin registry is wired up; falling back to interpreted code");
            }
            self.register_function(fd.name.clone(), function);
        }

        for cd in &image.classes {
            let parent = cd.parent.as_ref().and_then(|p| self.lookup_class(p));
            if cd.parent.is_some() && parent.is_none() {
                return Err(RuntimeError::UndefinedClass {
                    name: cd.parent.clone().unwrap(),
                });
            }
            let class = Class::new(cd.name.clone(), parent);
            class.interfaces.clone_from(&cd.interfaces);
            for (name, value) in &cd.constants {
                class.constants.insert(name.clone(), const_to_value(value, &self.functions));
            }
            for (name, value) in &cd.statics {
                class.statics.insert(name.clone(), const_to_value(value, &self.functions));
            }
            let class = self.apply_class_flags(class, cd);
            let class = Arc::new(self.apply_properties(class, cd));

            for (method_name, overloads) in &cd.methods {
                for md in overloads {
                    let chunk = Chunk {
                        code: md.code.clone(),
                        constants: md.constants.clone(),
                        upvalues: Vec::new(),
                        line_info: Vec::new(),
                    };
                    let defaults = md.defaults.iter().map(|c| const_to_value(c, &self.functions)).collect();
                    let method = Arc::new(Method::new(
                        method_name.clone(),
                        cd.name.clone(),
                        md.param_count,
                        md.min_arity,
                        defaults,
                        Some(Arc::new(chunk)),
                        md.local_slot_count,
                        md.visibility.into(),
                    ));
                    class.define_method(method);
                }
            }

            self.register_class(cd.name.clone(), class);
        }

        for ed in &image.enums {
            let members = ed
                .members
                .iter()
                .map(|(name, value)| (name.clone(), const_to_value(value, &self.functions)))
                .collect();
            self.register_enum(ed.name.clone(), Arc::new(EnumType { name: ed.name.clone(), members }));
        }

        self.set_entry(image.entry_function.clone());
        Ok(())
    }

    fn apply_class_flags(&self, mut class: Class, cd: &ClassDescriptor) -> Class {
        class.is_abstract = cd.is_abstract;
        class.is_interface = cd.is_interface;
        class.is_exception = cd.is_exception;
        class
    }

    fn apply_properties(&self, mut class: Class, cd: &ClassDescriptor) -> Class {
        class.properties = cd
            .properties
            .iter()
            .map(|p| PropertyDescriptor {
                name: p.name.clone(),
                default: const_to_value(&p.default, &self.functions),
                visibility: p.visibility.into(),
            })
            .collect();
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image() -> ProgramImage {
        ProgramImage {
            functions: vec![FunctionDescriptor {
                name: "main".to_string(),
                param_count: 0,
                min_arity: 0,
                defaults: vec![],
                variadic: false,
                local_slot_count: 0,
                upvalues: vec![],
                code: vec![crate::bytecode::Op::PushOne as u8, crate::bytecode::Op::Return as u8],
                constants: vec![],
                native_binding: None,
            }],
            classes: vec![],
            enums: vec![],
            entry_function: "main".to_string(),
        }
    }

    #[test]
    fn load_image_registers_functions_and_sets_entry() {
        let registry = Registry::new();
        registry.load_image(&minimal_image()).unwrap();
        let entry = registry.entry_function().unwrap();
        assert_eq!(entry.name, "main");
    }

    #[test]
    fn freeze_rejects_further_registration() {
        let registry = Registry::new();
        registry.load_image(&minimal_image()).unwrap();
        registry.freeze();
        assert!(registry.is_frozen());

        let entry = registry.entry_function().unwrap();
        assert!(!registry.register_function("extra".to_string(), entry));

        let frozen_empty = Registry::new();
        frozen_empty.freeze();
        assert!(frozen_empty.load_image(&minimal_image()).is_err());
    }

    #[test]
    fn class_with_unknown_parent_errors() {
        let registry = Registry::new();
        let mut image = minimal_image();
        image.classes.push(ClassDescriptor {
            name: "Child".to_string(),
            parent: Some("Missing".to_string()),
            interfaces: vec![],
            is_abstract: false,
            is_interface: false,
            is_exception: false,
            properties: vec![],
            constants: HashMap::new(),
            statics: HashMap::new(),
            methods: HashMap::new(),
        });
        assert!(registry.load_image(&image).is_err());
    }
}
