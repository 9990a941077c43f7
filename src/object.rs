//! Instances of a `Class`: the `Object` heap value.

use std::sync::Arc;

use dashmap::DashMap;

use crate::class::Class;
use crate::value::Value;

/// A class instance. Field storage is a concurrent map so instances can be
/// shared (read) across worker threads once the owning class is frozen;
/// mutation of an individual instance is still the caller's responsibility
/// to serialize if it is shared across tasks.
#[derive(Debug)]
pub struct Object {
    pub class: Arc<Class>,
    fields: DashMap<String, Value>,
}

impl Object {
    /// Allocates a new instance and initializes its fields by walking the
    /// inheritance chain root-to-leaf, so a subclass's default overrides a
    /// parent's declaration of the same property name.
    pub fn new(class: Arc<Class>) -> Self {
        let fields = DashMap::new();
        let mut chain = Vec::new();
        let mut cur = Some(class.clone());
        while let Some(c) = cur {
            chain.push(c.clone());
            cur = c.parent.clone();
        }
        for c in chain.iter().rev() {
            for prop in &c.properties {
                fields.insert(prop.name.clone(), prop.default.clone());
            }
        }
        Object { class, fields }
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).map(|v| v.clone())
    }

    pub fn set_field(&self, name: String, value: Value) {
        self.fields.insert(name, value);
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn is_instance_of(self: &Arc<Self>, class_name: &str) -> bool {
        self.class.name == class_name || self.class.is_subclass_of(class_name)
    }

    /// All current field values, walked by the GC mark phase when tracing
    /// an instance's children.
    pub fn field_values(&self) -> Vec<Value> {
        self.fields.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::PropertyDescriptor;
    use crate::class::Visibility;

    #[test]
    fn field_defaults_init_parent_first() {
        let parent = Arc::new(Class::new("Base".into(), None));
        parent.properties.len(); // touch for clarity, Vec is immutable after construction helper below
        let mut parent = Arc::try_unwrap(parent).unwrap();
        parent.properties.push(PropertyDescriptor {
            name: "x".into(),
            default: Value::Int(1),
            visibility: Visibility::Public,
        });
        let parent = Arc::new(parent);

        let mut child = Class::new("Child".into(), Some(parent));
        child.properties.push(PropertyDescriptor {
            name: "y".into(),
            default: Value::Int(2),
            visibility: Visibility::Public,
        });
        let child = Arc::new(child);

        let obj = Object::new(child);
        assert!(matches!(obj.get_field("x"), Some(Value::Int(1))));
        assert!(matches!(obj.get_field("y"), Some(Value::Int(2))));
    }
}
