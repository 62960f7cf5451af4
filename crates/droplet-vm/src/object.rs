//! Heap object kinds
//!
//! A closed set of variants, polymorphic over three operations: mark-self
//! (owned by the heap header), child enumeration for the collector, and
//! display rendering. Display strings double as map keys, so they are part
//! of the observable semantics, not just debug output.

use crate::value::Value;
use rustc_hash::FxHashMap;

/// A heap-managed object
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Immutable text
    Str(String),
    /// Ordered sequence of values, auto-growing on indexed store
    Array(Vec<Value>),
    /// String-keyed mapping; keys are the display form of the original key
    Map(FxHashMap<String, Value>),
    /// Class-tagged record of named fields
    Instance {
        /// Class name this instance was created with
        class_name: String,
        /// Field name to value
        fields: FxHashMap<String, Value>,
    },
    /// First-class handle to a function-table index
    Function(u32),
    /// A receiver paired with a function-table index
    BoundMethod {
        /// The receiver (self) value
        receiver: Value,
        /// Function-table index of the method
        method: u32,
    },
}

impl HeapObject {
    /// Kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "string",
            HeapObject::Array(_) => "array",
            HeapObject::Map(_) => "map",
            HeapObject::Instance { .. } => "instance",
            HeapObject::Function(_) => "function",
            HeapObject::BoundMethod { .. } => "bound-method",
        }
    }

    /// Invoke `visit` for every contained value (the collector's
    /// child-enumeration hook).
    pub fn children(&self, visit: &mut dyn FnMut(Value)) {
        match self {
            HeapObject::Str(_) | HeapObject::Function(_) => {}
            HeapObject::Array(items) => {
                for value in items {
                    visit(*value);
                }
            }
            HeapObject::Map(entries) => {
                for value in entries.values() {
                    visit(*value);
                }
            }
            HeapObject::Instance { fields, .. } => {
                for value in fields.values() {
                    visit(*value);
                }
            }
            HeapObject::BoundMethod { receiver, .. } => visit(*receiver),
        }
    }

    /// Display form of this object
    pub fn display(&self) -> String {
        match self {
            HeapObject::Str(s) => s.clone(),
            HeapObject::Array(_) => "<array>".to_string(),
            HeapObject::Map(_) => "<map>".to_string(),
            HeapObject::Instance { class_name, .. } => format!("<object:{}>", class_name),
            HeapObject::Function(index) => format!("<function@{}>", index),
            HeapObject::BoundMethod { method, .. } => format!("<bound-method@{}>", method),
        }
    }

    /// String payload, when this is a Str
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeapObject::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Array elements, when this is an Array
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            HeapObject::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Mutable array elements, when this is an Array
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            HeapObject::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Map entries, when this is a Map
    pub fn as_map(&self) -> Option<&FxHashMap<String, Value>> {
        match self {
            HeapObject::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Mutable map entries, when this is a Map
    pub fn as_map_mut(&mut self) -> Option<&mut FxHashMap<String, Value>> {
        match self {
            HeapObject::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Class name, when this is an Instance
    pub fn class_name(&self) -> Option<&str> {
        match self {
            HeapObject::Instance { class_name, .. } => Some(class_name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjRef;

    #[test]
    fn test_display_forms() {
        assert_eq!(HeapObject::Str("hi".into()).display(), "hi");
        assert_eq!(HeapObject::Array(vec![]).display(), "<array>");
        assert_eq!(HeapObject::Map(FxHashMap::default()).display(), "<map>");
        assert_eq!(
            HeapObject::Instance {
                class_name: "Point".into(),
                fields: FxHashMap::default(),
            }
            .display(),
            "<object:Point>"
        );
        assert_eq!(HeapObject::Function(3).display(), "<function@3>");
        assert_eq!(
            HeapObject::BoundMethod {
                receiver: Value::Nil,
                method: 7,
            }
            .display(),
            "<bound-method@7>"
        );
    }

    #[test]
    fn test_children_enumeration() {
        let child = Value::Object(ObjRef::new(9));
        let mut seen = Vec::new();

        HeapObject::Array(vec![Value::Int(1), child]).children(&mut |v| seen.push(v));
        assert_eq!(seen, vec![Value::Int(1), child]);

        seen.clear();
        HeapObject::BoundMethod {
            receiver: child,
            method: 0,
        }
        .children(&mut |v| seen.push(v));
        assert_eq!(seen, vec![child]);

        seen.clear();
        HeapObject::Str("leaf".into()).children(&mut |v| seen.push(v));
        HeapObject::Function(2).children(&mut |v| seen.push(v));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_instance_fields() {
        let mut fields = FxHashMap::default();
        fields.insert("x".to_string(), Value::Int(4));
        let instance = HeapObject::Instance {
            class_name: "Point".into(),
            fields,
        };
        assert_eq!(instance.class_name(), Some("Point"));
        assert_eq!(instance.kind_name(), "instance");
    }
}
