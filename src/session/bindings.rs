//! Binding table values and their transferability classification
//!
//! Scripts run in a separate interpreter process, so a binding only survives
//! between calls if it can cross the process boundary. The worker tags every
//! new name with one of three wire kinds:
//!
//! - `json`   - plain data, carried as a `serde_json::Value`
//! - `pickle` - any other picklable object, carried as an opaque payload
//! - `opaque` - a handle-like value that must not persist (see [`OpaqueKind`])
//!
//! Only the first two become [`BindingValue`]s. The decision is made from the
//! closed tag set, never by probing values on the host side.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A value that can be carried forward to later executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingValue {
    /// Plain data (numbers, strings, lists, string-keyed maps)
    Json { value: Value },
    /// Pickled interpreter object, base64 encoded
    Pickle {
        type_name: String,
        repr: String,
        data: String,
    },
}

impl BindingValue {
    pub fn json(value: impl Into<Value>) -> Self {
        BindingValue::Json {
            value: value.into(),
        }
    }

    /// The plain value, if this binding is JSON
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            BindingValue::Json { value } => Some(value),
            BindingValue::Pickle { .. } => None,
        }
    }

    /// Interpreter-side type name
    pub fn type_name(&self) -> &str {
        match self {
            BindingValue::Json { value } => match value {
                Value::Null => "NoneType",
                Value::Bool(_) => "bool",
                Value::Number(n) if n.is_f64() => "float",
                Value::Number(_) => "int",
                Value::String(_) => "str",
                Value::Array(_) => "list",
                Value::Object(_) => "dict",
            },
            BindingValue::Pickle { type_name, .. } => type_name,
        }
    }
}

impl fmt::Display for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Json { value } => write!(f, "{}", value),
            BindingValue::Pickle { repr, .. } => write!(f, "{}", repr),
        }
    }
}

/// Closed set of value kinds that never persist between executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpaqueKind {
    /// Open files, sockets wrapped in io objects, buffers
    Stream,
    /// Imported modules (re-import instead)
    Module,
    /// Functions, lambdas, classes
    Callable,
    /// Generators and coroutines
    Generator,
    /// Anything the worker could neither encode as JSON nor pickle
    Unserializable,
}

impl fmt::Display for OpaqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpaqueKind::Stream => "stream",
            OpaqueKind::Module => "module",
            OpaqueKind::Callable => "callable",
            OpaqueKind::Generator => "generator",
            OpaqueKind::Unserializable => "unserializable",
        };
        f.write_str(name)
    }
}

/// A binding as reported by the worker, before classification
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum WireBinding {
    Json {
        value: Value,
    },
    Pickle {
        type_name: String,
        #[serde(default)]
        repr: String,
        data: String,
    },
    Opaque {
        tag: OpaqueKind,
        #[serde(default)]
        type_name: String,
    },
}

/// Outcome of classifying one new binding
#[derive(Debug, Clone, PartialEq)]
pub enum Transferability {
    Persistent(BindingValue),
    Transient { kind: OpaqueKind, type_name: String },
}

impl WireBinding {
    pub(crate) fn classify(self) -> Transferability {
        match self {
            WireBinding::Json { value } => Transferability::Persistent(BindingValue::Json { value }),
            WireBinding::Pickle {
                type_name,
                repr,
                data,
            } => Transferability::Persistent(BindingValue::Pickle {
                type_name,
                repr,
                data,
            }),
            WireBinding::Opaque { tag, type_name } => Transferability::Transient {
                kind: tag,
                type_name,
            },
        }
    }
}

/// A new name that was dropped from a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedBinding {
    pub name: String,
    pub kind: OpaqueKind,
    pub type_name: String,
}

/// Name -> value table, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bindings(BTreeMap<String, BindingValue>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: BindingValue) -> Option<BindingValue> {
        self.0.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<BindingValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Overwrite or add every entry of `other`
    pub fn merge(&mut self, other: &Bindings) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Split worker-reported bindings into a persistent delta and the names
    /// that were excluded
    pub(crate) fn from_wire(
        wire: BTreeMap<String, WireBinding>,
    ) -> (Bindings, Vec<ExcludedBinding>) {
        let mut delta = Bindings::new();
        let mut excluded = Vec::new();
        for (name, binding) in wire {
            match binding.classify() {
                Transferability::Persistent(value) => {
                    delta.insert(name, value);
                }
                Transferability::Transient { kind, type_name } => excluded.push(ExcludedBinding {
                    name,
                    kind,
                    type_name,
                }),
            }
        }
        (delta, excluded)
    }
}

impl FromIterator<(String, BindingValue)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (String, BindingValue)>>(iter: I) -> Self {
        Bindings(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_bindings_split_by_kind() {
        let wire: BTreeMap<String, WireBinding> = serde_json::from_value(json!({
            "y": {"kind": "json", "value": 2},
            "df": {"kind": "pickle", "type_name": "DataFrame", "repr": "   a\n0  1", "data": "gAR9lC4="},
            "fh": {"kind": "opaque", "tag": "stream", "type_name": "TextIOWrapper"},
            "helper": {"kind": "opaque", "tag": "callable", "type_name": "function"}
        }))
        .unwrap();

        let (delta, excluded) = Bindings::from_wire(wire);

        assert_eq!(delta.names().collect::<Vec<_>>(), vec!["df", "y"]);
        assert_eq!(delta.get("y").and_then(BindingValue::as_json), Some(&json!(2)));
        assert_eq!(delta.get("df").unwrap().type_name(), "DataFrame");
        assert_eq!(excluded.len(), 2);
        assert_eq!(excluded[0].name, "fh");
        assert_eq!(excluded[0].kind, OpaqueKind::Stream);
        assert_eq!(excluded[1].kind, OpaqueKind::Callable);
    }

    #[test]
    fn test_merge_overwrites_existing_names() {
        let mut table = Bindings::new();
        table.insert("x", BindingValue::json(1));
        table.insert("keep", BindingValue::json("yes"));

        let mut incoming = Bindings::new();
        incoming.insert("x", BindingValue::json(10));
        incoming.insert("z", BindingValue::json(3));
        table.merge(&incoming);

        assert_eq!(table.len(), 3);
        assert_eq!(table.get("x"), Some(&BindingValue::json(10)));
        assert!(table.contains("keep"));
    }

    #[test]
    fn test_binding_serialization_is_tagged() {
        let mut table = Bindings::new();
        table.insert("n", BindingValue::json(1.5));
        let encoded = serde_json::to_value(&table).unwrap();
        assert_eq!(encoded, json!({"n": {"kind": "json", "value": 1.5}}));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(BindingValue::json(1).type_name(), "int");
        assert_eq!(BindingValue::json(1.5).type_name(), "float");
        assert_eq!(BindingValue::json("a").type_name(), "str");
        assert_eq!(BindingValue::json(json!([1])).type_name(), "list");
        assert_eq!(OpaqueKind::Generator.to_string(), "generator");
    }
}
