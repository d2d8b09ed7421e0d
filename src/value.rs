//! Input values passed to features and segments, and the type descriptors they are matched
//! against.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::Str;

/// Attributes attached to an [`Entity`].
pub type Attributes = HashMap<Str, Value>;

/// A value passed into a feature or a segment.
///
/// The set of variants is closed, so segment dispatch is a match on the discriminant rather than
/// a walk over a runtime type hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// A flag.
    Boolean(bool),
    /// A whole number.
    Integer(i64),
    /// A floating point number.
    Number(f64),
    /// Text.
    String(Str),
    /// A domain object, see [`Entity`].
    Entity(Entity),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value.into())
    }
}

impl Value {
    /// The most specific type descriptor of this value.
    pub fn input_type(&self) -> InputType {
        match self {
            Value::Null => InputType::Null,
            Value::Boolean(_) => InputType::Boolean,
            Value::Integer(_) => InputType::Integer,
            Value::Number(_) => InputType::Number,
            Value::String(_) => InputType::String,
            Value::Entity(entity) => InputType::Entity(entity.kind.clone()),
        }
    }

    /// The string, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The entity, if this is an `Entity`.
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(e) => Some(e),
            _ => None,
        }
    }
}

/// Renders a stable identity for the value. Entities render as `kind:key` so that two snapshots
/// of the same entity with different attributes share an identity.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
            Value::Entity(e) => write!(f, "{}:{}", e.kind, e.key),
        }
    }
}

/// A domain object (a user, an account, a request) identified by its kind and key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Kind of object, e.g. `user`.
    pub kind: Str,
    /// Identifies the object within its kind.
    pub key: Str,
    /// Not part of the identity.
    #[serde(default)]
    pub attributes: Attributes,
}

impl Entity {
    /// An entity without attributes.
    pub fn new(kind: impl Into<Str>, key: impl Into<Str>) -> Entity {
        Entity {
            kind: kind.into(),
            key: key.into(),
            attributes: Attributes::new(),
        }
    }

    /// Set attribute `name`, replacing any previous value.
    pub fn with_attribute(mut self, name: impl Into<Str>, value: impl Into<Value>) -> Entity {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// The value of attribute `name`, if set.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Declared type of an implementation input.
///
/// Types form a shallow hierarchy: `Integer` is a `Number`, every `Entity(kind)` is an
/// `AnyEntity`, and everything is `Any`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InputType {
    /// Accepts every value.
    Any,
    /// Only `null`.
    Null,
    /// Booleans.
    Boolean,
    /// Integers.
    Integer,
    /// Floating point. Also accepts integers.
    Number,
    /// Strings.
    String,
    /// An entity of any kind.
    AnyEntity,
    /// An entity of the given kind.
    Entity(Str),
}

impl InputType {
    /// Returns this type followed by its ancestors, most specific first.
    pub fn lineage(&self) -> Vec<InputType> {
        match self {
            InputType::Any => vec![InputType::Any],
            InputType::Integer => vec![InputType::Integer, InputType::Number, InputType::Any],
            InputType::Entity(kind) => vec![
                InputType::Entity(kind.clone()),
                InputType::AnyEntity,
                InputType::Any,
            ],
            other => vec![other.clone(), InputType::Any],
        }
    }

    /// Returns `true` if a value of type `other` may be passed where `self` is declared.
    pub fn accepts(&self, other: &InputType) -> bool {
        other.lineage().contains(self)
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputType::Any => f.write_str("any"),
            InputType::Null => f.write_str("null"),
            InputType::Boolean => f.write_str("bool"),
            InputType::Integer => f.write_str("int"),
            InputType::Number => f.write_str("number"),
            InputType::String => f.write_str("str"),
            InputType::AnyEntity => f.write_str("entity"),
            InputType::Entity(kind) => write!(f, "entity<{kind}>"),
        }
    }
}
