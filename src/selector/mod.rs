//! Strategies deciding which implementation of a feature a call uses.
//!
//! A [`Selector`] is identified in stored state by the qualified type name it is registered under
//! (see [`App::register_selector`]) plus the JSON produced by [`Selector::serialize_data`]. The
//! factory registered for that type name turns the JSON back into a selector.
use std::{fmt, sync::Arc};

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{value::InputType, App, Error, Result, Str, Value};

mod experiment;
mod rollout;

pub use experiment::Experiment;
pub use rollout::Rollout;

/// Picks an implementation name for a call.
pub trait Selector: Send + Sync + fmt::Debug {
    /// Short human-readable description of the purpose of this selector.
    fn name(&self) -> &Str;

    /// Qualified name of the selector type, as registered with the [`App`].
    fn type_name(&self) -> &str;

    /// Returns the name of the implementation to use for `input`.
    fn select(&self, input: &[Value]) -> Result<Str>;

    /// Informs the selector that `input` was served by `implementation`.
    fn used_implementation(&self, _implementation: &str, _input: &[Value]) -> Result<()> {
        Ok(())
    }

    /// Configuration of the selector, enough for its factory to rebuild it.
    fn serialize_data(&self) -> Result<serde_json::Value>;
}

/// Selectors are immutable and shared between states; identity is pointer identity.
pub type SharedSelector = Arc<dyn Selector>;

/// Rebuilds a selector from the output of [`Selector::serialize_data`], resolving names of
/// referenced segments and persisters through the [`App`].
pub type SelectorFactory = fn(&App, serde_json::Value) -> Result<SharedSelector>;

/// Returns `true` if both selectors have the same type and configuration, and thus select
/// identically.
///
/// Configurations are compared in their serialized text, so key order counts: weights listed in
/// a different order bucket differently.
pub fn equivalent(a: &dyn Selector, b: &dyn Selector) -> bool {
    if a.type_name() != b.type_name() {
        return false;
    }
    let text = |selector: &dyn Selector| {
        selector
            .serialize_data()
            .ok()
            .and_then(|data| serde_json::to_string(&data).ok())
    };
    match (text(a), text(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Argument segmenting selectors act on.
pub(crate) fn first_input(input: &[Value]) -> Result<&Value> {
    input.first().ok_or_else(|| Error::InvalidArguments {
        expected: vec![InputType::Any],
        found: Vec::new(),
    })
}

/// Always returns one fixed implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Static {
    name: Str,
    value: Str,
}

impl Static {
    /// Type name stored alongside serialized data.
    pub const TYPE_NAME: &'static str = "feats.Static";

    /// A selector always returning `value`.
    pub fn new(name: impl Into<Str>, value: impl Into<Str>) -> Static {
        Static {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The implementation name always selected.
    pub fn value(&self) -> &Str {
        &self.value
    }

    pub(crate) fn from_data(_app: &App, data: serde_json::Value) -> Result<SharedSelector> {
        let selector: Static = serde_json::from_value(data)?;
        Ok(Arc::new(selector))
    }
}

impl Selector for Static {
    fn name(&self) -> &Str {
        &self.name
    }

    fn type_name(&self) -> &str {
        Static::TYPE_NAME
    }

    fn select(&self, _input: &[Value]) -> Result<Str> {
        Ok(self.value.clone())
    }

    fn serialize_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Stand-in used when a feature has no state or no mapping matches: always returns the feature's
/// default implementation. Never stored.
#[derive(Debug, Clone)]
pub struct DefaultSelector {
    name: Str,
    implementation: Str,
}

impl DefaultSelector {
    /// Type name stored alongside serialized data.
    pub const TYPE_NAME: &'static str = "feats.Default";

    /// Select the default `implementation`.
    pub fn new(implementation: impl Into<Str>) -> DefaultSelector {
        DefaultSelector {
            name: "Default".into(),
            implementation: implementation.into(),
        }
    }
}

impl Selector for DefaultSelector {
    fn name(&self) -> &Str {
        &self.name
    }

    fn type_name(&self) -> &str {
        DefaultSelector::TYPE_NAME
    }

    fn select(&self, _input: &[Value]) -> Result<Str> {
        Ok(self.implementation.clone())
    }

    fn serialize_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "name": self.name,
            "value": self.implementation,
        }))
    }
}

/// Implementation weights in declaration order. Order matters: rollouts assign hash buckets by
/// cumulative weight.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Weights(Vec<(Str, u64)>);

impl Weights {
    /// No implementations.
    pub fn new() -> Weights {
        Weights::default()
    }

    /// Set the weight of `implementation`, keeping its original position if already present.
    pub fn with(mut self, implementation: impl Into<Str>, weight: u64) -> Weights {
        self.set(implementation.into(), weight);
        self
    }

    fn set(&mut self, implementation: Str, weight: u64) {
        match self.0.iter_mut().find(|(name, _)| *name == implementation) {
            Some(entry) => entry.1 = weight,
            None => self.0.push((implementation, weight)),
        }
    }

    /// Implementations and their weights, in insertion order.
    ///
    /// ```
    /// # use feats::Weights;
    /// let weights = Weights::new().with("b", 2).with("a", 1).with("b", 3);
    /// let listed: Vec<_> = weights.iter().map(|(name, weight)| (name.to_string(), weight)).collect();
    /// assert_eq!(listed, [("b".to_owned(), 3), ("a".to_owned(), 1)]);
    /// ```
    pub fn iter(&self) -> impl Iterator<Item = (&Str, u64)> {
        self.0.iter().map(|(name, weight)| (name, *weight))
    }

    /// Number of implementations, including zero-weight ones.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no implementation is listed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<Str>> FromIterator<(K, u64)> for Weights {
    fn from_iter<T: IntoIterator<Item = (K, u64)>>(iter: T) -> Self {
        let mut weights = Weights::new();
        for (name, weight) in iter {
            weights.set(name.into(), weight);
        }
        weights
    }
}

impl Serialize for Weights {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, weight) in &self.0 {
            map.serialize_entry(name, weight)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Weights {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct WeightsVisitor;

        impl<'de> Visitor<'de> for WeightsVisitor {
            type Value = Weights;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map from implementation name to weight")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Weights, A::Error> {
                let mut weights = Weights::new();
                while let Some((name, weight)) = map.next_entry::<Str, u64>()? {
                    weights.set(name, weight);
                }
                Ok(weights)
            }
        }

        deserializer.deserialize_map(WeightsVisitor)
    }
}
