use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{
    definition::{Definition, Implementation},
    value::InputType,
    Error, Result, Str, Value,
};

/// Number of resolved input types remembered per segment. The set of types a segment sees in a
/// process is expected to be small.
const RESOLUTION_CACHE_CAPACITY: usize = 32;

/// A function from an input value to a string label, chosen by the value's type.
///
/// Each implementation takes exactly one input. When a value's type has several registered
/// ancestors (e.g. `Integer` and `Number`), the most specific one wins.
pub struct Segment {
    name: Str,
    definition: Definition<String>,
    input_mapping: HashMap<InputType, Str>,
    resolved: RwLock<HashMap<InputType, Str>>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("input_mapping", &self.input_mapping)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Segment {
    /// Validate that `definition` forms a segment. Every implementation must take exactly one
    /// input and no two implementations may declare the same input type.
    pub fn new(name: impl Into<Str>, definition: Definition<String>) -> Result<Segment> {
        let mut problems = Vec::new();
        let mut input_mapping: HashMap<InputType, Str> = HashMap::new();

        for implementation in definition.implementations().values() {
            let input_type = match implementation.input_types() {
                [input_type] => input_type,
                [] => {
                    problems.push(format!("{:?} must specify an input", implementation.name()));
                    continue;
                }
                _ => {
                    problems.push(format!(
                        "{:?} cannot specify more than one input",
                        implementation.name()
                    ));
                    continue;
                }
            };
            if let Some(existing) = input_mapping.get(input_type) {
                problems.push(format!(
                    "{:?} cannot be segmented alongside {:?}: both take {}",
                    implementation.name(),
                    existing,
                    input_type
                ));
                continue;
            }
            input_mapping.insert(input_type.clone(), implementation.name().clone());
        }

        if !problems.is_empty() {
            return Err(Error::InvalidSegment { problems });
        }

        Ok(Segment {
            name: name.into(),
            definition,
            input_mapping,
            resolved: RwLock::new(HashMap::new()),
        })
    }

    /// Qualified name this segment is registered under.
    pub fn name(&self) -> &Str {
        &self.name
    }

    /// The labelling implementations.
    pub fn definition(&self) -> &Definition<String> {
        &self.definition
    }

    /// Input types with a registered implementation.
    pub fn input_types(&self) -> impl Iterator<Item = &InputType> {
        self.input_mapping.keys()
    }

    /// Returns `true` if some implementation declares exactly `input_type`.
    pub fn declares(&self, input_type: &InputType) -> bool {
        self.input_mapping.contains_key(input_type)
    }

    /// Find the implementation handling `input_type`, searching from the type itself towards its
    /// least specific ancestor.
    pub fn find_implementation(&self, input_type: &InputType) -> Result<&Implementation<String>> {
        let cached = self
            .resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(input_type)
            .cloned();
        let name = match cached {
            Some(name) => name,
            None => {
                let name = input_type
                    .lineage()
                    .iter()
                    .find_map(|candidate| self.input_mapping.get(candidate))
                    .cloned()
                    .ok_or_else(|| Error::NoSegmentImplementation {
                        segment: self.name.clone(),
                        input_type: input_type.clone(),
                    })?;
                let mut resolved = self
                    .resolved
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if resolved.len() < RESOLUTION_CACHE_CAPACITY {
                    resolved.insert(input_type.clone(), name.clone());
                }
                name
            }
        };

        self.definition.get(&name).ok_or_else(|| Error::NoSegmentImplementation {
            segment: self.name.clone(),
            input_type: input_type.clone(),
        })
    }

    /// Label `value` using the implementation matching its type.
    pub fn segment(&self, value: &Value) -> Result<Str> {
        let implementation = self
            .find_implementation(&value.input_type())
            .inspect_err(|err| {
                log::warn!(target: "feats",
                           segment:display = self.name;
                           "unable to segment value: {}", err);
            })?;
        Ok(implementation.call(std::slice::from_ref(value)).into())
    }
}

/// Segments are shared between the registry and every state referencing them.
pub type SharedSegment = Arc<Segment>;
