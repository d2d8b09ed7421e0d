use std::{collections::HashMap, sync::RwLock};

use crate::{value::InputType, Error, Result, Str, Value};

/// Remembers which implementation an entity was assigned to in an experiment, so that repeated
/// evaluations for the same entity stay in the same group.
///
/// Storage may not be durable (e.g., a cookie may expire). The only guarantee expected is that a
/// group retrievable through [`get_existing_test_group`](Self::get_existing_test_group) is
/// returned unchanged.
pub trait ExperimentPersister: Send + Sync {
    /// Returns the group previously persisted for `value`, if any.
    fn get_existing_test_group(&self, experiment: &str, value: &Value) -> Result<Option<Str>>;

    /// Associates `group` with `value`. An existing association is not overwritten.
    ///
    /// Returns the group `value` ends up associated with, or `None` if `value` cannot be tracked
    /// by this persister.
    fn persist_test_group(&self, experiment: &str, value: &Value, group: &str)
        -> Result<Option<Str>>;
}

/// Experiment name, then the value's type and its displayed identity. Values of different types
/// may display the same (`Integer(1)` and `Number(1.0)`).
type GroupKey = (Str, InputType, String);

fn group_key(experiment: &str, value: &Value) -> GroupKey {
    (experiment.into(), value.input_type(), value.to_string())
}

/// Keeps assignments in process memory. They are lost when the process exits.
#[derive(Default)]
pub struct MemoryPersister {
    groups: RwLock<HashMap<GroupKey, Str>>,
}

impl MemoryPersister {
    /// Name the built-in instance is registered under.
    pub const NAME: &'static str = "feats.MemoryPersister";

    /// Create a persister with no assignments.
    pub fn new() -> Self {
        MemoryPersister::default()
    }
}

impl ExperimentPersister for MemoryPersister {
    fn get_existing_test_group(&self, experiment: &str, value: &Value) -> Result<Option<Str>> {
        let groups = self
            .groups
            .read()
            .map_err(|_| Error::StorageUnavailable("experiment groups lock poisoned".to_owned()))?;
        Ok(groups.get(&group_key(experiment, value)).cloned())
    }

    fn persist_test_group(
        &self,
        experiment: &str,
        value: &Value,
        group: &str,
    ) -> Result<Option<Str>> {
        let mut groups = self
            .groups
            .write()
            .map_err(|_| Error::StorageUnavailable("experiment groups lock poisoned".to_owned()))?;
        let group = groups
            .entry(group_key(experiment, value))
            .or_insert_with(|| group.into());
        Ok(Some(group.clone()))
    }
}
