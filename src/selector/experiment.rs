use std::{fmt, sync::Arc};

use rand::{
    distributions::{Distribution, WeightedIndex},
    thread_rng,
};
use serde::{Deserialize, Serialize};

use super::{first_input, Selector, SharedSelector, Weights};
use crate::{persister::ExperimentPersister, App, Error, Result, Str, Value};

/// Weighted random selection for A/B tests.
///
/// The first time an entity is seen it is assigned a random implementation; the assignment is
/// then remembered by the experiment's persister and returned on every later call for as long as
/// the persister can retrieve it.
#[derive(Clone)]
pub struct Experiment {
    name: Str,
    persister_name: Str,
    persister: Arc<dyn ExperimentPersister>,
    weights: Weights,
    distribution: WeightedIndex<u64>,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("persister", &self.persister_name)
            .field("weights", &self.weights)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct ExperimentData {
    name: Str,
    persister: Str,
    weights: Weights,
}

impl Experiment {
    /// Type name stored alongside serialized data.
    pub const TYPE_NAME: &'static str = "feats.Experiment";

    /// `persister_name` is the name `persister` is registered under with the [`App`]; it is what
    /// gets stored.
    pub fn new(
        name: impl Into<Str>,
        persister_name: impl Into<Str>,
        persister: Arc<dyn ExperimentPersister>,
        weights: Weights,
    ) -> Result<Experiment> {
        let distribution = WeightedIndex::new(weights.iter().map(|(_, weight)| weight))
            .map_err(|err| Error::InvalidWeights(err.to_string()))?;
        Ok(Experiment {
            name: name.into(),
            persister_name: persister_name.into(),
            persister,
            weights,
            distribution,
        })
    }

    /// Assignment probabilities per implementation.
    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Name of the persister remembering assignments.
    pub fn persister_name(&self) -> &Str {
        &self.persister_name
    }

    pub(crate) fn from_data(app: &App, data: serde_json::Value) -> Result<SharedSelector> {
        let data: ExperimentData = serde_json::from_value(data)?;
        let persister = app.get_persister(&data.persister)?;
        Ok(Arc::new(Experiment::new(
            data.name,
            data.persister,
            persister,
            data.weights,
        )?))
    }
}

impl Selector for Experiment {
    fn name(&self) -> &Str {
        &self.name
    }

    fn type_name(&self) -> &str {
        Experiment::TYPE_NAME
    }

    fn select(&self, input: &[Value]) -> Result<Str> {
        let value = first_input(input)?;
        if let Some(group) = self.persister.get_existing_test_group(&self.name, value)? {
            return Ok(group);
        }
        let index = self.distribution.sample(&mut thread_rng());
        Ok(self.weights.0[index].0.clone())
    }

    fn used_implementation(&self, implementation: &str, input: &[Value]) -> Result<()> {
        let value = first_input(input)?;
        let group = self
            .persister
            .persist_test_group(&self.name, value, implementation)?;
        log::trace!(target: "feats",
                    experiment:display = self.name,
                    subject:display = value,
                    group:debug = group;
                    "persisted experiment group");
        Ok(())
    }

    fn serialize_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(ExperimentData {
            name: self.name.clone(),
            persister: self.persister_name.clone(),
            weights: self.weights.clone(),
        })?)
    }
}
