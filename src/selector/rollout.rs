use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{first_input, Selector, SharedSelector, Weights};
use crate::{
    segment::SharedSegment,
    sharder::{Md5Sharder, Sharder},
    App, Error, Result, Str, Value,
};

/// Deterministic weighted selection for gradually enabling an implementation.
///
/// The input is labelled by a segment and the label is hashed into one of `total weight`
/// buckets. Buckets are assigned to implementations by cumulative weight in declaration order,
/// so a given label keeps its implementation for as long as the weights don't change.
#[derive(Debug, Clone)]
pub struct Rollout {
    name: Str,
    segment: SharedSegment,
    weights: Weights,
    cum_weights: Vec<u64>,
    modulo: u64,
}

#[derive(Serialize, Deserialize)]
struct RolloutData {
    name: Str,
    segment: Str,
    weights: Weights,
}

impl Rollout {
    /// Type name stored alongside serialized data.
    pub const TYPE_NAME: &'static str = "feats.Rollout";

    /// Fails with [`Error::InvalidWeights`] if `weights` is empty or sums to zero.
    pub fn new(name: impl Into<Str>, segment: SharedSegment, weights: Weights) -> Result<Rollout> {
        if weights.is_empty() {
            return Err(Error::InvalidWeights(
                "must supply at least one weight to the selector".to_owned(),
            ));
        }

        let mut cum_weights = Vec::with_capacity(weights.len());
        let mut total = 0u64;
        for (name, weight) in weights.iter() {
            total = total.checked_add(weight).ok_or_else(|| {
                Error::InvalidWeights(format!("total weight overflows at {name:?}"))
            })?;
            cum_weights.push(total);
        }
        if total == 0 {
            return Err(Error::InvalidWeights(
                "must supply at least one positive weight to the selector".to_owned(),
            ));
        }

        Ok(Rollout {
            name: name.into(),
            segment,
            weights,
            cum_weights,
            modulo: total,
        })
    }

    /// Segment labelling the input before hashing.
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    /// Bucket weights per implementation, in bucket order.
    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Select the implementation for an already computed segmentation key.
    pub fn select_key(&self, key: &str, sharder: &impl Sharder) -> Str {
        let bucket = sharder.get_shard(key, self.modulo);
        // First cumulative weight strictly above the bucket, so zero-weight entries never win.
        let index = self.cum_weights.partition_point(|&cum| cum <= bucket);
        self.weights.0[index].0.clone()
    }

    pub(crate) fn from_data(app: &App, data: serde_json::Value) -> Result<SharedSelector> {
        let data: RolloutData = serde_json::from_value(data)?;
        let segment = app.get_segment(&data.segment)?;
        Ok(Arc::new(Rollout::new(data.name, segment, data.weights)?))
    }
}

impl Selector for Rollout {
    fn name(&self) -> &Str {
        &self.name
    }

    fn type_name(&self) -> &str {
        Rollout::TYPE_NAME
    }

    fn select(&self, input: &[Value]) -> Result<Str> {
        let key = self.segment.segment(first_input(input)?)?;
        Ok(self.select_key(&key, &Md5Sharder))
    }

    fn serialize_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(RolloutData {
            name: self.name.clone(),
            segment: self.segment.name().clone(),
            weights: self.weights.clone(),
        })?)
    }
}
