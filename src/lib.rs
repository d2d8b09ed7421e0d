//! Feature toggles with segmented rollouts and experiments, configured through an append-only
//! history of states.
//!
//! # Overview
//!
//! A feature is a named decision point with several named implementations sharing one input
//! signature. Features are registered with an [`App`], which hands out a [`FeatureHandle`] used to
//! evaluate them. Evaluating a feature with some input picks one implementation and calls it.
//!
//! Which implementation is picked is decided by the feature's current [`FeatureState`]: the input
//! is labelled by the state's segments, the labels select a [`Selector`] and the selector names an
//! implementation. Built-in selectors are [`Static`] (always the same implementation),
//! [`Rollout`] (deterministic weighted buckets) and [`Experiment`] (weighted random assignment
//! remembered by an [`ExperimentPersister`]). Without a state, or when nothing is mapped for an
//! input, the feature's default implementation is used.
//!
//! States are values. Editing one returns a new state, which is then appended to the feature's
//! history in [`Storage`]. The last appended state is the current one.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Registration errors report every problem found in a definition at once. Evaluation errors
//! usually indicate a misconfigured state or a storage outage; callers that must not fail can fall
//! back to the feature's default implementation.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target `feats` for
//! logging messages. Consider integrating a `log`-compatible logger implementation for better
//! visibility into feature evaluation.
//!
//! # Examples
//!
//! A runnable example lives in the `demos/simple` directory of the crate repository.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod app;
mod config;
mod definition;
mod error;
mod feature;
mod persister;
mod segment;
mod selector;
mod sharder;
mod state;
mod storage;
mod str;
mod value;

pub use app::{App, FeatureHandle, FeatureInfo};
pub use config::AppConfig;
pub use definition::{
    Definition, DefinitionBuilder, Implementation, ImplementationBuilder, DEFAULT_TAG,
};
pub use error::{Error, Result};
pub use feature::Feature;
pub use persister::{ExperimentPersister, MemoryPersister};
pub use segment::{Segment, SharedSegment};
pub use selector::{
    equivalent, DefaultSelector, Experiment, Rollout, Selector, SelectorFactory, SharedSelector,
    Static, Weights,
};
pub use sharder::{Md5Sharder, Sharder};
pub use state::{FeatureState, SegmentKey, SERIALIZER_VERSION};
pub use storage::{EntryId, MemoryStorage, StateMap, Storage, StreamIterator};
pub use str::Str;
pub use value::{Attributes, Entity, InputType, Value};
