use std::sync::Arc;

use crate::{value::InputType, Str};

/// Result type used throughout `feats`.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing everything that can go wrong while registering, configuring or evaluating
/// features.
///
/// Registration errors (`Invalid*`, `DuplicateName`) are meant to abort startup. Reference
/// resolution errors (`Unknown*Name`) and `InvalidSerializerVersion` indicate that stored state
/// and deployed code have drifted apart.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A definition could not be built. All problems found are reported at once.
    #[error("invalid definition: {}", .problems.join("; "))]
    InvalidDefinition {
        /// Human-readable description of every problem found.
        problems: Vec<String>,
    },

    /// A definition does not form a consistent feature.
    #[error("invalid feature: {}", .problems.join("; "))]
    InvalidFeature {
        /// Human-readable description of every problem found.
        problems: Vec<String>,
    },

    /// A definition does not form a consistent segment.
    #[error("invalid segment: {}", .problems.join("; "))]
    InvalidSegment {
        /// Human-readable description of every problem found.
        problems: Vec<String>,
    },

    /// A qualified name does not follow the `namespace.name` convention.
    #[error("invalid qualified name {0:?}")]
    InvalidName(Str),

    /// A name is already taken in the registry.
    #[error("{kind} {name:?} is already registered")]
    DuplicateName {
        /// Which registry the collision happened in.
        kind: &'static str,
        /// The conflicting name.
        name: Str,
    },

    /// No feature is registered under this name.
    #[error("unknown feature name {0:?}")]
    UnknownFeatureName(Str),

    /// No segment is registered under this name.
    #[error("unknown segment name {0:?}")]
    UnknownSegmentName(Str),

    /// No selector type is registered under this name.
    #[error("unknown selector name {0:?}")]
    UnknownSelectorName(Str),

    /// No experiment persister is registered under this name.
    #[error("unknown persister name {0:?}")]
    UnknownPersisterName(Str),

    /// A selector chose an implementation the feature does not define.
    #[error("feature {feature:?} has no implementation named {implementation:?}")]
    UnknownImplementation {
        /// Qualified feature name.
        feature: Str,
        /// Implementation name returned by the selector.
        implementation: Str,
    },

    /// Stored state was written by an incompatible serializer.
    #[error("invalid serializer version (expected: {expected:?}, found: {found:?})")]
    InvalidSerializerVersion {
        /// Version this build writes and reads.
        expected: &'static str,
        /// Version found in the stored map.
        found: String,
    },

    /// Stored state is missing entries or references entries that do not exist.
    #[error("malformed state: {0}")]
    MalformedState(String),

    /// A JSON value inside stored state could not be encoded or decoded.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Json(Arc<serde_json::Error>),

    /// A feature state breaks one of its invariants.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Selector weights cannot be used for selection.
    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    /// Call arguments do not match the declared input types.
    #[error("invalid arguments (expected: {expected:?}, found: {found:?})")]
    InvalidArguments {
        /// Declared input types.
        expected: Vec<InputType>,
        /// Types of the values actually passed.
        found: Vec<InputType>,
    },

    /// A segment has no implementation able to handle the given input type.
    #[error("segment {segment:?} has no implementation for {input_type}")]
    NoSegmentImplementation {
        /// Qualified segment name.
        segment: Str,
        /// Exact type of the rejected value.
        input_type: InputType,
    },

    /// The storage backend could not be reached. An empty history is not an error.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}
