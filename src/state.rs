//! Versioned feature configuration and its flat-map serialization.
//!
//! A [`FeatureState`] binds an ordered list of segments, the selectors in use and a mapping from
//! segmentation keys to selectors. States are values: every edit returns a new state and the
//! original is left untouched.
//!
//! # Serialized form
//!
//! States are stored as flat string maps so that they fit narrow key-value or stream stores:
//!
//! | key | value |
//! |---|---|
//! | `version` | [`SERIALIZER_VERSION`] |
//! | `segmentation` | JSON array of segment names, in key order |
//! | `created_by` | audit string |
//! | `selector:<index>` | JSON `{"type": <selector type name>, "data": <selector data>}` |
//! | `segment:<JSON key>` | `selector:<index>` of the mapped selector; the key is a JSON array of labels, or `null` for the fallthrough |
use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    segment::SharedSegment,
    selector::{self, first_input, SharedSelector},
    storage::StateMap,
    App, Error, Result, Str, Value,
};

/// Version written to and expected in the `version` entry. Other versions are rejected, never
/// migrated.
pub const SERIALIZER_VERSION: &str = "v1";

const SELECTOR_PREFIX: &str = "selector:";
const SEGMENT_PREFIX: &str = "segment:";

/// Segmentation key of a mapping entry: one label per segment, in segment order. `None` is the
/// fallthrough used when no labelled entry matches.
pub type SegmentKey = Option<Vec<Str>>;

#[derive(Serialize, Deserialize)]
struct SelectorRecord {
    #[serde(rename = "type")]
    type_name: Str,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

/// Immutable snapshot of a feature's segmentation and selector configuration.
#[derive(Debug, Clone)]
pub struct FeatureState {
    segments: Vec<SharedSegment>,
    selectors: Vec<SharedSelector>,
    selector_mapping: BTreeMap<SegmentKey, SharedSelector>,
    created_by: Str,
}

impl FeatureState {
    /// The zero state: no segments, no selectors, nothing mapped.
    pub fn initial(created_by: impl Into<Str>) -> FeatureState {
        FeatureState {
            segments: Vec::new(),
            selectors: Vec::new(),
            selector_mapping: BTreeMap::new(),
            created_by: created_by.into(),
        }
    }

    /// Build a state, checking that every mapped selector is listed in `selectors` and that
    /// every key has one label per segment. Duplicate selectors are dropped.
    pub fn new(
        segments: Vec<SharedSegment>,
        selectors: Vec<SharedSelector>,
        selector_mapping: BTreeMap<SegmentKey, SharedSelector>,
        created_by: impl Into<Str>,
    ) -> Result<FeatureState> {
        let mut unique: Vec<SharedSelector> = Vec::with_capacity(selectors.len());
        for selector in selectors {
            if position(&unique, &selector).is_none() {
                unique.push(selector);
            }
        }

        for (key, selector) in &selector_mapping {
            check_key(key, segments.len())?;
            if position(&unique, selector).is_none() {
                return Err(Error::InvalidState(format!(
                    "selector {:?} mapped under {:?} is not listed in the state",
                    selector.name(),
                    key
                )));
            }
        }

        Ok(FeatureState {
            segments,
            selectors: unique,
            selector_mapping,
            created_by: created_by.into(),
        })
    }

    /// Segments labelling the input, in key order.
    pub fn segments(&self) -> &[SharedSegment] {
        &self.segments
    }

    /// Listed selectors, mapped or not.
    pub fn selectors(&self) -> &[SharedSelector] {
        &self.selectors
    }

    /// Segment keys and the selector each one maps to.
    pub fn selector_mapping(&self) -> &BTreeMap<SegmentKey, SharedSelector> {
        &self.selector_mapping
    }

    /// Author of this state.
    pub fn created_by(&self) -> &Str {
        &self.created_by
    }

    /// Returns a copy listing `selector`. Listing an already listed selector is a no-op.
    pub fn add_selector(&self, selector: SharedSelector) -> FeatureState {
        let mut state = self.clone();
        if position(&state.selectors, &selector).is_none() {
            state.selectors.push(selector);
        }
        state
    }

    /// Returns a copy where `old` is replaced by `new`, both in the selector list and in every
    /// mapping entry pointing at `old`.
    pub fn update_selector(
        &self,
        old: &SharedSelector,
        new: SharedSelector,
    ) -> Result<FeatureState> {
        let index = self.require(old)?;
        let mut state = self.clone();
        if Arc::ptr_eq(old, &new) {
            return Ok(state);
        }
        for mapped in state.selector_mapping.values_mut() {
            if Arc::ptr_eq(mapped, old) {
                *mapped = new.clone();
            }
        }
        match position(&state.selectors, &new) {
            // `new` was listed already; drop `old` instead of listing `new` twice.
            Some(_) => {
                state.selectors.remove(index);
            }
            None => state.selectors[index] = new,
        }
        Ok(state)
    }

    /// Returns a copy without `selector` and without the mapping entries pointing at it.
    pub fn remove_selector(&self, selector: &SharedSelector) -> Result<FeatureState> {
        let index = self.require(selector)?;
        let mut state = self.clone();
        state.selectors.remove(index);
        state
            .selector_mapping
            .retain(|_, mapped| !Arc::ptr_eq(mapped, selector));
        Ok(state)
    }

    /// Returns a copy mapping `key` to `selector`, listing the selector if needed.
    pub fn map_selector(&self, key: SegmentKey, selector: SharedSelector) -> Result<FeatureState> {
        check_key(&key, self.segments.len())?;
        let mut state = self.add_selector(selector.clone());
        state.selector_mapping.insert(key, selector);
        Ok(state)
    }

    /// Returns a copy without the mapping entry for `key`. Selectors stay listed.
    pub fn unmap(&self, key: &SegmentKey) -> FeatureState {
        let mut state = self.clone();
        state.selector_mapping.remove(key);
        state
    }

    /// Returns a copy segmented by `segments`. Labelled mapping entries no longer fit the new
    /// key shape and are dropped; the fallthrough is kept.
    pub fn with_segments(&self, segments: Vec<SharedSegment>) -> FeatureState {
        let mut state = self.clone();
        state.segments = segments;
        state.selector_mapping.retain(|key, _| key.is_none());
        state
    }

    /// Returns a copy attributed to `created_by`.
    pub fn with_created_by(&self, created_by: impl Into<Str>) -> FeatureState {
        let mut state = self.clone();
        state.created_by = created_by.into();
        state
    }

    /// Label `input` with every segment, in order.
    pub fn segment_key(&self, input: &[Value]) -> Result<Vec<Str>> {
        if self.segments.is_empty() {
            return Ok(Vec::new());
        }
        let value = first_input(input)?;
        self.segments
            .iter()
            .map(|segment| segment.segment(value))
            .collect()
    }

    /// Find the selector configured for `input`: the entry for its segmentation key, else the
    /// fallthrough, else `None`.
    pub fn find_selector(&self, input: &[Value]) -> Result<Option<SharedSelector>> {
        let key = Some(self.segment_key(input)?);
        Ok(self
            .selector_mapping
            .get(&key)
            .or_else(|| self.selector_mapping.get(&None))
            .cloned())
    }

    /// Flatten into the map appended to [`Storage`](crate::Storage).
    pub fn serialize(&self) -> Result<StateMap> {
        let mut data = StateMap::new();
        data.insert("version".to_owned(), SERIALIZER_VERSION.to_owned());

        let segmentation: Vec<&Str> = self.segments.iter().map(|s| s.name()).collect();
        data.insert(
            "segmentation".to_owned(),
            serde_json::to_string(&segmentation)?,
        );
        data.insert("created_by".to_owned(), self.created_by.to_string());

        for (index, selector) in self.selectors.iter().enumerate() {
            let record = SelectorRecord {
                type_name: selector.type_name().into(),
                data: Some(selector.serialize_data()?),
            };
            data.insert(selector_key(index), serde_json::to_string(&record)?);
        }

        for (key, selector) in &self.selector_mapping {
            let index = position(&self.selectors, selector).ok_or_else(|| {
                Error::InvalidState(format!("selector {:?} is not listed", selector.name()))
            })?;
            data.insert(
                format!("{SEGMENT_PREFIX}{}", serde_json::to_string(key)?),
                selector_key(index),
            );
        }

        Ok(data)
    }

    /// Rebuild a state from its serialized form, resolving segment and selector type names
    /// through `app`.
    pub fn deserialize(app: &App, data: &StateMap) -> Result<FeatureState> {
        let version = required(data, "version")?;
        if version != SERIALIZER_VERSION {
            return Err(Error::InvalidSerializerVersion {
                expected: SERIALIZER_VERSION,
                found: version.to_owned(),
            });
        }

        let segment_names: Vec<Str> = serde_json::from_str(required(data, "segmentation")?)?;
        let segments = segment_names
            .iter()
            .map(|name| app.get_segment(name))
            .collect::<Result<Vec<_>>>()?;

        let created_by = required(data, "created_by")?;

        // Selectors first, so that mapping entries can refer to them.
        let mut indexed = Vec::new();
        for (key, value) in data.range(SELECTOR_PREFIX.to_owned()..) {
            let Some(suffix) = key.strip_prefix(SELECTOR_PREFIX) else {
                break;
            };
            let index: usize = suffix
                .parse()
                .map_err(|_| Error::MalformedState(format!("invalid selector key {key:?}")))?;
            let record: SelectorRecord = serde_json::from_str(value)?;
            let factory = app.get_selector(&record.type_name)?;
            let selector_data = record.data.ok_or_else(|| {
                Error::MalformedState(format!("selector {key:?} has no data"))
            })?;
            indexed.push((index, key.as_str(), factory(app, selector_data)?));
        }
        indexed.sort_by_key(|(index, _, _)| *index);

        let mut selector_mapping = BTreeMap::new();
        for (key, value) in data.range(SEGMENT_PREFIX.to_owned()..) {
            let Some(suffix) = key.strip_prefix(SEGMENT_PREFIX) else {
                break;
            };
            let segment_key: SegmentKey = serde_json::from_str(suffix)?;
            let selector = indexed
                .iter()
                .find(|(_, name, _)| *name == value.as_str())
                .map(|(_, _, selector)| selector.clone())
                .ok_or_else(|| {
                    Error::MalformedState(format!("{key:?} refers to unknown {value:?}"))
                })?;
            selector_mapping.insert(segment_key, selector);
        }

        let selectors = indexed
            .into_iter()
            .map(|(_, _, selector)| selector)
            .collect();
        FeatureState::new(segments, selectors, selector_mapping, created_by)
    }

    fn require(&self, selector: &SharedSelector) -> Result<usize> {
        position(&self.selectors, selector).ok_or_else(|| {
            Error::InvalidState(format!(
                "selector {:?} is not part of this state",
                selector.name()
            ))
        })
    }
}

/// Two states are equal when they segment identically, list equivalent selectors in the same
/// order and map the same keys to the same selector positions.
impl PartialEq for FeatureState {
    fn eq(&self, other: &Self) -> bool {
        let segments_eq = self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.name() == b.name());
        let selectors_eq = self.selectors.len() == other.selectors.len()
            && self
                .selectors
                .iter()
                .zip(&other.selectors)
                .all(|(a, b)| selector::equivalent(&**a, &**b));
        let mapping_eq = self.selector_mapping.len() == other.selector_mapping.len()
            && self.selector_mapping.iter().all(|(key, selector)| {
                other.selector_mapping.get(key).map_or(false, |theirs| {
                    position(&self.selectors, selector) == position(&other.selectors, theirs)
                })
            });

        segments_eq && selectors_eq && mapping_eq && self.created_by == other.created_by
    }
}

fn position(selectors: &[SharedSelector], selector: &SharedSelector) -> Option<usize> {
    selectors.iter().position(|s| Arc::ptr_eq(s, selector))
}

fn selector_key(index: usize) -> String {
    format!("{SELECTOR_PREFIX}{index}")
}

fn check_key(key: &SegmentKey, segments: usize) -> Result<()> {
    match key {
        Some(labels) if labels.len() != segments => Err(Error::InvalidState(format!(
            "key {labels:?} has {} labels but the state has {segments} segments",
            labels.len()
        ))),
        _ => Ok(()),
    }
}

fn required<'a>(data: &'a StateMap, key: &str) -> Result<&'a str> {
    data.get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::MalformedState(format!("missing {key:?}")))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs::File, sync::Arc};

    use super::{FeatureState, SegmentKey, SERIALIZER_VERSION};
    use crate::{
        definition::{Definition, Implementation},
        segment::SharedSegment,
        selector::{Rollout, SharedSelector, Static, Weights},
        storage::StateMap,
        value::InputType,
        App, AppConfig, Error, Value,
    };

    const SEGMENT: &str = "tests.TestSegment";

    fn app() -> App {
        let app = AppConfig::memory().to_app().unwrap();
        app.segment(
            SEGMENT,
            Definition::builder()
                .implementation(
                    Implementation::builder("segment")
                        .input(InputType::String)
                        .func(|args: &[Value]| args[0].to_string()),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
        app
    }

    fn segment(app: &App) -> SharedSegment {
        app.get_segment(SEGMENT).unwrap()
    }

    fn rollout(app: &App) -> SharedSelector {
        Arc::new(Rollout::new("test.name", segment(app), Weights::new().with("0", 1)).unwrap())
    }

    fn key(label: &str) -> SegmentKey {
        Some(vec![label.into()])
    }

    fn feature_state(app: &App, key: SegmentKey) -> FeatureState {
        let selector = rollout(app);
        FeatureState::new(
            vec![segment(app)],
            vec![selector.clone()],
            BTreeMap::from([(key, selector)]),
            "foo@bar.baz",
        )
        .unwrap()
    }

    fn serialized_data(extra: &[(&str, &str)]) -> StateMap {
        let mut data = StateMap::from([
            ("version".to_owned(), SERIALIZER_VERSION.to_owned()),
            ("segmentation".to_owned(), format!(r#"["{SEGMENT}"]"#)),
            ("created_by".to_owned(), "foo@bar.baz".to_owned()),
            (
                "selector:0".to_owned(),
                format!(
                    r#"{{"type":"feats.Rollout","data":{{"name":"test.name","segment":"{SEGMENT}","weights":{{"0":1}}}}}}"#
                ),
            ),
            (r#"segment:["value_match"]"#.to_owned(), "selector:0".to_owned()),
        ]);
        for (k, v) in extra {
            data.insert((*k).to_owned(), (*v).to_owned());
        }
        data
    }

    #[test]
    fn serializes_data() {
        let app = app();
        assert_eq!(
            feature_state(&app, key("value_match")).serialize().unwrap(),
            serialized_data(&[])
        );
    }

    #[test]
    fn serializes_with_fallthrough() {
        let app = app();
        let mut expected = serialized_data(&[]);
        expected.remove(r#"segment:["value_match"]"#);
        expected.insert("segment:null".to_owned(), "selector:0".to_owned());

        assert_eq!(feature_state(&app, None).serialize().unwrap(), expected);
    }

    #[test]
    fn deserializes_data() {
        let app = app();
        let state = FeatureState::deserialize(&app, &serialized_data(&[])).unwrap();

        assert_eq!(state, feature_state(&app, key("value_match")));
        assert_eq!(state.created_by(), "foo@bar.baz");
        assert_eq!(state.segments()[0].name(), SEGMENT);
        assert_eq!(
            state.selector_mapping()[&key("value_match")].type_name(),
            Rollout::TYPE_NAME
        );
    }

    #[test]
    fn deserializes_fallthrough() {
        let app = app();
        let mut data = serialized_data(&[]);
        data.remove(r#"segment:["value_match"]"#);
        data.insert("segment:null".to_owned(), "selector:0".to_owned());

        let state = FeatureState::deserialize(&app, &data).unwrap();
        assert_eq!(state, feature_state(&app, None));
        assert!(state.selector_mapping().contains_key(&None));
    }

    #[test]
    fn round_trips_through_serialization() {
        let app = app();
        let rollout = rollout(&app);
        let fixed: SharedSelector = Arc::new(Static::new("pinned", "bar"));
        let state = FeatureState::initial("ops@example.com")
            .with_segments(vec![segment(&app)])
            .map_selector(key("a"), rollout.clone())
            .unwrap()
            .map_selector(key("b"), rollout)
            .unwrap()
            .map_selector(None, fixed.clone())
            .unwrap()
            .map_selector(key("c"), fixed)
            .unwrap();

        let data = state.serialize().unwrap();
        let restored = FeatureState::deserialize(&app, &data).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.selectors().len(), 2);
        assert!(Arc::ptr_eq(
            &restored.selector_mapping()[&key("a")],
            &restored.selector_mapping()[&key("b")]
        ));
        assert_eq!(restored.serialize().unwrap(), data);
    }

    #[test]
    fn deserializes_fixture_file() {
        let app = app();
        let data: StateMap =
            serde_json::from_reader(File::open("tests/data/state-v1.json").unwrap()).unwrap();
        let state = FeatureState::deserialize(&app, &data).unwrap();

        assert_eq!(state.created_by(), "ops@example.com");
        assert_eq!(state.selectors().len(), 2);
        assert_eq!(state.selector_mapping().len(), 2);
        let fallthrough = state.find_selector(&["unmapped".into()]).unwrap().unwrap();
        assert_eq!(fallthrough.select(&["unmapped".into()]).unwrap(), "bar");
        let mapped = state.find_selector(&["beta".into()]).unwrap().unwrap();
        assert_eq!(mapped.select(&["beta".into()]).unwrap(), "foo");
    }

    #[test]
    fn deserialize_raises_error_wrong_serializer_version() {
        let app = app();
        let result = FeatureState::deserialize(&app, &serialized_data(&[("version", "v0")]));
        assert!(matches!(
            result,
            Err(Error::InvalidSerializerVersion { found, .. }) if found == "v0"
        ));
    }

    #[test]
    fn raises_error_unknown_segment() {
        let app = app();
        let result = FeatureState::deserialize(
            &app,
            &serialized_data(&[("segmentation", r#"["unknown.path"]"#)]),
        );
        assert!(matches!(result, Err(Error::UnknownSegmentName(name)) if name == "unknown.path"));
    }

    #[test]
    fn raises_error_unknown_selector() {
        let app = app();
        let result = FeatureState::deserialize(
            &app,
            &serialized_data(&[("selector:0", r#"{"type": "some.wrong.path"}"#)]),
        );
        assert!(matches!(result, Err(Error::UnknownSelectorName(name)) if name == "some.wrong.path"));
    }

    #[test]
    fn dangling_mapping_is_malformed() {
        let app = app();
        let result = FeatureState::deserialize(
            &app,
            &serialized_data(&[(r#"segment:["other"]"#, "selector:7")]),
        );
        assert!(matches!(result, Err(Error::MalformedState(_))));
    }

    #[test]
    fn missing_version_is_malformed() {
        let app = app();
        let mut data = serialized_data(&[]);
        data.remove("version");
        assert!(matches!(
            FeatureState::deserialize(&app, &data),
            Err(Error::MalformedState(_))
        ));
    }

    #[test]
    fn find_selector_uses_key_then_fallthrough() {
        let app = app();
        let keyed: SharedSelector = Arc::new(Static::new("keyed", "foo"));
        let fallthrough: SharedSelector = Arc::new(Static::new("fallthrough", "bar"));
        let state = FeatureState::initial("t")
            .with_segments(vec![segment(&app)])
            .map_selector(key("match"), keyed.clone())
            .unwrap();

        let found = state.find_selector(&["match".into()]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &keyed));
        assert!(state.find_selector(&["other".into()]).unwrap().is_none());

        let state = state.map_selector(None, fallthrough.clone()).unwrap();
        let found = state.find_selector(&["other".into()]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &fallthrough));
    }

    #[test]
    fn unsegmented_state_maps_the_empty_key() {
        let selector: SharedSelector = Arc::new(Static::new("all", "bar"));
        let state = FeatureState::initial("t")
            .map_selector(Some(Vec::new()), selector.clone())
            .unwrap();
        let found = state.find_selector(&[]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &selector));
    }

    #[test]
    fn rejects_unlisted_selectors_and_bad_key_arity() {
        let app = app();
        let selector: SharedSelector = Arc::new(Static::new("s", "foo"));
        assert!(matches!(
            FeatureState::new(
                vec![segment(&app)],
                Vec::new(),
                BTreeMap::from([(key("a"), selector.clone())]),
                "t",
            ),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            FeatureState::initial("t").map_selector(key("a"), selector),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn mutators_never_touch_the_original() {
        let app = app();
        let original = feature_state(&app, key("value_match"));
        let snapshot = original.clone();
        let existing = original.selectors()[0].clone();
        let other: SharedSelector = Arc::new(Static::new("other", "bar"));

        let added = original.add_selector(other.clone());
        assert_eq!(added.selectors().len(), 2);
        assert_eq!(original, snapshot);
        assert_eq!(original.selectors().len(), 1);

        let updated = original.update_selector(&existing, other.clone()).unwrap();
        assert!(Arc::ptr_eq(
            &updated.selector_mapping()[&key("value_match")],
            &other
        ));
        assert_eq!(updated.selectors().len(), 1);
        assert!(Arc::ptr_eq(
            &original.selector_mapping()[&key("value_match")],
            &existing
        ));

        let removed = original.remove_selector(&existing).unwrap();
        assert!(removed.selectors().is_empty());
        assert!(removed.selector_mapping().is_empty());
        assert_eq!(original, snapshot);
        assert_eq!(original.selector_mapping().len(), 1);
    }

    #[test]
    fn update_propagates_to_every_mapping_entry() {
        let app = app();
        let old: SharedSelector = Arc::new(Static::new("old", "foo"));
        let kept: SharedSelector = Arc::new(Static::new("kept", "foo"));
        let new: SharedSelector = Arc::new(Static::new("new", "bar"));
        let state = FeatureState::initial("t")
            .with_segments(vec![segment(&app)])
            .map_selector(key("a"), old.clone())
            .unwrap()
            .map_selector(key("b"), old.clone())
            .unwrap()
            .map_selector(key("c"), kept.clone())
            .unwrap();

        let updated = state.update_selector(&old, new.clone()).unwrap();
        assert!(Arc::ptr_eq(&updated.selector_mapping()[&key("a")], &new));
        assert!(Arc::ptr_eq(&updated.selector_mapping()[&key("b")], &new));
        assert!(Arc::ptr_eq(&updated.selector_mapping()[&key("c")], &kept));

        let removed = updated.remove_selector(&new).unwrap();
        assert_eq!(removed.selector_mapping().len(), 1);
        assert!(removed.selector_mapping().contains_key(&key("c")));
    }

    #[test]
    fn editing_unknown_selector_is_an_error() {
        let state = FeatureState::initial("t");
        let stranger: SharedSelector = Arc::new(Static::new("stranger", "foo"));
        assert!(matches!(
            state.remove_selector(&stranger),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            state.update_selector(&stranger, stranger.clone()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn changing_segments_keeps_only_the_fallthrough() {
        let app = app();
        let state = feature_state(&app, key("value_match"))
            .map_selector(None, Arc::new(Static::new("all", "foo")))
            .unwrap();
        let resegmented = state.with_segments(Vec::new());
        assert_eq!(resegmented.selector_mapping().len(), 1);
        assert!(resegmented.selector_mapping().contains_key(&None));
    }
}
