use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use regex::Regex;

use crate::{
    definition::{Definition, Implementation, ImplementationBuilder},
    feature::Feature,
    persister::ExperimentPersister,
    segment::{Segment, SharedSegment},
    selector::{
        DefaultSelector, Experiment, Rollout, Selector, SelectorFactory, SharedSelector, Static,
    },
    state::FeatureState,
    storage::{EntryId, Storage},
    value::InputType,
    AppConfig, Error, Result, Str, Value,
};

/// Registry of features, segments, selector types and persisters, backed by a [`Storage`]
/// holding the state history of every feature.
///
/// `App` is cheap to clone; clones share registries and storage.
///
/// # Examples
/// ```
/// # use feats::{AppConfig, Definition, Implementation, InputType, Value};
/// let app = AppConfig::memory().to_app().unwrap();
/// let greeting = app
///     .feature(
///         "demo.Greeting",
///         Definition::builder()
///             .implementation(
///                 Implementation::builder("formal")
///                     .input(InputType::String)
///                     .default()
///                     .func(|args: &[Value]| format!("Good day, {}", args[0])),
///             )
///             .implementation(
///                 Implementation::builder("casual")
///                     .input(InputType::String)
///                     .func(|args: &[Value]| format!("Hey {}", args[0])),
///             )
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// assert_eq!(greeting.create(&["Ada".into()]).unwrap(), "Good day, Ada");
/// ```
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    storage: Arc<dyn Storage>,
    features: Registry<Arc<dyn FeatureInfo>>,
    segments: Registry<SharedSegment>,
    selectors: Registry<SelectorFactory>,
    persisters: Registry<Arc<dyn ExperimentPersister>>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("features", &self.inner.features.names())
            .field("segments", &self.inner.segments.names())
            .field("selectors", &self.inner.selectors.names())
            .field("persisters", &self.inner.persisters.names())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Create a new `App` using the specified configuration. Built-in selector types are always
    /// registered.
    pub fn new(config: AppConfig) -> Result<App> {
        let app = App {
            inner: Arc::new(AppInner {
                storage: config.storage,
                features: Registry::new("feature"),
                segments: Registry::new("segment"),
                selectors: Registry::new("selector"),
                persisters: Registry::new("persister"),
            }),
        };

        app.register_selector(Static::TYPE_NAME, Static::from_data)?;
        app.register_selector(Rollout::TYPE_NAME, Rollout::from_data)?;
        app.register_selector(Experiment::TYPE_NAME, Experiment::from_data)?;
        for (name, factory) in config.selectors {
            app.register_selector(name, factory)?;
        }
        for (name, persister) in config.persisters {
            app.register_persister(name, persister)?;
        }

        Ok(app)
    }

    /// Register a feature under `name`, returning a handle used to evaluate and configure it.
    pub fn feature<O: 'static>(
        &self,
        name: impl Into<Str>,
        definition: Definition<O>,
    ) -> Result<FeatureHandle<O>> {
        let name = name.into();
        let registered = Arc::new(RegisteredFeature {
            name: name.clone(),
            feature: Feature::new(definition)?,
        });
        self.inner
            .features
            .insert(name.clone(), registered.clone() as Arc<dyn FeatureInfo>)?;

        log::debug!(target: "feats",
                    feature = name,
                    default = registered.feature.default_implementation().name();
                    "registered feature");

        Ok(FeatureHandle {
            app: self.clone(),
            registered,
        })
    }

    /// Register an on/off feature. `predicate` becomes the `Default` implementation next to
    /// `Enabled` and `Disabled`.
    pub fn boolean(
        &self,
        name: impl Into<Str>,
        predicate: ImplementationBuilder<bool>,
    ) -> Result<FeatureHandle<bool>> {
        self.feature(name, Definition::boolean(predicate)?)
    }

    /// Register a segment under `name`.
    pub fn segment(
        &self,
        name: impl Into<Str>,
        definition: Definition<String>,
    ) -> Result<SharedSegment> {
        let segment = Arc::new(Segment::new(name, definition)?);
        self.inner
            .segments
            .insert(segment.name().clone(), segment.clone())?;

        log::debug!(target: "feats", segment = segment.name(); "registered segment");
        Ok(segment)
    }

    /// The segment registered under `name`.
    pub fn get_segment(&self, name: &str) -> Result<SharedSegment> {
        self.inner
            .segments
            .get(name)
            .ok_or_else(|| Error::UnknownSegmentName(name.into()))
    }

    /// All registered segments, ordered by name.
    pub fn segments(&self) -> Vec<SharedSegment> {
        self.inner.segments.values()
    }

    /// Register a selector type. `factory` rebuilds selectors of this type from stored data.
    pub fn register_selector(&self, name: impl Into<Str>, factory: SelectorFactory) -> Result<()> {
        let name = name.into();
        self.inner.selectors.insert(name.clone(), factory)?;
        log::debug!(target: "feats", selector = name; "registered selector type");
        Ok(())
    }

    /// The factory of the selector type registered under `name`.
    pub fn get_selector(&self, name: &str) -> Result<SelectorFactory> {
        self.inner
            .selectors
            .get(name)
            .ok_or_else(|| Error::UnknownSelectorName(name.into()))
    }

    /// Register a persister that experiments can refer to by `name`.
    pub fn register_persister(
        &self,
        name: impl Into<Str>,
        persister: Arc<dyn ExperimentPersister>,
    ) -> Result<()> {
        let name = name.into();
        self.inner.persisters.insert(name.clone(), persister)?;
        log::debug!(target: "feats", persister = name; "registered persister");
        Ok(())
    }

    /// The persister registered under `name`.
    pub fn get_persister(&self, name: &str) -> Result<Arc<dyn ExperimentPersister>> {
        self.inner
            .persisters
            .get(name)
            .ok_or_else(|| Error::UnknownPersisterName(name.into()))
    }

    /// The feature registered under `name`, type-erased.
    pub fn get_feature(&self, name: &str) -> Result<Arc<dyn FeatureInfo>> {
        self.inner
            .features
            .get(name)
            .ok_or_else(|| Error::UnknownFeatureName(name.into()))
    }

    /// All registered features, ordered by name.
    pub fn features(&self) -> Vec<Arc<dyn FeatureInfo>> {
        self.inner.features.values()
    }

    /// Append `state` to the history of the feature registered under `name`.
    pub fn configure_feature(&self, name: &str, state: &FeatureState) -> Result<EntryId> {
        let feature = self.get_feature(name)?;
        self.append_state(&*feature, state)
    }

    /// Where feature states are kept.
    pub fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    /// The last state appended for `feature`, or `None` if it was never configured.
    fn load_state(&self, feature: &str) -> Result<Option<FeatureState>> {
        let Some(data) = self.storage().last(feature)? else {
            return Ok(None);
        };
        FeatureState::deserialize(self, &data)
            .inspect_err(|err| {
                log::warn!(target: "feats", feature; "failed to load feature state: {err}");
            })
            .map(Some)
    }

    fn append_state(&self, feature: &dyn FeatureInfo, state: &FeatureState) -> Result<EntryId> {
        if let Some(segment) = state
            .segments()
            .iter()
            .find(|segment| !feature.accepts_segment(segment))
        {
            return Err(Error::InvalidState(format!(
                "segment {:?} cannot segment the inputs of feature {:?}",
                segment.name(),
                feature.name()
            )));
        }

        // Anything appended must load back, so every segment, selector type and persister it
        // names has to be registered with this app.
        let data = state.serialize()?;
        FeatureState::deserialize(self, &data)?;

        let id = self.storage().append(feature.name(), data)?;
        log::debug!(target: "feats",
                    feature = feature.name(),
                    entry = id,
                    created_by = state.created_by();
                    "appended feature state");
        Ok(id)
    }
}

/// Type-erased view of a registered feature, for listing and administration.
pub trait FeatureInfo: Send + Sync {
    /// Qualified name the feature is registered under.
    fn name(&self) -> &Str;

    /// Free-form description from the definition.
    fn description(&self) -> Option<&Str>;

    /// Declared inputs, shared by every implementation.
    fn input_types(&self) -> &[InputType];

    /// Name of the Rust type implementations return.
    fn output_type(&self) -> &'static str;

    /// Names of all implementations, sorted.
    fn implementation_names(&self) -> Vec<Str>;

    /// Name of the implementation used when nothing else is configured.
    fn default_implementation(&self) -> &Str;

    /// Whether `segment` can label the inputs of this feature. Only features taking exactly one
    /// input can be segmented, and only by segments declaring that input type.
    fn accepts_segment(&self, segment: &Segment) -> bool {
        match self.input_types() {
            [input_type] => segment.declares(input_type),
            _ => false,
        }
    }
}

struct RegisteredFeature<O> {
    name: Str,
    feature: Feature<O>,
}

impl<O> FeatureInfo for RegisteredFeature<O> {
    fn name(&self) -> &Str {
        &self.name
    }

    fn description(&self) -> Option<&Str> {
        self.feature.description()
    }

    fn input_types(&self) -> &[InputType] {
        self.feature.input_types()
    }

    fn output_type(&self) -> &'static str {
        self.feature.default_implementation().output_type()
    }

    fn implementation_names(&self) -> Vec<Str> {
        self.feature.implementations().keys().cloned().collect()
    }

    fn default_implementation(&self) -> &Str {
        self.feature.default_implementation().name()
    }
}

/// Handle to a registered feature, used to evaluate it and to read or append its states.
pub struct FeatureHandle<O> {
    app: App,
    registered: Arc<RegisteredFeature<O>>,
}

impl<O> Clone for FeatureHandle<O> {
    fn clone(&self) -> Self {
        FeatureHandle {
            app: self.app.clone(),
            registered: self.registered.clone(),
        }
    }
}

impl<O> fmt::Debug for FeatureHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureHandle")
            .field("name", &self.registered.name)
            .field("feature", &self.registered.feature)
            .finish()
    }
}

impl<O> FeatureHandle<O> {
    /// Qualified name the feature is registered under.
    pub fn name(&self) -> &Str {
        &self.registered.name
    }

    /// The registered feature and its implementations.
    pub fn feature(&self) -> &Feature<O> {
        &self.registered.feature
    }

    /// The current state, or `None` if the feature was never configured.
    pub fn state(&self) -> Result<Option<FeatureState>> {
        self.app.load_state(self.name())
    }

    /// Append `state` to the history of this feature. It becomes the current state.
    pub fn set_state(&self, state: &FeatureState) -> Result<EntryId> {
        self.app.append_state(&*self.registered, state)
    }

    /// Every state ever appended, oldest first.
    pub fn history(&self) -> Result<Vec<FeatureState>> {
        self.app
            .storage()
            .history(self.name())?
            .map(|data| FeatureState::deserialize(&self.app, &data))
            .collect()
    }

    /// The selector deciding calls with `input`. Falls back to one returning the default
    /// implementation when the feature has no state or nothing is mapped for `input`.
    pub fn find_selector(&self, input: &[Value]) -> Result<SharedSelector> {
        let configured = match self.state()? {
            Some(state) => state.find_selector(input)?,
            None => None,
        };
        Ok(configured.unwrap_or_else(|| {
            Arc::new(DefaultSelector::new(
                self.feature().default_implementation().name().clone(),
            ))
        }))
    }

    /// The implementation a call with `input` would use. Selectors are not told about the
    /// choice.
    pub fn find(&self, input: &[Value]) -> Result<&Implementation<O>> {
        let selector = self.find_selector(input)?;
        self.select(&*selector, input)
    }

    /// Evaluate the feature: pick an implementation for `input` and call it.
    pub fn create(&self, input: &[Value]) -> Result<O> {
        self.try_create(input).inspect_err(|err| {
            log::warn!(target: "feats",
                       feature = self.name();
                       "error occurred while evaluating a feature: {err}");
        })
    }

    /// Registered segments able to label the input of this feature.
    pub fn valid_segments(&self) -> Vec<SharedSegment> {
        self.app
            .segments()
            .into_iter()
            .filter(|segment| self.registered.accepts_segment(segment))
            .collect()
    }

    fn try_create(&self, input: &[Value]) -> Result<O> {
        self.feature()
            .default_implementation()
            .check_arguments(input)?;

        let selector = self.find_selector(input)?;
        let implementation = self.select(&*selector, input)?;
        selector.used_implementation(implementation.name(), input)?;

        log::trace!(target: "feats",
                    feature = self.name(),
                    selector = selector.name(),
                    implementation = implementation.name();
                    "selected implementation");

        Ok(implementation.call(input))
    }

    fn select(
        &self,
        selector: &dyn Selector,
        input: &[Value],
    ) -> Result<&Implementation<O>> {
        let name = selector.select(input)?;
        self.feature()
            .get(&name)
            .ok_or_else(|| Error::UnknownImplementation {
                feature: self.name().clone(),
                implementation: name,
            })
    }
}

/// Name-keyed registry with unique, validated names.
struct Registry<T> {
    kind: &'static str,
    entries: RwLock<BTreeMap<Str, T>>,
}

impl<T: Clone> Registry<T> {
    fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert(&self, name: Str, value: T) -> Result<()> {
        validate_name(&name)?;
        // Entries are inserted whole, so a poisoned map is still consistent.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(name) {
            Entry::Occupied(entry) => Err(Error::DuplicateName {
                kind: self.kind,
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    fn get(&self, name: &str) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).cloned()
    }

    fn values(&self) -> Vec<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().cloned().collect()
    }

    fn names(&self) -> Vec<Str> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }
}

/// Qualified names are dotted identifiers with at least one namespace, e.g. `checkout.NewFlow`.
fn validate_name(name: &Str) -> Result<()> {
    static QUALIFIED_NAME: OnceLock<Regex> = OnceLock::new();
    let pattern = QUALIFIED_NAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)+$")
            .expect("qualified name pattern should compile")
    });
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.clone()))
    }
}
