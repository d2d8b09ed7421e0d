use std::sync::Arc;

use crate::{
    persister::{ExperimentPersister, MemoryPersister},
    selector::SelectorFactory,
    storage::{MemoryStorage, Storage},
    App, Result, Str,
};

/// Configuration for [`App`].
pub struct AppConfig {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) persisters: Vec<(Str, Arc<dyn ExperimentPersister>)>,
    pub(crate) selectors: Vec<(Str, SelectorFactory)>,
}

impl AppConfig {
    /// Create a configuration keeping feature states in `storage`.
    ///
    /// The in-process [`MemoryPersister`] is registered as `feats.MemoryPersister`.
    pub fn from_storage(storage: impl Storage + 'static) -> Self {
        AppConfig {
            storage: Arc::new(storage),
            persisters: vec![(
                MemoryPersister::NAME.into(),
                Arc::new(MemoryPersister::new()),
            )],
            selectors: Vec::new(),
        }
    }

    /// Create a configuration keeping everything in process memory.
    ///
    /// ```
    /// # use feats::AppConfig;
    /// let app = AppConfig::memory().to_app().unwrap();
    /// ```
    pub fn memory() -> Self {
        AppConfig::from_storage(MemoryStorage::new())
    }

    /// Register a persister that experiments can refer to by `name`.
    ///
    /// ```
    /// # use feats::{AppConfig, MemoryPersister};
    /// let mut config = AppConfig::memory();
    /// config.persister("checkout.Assignments", MemoryPersister::new());
    /// let app = config.to_app().unwrap();
    /// assert!(app.get_persister("checkout.Assignments").is_ok());
    /// ```
    pub fn persister(
        &mut self,
        name: impl Into<Str>,
        persister: impl ExperimentPersister + 'static,
    ) -> &mut Self {
        self.persisters.push((name.into(), Arc::new(persister)));
        self
    }

    /// Register a custom selector type. `factory` rebuilds the selector from its stored data.
    pub fn selector(&mut self, name: impl Into<Str>, factory: SelectorFactory) -> &mut Self {
        self.selectors.push((name.into(), factory));
        self
    }

    /// Create a new [`App`] using the specified configuration.
    ///
    /// Fails if a persister or selector was given an invalid or duplicate name.
    pub fn to_app(self) -> Result<App> {
        App::new(self)
    }
}
