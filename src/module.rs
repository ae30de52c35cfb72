//! Pluggable service modules and the catalog that builds them by kind.
//!
//! Which modules run is decided by configuration: each entry names a kind
//! that must exist in the [`ModuleCatalog`], plus a settings table handed to
//! the kind's factory.

use std::collections::HashMap;

use crate::config::ModuleSpec;
use crate::engine::{Controller, ControllerConfig};
use crate::error::{Error, Result};

pub trait ServiceModule: Send + Sync {
    fn name(&self) -> &str;

    /// Called once at startup, before workers run. Registers events and
    /// agents.
    fn module_init(&self, _controller: &Controller, _config: &ControllerConfig) -> Result<()> {
        Err(Error::HookAbsent("module_init"))
    }

    /// Called after every module's `module_init` has run.
    fn init_complete(&self, _controller: &Controller, _config: &ControllerConfig) -> Result<()> {
        Err(Error::HookAbsent("init_complete"))
    }
}

pub type ModuleFactory = fn(&toml::Table) -> Result<Box<dyn ServiceModule>>;

/// Kind name to factory.
#[derive(Default)]
pub struct ModuleCatalog {
    factories: HashMap<&'static str, ModuleFactory>,
}

impl ModuleCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog of the modules shipped with this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register(
            crate::modules::health::KIND,
            crate::modules::health::HealthMonitor::from_settings,
        );
        catalog
    }

    pub fn register(&mut self, kind: &'static str, factory: ModuleFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn build(&self, spec: &ModuleSpec) -> Result<Box<dyn ServiceModule>> {
        let factory = self
            .factories
            .get(spec.kind.as_str())
            .ok_or_else(|| Error::UnknownModule(spec.kind.clone()))?;
        factory(&spec.settings)
    }

    pub fn build_all(&self, specs: &[ModuleSpec]) -> Result<Vec<Box<dyn ServiceModule>>> {
        specs.iter().map(|spec| self.build(spec)).collect()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}
