//! Named route factories.
//!
//! The host application lists the routers it ships as named factories.
//! Directory discovery (see [`EndpointManager::load`]) selects factories by
//! file stem; [`EndpointManager::load_manifest`] instantiates all of them.
//!
//! [`EndpointManager::load`]: crate::routing::manager::EndpointManager::load
//! [`EndpointManager::load_manifest`]: crate::routing::manager::EndpointManager::load_manifest

use std::fmt;
use std::sync::Arc;

use crate::routing::annotations::RouteRegistry;
use crate::routing::endpoint::{BoxError, Endpoint};
use crate::routing::router::RouteSource;

/// A router instance together with its declared endpoints, ready to register.
pub struct MountedRouter {
    pub source: Arc<dyn RouteSource>,
    pub declared: Vec<Endpoint>,
}

impl MountedRouter {
    /// Bind `instance`'s declared routes from `registry`.
    pub fn new<R: RouteSource>(registry: &RouteRegistry, instance: Arc<R>) -> Self {
        let declared = registry.get_route_references(&instance);
        Self {
            source: instance,
            declared,
        }
    }

    pub fn prefix(&self) -> &str {
        self.source.prefix()
    }
}

type Factory = Arc<dyn Fn(&RouteRegistry) -> Result<MountedRouter, BoxError> + Send + Sync>;

/// Ordered list of named router factories.
#[derive(Clone, Default)]
pub struct RouteManifest {
    entries: Vec<(String, Factory)>,
}

impl RouteManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. Re-using a name replaces the earlier entry in place.
    pub fn register<R, F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        R: RouteSource,
        F: Fn() -> Result<R, BoxError> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |registry: &RouteRegistry| {
            let instance = Arc::new(factory()?);
            Ok(MountedRouter::new(registry, instance))
        });
        self.insert(name, factory);
        self
    }

    /// Register a type built with `Default`.
    pub fn register_default<R: RouteSource + Default>(&mut self, name: &str) -> &mut Self {
        self.register(name, || Ok(R::default()))
    }

    /// Register an already constructed router; every load shares this instance.
    pub fn register_instance<R: RouteSource>(&mut self, name: &str, instance: Arc<R>) -> &mut Self {
        let factory: Factory = Arc::new(move |registry: &RouteRegistry| Ok(MountedRouter::new(registry, Arc::clone(&instance))));
        self.insert(name, factory);
        self
    }

    /// Build the router registered under `name`, if any.
    pub fn instantiate(&self, name: &str, registry: &RouteRegistry) -> Option<Result<MountedRouter, BoxError>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, factory)| factory(registry))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(entry, _)| entry == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: &str, factory: Factory) {
        match self.entries.iter_mut().find(|(entry, _)| entry == name) {
            Some(slot) => slot.1 = factory,
            None => self.entries.push((name.to_string(), factory)),
        }
    }
}

impl fmt::Debug for RouteManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
