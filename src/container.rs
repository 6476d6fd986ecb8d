//! Scoped capability resolution.
//!
//! [`Providers`] is the process-wide table mapping a type to how it is
//! obtained: a factory run once per scope, or a singleton shared by every
//! scope. A [`Container`] is the per-request view over that table which caches
//! what it constructs and forgets it all on [`Container::clear`]. A container
//! may also carry a context table consulted before the schema's own.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::ContainerError;

pub type Instance = Arc<dyn Any + Send + Sync>;

type FactoryFn = dyn Fn(&Container) -> anyhow::Result<Instance> + Send + Sync;

/// Constructs one instance of a type inside a scope.
#[derive(Clone)]
pub struct Factory {
    type_name: &'static str,
    build: Arc<FactoryFn>,
}

impl Factory {
    pub fn new<T, F>(build: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name::<T>(),
            build: Arc::new(move |container| {
                let value = build(container)?;
                Ok(Arc::new(value) as Instance)
            }),
        }
    }

    pub fn from_default<T>() -> Self
    where
        T: Default + Send + Sync + 'static,
    {
        Self::new(|_| Ok(T::default()))
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn build(&self, container: &Container) -> anyhow::Result<Instance> {
        (self.build)(container)
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[derive(Clone)]
enum Provider {
    Scoped(Factory),
    Singleton(Instance),
}

/// Table of everything a scope is able to resolve.
#[derive(Clone, Default)]
pub struct Providers {
    entries: HashMap<TypeId, (&'static str, Provider)>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory producing a fresh `T` for every scope.
    pub fn scoped<T, F>(&mut self, build: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert_factory(TypeId::of::<T>(), Factory::new(build))
    }

    /// Registers one `T` shared by every scope.
    pub fn singleton<T>(&mut self, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.entries.insert(
            TypeId::of::<T>(),
            (type_name::<T>(), Provider::Singleton(Arc::new(value))),
        );
        self
    }

    pub(crate) fn insert_factory(&mut self, id: TypeId, factory: Factory) -> &mut Self {
        self.entries
            .insert(id, (factory.type_name(), Provider::Scoped(factory)));
        self
    }

    /// Adds every entry of `other`, letting `other` win on conflicts.
    pub fn merge(&mut self, other: &Providers) {
        for (id, entry) in &other.entries {
            self.entries.insert(*id, entry.clone());
        }
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.values().map(|(name, _)| name))
            .finish()
    }
}

/// Per-scope instance cache over a [`Providers`] table.
pub struct Container {
    scope_id: u64,
    providers: Arc<Providers>,
    context: Option<Arc<Providers>>,
    instances: Mutex<Option<HashMap<TypeId, Instance>>>,
}

impl Container {
    pub fn new(scope_id: u64, providers: Arc<Providers>) -> Self {
        Self::with_context(scope_id, providers, None)
    }

    /// A container whose `context` entries shadow the schema providers.
    pub fn with_context(
        scope_id: u64,
        providers: Arc<Providers>,
        context: Option<Arc<Providers>>,
    ) -> Self {
        Self {
            scope_id,
            providers,
            context,
            instances: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Stores a value for this scope only, replacing any cached one.
    pub fn set<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(instances) = instances.as_mut() {
            instances.insert(TypeId::of::<T>(), Arc::new(value));
        }
    }

    /// Returns the value cached in this scope, without constructing anything.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        instances
            .as_ref()?
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|instance| instance.downcast::<T>().ok())
    }

    /// Returns the scope's `T`, constructing it on first use.
    pub fn resolve<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: Send + Sync + 'static,
    {
        self.resolve_any(TypeId::of::<T>(), type_name::<T>())?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                type_name: type_name::<T>(),
            })
    }

    /// Type-erased [`Container::resolve`].
    pub fn resolve_any(
        &self,
        id: TypeId,
        type_name: &'static str,
    ) -> Result<Instance, ContainerError> {
        {
            let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
            match instances.as_ref() {
                Some(instances) => {
                    if let Some(instance) = instances.get(&id) {
                        return Ok(instance.clone());
                    }
                }
                None => {
                    return Err(ContainerError::Released {
                        scope_id: self.scope_id,
                    })
                }
            }
        }

        let entry = self
            .context
            .as_ref()
            .and_then(|context| context.entries.get(&id))
            .or_else(|| self.providers.entries.get(&id));
        let factory = match entry {
            Some((_, Provider::Singleton(instance))) => return Ok(instance.clone()),
            Some((_, Provider::Scoped(factory))) => factory,
            None => return Err(ContainerError::MissingProvider { type_name }),
        };

        // Built outside the lock so factories may resolve their own dependencies.
        let built = factory
            .build(self)
            .map_err(|source| ContainerError::Construction { type_name, source })?;
        if (*built).type_id() != id {
            return Err(ContainerError::TypeMismatch { type_name });
        }

        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        match instances.as_mut() {
            Some(instances) => Ok(instances.entry(id).or_insert(built).clone()),
            None => Err(ContainerError::Released {
                scope_id: self.scope_id,
            }),
        }
    }

    /// Drops every cached instance; later resolutions fail.
    pub fn clear(&self) -> usize {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        instances.take().map(|cached| cached.len()).unwrap_or(0)
    }

    pub fn is_cleared(&self) -> bool {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("scope_id", &self.scope_id)
            .field("providers", &self.providers)
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counter(AtomicUsize);

    #[derive(Debug)]
    struct Service {
        counter: Arc<Counter>,
    }

    fn providers() -> Arc<Providers> {
        let mut providers = Providers::new();
        providers.singleton(Counter::default());
        providers.scoped(|container| {
            let counter = container.resolve::<Counter>()?;
            counter.0.fetch_add(1, Ordering::SeqCst);
            Ok(Service { counter })
        });
        Arc::new(providers)
    }

    #[test]
    fn test_scoped_instance_is_built_once_per_container() {
        let providers = providers();
        let container = Container::new(1, providers.clone());

        let a = container.resolve::<Service>().unwrap();
        let b = container.resolve::<Service>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.counter.0.load(Ordering::SeqCst), 1);

        let other = Container::new(2, providers);
        let c = other.resolve::<Service>().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&a.counter, &c.counter));
        assert_eq!(c.counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_provider() {
        let container = Container::new(1, Arc::new(Providers::new()));
        let err = container.resolve::<String>().unwrap_err();
        assert!(matches!(err, ContainerError::MissingProvider { .. }));
    }

    #[test]
    fn test_set_and_get_are_scope_local() {
        let providers = Arc::new(Providers::new());
        let first = Container::new(1, providers.clone());
        let second = Container::new(2, providers);

        first.set(String::from("first"));
        assert_eq!(first.get::<String>().as_deref().map(String::as_str), Some("first"));
        assert!(second.get::<String>().is_none());
    }

    #[test]
    fn test_clear_releases_instances() {
        let container = Container::new(7, providers());
        container.resolve::<Service>().unwrap();
        assert_eq!(container.clear(), 1);
        assert!(container.is_cleared());

        let err = container.resolve::<Service>().unwrap_err();
        assert!(matches!(err, ContainerError::Released { scope_id: 7 }));
    }

    #[test]
    fn test_context_shadows_providers() {
        let mut context = Providers::new();
        context.singleton(String::from("from context"));
        context.singleton(Counter::default());

        let mut base = Providers::new();
        base.singleton(String::from("from schema"));
        let base = Arc::new(base);

        let container = Container::with_context(1, base.clone(), Some(Arc::new(context)));
        assert_eq!(container.resolve::<String>().unwrap().as_str(), "from context");
        assert!(container.resolve::<Counter>().is_ok());

        let plain = Container::new(2, base);
        assert_eq!(plain.resolve::<String>().unwrap().as_str(), "from schema");
        assert!(plain.resolve::<Counter>().is_err());
    }

    #[test]
    fn test_failing_factory() {
        let mut providers = Providers::new();
        providers.scoped::<Service, _>(|_| Err(anyhow::anyhow!("no database")));
        let container = Container::new(1, Arc::new(providers));
        let err = container.resolve::<Service>().unwrap_err();
        assert!(err.to_string().contains("no database"));
    }
}
