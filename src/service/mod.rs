//! service contracts: capabilities, explicit dependency declarations and factories.
//!
//! A capability type is identified by a `ServiceType`, built from any `'static` type,
//! concrete structs and `dyn Trait` objects alike. Implementations list the capability
//! types they fulfill and the capability types they depend on in a `ServiceDescriptor`;
//! the locator uses those lists in place of runtime type introspection.

pub mod locator;
pub mod map;

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::Result;
pub use locator::{DependencySet, ServiceLocator};
pub use map::ServiceMap;

/// converts a shared service into `Any` so callers can recover the concrete type
pub trait AsAny {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Clone, Copy)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
    plural: bool,
}

impl ServiceType {
    /// a singular capability: at most one instance may be registered under it
    pub fn of<T: ?Sized + 'static>() -> ServiceType {
        ServiceType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            plural: false,
        }
    }

    /// a plural capability: any number of distinct instances, kept in registration order
    pub fn plural<T: ?Sized + 'static>() -> ServiceType {
        ServiceType {
            plural: true,
            ..ServiceType::of::<T>()
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_plural(&self) -> bool {
        self.plural
    }

    /// the root marker every service implicitly carries; never registered under
    pub(crate) fn root() -> ServiceType {
        ServiceType::of::<dyn Service>()
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.plural {
            write!(f, "{}(plural)", self.name)
        } else {
            f.write_str(self.name)
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// What a service implementation is and what it needs.
///
/// `capabilities` and `dependencies` are expected to already contain the transitive
/// closure for the implementation: everything it fulfills and everything it needs.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    service_type: ServiceType,
    capabilities: Vec<ServiceType>,
    dependencies: Vec<ServiceType>,
}

impl ServiceDescriptor {
    pub fn new(service_type: ServiceType) -> ServiceDescriptor {
        ServiceDescriptor {
            service_type,
            capabilities: vec![],
            dependencies: vec![],
        }
    }

    pub fn implements(mut self, capability: ServiceType) -> Self {
        if capability != self.service_type && !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn depends_on(mut self, dependency: ServiceType) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn dependencies(&self) -> &[ServiceType] {
        &self.dependencies
    }

    /// the concrete type followed by every declared capability, minus the root marker
    pub fn types(&self) -> impl Iterator<Item = ServiceType> + '_ {
        let root = ServiceType::root();
        std::iter::once(self.service_type)
            .chain(self.capabilities.iter().copied())
            .filter(move |t| *t != root)
    }

    pub fn is_assignable_to(&self, capability: &ServiceType) -> bool {
        self.types().any(|t| t == *capability)
    }
}

/// read access to the registered services, handed to `Service::start`
pub trait ServiceProvider {
    fn services_of(&self, service_type: &ServiceType) -> Vec<Arc<dyn Service>>;
}

/// the first registered instance of the concrete service type `T`
pub fn lookup<T: Service>(provider: &dyn ServiceProvider) -> Option<Arc<T>> {
    provider
        .services_of(&ServiceType::of::<T>())
        .into_iter()
        .find_map(|service| service.into_any().downcast::<T>().ok())
}

pub trait Service: AsAny + Send + Sync + 'static {
    fn descriptor(&self) -> ServiceDescriptor;

    fn start(&self, provider: &dyn ServiceProvider) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

/// configuration handed to exactly one factory to create a service
pub trait ServiceCreationConfiguration: Any + Send + Sync + fmt::Debug {
    fn service_type(&self) -> ServiceType;

    fn as_any(&self) -> &dyn Any;
}

pub trait ServiceFactory: Send + Sync {
    /// the descriptor of the services this factory produces
    fn descriptor(&self) -> ServiceDescriptor;

    /// factories that need configuration are never used for bare lookups
    fn requires_configuration(&self) -> bool {
        false
    }

    fn accepts(&self, _config: &dyn ServiceCreationConfiguration) -> bool {
        true
    }

    fn create(&self, config: Option<&dyn ServiceCreationConfiguration>) -> Result<Arc<dyn Service>>;
}

/// the registered factories a `DependencySet` discovers services from
#[derive(Clone, Default)]
pub struct ServiceFactories {
    factories: Vec<Arc<dyn ServiceFactory>>,
}

impl fmt::Debug for ServiceFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|f| f.descriptor().service_type()))
            .finish()
    }
}

impl ServiceFactories {
    pub fn new() -> ServiceFactories {
        ServiceFactories::default()
    }

    /// the factories for the services this crate ships
    pub fn with_defaults() -> ServiceFactories {
        let mut factories = ServiceFactories::new();
        factories.register(Arc::new(crate::execution::ExecutionServiceFactory));
        factories.register(Arc::new(crate::write_behind::WriteBehindProviderFactory));
        factories
    }

    pub fn register(&mut self, factory: Arc<dyn ServiceFactory>) -> &mut Self {
        self.factories.push(factory);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ServiceFactory>> {
        self.factories.iter()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// identity comparison; two handles are the same service only if they point at the same instance
pub(crate) fn same_service(a: &Arc<dyn Service>, b: &Arc<dyn Service>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
