/// dependency resolution and ordered start/stop of a service set
///
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::*;
use parking_lot::Mutex;

use super::{
    same_service, Service, ServiceCreationConfiguration, ServiceDescriptor, ServiceFactories,
    ServiceFactory, ServiceMap, ServiceProvider, ServiceType,
};
use crate::error::{CacheError, Result};

/// The declared inputs of a service set: provided instances, creation configurations
/// and bare capability requests, resolved against a set of factories by `build()`.
#[derive(Default)]
pub struct DependencySet {
    provided: Vec<Arc<dyn Service>>,
    configurations: Vec<Arc<dyn ServiceCreationConfiguration>>,
    requested: Vec<ServiceType>,
    factories: ServiceFactories,
}

impl fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencySet")
            .field("provided", &self.provided.len())
            .field("configurations", &self.configurations)
            .field("requested", &self.requested)
            .field("factories", &self.factories)
            .finish()
    }
}

impl DependencySet {
    pub fn new(factories: ServiceFactories) -> DependencySet {
        DependencySet {
            factories,
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.provided.push(service);
        self
    }

    pub fn with_configuration(mut self, config: Arc<dyn ServiceCreationConfiguration>) -> Self {
        self.configurations.push(config);
        self
    }

    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.requested.push(service_type);
        self
    }

    pub fn build(self) -> Result<ServiceLocator> {
        let mut provided = ServiceMap::new();
        provided.add_all(self.provided.iter().cloned())?;

        let resolver = Resolver {
            provided,
            factories: &self.factories,
        };

        // configured services resolve first so later dependency lookups find them
        let mut resolved = ServiceMap::new();
        for config in self.configurations.iter() {
            let wanted = config.service_type();
            let candidates: Vec<&Arc<dyn ServiceFactory>> = self
                .factories
                .iter()
                .filter(|f| f.descriptor().is_assignable_to(&wanted))
                .filter(|f| f.accepts(config.as_ref()))
                .collect();

            if candidates.is_empty() {
                return Err(CacheError::NoFactory(wanted.name().to_string()));
            }
            if candidates.len() > 1 && !wanted.is_plural() {
                return Err(CacheError::AmbiguousFactory {
                    service: wanted.name().to_string(),
                    candidates: factory_names(candidates.iter().copied()),
                });
            }

            for factory in candidates {
                resolved = resolver.lookup_dependencies_of(resolved, &factory.descriptor())?;
                resolved.add(factory.create(Some(config.as_ref()))?)?;
            }
        }

        for service in self.provided.iter() {
            resolved = resolver.lookup_dependencies_of(resolved, &service.descriptor())?;
            resolved.add(service.clone())?;
        }

        for requested in self.requested.iter() {
            if !resolved.contains(requested) {
                resolved = resolver.lookup_service(resolved, requested)?;
            }
        }

        debug!("resolved {} services", resolved.len());
        Ok(ServiceLocator::new(resolved))
    }
}

struct Resolver<'a> {
    provided: ServiceMap,
    factories: &'a ServiceFactories,
}

impl<'a> Resolver<'a> {
    fn lookup_dependencies_of(
        &self,
        mut resolved: ServiceMap,
        descriptor: &ServiceDescriptor,
    ) -> Result<ServiceMap> {
        for dependency in descriptor.dependencies() {
            resolved = self.lookup_service(resolved, dependency)?;
        }
        Ok(resolved)
    }

    /// Resolves `requested` on a copy of `resolved`; the input is only replaced on success.
    fn lookup_service(&self, resolved: ServiceMap, requested: &ServiceType) -> Result<ServiceMap> {
        if resolved.contains(requested) && !requested.is_plural() {
            return Ok(resolved);
        }

        let mut resolved = {
            let mut copy = resolved.clone();
            match copy.add_all(self.provided.get(requested)) {
                Ok(_) => copy,
                Err(e) => {
                    return Err(CacheError::Dependency {
                        service: requested.name().to_string(),
                        reason: format!("failed to resolve provided services: {}", e),
                    })
                }
            }
        };
        if resolved.contains(requested) && !requested.is_plural() {
            return Ok(resolved);
        }

        let candidates = self.discover(&resolved, requested);
        if candidates.len() > 1 && !requested.is_plural() {
            return Err(CacheError::Dependency {
                service: requested.name().to_string(),
                reason: format!(
                    "multiple factories for non-plural service: {:?}",
                    factory_names(candidates.iter().copied())
                ),
            });
        }

        for factory in candidates.iter() {
            let descriptor = factory.descriptor();
            if resolved.contains(&descriptor.service_type()) {
                continue;
            }

            let mut attempt = match self.lookup_dependencies_of(resolved.clone(), &descriptor) {
                Ok(attempt) => attempt,
                Err(e) => {
                    debug!(
                        "skipping {} for {}: {}",
                        descriptor.service_type(),
                        requested,
                        e
                    );
                    continue;
                }
            };

            attempt.add(factory.create(None)?)?;
            resolved = attempt;
        }

        if resolved.contains(requested) {
            Ok(resolved)
        } else {
            Err(CacheError::Dependency {
                service: requested.name().to_string(),
                reason: format!(
                    "failed to find provider with satisfied dependency set, candidates: {:?}",
                    factory_names(candidates.iter().copied())
                ),
            })
        }
    }

    fn discover(&self, resolved: &ServiceMap, requested: &ServiceType) -> Vec<&'a Arc<dyn ServiceFactory>> {
        self.factories
            .iter()
            .filter(|f| !f.requires_configuration())
            .filter(|f| {
                let descriptor = f.descriptor();
                let produced = descriptor.service_type();
                descriptor.is_assignable_to(requested)
                    && !self.provided.contains(&produced)
                    && !resolved.contains(&produced)
            })
            .collect()
    }
}

fn factory_names<'f, I>(factories: I) -> Vec<String>
where
    I: Iterator<Item = &'f Arc<dyn ServiceFactory>>,
{
    factories
        .map(|f| f.descriptor().service_type().name().to_string())
        .collect()
}

/// A resolved service set that starts and stops its services in dependency order.
pub struct ServiceLocator {
    services: ServiceMap,
    running: AtomicBool,
    running_lock: Mutex<()>,
}

impl fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("services", &self.services)
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

impl ServiceProvider for ServiceLocator {
    fn services_of(&self, service_type: &ServiceType) -> Vec<Arc<dyn Service>> {
        self.services.get(service_type)
    }
}

impl ServiceLocator {
    pub fn dependency_set(factories: ServiceFactories) -> DependencySet {
        DependencySet::new(factories)
    }

    fn new(services: ServiceMap) -> ServiceLocator {
        ServiceLocator {
            services,
            running: AtomicBool::new(false),
            running_lock: Mutex::new(()),
        }
    }

    pub fn services(&self) -> &ServiceMap {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts every service after its dependencies; a failure stops the ones already
    /// started, in reverse order, and is then returned.
    pub fn start_all_services(&self) -> Result<()> {
        let _guard = self.running_lock.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CacheError::AlreadyStarted);
        }

        let result = start_in_order(&self.services, |service| service.start(self));
        if result.is_err() {
            self.running.store(false, Ordering::Release);
        }
        result
    }

    /// Stops every service once nothing still running depends on it. Every service gets
    /// a chance to stop; the first failure is returned after the sweep.
    pub fn stop_all_services(&self) -> Result<()> {
        let _guard = self.running_lock.lock();
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CacheError::AlreadyStopped);
        }

        stop_in_order(&self.services, |service| service.stop())
    }
}

fn contains(list: &[Arc<dyn Service>], service: &Arc<dyn Service>) -> bool {
    list.iter().any(|s| same_service(s, service))
}

fn names(list: &[Arc<dyn Service>]) -> Vec<String> {
    list.iter()
        .map(|s| s.descriptor().service_type().name().to_string())
        .collect()
}

/// the registered services `service` directly depends on
fn dependencies_of(services: &ServiceMap, service: &Arc<dyn Service>) -> Vec<Arc<dyn Service>> {
    let mut dependencies: Vec<Arc<dyn Service>> = vec![];
    for dependency_type in service.descriptor().dependencies() {
        for dependency in services.get(dependency_type) {
            if !same_service(&dependency, service) && !contains(&dependencies, &dependency) {
                dependencies.push(dependency);
            }
        }
    }
    dependencies
}

/// every registered service that depends on `service`, directly or transitively
fn dependents_of(services: &ServiceMap, service: &Arc<dyn Service>) -> Vec<Arc<dyn Service>> {
    let all = services.all();
    let mut dependents: Vec<Arc<dyn Service>> = vec![];
    let mut pending = vec![service.clone()];

    while let Some(target) = pending.pop() {
        for candidate in all.iter() {
            if same_service(candidate, service) || contains(&dependents, candidate) {
                continue;
            }
            if contains(&dependencies_of(services, candidate), &target) {
                dependents.push(candidate.clone());
                pending.push(candidate.clone());
            }
        }
    }
    dependents
}

fn start_in_order<F>(services: &ServiceMap, mut start: F) -> Result<()>
where
    F: FnMut(&Arc<dyn Service>) -> Result<()>,
{
    let started_at = Instant::now();
    let mut unstarted = services.all();
    let total = unstarted.len();
    let mut running: Vec<Arc<dyn Service>> = vec![];
    let mut cycles = 0;

    debug!("starting {} services", total);

    let result = (|| {
        while !unstarted.is_empty() {
            let mut started_something = false;
            let mut index = 0;
            while index < unstarted.len() {
                let service = unstarted[index].clone();
                let ready = dependencies_of(services, &service)
                    .iter()
                    .all(|d| contains(&running, d));
                if ready {
                    trace!("starting {}", service.descriptor().service_type());
                    start(&service)?;
                    running.push(service);
                    unstarted.remove(index);
                    started_something = true;
                } else {
                    index += 1;
                }
            }

            if !started_something {
                return Err(CacheError::CyclicDependency(names(&unstarted)));
            }
            cycles += 1;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            debug!(
                "all services started, {} services in {} cycles, {}ms",
                total,
                cycles,
                started_at.elapsed().as_millis()
            );
            Ok(())
        }
        Err(e) => {
            while let Some(service) = running.pop() {
                if let Err(stop_err) = service.stop() {
                    error!(
                        "stopping {} after failed start: {}",
                        service.descriptor().service_type(),
                        stop_err
                    );
                }
            }
            Err(e)
        }
    }
}

fn stop_in_order<F>(services: &ServiceMap, mut stop: F) -> Result<()>
where
    F: FnMut(&Arc<dyn Service>) -> Result<()>,
{
    let stopped_at = Instant::now();
    let mut running = services.all();
    let total = running.len();
    let mut first_failure: Option<CacheError> = None;
    let mut cycles = 0;

    debug!("stopping {} services", total);

    while !running.is_empty() {
        let mut stopped_something = false;
        let mut index = 0;
        while index < running.len() {
            let service = running[index].clone();
            let blocked = dependents_of(services, &service)
                .iter()
                .any(|d| contains(&running, d));
            if blocked {
                index += 1;
                continue;
            }

            trace!("stopping {}", service.descriptor().service_type());
            if let Err(e) = stop(&service) {
                if first_failure.is_none() {
                    first_failure = Some(e);
                } else {
                    error!(
                        "stopping {} failed: {}",
                        service.descriptor().service_type(),
                        e
                    );
                }
            }
            running.remove(index);
            stopped_something = true;
        }

        if !stopped_something {
            return Err(CacheError::CyclicDependency(names(&running)));
        }
        cycles += 1;
    }

    debug!(
        "all services stopped, {} services in {} cycles, {}ms",
        total,
        cycles,
        stopped_at.elapsed().as_millis()
    );

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
