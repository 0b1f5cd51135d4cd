/// identity based multi-map from capability type to service instances
///
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use super::{same_service, Service, ServiceType};
use crate::error::{CacheError, Result};

/// `Clone` produces an independent map: fresh per-type lists holding the same instances,
/// so a speculative copy can be extended and thrown away without touching the original.
#[derive(Clone, Default)]
pub struct ServiceMap {
    services: HashMap<ServiceType, Vec<Arc<dyn Service>>>,
    all: Vec<Arc<dyn Service>>,
}

impl fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.all.iter().map(|s| s.descriptor().service_type()))
            .finish()
    }
}

impl ServiceMap {
    pub fn new() -> ServiceMap {
        ServiceMap::default()
    }

    /// Registers the instance under its concrete type and every declared capability.
    ///
    /// Re-adding the same instance is a no-op. A different instance under an occupied
    /// singular type fails, naming every conflicting type, and leaves the map unchanged.
    pub fn add(&mut self, service: Arc<dyn Service>) -> Result<&mut Self> {
        let descriptor = service.descriptor();

        let conflicts: Vec<String> = descriptor
            .types()
            .filter(|t| !t.is_plural())
            .filter(|t| {
                self.services
                    .get(t)
                    .map_or(false, |list| list.iter().any(|s| !same_service(s, &service)))
            })
            .map(|t| t.name().to_string())
            .collect();

        if !conflicts.is_empty() {
            return Err(CacheError::DuplicateService {
                service: descriptor.service_type().name().to_string(),
                conflicts,
            });
        }

        for service_type in descriptor.types() {
            let list = self.services.entry(service_type).or_default();
            if !list.iter().any(|s| same_service(s, &service)) {
                list.push(service.clone());
            }
        }

        if !self.all.iter().any(|s| same_service(s, &service)) {
            self.all.push(service);
        }

        Ok(self)
    }

    pub fn add_all<I>(&mut self, services: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = Arc<dyn Service>>,
    {
        for service in services {
            self.add(service)?;
        }
        Ok(self)
    }

    /// the instances registered under the type, in registration order
    pub fn get(&self, service_type: &ServiceType) -> Vec<Arc<dyn Service>> {
        self.services.get(service_type).cloned().unwrap_or_default()
    }

    pub fn contains(&self, service_type: &ServiceType) -> bool {
        self.services
            .get(service_type)
            .map_or(false, |list| !list.is_empty())
    }

    /// every distinct instance, in registration order
    pub fn all(&self) -> Vec<Arc<dyn Service>> {
        self.all.clone()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceDescriptor, ServiceProvider};

    trait Listener {}
    trait Provider {}

    struct ListenerA;
    struct ListenerB;
    struct ProviderA;
    struct ProviderB;

    macro_rules! test_service {
        ($name:ident, $descriptor:expr) => {
            impl Service for $name {
                fn descriptor(&self) -> ServiceDescriptor {
                    $descriptor
                }
                fn start(&self, _: &dyn ServiceProvider) -> Result<()> {
                    Ok(())
                }
                fn stop(&self) -> Result<()> {
                    Ok(())
                }
            }
        };
    }

    test_service!(
        ListenerA,
        ServiceDescriptor::new(ServiceType::of::<ListenerA>())
            .implements(ServiceType::plural::<dyn Listener>())
    );
    test_service!(
        ListenerB,
        ServiceDescriptor::new(ServiceType::of::<ListenerB>())
            .implements(ServiceType::plural::<dyn Listener>())
    );
    test_service!(
        ProviderA,
        ServiceDescriptor::new(ServiceType::of::<ProviderA>())
            .implements(ServiceType::of::<dyn Provider>())
    );
    test_service!(
        ProviderB,
        ServiceDescriptor::new(ServiceType::of::<ProviderB>())
            .implements(ServiceType::of::<dyn Provider>())
    );

    #[test]
    fn singular_rejects_second_instance() {
        let mut map = ServiceMap::new();
        map.add(Arc::new(ProviderA)).unwrap();

        match map.add(Arc::new(ProviderB)) {
            Err(CacheError::DuplicateService { conflicts, .. }) => {
                assert_eq!(conflicts.len(), 1);
                assert!(conflicts[0].ends_with("Provider"));
            }
            other => panic!("expected duplicate error, got {:?}", other.map(|_| ())),
        }

        // a second instance of the same concrete type conflicts on both types
        match map.add(Arc::new(ProviderA)) {
            Err(CacheError::DuplicateService { conflicts, .. }) => assert_eq!(conflicts.len(), 2),
            other => panic!("expected duplicate error, got {:?}", other.map(|_| ())),
        }

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&ServiceType::of::<dyn Provider>()).len(), 1);
    }

    #[test]
    fn same_instance_is_idempotent() {
        let mut map = ServiceMap::new();
        let provider: Arc<dyn Service> = Arc::new(ProviderA);
        map.add(provider.clone()).unwrap();
        map.add(provider.clone()).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&ServiceType::of::<ProviderA>()).len(), 1);
        assert_eq!(map.get(&ServiceType::of::<dyn Provider>()).len(), 1);
    }

    #[test]
    fn plural_keeps_order() {
        let mut map = ServiceMap::new();
        let b: Arc<dyn Service> = Arc::new(ListenerB);
        let a: Arc<dyn Service> = Arc::new(ListenerA);
        map.add(b.clone()).unwrap().add(a.clone()).unwrap();

        let listeners = map.get(&ServiceType::of::<dyn Listener>());
        assert_eq!(listeners.len(), 2);
        assert!(same_service(&listeners[0], &b));
        assert!(same_service(&listeners[1], &a));
        assert_eq!(map.all().len(), 2);
    }

    #[test]
    fn root_marker_is_not_registered() {
        let mut map = ServiceMap::new();
        map.add(Arc::new(ListenerA)).unwrap();
        assert!(!map.contains(&ServiceType::root()));
        assert!(map.contains(&ServiceType::of::<ListenerA>()));
        assert!(map.get(&ServiceType::of::<ProviderA>()).is_empty());
    }

    #[test]
    fn copies_are_independent() {
        let mut original = ServiceMap::new();
        original.add(Arc::new(ListenerA)).unwrap();

        let mut copy = original.clone();
        copy.add(Arc::new(ProviderA)).unwrap();
        copy.add(Arc::new(ListenerB)).unwrap();

        assert_eq!(original.len(), 1);
        assert!(!original.contains(&ServiceType::of::<dyn Provider>()));
        assert_eq!(original.get(&ServiceType::of::<dyn Listener>()).len(), 1);
        assert_eq!(copy.len(), 3);
    }
}
