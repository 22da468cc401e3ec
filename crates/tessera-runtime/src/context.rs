//! Subject context: a typed service bundle with fallback composition and a
//! memoized resolution cache (§4.B).

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Implemented by interceptor-like services that must be told when they
/// start or stop observing subjects in a context, because that context (or
/// one of its descendants) gained or lost a fallback exposing them.
pub trait ContextAttachObserver: Send + Sync {
    fn on_attached(&self, context: &Arc<SubjectContext>);
    fn on_detached(&self, context: &Arc<SubjectContext>);
}

type AnyService = Arc<dyn Any + Send + Sync>;

struct Inner {
    services: HashMap<TypeId, AnyService>,
    fallbacks: Vec<Arc<SubjectContext>>,
    cache: HashMap<TypeId, Option<AnyService>>,
}

/// A container for services (typed singletons) and fallback contexts.
///
/// `try_get_service::<T>()` resolves from local services first, then from
/// fallback contexts in registration order, deduplicating by type.
/// Resolution is cached; the cache is cleared whenever the service set or
/// fallback list mutates.
pub struct SubjectContext {
    inner: Mutex<Inner>,
}

impl SubjectContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                services: HashMap::new(),
                fallbacks: Vec::new(),
                cache: HashMap::new(),
            }),
        })
    }

    /// Idempotent: if a service of this type is already registered, the
    /// call is a no-op and returns `false`.
    pub fn add_service<T: Send + Sync + 'static>(&self, service: Arc<T>) -> bool {
        let mut inner = self.inner.lock();
        let key = TypeId::of::<T>();
        if inner.services.contains_key(&key) {
            return false;
        }
        inner.services.insert(key, service);
        inner.cache.clear();
        true
    }

    pub fn remove_service<T: Send + Sync + 'static>(&self) -> bool {
        let mut inner = self.inner.lock();
        let key = TypeId::of::<T>();
        let removed = inner.services.remove(&key).is_some();
        if removed {
            inner.cache.clear();
        }
        removed
    }

    /// Adds a fallback context, then (outside the lock) notifies any
    /// attach-observers the fallback exposes that they now observe `self`.
    pub fn add_fallback(
        self: &Arc<Self>,
        fallback: Arc<SubjectContext>,
        observers: &[Arc<dyn ContextAttachObserver>],
    ) {
        {
            let mut inner = self.inner.lock();
            inner.fallbacks.push(fallback);
            inner.cache.clear();
        }
        for observer in observers {
            observer.on_attached(self);
        }
    }

    pub fn remove_fallback(
        self: &Arc<Self>,
        fallback: &Arc<SubjectContext>,
        observers: &[Arc<dyn ContextAttachObserver>],
    ) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.fallbacks.len();
            inner.fallbacks.retain(|f| !Arc::ptr_eq(f, fallback));
            let removed = inner.fallbacks.len() != before;
            if removed {
                inner.cache.clear();
            }
            removed
        };
        if removed {
            for observer in observers {
                observer.on_detached(self);
            }
        }
        removed
    }

    pub fn try_get_service<T: Send + Sync + 'static>(self: &Arc<Self>) -> Option<Arc<T>> {
        let key = TypeId::of::<T>();

        // Fast path (§4.B contract): zero own services, exactly one
        // fallback -> delegate transparently, no local cache state kept.
        {
            let inner = self.inner.lock();
            if inner.services.is_empty() && inner.fallbacks.len() == 1 {
                let only = inner.fallbacks[0].clone();
                drop(inner);
                return only.try_get_service::<T>();
            }
            if let Some(cached) = inner.cache.get(&key) {
                return cached.clone().and_then(|a| a.downcast::<T>().ok());
            }
        }

        let resolved = self.resolve_uncached(key);
        let mut inner = self.inner.lock();
        inner.cache.insert(key, resolved.clone());
        resolved.and_then(|a| a.downcast::<T>().ok())
    }

    fn resolve_uncached(self: &Arc<Self>, key: TypeId) -> Option<AnyService> {
        let fallbacks = {
            let inner = self.inner.lock();
            if let Some(local) = inner.services.get(&key) {
                return Some(local.clone());
            }
            inner.fallbacks.clone()
        };
        for fallback in &fallbacks {
            if let Some(found) = fallback.resolve_uncached(key) {
                return Some(found);
            }
        }
        None
    }

    pub fn fallback_count(&self) -> usize {
        self.inner.lock().fallbacks.len()
    }

    pub fn own_service_count(&self) -> usize {
        self.inner.lock().services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Logger(&'static str);

    #[test]
    fn resolves_local_before_fallback() {
        let fallback = SubjectContext::new();
        fallback.add_service(Arc::new(Logger("fallback")));

        let ctx = SubjectContext::new();
        ctx.add_service(Arc::new(Logger("local")));
        ctx.add_fallback(fallback, &[]);

        let resolved = ctx.try_get_service::<Logger>().unwrap();
        assert_eq!(*resolved, Logger("local"));
    }

    #[test]
    fn falls_back_when_not_registered_locally() {
        let fallback = SubjectContext::new();
        fallback.add_service(Arc::new(Logger("fallback")));

        let ctx = SubjectContext::new();
        ctx.add_fallback(fallback, &[]);

        let resolved = ctx.try_get_service::<Logger>().unwrap();
        assert_eq!(*resolved, Logger("fallback"));
    }

    #[test]
    fn add_service_is_idempotent() {
        let ctx = SubjectContext::new();
        assert!(ctx.add_service(Arc::new(Logger("first"))));
        assert!(!ctx.add_service(Arc::new(Logger("second"))));
        assert_eq!(*ctx.try_get_service::<Logger>().unwrap(), Logger("first"));
    }

    #[test]
    fn single_fallback_with_no_local_services_delegates_transparently() {
        let fallback = SubjectContext::new();
        fallback.add_service(Arc::new(Logger("fallback")));

        let ctx = SubjectContext::new();
        ctx.add_fallback(fallback, &[]);
        assert_eq!(ctx.own_service_count(), 0);
        assert_eq!(ctx.fallback_count(), 1);
        assert!(ctx.try_get_service::<Logger>().is_some());
    }
}
