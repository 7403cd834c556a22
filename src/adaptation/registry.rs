//! Identity-keyed set of configured services.
//!
//! One registry per worker process. Configuration reload invalidates every
//! registered service before the new set is installed, so waiters of old
//! services observe a deconfigured service and re-dispatch.

use std::collections::HashMap;

use tracing::debug;

use super::service::{Ctx, ServicePointer, ServiceRep};

pub struct Registry {
    services: HashMap<String, ServicePointer>,
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            services: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a configured service under its identity. Duplicate
    /// identities are rejected at config load; hitting one here is a
    /// programmer error.
    pub fn add(&mut self, service: ServicePointer) {
        let identity = service.borrow().identity().to_string();
        let prior = self.services.insert(identity.clone(), service);
        debug_assert!(prior.is_none(), "duplicate service identity {identity}");
        self.order.push(identity);
    }

    pub fn lookup(&self, identity: &str) -> Option<ServicePointer> {
        self.services.get(identity).cloned()
    }

    /// All services, in registration order.
    pub fn all(&self) -> impl Iterator<Item = &ServicePointer> {
        self.order.iter().filter_map(|id| self.services.get(id))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        self.services.clear();
        self.order.clear();
    }

    /// Drop the current set, invalidating each member first.
    pub fn deconfigure_all(&mut self, ctx: &mut Ctx<'_>) {
        debug!(
            target: "adaptation",
            "deconfiguring {} adaptation services",
            self.services.len()
        );
        for identity in &self.order {
            if let Some(service) = self.services.get(identity) {
                ServiceRep::invalidate(service, ctx);
            }
        }
        self.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
