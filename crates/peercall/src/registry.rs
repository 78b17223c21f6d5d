//! Service registry and dispatcher

use crate::error::RegistrationError;
use crate::payload::{Payload, ReplyTarget};
use crate::service::{short_type_name, MethodDescriptor, MethodEntry, MethodTable, Receiver, Service};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peercall_protocol::RemoteError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A registered service with its receiver erased
trait ServiceEntry: Send + Sync {
    fn descriptors(&self) -> Vec<MethodDescriptor>;

    fn invoke(
        &self,
        method: &str,
        arg: &dyn Payload,
        reply: ReplyTarget<'_>,
    ) -> Result<(), RemoteError>;
}

struct Registration<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, MethodEntry<S>>,
}

impl<S: Service> ServiceEntry for Registration<S> {
    fn descriptors(&self) -> Vec<MethodDescriptor> {
        let mut descriptors: Vec<_> = self.methods.values().map(|m| m.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    fn invoke(
        &self,
        method: &str,
        arg: &dyn Payload,
        reply: ReplyTarget<'_>,
    ) -> Result<(), RemoteError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| RemoteError::MethodNotFound {
                service: self.name.clone(),
                method: method.to_string(),
            })?;
        entry
            .callable
            .call(&self.receiver, &entry.descriptor, arg, reply)
    }
}

/// Maps service names to receivers and their callable methods.
///
/// Entries are added once and never replaced or removed.
#[derive(Default)]
pub struct Registry {
    services: DashMap<String, Arc<dyn ServiceEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `receiver` under its type name
    pub fn register<S: Service>(
        &self,
        receiver: impl Into<Receiver<S>>,
    ) -> Result<(), RegistrationError> {
        self.register_name(S::service_name(), receiver)
    }

    /// Register `receiver` under an explicit name
    pub fn register_name<S: Service>(
        &self,
        name: impl Into<String>,
        receiver: impl Into<Receiver<S>>,
    ) -> Result<(), RegistrationError> {
        let receiver = match receiver.into() {
            Receiver::Shared(receiver) => receiver,
            Receiver::Owned(_) => {
                return Err(RegistrationError::InvalidReceiver {
                    type_name: short_type_name::<S>(),
                })
            }
        };

        let name = name.into();
        if name.is_empty() {
            return Err(RegistrationError::InvalidServiceName(short_type_name::<S>()));
        }

        let mut table = MethodTable::new(name.clone());
        S::methods(&mut table);
        if table.is_empty() {
            return Err(RegistrationError::NoMethods(name));
        }
        let method_count = table.len();

        match self.services.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistrationError::DuplicateService(name)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Registration {
                    name: name.clone(),
                    receiver,
                    methods: table.into_entries(),
                }));
                info!(service = %name, methods = method_count, "Registered service");
                Ok(())
            }
        }
    }

    /// Invoke `service.method`.
    ///
    /// Returns exactly the error the method returned. Whatever the method
    /// wrote into its reply is delivered to `reply` even when it fails.
    pub fn invoke(
        &self,
        service: &str,
        method: &str,
        arg: &dyn Payload,
        reply: ReplyTarget<'_>,
    ) -> Result<(), RemoteError> {
        // Clone the entry out so no shard lock is held while the method runs
        let entry = self
            .services
            .get(service)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RemoteError::ServiceNotFound {
                service: service.to_string(),
            })?;

        let result = entry.invoke(method, arg, reply);
        if let Err(ref e) = result {
            debug!(service, method, error = %e, "Call failed");
        }
        result
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Methods registered for `service`, sorted by name
    pub fn methods(&self, service: &str) -> Option<Vec<MethodDescriptor>> {
        self.services.get(service).map(|e| e.value().descriptors())
    }
}
