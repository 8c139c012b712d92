use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handler::Handler;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tracing::{debug, error};

/// Directory of handlers by service name and service type.
///
/// Cloning is cheap and every clone sees the same entries; services register
/// at start-up and the registry is passed to each peer at construction.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn Handler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. A second handler with the same name *and* type is rejected.
    pub fn register(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if handlers
            .iter()
            .any(|h| h.name() == handler.name() && h.service_type() == handler.service_type())
        {
            return Err(ProtocolError::DuplicateHandler {
                name: handler.name().to_string(),
                service_type: handler.service_type().to_string(),
            });
        }

        debug!(
            name = handler.name(),
            service_type = handler.service_type(),
            "Handler registered"
        );
        handlers.push(handler);
        Ok(())
    }

    fn read(&self) -> Option<RwLockReadGuard<'_, Vec<Arc<dyn Handler>>>> {
        match self.handlers.read() {
            Ok(handlers) => Some(handlers),
            Err(_) => {
                error!("{}", constants::ERR_REGISTRY_READ_LOCK);
                None
            }
        }
    }

    /// Handler with exactly this name
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.read()?;
        handlers.iter().find(|h| h.name() == name).cloned()
    }

    /// All handlers of this type, in registration order
    pub fn lookup_by_type(&self, service_type: &str) -> Vec<Arc<dyn Handler>> {
        self.read()
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|h| h.service_type() == service_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Exact name first, otherwise the first handler of the given type
    pub fn resolve(&self, name: Option<&str>, service_type: Option<&str>) -> Option<Arc<dyn Handler>> {
        if let Some(handler) = name.and_then(|n| self.lookup(n)) {
            return Some(handler);
        }
        service_type.and_then(|t| self.lookup_by_type(t).into_iter().next())
    }

    pub fn len(&self) -> usize {
        self.read().map_or(0, |handlers| handlers.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
