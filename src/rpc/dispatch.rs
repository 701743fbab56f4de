use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::EventKind;
use crate::error::Result;

/// A registered event handler.
pub type Handler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Event kind -> handlers, invoked in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<EventKind, Vec<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke every handler for `kind`. A handler that errors or panics is
    /// logged and skipped; the rest still run. Returns the number of failures.
    pub fn dispatch(&self, kind: &EventKind, payload: &Value) -> usize {
        // Snapshot the list so handlers may register more handlers.
        let handlers: Vec<Handler> = match self.handlers.get(kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut failures = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::error!("{} handler error: {}", kind, e);
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!("{} handler panicked", kind);
                }
            }
        }
        failures
    }
}
