//! Immutable method registry: a plain map from method name to handler, built
//! once at daemon startup and never mutated after.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::Result;
use crate::rpc::notify::NotificationSink;
use crate::rpc::RpcState;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type Handler = fn(Arc<RpcState>, NotificationSink, Value) -> HandlerFuture;

#[derive(Default)]
pub struct Router {
    handlers: HashMap<&'static str, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: &'static str, handler: Handler) {
        self.handlers.insert(method, handler);
    }

    pub fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_state: Arc<RpcState>, _notify: NotificationSink, _params: Value) -> HandlerFuture {
        Box::pin(async { Ok(Value::Null) })
    }

    #[test]
    fn unregistered_method_returns_none() {
        let router = Router::new();
        assert!(router.get("Meta.Authenticate").is_none());
    }

    #[test]
    fn registered_method_is_found_by_name() {
        let mut router = Router::new();
        router.register("Meta.Authenticate", noop);
        assert!(router.get("Meta.Authenticate").is_some());
    }
}
