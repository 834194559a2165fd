use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::protocol::{RpcReply, RpcRequest};
use crate::{log_warn, Result, RpcError};

pub(super) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased action handler: request `data` in, reply data out.
///
/// `Ok(Some(_))` becomes `status: success`, `Ok(None)` becomes
/// `status: notFound`, `Err(_)` becomes `status: error`.
pub(super) trait HandlerFn: Send + Sync {
    fn call(&self, data: Value) -> BoxFuture<'static, Result<Option<Value>>>;
}

struct Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<TResp>>> + Send,
    TReq: DeserializeOwned,
    TResp: Serialize,
{
    func: F,
    _phantom: std::marker::PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> HandlerFn for Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<TResp>>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, data: Value) -> BoxFuture<'static, Result<Option<Value>>> {
        // ---
        let req: TReq = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => {
                let err = RpcError::handler(format!("invalid data: {e}"));
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = (self.func)(req);

        Box::pin(async move {
            let Some(resp) = fut.await? else {
                return Ok(None);
            };
            let value: Value = serde_json::to_value(resp)?;
            Ok::<_, RpcError>(Some(value))
        })
    }
}

/// Wrap a typed handler closure for storage in a [`HandlerRegistry`].
pub(super) fn wrap_handler<F, Fut, TReq, TResp>(func: F) -> Arc<dyn HandlerFn>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<TResp>>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    Arc::new(Handler {
        func,
        _phantom: std::marker::PhantomData,
    })
}

/// Action → handler table, fixed once the server is built.
#[derive(Default, Clone)]
pub(super) struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn HandlerFn>>,
}

impl HandlerRegistry {
    /// Register `handler` for `action`.
    ///
    /// Empty and duplicate actions are rejected so a misconfigured table
    /// fails at startup instead of on the first request.
    pub(super) fn insert(&mut self, action: &str, handler: Arc<dyn HandlerFn>) -> Result<()> {
        // ---
        if action.trim().is_empty() {
            return Err(RpcError::InvalidConfig("empty action name".into()));
        }
        if self.handlers.contains_key(action) {
            return Err(RpcError::InvalidConfig(format!(
                "duplicate handler for action '{action}'"
            )));
        }
        self.handlers.insert(action.to_string(), handler);
        Ok(())
    }

    pub(super) fn get(&self, action: &str) -> Option<Arc<dyn HandlerFn>> {
        self.handlers.get(action).cloned()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(super) fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }
}

/// Produce the reply for one request body.
///
/// Never fails: every problem (bad body, unknown action, handler error or
/// panic) is turned into an `error` reply so one bad request cannot stop the
/// server.
pub(super) async fn dispatch(registry: &HandlerRegistry, body: &[u8]) -> RpcReply {
    // ---
    let request: RpcRequest<Value> = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return RpcReply::error(format!("invalid request body: {e}")),
    };

    let Some(handler) = registry.get(&request.action) else {
        log_warn!("no handler for action: {}", request.action);
        return RpcReply::error(format!("unknown action: {}", request.action));
    };

    // Run the handler in its own task so a panic is contained.
    match tokio::spawn(handler.call(request.data)).await {
        Ok(Ok(Some(data))) => RpcReply::success(data),
        Ok(Ok(None)) => RpcReply::not_found(),
        Ok(Err(err)) => RpcReply::error(err.to_string()),
        Err(join_err) if join_err.is_panic() => {
            log_warn!("handler for action '{}' panicked", request.action);
            RpcReply::error("handler panicked")
        }
        Err(_) => RpcReply::error("handler cancelled"),
    }
}
