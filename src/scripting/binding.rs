//! Route Binding Layer (§4.8): resolves a request against a tenant's
//! [`RouterSnapshot`], checks out a pooled interpreter, runs the applicable
//! middleware chain followed by the matched route callback (or a registered
//! error handler), and hands back the accumulated response.
use mlua::Value;

use crate::router::RouteMatch;

use super::context::{RequestContext, RequestState, ResponseAccumulator, ScriptError};
use super::primitives::ErrorHandlerKind;
use super::script_set::ScriptSet;

/// What the binding layer decided for one request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A script route (or its error handler) produced a response.
    Handled(ResponseAccumulator),
    /// No script route claims this path under any method; the caller should
    /// fall through to plain reverse-proxying (§4.4).
    NotScriptRouted,
    /// Some other method matches this path but `ctx.method` doesn't, and the
    /// tenant registered no `method_not_allowed` handler.
    MethodNotAllowed,
}

/// Runs one request through a tenant's script set (§4.6 Acquire/Release,
/// §4.8 dispatch order). Discards the checked-out interpreter instead of
/// returning it to the pool when a Lua call raises an unhandled error (§7
/// RuntimeError policy).
pub async fn dispatch(
    script_set: &ScriptSet,
    method: &str,
    mut ctx: RequestContext,
) -> Result<DispatchOutcome, ScriptError> {
    let snapshot = script_set.snapshot();
    let route_match = snapshot.route_match(method, &ctx.path);
    let cancellation = ctx.cancellation.clone();

    let handle = script_set.pool.acquire(&cancellation).await?;
    let instance = handle.instance();

    let (callback_id, error_kind) = match route_match {
        RouteMatch::Matched { callback_id, params } => {
            ctx.params = params;
            (Some(callback_id), None)
        }
        RouteMatch::NotFound => match snapshot.error_handler(ErrorHandlerKind::NotFound) {
            Some(id) => (Some(id), Some(ErrorHandlerKind::NotFound)),
            None => {
                handle.release(false).await;
                return Ok(DispatchOutcome::NotScriptRouted);
            }
        },
        RouteMatch::MethodNotAllowed => {
            match snapshot.error_handler(ErrorHandlerKind::MethodNotAllowed) {
                Some(id) => (Some(id), Some(ErrorHandlerKind::MethodNotAllowed)),
                None => {
                    handle.release(false).await;
                    return Ok(DispatchOutcome::MethodNotAllowed);
                }
            }
        }
    };
    let callback_id = callback_id.expect("callback_id set on every non-early-return path");
    let middleware_ids = if error_kind.is_some() {
        Vec::new()
    } else {
        snapshot.middlewares_for(&ctx.path)
    };

    instance.rebind(RequestState {
        ctx,
        resp: ResponseAccumulator::new(),
    });

    let result = invoke_pipeline(instance, &middleware_ids, callback_id).await;

    match result {
        Ok(()) => {
            let resp = std::mem::replace(
                &mut instance.state.lock().unwrap().resp,
                ResponseAccumulator::new(),
            );
            handle.release(false).await;
            Ok(DispatchOutcome::Handled(resp))
        }
        Err(err) => {
            handle.release(true).await;
            Err(err)
        }
    }
}

/// Builds and runs the middleware-then-handler call chain for one request
/// (§4.7/§4.8: middleware runs in registration order, each must call `next()`
/// to continue; omitting it short-circuits the chain without reaching the
/// route callback).
async fn invoke_pipeline(
    instance: &super::pool::PooledInstance,
    middleware_ids: &[u64],
    route_callback_id: u64,
) -> Result<(), ScriptError> {
    let lua = &instance.lua;
    let globals = lua.globals();
    let req: Value = globals
        .get("req")
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    let res: Value = globals
        .get("res")
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;

    let guard = instance.callbacks.lock().unwrap();

    let route_key = guard.get(&route_callback_id).ok_or_else(|| {
        ScriptError::Runtime(format!("unknown callback id {route_callback_id}"))
    })?;
    let route_fn: mlua::Function = lua
        .registry_value(route_key)
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;

    // Route/middleware callbacks may call the `http_*` primitives, which are
    // registered as async functions (§4.7); those can only be driven through
    // `call_async`, never the synchronous `Function::call`. So every link in
    // the chain is itself an async function that awaits the next one.
    let mut chain = {
        let req = req.clone();
        let res = res.clone();
        lua.create_async_function(move |_, ()| {
            let route_fn = route_fn.clone();
            let req = req.clone();
            let res = res.clone();
            async move { route_fn.call_async::<()>((req, res)).await }
        })
        .map_err(|e| ScriptError::Runtime(e.to_string()))?
    };

    for id in middleware_ids.iter().rev() {
        let key = guard
            .get(id)
            .ok_or_else(|| ScriptError::Runtime(format!("unknown callback id {id}")))?;
        let mw_fn: mlua::Function = lua
            .registry_value(key)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        let next = chain.clone();
        let req = req.clone();
        let res = res.clone();
        chain = lua
            .create_async_function(move |_, ()| {
                let mw_fn = mw_fn.clone();
                let next = next.clone();
                let req = req.clone();
                let res = res.clone();
                async move { mw_fn.call_async::<()>((req, res, next)).await }
            })
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    }
    drop(guard);

    chain
        .call_async::<()>(())
        .await
        .map_err(|e| ScriptError::Runtime(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http_client::HttpClientAdapter;
    use crate::scripting::compiler::PrototypeCache;
    use crate::ports::http_client::HttpClient;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn client() -> Arc<dyn HttpClient> {
        Arc::new(HttpClientAdapter::new().unwrap())
    }

    fn ctx(method: &str, path: &str) -> RequestContext {
        RequestContext::new(
            method.into(),
            path.into(),
            "example.com".into(),
            "127.0.0.1".into(),
            vec![],
            vec![],
            HashMap::new(),
            None,
            1024,
            CancellationToken::new(),
        )
    }

    async fn set_for(source: &str) -> ScriptSet {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("routes.lua"), source).unwrap();
        let prototypes = PrototypeCache::new();
        ScriptSet::load(Some(dir.path().to_str().unwrap()), &prototypes, client(), 10, 2)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn matched_route_writes_response_body() {
        let set = set_for(
            "register_route('get', '/hello', function(req, res) res:write('hi there') end)",
        )
        .await;

        let outcome = dispatch(&set, "GET", ctx("GET", "/hello")).await.unwrap();
        match outcome {
            DispatchOutcome::Handled(resp) => assert_eq!(resp.body, b"hi there"),
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unclaimed_path_falls_through_to_proxy() {
        let set = set_for("register_route('get', '/hello', function(req, res) end)").await;
        let outcome = dispatch(&set, "GET", ctx("GET", "/nope")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotScriptRouted));
    }

    #[tokio::test]
    async fn middleware_short_circuit_skips_route_handler() {
        let set = set_for(
            "register_middleware(function(req, res, next) res:status(403); res:write('blocked') end)\n\
             register_route('get', '/hello', function(req, res) res:write('should not run') end)",
        )
        .await;

        let outcome = dispatch(&set, "GET", ctx("GET", "/hello")).await.unwrap();
        match outcome {
            DispatchOutcome::Handled(resp) => {
                assert_eq!(resp.status, 403);
                assert_eq!(resp.body, b"blocked");
            }
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn middleware_calling_next_reaches_route_handler() {
        let set = set_for(
            "register_middleware(function(req, res, next) next() end)\n\
             register_route('get', '/hello', function(req, res) res:write('ok') end)",
        )
        .await;

        let outcome = dispatch(&set, "GET", ctx("GET", "/hello")).await.unwrap();
        match outcome {
            DispatchOutcome::Handled(resp) => assert_eq!(resp.body, b"ok"),
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn method_mismatch_without_handler_returns_method_not_allowed() {
        let set = set_for("register_route('post', '/widgets', function(req, res) end)").await;
        let outcome = dispatch(&set, "GET", ctx("GET", "/widgets")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::MethodNotAllowed));
    }

    #[tokio::test]
    async fn not_found_error_handler_runs_when_registered() {
        let set = set_for(
            "register_route('get', '/hello', function(req, res) end)\n\
             register_error_handler('not_found', function(req, res) res:status(404); res:write('custom 404') end)",
        )
        .await;

        let outcome = dispatch(&set, "GET", ctx("GET", "/missing")).await.unwrap();
        match outcome {
            DispatchOutcome::Handled(resp) => {
                assert_eq!(resp.status, 404);
                assert_eq!(resp.body, b"custom 404");
            }
            other => panic!("expected Handled, got {other:?}"),
        }
    }
}
