//! Host primitives exposed to tenant Lua scripts (§4.7): route/middleware/
//! error-handler registration, request/response accessors, context storage,
//! the outbound HTTP client, and `log`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use mlua::{Lua, Value, Variadic};
use tokio_util::sync::CancellationToken;

use crate::ports::http_client::HttpClient;

use super::context::{RequestState, ScriptValue};
use super::pool::Phase;

/// One route/middleware/error-handler recorded by the registration instance
/// while scripts execute at load time (§4.6, §4.8).
#[derive(Debug, Clone)]
pub enum PendingRegistration {
    Route {
        method: String,
        pattern: String,
        callback_id: u64,
    },
    Middleware {
        pattern: Option<String>,
        callback_id: u64,
    },
    ErrorHandler {
        kind: ErrorHandlerKind,
        callback_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorHandlerKind {
    NotFound,
    MethodNotAllowed,
}

impl std::str::FromStr for ErrorHandlerKind {
    type Err = mlua::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(ErrorHandlerKind::NotFound),
            "method_not_allowed" => Ok(ErrorHandlerKind::MethodNotAllowed),
            other => Err(mlua::Error::RuntimeError(format!(
                "unknown error handler kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct GroupFrame {
    prefix: String,
}

/// State shared by every interpreter instance belonging to one tenant's
/// script set: the pending-registration list only the registration instance
/// writes to, the group-nesting stack used while a registration block runs,
/// and the pooled HTTP client used by the `http_*` primitives.
///
/// All fields use `std::sync::Mutex`, not `tokio::sync::Mutex`: every access
/// originates from a synchronous Lua callback (registration primitives,
/// `req`/`res` methods), never from code that holds the lock across an
/// `.await`. A tokio mutex would force those callbacks through
/// `block_in_place`, which panics outside a multi-threaded runtime.
pub struct ScriptRuntimeShared {
    pub pending: Mutex<Vec<PendingRegistration>>,
    group_stack: Mutex<Vec<GroupFrame>>,
    http_client: Arc<dyn HttpClient>,
    pub outbound_timeout_secs: u64,
}

impl ScriptRuntimeShared {
    pub fn new(http_client: Arc<dyn HttpClient>, outbound_timeout_secs: u64) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            group_stack: Mutex::new(Vec::new()),
            http_client,
            outbound_timeout_secs,
        }
    }

    fn current_prefix(&self) -> String {
        self.group_stack
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.prefix.as_str())
            .collect::<Vec<_>>()
            .concat()
    }
}

type CallbackRegistry = Arc<Mutex<HashMap<u64, mlua::RegistryKey>>>;

fn configuration_error(what: &str) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "{what} cannot be called outside the load phase (ConfigurationError)"
    ))
}

/// Installs every host primitive as a Lua global on `lua`. Called once per
/// interpreter instance at creation time (§4.6); `req`/`res` stay bound to
/// `state` for the instance's whole lifetime, only `state`'s contents change
/// between requests.
pub fn install(
    lua: &Lua,
    state: Arc<Mutex<RequestState>>,
    phase: Arc<AtomicU8>,
    callbacks: CallbackRegistry,
    next_callback_id: Arc<AtomicU64>,
    shared: Arc<ScriptRuntimeShared>,
    is_registration_instance: bool,
) -> mlua::Result<()> {
    install_registration_primitives(
        lua,
        phase.clone(),
        callbacks.clone(),
        next_callback_id.clone(),
        shared.clone(),
        is_registration_instance,
    )?;
    install_request_response(lua, state.clone())?;
    install_context_storage(lua, state.clone())?;
    install_http_client(lua, shared, state)?;
    install_log(lua)?;
    Ok(())
}

fn store_callback(
    lua: &Lua,
    callbacks: &CallbackRegistry,
    next_callback_id: &Arc<AtomicU64>,
    callback: mlua::Function,
) -> mlua::Result<u64> {
    let id = next_callback_id.fetch_add(1, Ordering::Relaxed);
    let key = lua.create_registry_value(callback)?;
    callbacks.lock().unwrap().insert(id, key);
    Ok(id)
}

fn install_registration_primitives(
    lua: &Lua,
    phase: Arc<AtomicU8>,
    callbacks: CallbackRegistry,
    next_callback_id: Arc<AtomicU64>,
    shared: Arc<ScriptRuntimeShared>,
    is_registration_instance: bool,
) -> mlua::Result<()> {
    let globals = lua.globals();
    // Tracks, within this instance's single deterministic script execution,
    // whether any route has been registered yet. Every instance in a script
    // set runs the identical registration source in the identical order, so
    // this flag trips at the same point for all of them (§4.8: middleware
    // must be declared before routes).
    let route_registered = Arc::new(std::sync::atomic::AtomicBool::new(false));

    {
        let phase = phase.clone();
        let callbacks = callbacks.clone();
        let next_callback_id = next_callback_id.clone();
        let shared = shared.clone();
        let route_registered = route_registered.clone();
        globals.set(
            "register_route",
            lua.create_function(
                move |lua, (method, pattern, callback): (String, String, mlua::Function)| {
                    if Phase::load_active(&phase) != Phase::Load {
                        return Err(configuration_error("register_route"));
                    }
                    route_registered.store(true, Ordering::Release);
                    let callback_id =
                        store_callback(lua, &callbacks, &next_callback_id, callback)?;
                    if is_registration_instance {
                        let method = method.to_uppercase();
                        let full_pattern = format!("{}{}", shared.current_prefix(), pattern);
                        shared.pending.lock().unwrap().push(PendingRegistration::Route {
                            method,
                            pattern: full_pattern,
                            callback_id,
                        });
                    }
                    Ok(())
                },
            )?,
        )?;
    }

    {
        let phase = phase.clone();
        let callbacks = callbacks.clone();
        let next_callback_id = next_callback_id.clone();
        let shared = shared.clone();
        let route_registered = route_registered.clone();
        globals.set(
            "register_middleware",
            lua.create_function(move |lua, callback: mlua::Function| {
                if Phase::load_active(&phase) != Phase::Load {
                    return Err(configuration_error("register_middleware"));
                }
                if route_registered.load(Ordering::Acquire) {
                    return Err(configuration_error(
                        "register_middleware: middleware must be registered before routes",
                    ));
                }
                let callback_id = store_callback(lua, &callbacks, &next_callback_id, callback)?;
                if is_registration_instance {
                    shared.pending.lock().unwrap().push(PendingRegistration::Middleware {
                        pattern: None,
                        callback_id,
                    });
                }
                Ok(())
            })?,
        )?;
    }

    {
        let phase = phase.clone();
        let callbacks = callbacks.clone();
        let next_callback_id = next_callback_id.clone();
        let shared = shared.clone();
        let route_registered = route_registered.clone();
        globals.set(
            "register_middleware_for",
            lua.create_function(
                move |lua, (pattern, callback): (String, mlua::Function)| {
                    if Phase::load_active(&phase) != Phase::Load {
                        return Err(configuration_error("register_middleware_for"));
                    }
                    if route_registered.load(Ordering::Acquire) {
                        return Err(configuration_error(
                            "register_middleware_for: middleware must be registered before routes",
                        ));
                    }
                    let callback_id =
                        store_callback(lua, &callbacks, &next_callback_id, callback)?;
                    if is_registration_instance {
                        let full_pattern = format!("{}{}", shared.current_prefix(), pattern);
                        shared.pending.lock().unwrap().push(PendingRegistration::Middleware {
                            pattern: Some(full_pattern),
                            callback_id,
                        });
                    }
                    Ok(())
                },
            )?,
        )?;
    }

    {
        let phase = phase.clone();
        let callbacks = callbacks.clone();
        let next_callback_id = next_callback_id.clone();
        let shared = shared.clone();
        globals.set(
            "register_error_handler",
            lua.create_function(
                move |lua, (kind, callback): (String, mlua::Function)| {
                    if Phase::load_active(&phase) != Phase::Load {
                        return Err(configuration_error("register_error_handler"));
                    }
                    let kind: ErrorHandlerKind = kind.parse()?;
                    let callback_id =
                        store_callback(lua, &callbacks, &next_callback_id, callback)?;
                    if is_registration_instance {
                        shared
                            .pending
                            .lock()
                            .unwrap()
                            .push(PendingRegistration::ErrorHandler { kind, callback_id });
                    }
                    Ok(())
                },
            )?,
        )?;
    }

    {
        let phase = phase.clone();
        let shared = shared.clone();
        globals.set(
            "register_group",
            lua.create_function(move |_lua, (prefix, block): (String, mlua::Function)| {
                if Phase::load_active(&phase) != Phase::Load {
                    return Err(configuration_error("register_group"));
                }
                shared.group_stack.lock().unwrap().push(GroupFrame { prefix });
                let result = block.call::<()>(());
                shared.group_stack.lock().unwrap().pop();
                result
            })?,
        )?;
    }

    Ok(())
}

impl Phase {
    fn load_active(phase: &Arc<AtomicU8>) -> Phase {
        match phase.load(Ordering::Acquire) {
            0 => Phase::Load,
            _ => Phase::Serving,
        }
    }
}

/// `req`/`res` globals, installed once per instance, backed by the shared
/// `RequestState` rebound on each acquire (§4.7 method-style accessors).
struct RequestHandle(Arc<Mutex<RequestState>>);
struct ResponseHandle(Arc<Mutex<RequestState>>);

impl mlua::UserData for RequestHandle {
    fn add_methods<M: mlua::UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("method", |_, this, ()| {
            Ok(this.0.lock().unwrap().ctx.method.clone())
        });
        methods.add_method("path", |_, this, ()| {
            Ok(this.0.lock().unwrap().ctx.path.clone())
        });
        methods.add_method("host", |_, this, ()| {
            Ok(this.0.lock().unwrap().ctx.host.clone())
        });
        methods.add_method("remote_addr", |_, this, ()| {
            Ok(this.0.lock().unwrap().ctx.remote_addr.clone())
        });
        methods.add_method("header", |_, this, name: String| {
            Ok(this.0.lock().unwrap().ctx.header(&name))
        });
        methods.add_method("headers", |lua, this, ()| {
            let guard = this.0.lock().unwrap();
            let table = lua.create_table()?;
            for (k, v) in &guard.ctx.headers {
                table.set(k.as_str(), v.as_str())?;
            }
            Ok(table)
        });
        methods.add_method("query", |_, this, name: String| {
            Ok(this.0.lock().unwrap().ctx.query_get(&name))
        });
        methods.add_method("param", |_, this, name: String| {
            Ok(this.0.lock().unwrap().ctx.params.get(&name).cloned())
        });
        methods.add_method("body", |_, this, ()| {
            this.0
                .lock()
                .unwrap()
                .ctx
                .body()
                .map_err(|err| mlua::Error::RuntimeError(err.to_string()))
        });
    }
}

impl mlua::UserData for ResponseHandle {
    fn add_methods<M: mlua::UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("status", |_, this, code: u16| {
            this.0.lock().unwrap().resp.set_status(code);
            Ok(())
        });
        methods.add_method("header", |_, this, (name, value): (String, String)| {
            this.0.lock().unwrap().resp.set_header(name, value);
            Ok(())
        });
        methods.add_method("write", |_, this, bytes: mlua::String| {
            this.0.lock().unwrap().resp.write(&bytes.as_bytes());
            Ok(())
        });
    }
}

fn install_request_response(lua: &Lua, state: Arc<Mutex<RequestState>>) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set("req", RequestHandle(state.clone()))?;
    globals.set("res", ResponseHandle(state))?;
    Ok(())
}

fn install_context_storage(lua: &Lua, state: Arc<Mutex<RequestState>>) -> mlua::Result<()> {
    let globals = lua.globals();

    {
        let state = state.clone();
        globals.set(
            "context_set",
            lua.create_function(move |_, (key, value): (String, Value)| {
                let script_value = ScriptValue::from_lua_value(&value);
                state.lock().unwrap().ctx.scratch.insert(key, script_value);
                Ok(())
            })?,
        )?;
    }

    {
        globals.set(
            "context_get",
            lua.create_function(move |lua, key: String| {
                let guard = state.lock().unwrap();
                match guard.ctx.scratch.get(&key) {
                    Some(value) => value.to_lua_value(lua),
                    None => Ok(Value::Nil),
                }
            })?,
        )?;
    }

    Ok(())
}

fn install_log(lua: &Lua) -> mlua::Result<()> {
    lua.globals().set(
        "log",
        lua.create_function(|_, message: String| {
            tracing::info!(target: "tenant_script", "{}", message);
            Ok(())
        })?,
    )
}

async fn perform_request(
    shared: &ScriptRuntimeShared,
    method: &str,
    url: String,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
    cancellation: CancellationToken,
) -> Result<(u16, Vec<u8>, Vec<(String, String)>), String> {
    let mut builder = hyper::Request::builder().method(method).uri(url);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let axum_body = match body {
        Some(bytes) => AxumBody::from(Bytes::from(bytes)),
        None => AxumBody::empty(),
    };
    let request = builder.body(axum_body).map_err(|e| e.to_string())?;

    let timeout = std::time::Duration::from_secs(shared.outbound_timeout_secs);
    let response = tokio::select! {
        result = tokio::time::timeout(timeout, shared.http_client.send_request(request)) => {
            result
                .map_err(|_| "outbound request timed out".to_string())?
                .map_err(|e| e.to_string())?
        }
        _ = cancellation.cancelled() => return Err("request cancelled".to_string()),
    };

    let status = response.status().as_u16();
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?;
    let body = collected.to_bytes().to_vec();

    Ok((status, body, response_headers))
}

fn install_http_client(
    lua: &Lua,
    shared: Arc<ScriptRuntimeShared>,
    state: Arc<Mutex<RequestState>>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    for (name, method) in [
        ("http_get", "GET"),
        ("http_post", "POST"),
        ("http_put", "PUT"),
        ("http_delete", "DELETE"),
    ] {
        let shared = shared.clone();
        let state = state.clone();
        globals.set(
            name,
            lua.create_async_function(move |lua, args: Variadic<Value>| {
                let shared = shared.clone();
                let state = state.clone();
                let method = method.to_string();
                async move {
                    let mut iter = args.into_iter();
                    let url = match iter.next() {
                        Some(Value::String(s)) => s.to_str()?.to_string(),
                        _ => return Err(mlua::Error::RuntimeError("url required".into())),
                    };
                    let body = match iter.next() {
                        Some(Value::String(s)) => Some(s.as_bytes().to_vec()),
                        _ => None,
                    };
                    let headers = match iter.next() {
                        Some(Value::Table(table)) => {
                            let mut out = Vec::new();
                            for pair in table.pairs::<String, String>() {
                                let (k, v) = pair?;
                                out.push((k, v));
                            }
                            out
                        }
                        _ => Vec::new(),
                    };

                    let cancellation = state.lock().unwrap().ctx.cancellation.clone();
                    let (status, body, response_headers) =
                        perform_request(&shared, &method, url, body, headers, cancellation)
                            .await
                            .map_err(mlua::Error::RuntimeError)?;

                    let result = lua.create_table()?;
                    result.set("status", status)?;
                    result.set("body", lua.create_string(&body)?)?;
                    let header_table = lua.create_table()?;
                    for (k, v) in response_headers {
                        header_table.set(k, v)?;
                    }
                    result.set("headers", header_table)?;
                    Ok(result)
                }
            })?,
        )?;
    }

    Ok(())
}
