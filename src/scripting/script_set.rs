//! Per-tenant script set (§4.5-§4.8): reads a tenant's `.lua` sources,
//! compiles them through a shared [`PrototypeCache`], builds the bounded
//! [`InterpreterPool`], and derives the tenant's [`RouterSnapshot`] from
//! whatever the registration instance recorded while loading.
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8};

use arc_swap::ArcSwap;
use mlua::Lua;
use thiserror::Error;
use std::sync::Mutex;

use crate::ports::http_client::HttpClient;
use crate::router::{RouterBuildError, RouterSnapshot};

use super::compiler::{CompileError, PrototypeCache};
use super::context::RequestState;
use super::pool::{InterpreterPool, PooledInstance, Phase};
use super::primitives::{self, ScriptRuntimeShared};

#[derive(Debug, Error)]
pub enum ScriptSetError {
    #[error("failed to read script directory {dir}: {source}")]
    Io {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    RouterBuild(#[from] RouterBuildError),
    #[error("lua error while loading scripts: {0}")]
    Lua(#[from] mlua::Error),
}

/// One tenant's loaded scripts: the interpreter pool they live in and the
/// router snapshot derived from their registration calls. Rebuilt wholesale
/// on reload (§5 "Router snapshot: read-only after construction; swap is via
/// an atomic pointer exchange") rather than mutated in place.
pub struct ScriptSet {
    pub pool: InterpreterPool,
    pub router: ArcSwap<RouterSnapshot>,
}

/// Reads every `*.lua` file directly under `dir`, sorted by filename so that
/// load order (and therefore registration order) is deterministic across
/// reloads and across every pooled instance (§4.6).
async fn read_sources(dir: &str) -> Result<Vec<(String, String)>, ScriptSetError> {
    let mut names = Vec::new();
    let mut entries =
        tokio::fs::read_dir(dir)
            .await
            .map_err(|source| ScriptSetError::Io { dir: dir.to_string(), source })?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| ScriptSetError::Io { dir: dir.to_string(), source })?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("lua") {
            names.push(path);
        }
    }
    names.sort();

    let mut sources = Vec::with_capacity(names.len());
    for path in names {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ScriptSetError::Io { dir: dir.to_string(), source })?;
        sources.push((name, source));
    }
    Ok(sources)
}

/// Builds one pooled interpreter: installs the primitive surface, executes
/// every compiled source while the instance is in `Phase::Load`, then leaves
/// it for the caller to flip to `Phase::Serving` once every instance in the
/// pool has finished loading (§4.6).
fn build_instance(
    sources: &[(String, Vec<u8>)],
    shared: Arc<ScriptRuntimeShared>,
    is_registration_instance: bool,
) -> Result<PooledInstance, ScriptSetError> {
    let lua = Lua::new();
    let state = Arc::new(Mutex::new(RequestState::inert()));
    let phase = Arc::new(AtomicU8::new(Phase::Load as u8));
    let callbacks = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let next_callback_id = Arc::new(AtomicU64::new(0));

    primitives::install(
        &lua,
        state.clone(),
        phase.clone(),
        callbacks.clone(),
        next_callback_id.clone(),
        shared,
        is_registration_instance,
    )?;

    for (name, bytecode) in sources {
        lua.load(bytecode.as_slice()).set_name(name).exec()?;
    }

    Ok(PooledInstance {
        lua,
        state,
        phase,
        callbacks,
        next_callback_id,
        is_registration_instance,
    })
}

impl ScriptSet {
    /// Loads a tenant's scripts and builds its interpreter pool and router
    /// snapshot. `script_dir = None` is a tenant with no scripts at all: an
    /// empty pool, an empty router, every request falls through to plain
    /// reverse-proxying.
    pub async fn load(
        script_dir: Option<&str>,
        prototypes: &PrototypeCache,
        http_client: Arc<dyn HttpClient>,
        outbound_timeout_secs: u64,
        max_instances: usize,
    ) -> Result<Self, ScriptSetError> {
        let sources = match script_dir {
            Some(dir) if Path::new(dir).is_dir() => read_sources(dir).await?,
            _ => Vec::new(),
        };

        let mut bytecodes = Vec::with_capacity(sources.len());
        for (name, source) in &sources {
            let proto = prototypes.compile_or_get(name, source).await?;
            bytecodes.push((proto.name, proto.bytecode));
        }

        let pool = InterpreterPool::new(max_instances.max(1));
        let mut registration_pending = None;

        for i in 0..max_instances.max(1) {
            let is_registration_instance = i == 0;
            let shared = Arc::new(ScriptRuntimeShared::new(
                http_client.clone(),
                outbound_timeout_secs,
            ));
            let instance = build_instance(&bytecodes, shared.clone(), is_registration_instance)?;
            instance.set_phase(Phase::Serving);
            if is_registration_instance {
                registration_pending = Some(shared.pending.lock().unwrap().clone());
            }
            pool.seed(instance).await;
        }

        let pending = registration_pending.unwrap_or_default();
        let snapshot = RouterSnapshot::build(&pending)?;

        Ok(Self {
            pool,
            router: ArcSwap::new(Arc::new(snapshot)),
        })
    }

    /// An empty script set for tenants with no `script_dir` configured.
    pub fn empty() -> Self {
        Self {
            pool: InterpreterPool::new(1),
            router: ArcSwap::new(Arc::new(RouterSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<RouterSnapshot> {
        self.router.load_full()
    }
}
