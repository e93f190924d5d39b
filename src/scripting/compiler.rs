//! Compiles tenant Lua sources to bytecode once and caches the result keyed
//! by `(name, sha1(source))`, so identical source registered twice under the
//! same name is a cache hit rather than a second compile (§4.5, §8).
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Compiled bytecode for one named script. Cheap to clone (`Vec<u8>` sharing
/// would need `Arc`, but dump sizes are small and compilation is rare).
#[derive(Debug, Clone)]
pub struct Prototype {
    pub name: String,
    pub source_hash: String,
    pub bytecode: Vec<u8>,
}

#[derive(Error, Debug, Clone)]
pub enum CompileError {
    #[error("failed to load script {name}: {message}")]
    Load { name: String, message: String },
    #[error("failed to dump bytecode for script {name}: {message}")]
    Dump { name: String, message: String },
}

fn source_hash(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compile `source` registered under `name` into a [`Prototype`]. A fresh
/// throwaway `mlua::Lua` is used purely as a compiler; it is discarded after
/// the bytecode dump.
pub fn compile(name: &str, source: &str) -> Result<Prototype, CompileError> {
    let lua = mlua::Lua::new();
    let function = lua
        .load(source)
        .set_name(name)
        .into_function()
        .map_err(|err| CompileError::Load {
            name: name.to_string(),
            message: err.to_string(),
        })?;
    let bytecode = function.dump(true);

    Ok(Prototype {
        name: name.to_string(),
        source_hash: source_hash(source),
        bytecode,
    })
}

/// Concurrent cache of compiled prototypes, keyed by `(name, source_hash)` so
/// a config reload that reuses identical source never recompiles (§4.5).
#[derive(Default)]
pub struct PrototypeCache {
    entries: scc::HashMap<(String, String), Prototype>,
}

impl PrototypeCache {
    pub fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
        }
    }

    /// Returns the cached prototype for `(name, source)` if present, else
    /// compiles, inserts, and returns the new one.
    pub async fn compile_or_get(
        &self,
        name: &str,
        source: &str,
    ) -> Result<Prototype, CompileError> {
        let hash = source_hash(source);
        let key = (name.to_string(), hash);

        if let Some(entry) = self.entries.get_async(&key).await {
            return Ok(entry.get().clone());
        }

        let prototype = compile(name, source)?;
        self.entries
            .entry_async(key)
            .await
            .or_insert(prototype.clone());
        Ok(prototype)
    }
}
