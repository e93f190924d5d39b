//! Embedded Lua scripting subsystem (§4.5-§4.8): bytecode compiler/cache,
//! bounded interpreter pool, host primitive surface, and the per-tenant
//! script set that ties them together with a [`crate::router::RouterSnapshot`].
pub mod binding;
pub mod compiler;
pub mod context;
pub mod pool;
pub mod primitives;
pub mod script_set;

pub use script_set::{ScriptSet, ScriptSetError};
