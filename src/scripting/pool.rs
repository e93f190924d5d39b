//! Interpreter Pool (§4.6): a bounded set of `mlua::Lua` VMs per tenant, each
//! pre-loaded with the tenant's compiled scripts, reused across requests via
//! acquire/release rather than constructed per request.
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use mlua::Lua;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use super::context::{RequestState, ScriptError};

/// Lifecycle phase of an interpreter instance. Registration primitives
/// (`register_route`, etc.) behave differently depending on which phase the
/// instance is in (§4.6, §4.7): harmless during `Load`, an error during
/// `Serving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Load = 0,
    Serving = 1,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Load,
            _ => Phase::Serving,
        }
    }
}

/// One interpreter in the pool. Owns its `Lua` VM and the state shared with
/// the `req`/`res` userdata globals installed once at creation time; only the
/// *contents* of `state` are rebound on each acquire, never the globals
/// themselves (§4.7).
pub struct PooledInstance {
    pub lua: Lua,
    pub state: Arc<StdMutex<RequestState>>,
    pub phase: Arc<AtomicU8>,
    pub callbacks: Arc<StdMutex<std::collections::HashMap<u64, mlua::RegistryKey>>>,
    pub next_callback_id: Arc<AtomicU64>,
    /// True only for the single instance whose registration calls are
    /// actually recorded into the tenant's pending-route list (§4.6); all
    /// other instances execute the same source to populate globals but their
    /// registration primitives are no-ops while `phase == Load`.
    pub is_registration_instance: bool,
}

impl PooledInstance {
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn next_callback_id(&self) -> u64 {
        self.next_callback_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Rebinds this instance's request state ahead of a request (§4.6
    /// "Acquire"). The `req`/`res` Lua globals keep pointing at the same
    /// `Arc<Mutex<..>>`; only its contents change. Synchronous: the lock is
    /// only ever held across plain field assignment, never an `.await`.
    pub fn rebind(&self, state: RequestState) {
        let mut guard = self.state.lock().unwrap();
        *guard = state;
    }

    /// Resets to an inert state before returning to the free list (§4.6
    /// "Release"), so no stale request data leaks into the next acquirer.
    pub fn clear(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = RequestState::inert();
    }
}

/// Bounded pool of interpreters for one tenant. Uses a semaphore to cap
/// concurrent checkouts plus a free list of idle instances (§5: "the pool
/// uses a bounded semaphore plus a free list").
pub struct InterpreterPool {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<PooledInstance>>>,
    capacity: usize,
}

/// An interpreter checked out of the pool. Returns itself to the free list
/// (after clearing its state) when dropped-via-release; callers must call
/// [`InterpreterHandle::release`] explicitly rather than relying on `Drop`,
/// since releasing requires an `.await` to clear shared state.
pub struct InterpreterHandle<'a> {
    instance: Option<PooledInstance>,
    pool: &'a InterpreterPool,
    permit: SemaphorePermit<'a>,
}

impl<'a> InterpreterHandle<'a> {
    pub fn instance(&self) -> &PooledInstance {
        self.instance.as_ref().expect("instance present until release")
    }

    /// Returns the instance to the pool's free list for reuse. Discards the
    /// instance if `discard` is set, which callers use after an unrecoverable
    /// Lua error (§7 RuntimeError policy: "discard instance"). The checked-out
    /// permit is forgotten rather than dropped on discard, so the semaphore's
    /// count shrinks along with the free list instead of letting a future
    /// `acquire` hand out a permit for an instance that no longer exists.
    pub async fn release(mut self, discard: bool) {
        if let Some(instance) = self.instance.take() {
            if discard {
                tracing::warn!("discarding interpreter instance after error");
                self.permit.forget();
                return;
            }
            instance.clear();
            self.pool.free.lock().await.push(instance);
        }
    }
}

impl InterpreterPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            free: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds a freshly built instance directly to the free list, used during
    /// pool warm-up / registration (§4.6).
    pub async fn seed(&self, instance: PooledInstance) {
        self.free.lock().await.push(instance);
    }

    /// Acquire an idle instance, waiting on the semaphore if the pool is
    /// fully checked out, honoring cancellation so shutdown or a
    /// client-disconnect aborts the wait (§4.9, §7 Cancellation policy).
    pub async fn acquire(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<InterpreterHandle<'_>, ScriptError> {
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => permit.map_err(|_| ScriptError::Cancelled)?,
            _ = cancellation.cancelled() => return Err(ScriptError::Cancelled),
        };

        let instance = {
            let mut free = self.free.lock().await;
            free.pop()
        };

        let instance = match instance {
            Some(instance) => instance,
            None => {
                return Err(ScriptError::Runtime(
                    "interpreter pool exhausted its free list".to_string(),
                ))
            }
        };

        Ok(InterpreterHandle {
            instance: Some(instance),
            pool: self,
            permit,
        })
    }

    pub async fn idle_count(&self) -> usize {
        self.free.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::context::RequestState;
    use std::sync::atomic::AtomicU8;

    fn bare_instance(is_registration_instance: bool) -> PooledInstance {
        PooledInstance {
            lua: Lua::new(),
            state: Arc::new(StdMutex::new(RequestState::inert())),
            phase: Arc::new(AtomicU8::new(Phase::Load as u8)),
            callbacks: Arc::new(StdMutex::new(std::collections::HashMap::new())),
            next_callback_id: Arc::new(AtomicU64::new(0)),
            is_registration_instance,
        }
    }

    #[tokio::test]
    async fn acquire_and_release_round_trips_through_free_list() {
        let pool = InterpreterPool::new(1);
        pool.seed(bare_instance(true)).await;
        assert_eq!(pool.idle_count().await, 1);

        let handle = pool.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(pool.idle_count().await, 0);
        handle.release(false).await;
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn discard_on_release_shrinks_free_list_permanently() {
        let pool = InterpreterPool::new(1);
        pool.seed(bare_instance(true)).await;
        let handle = pool.acquire(&CancellationToken::new()).await.unwrap();
        handle.release(true).await;
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn acquire_respects_cancellation_when_pool_exhausted() {
        let pool = InterpreterPool::new(1);
        pool.seed(bare_instance(true)).await;
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = pool.acquire(&token).await;
        assert!(matches!(result, Err(ScriptError::Cancelled)));
    }

    #[test]
    fn phase_defaults_to_load_and_transitions_to_serving() {
        let instance = bare_instance(true);
        assert_eq!(instance.phase(), Phase::Load);
        instance.set_phase(Phase::Serving);
        assert_eq!(instance.phase(), Phase::Serving);
    }

    #[test]
    fn callback_ids_are_monotonic_per_instance() {
        let instance = bare_instance(false);
        let a = instance.next_callback_id();
        let b = instance.next_callback_id();
        assert_eq!(b, a + 1);
    }
}
