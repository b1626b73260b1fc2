//! The broker's share registry (spec §4.6): two maps keyed by the 5-byte
//! share code, guarded by one mutex (grounded on the teacher's
//! single-mutex write discipline in `split.rs`'s `Arc<Mutex<Writer>>`, held
//! only across one critical section at a time — no code path here acquires
//! a Connection's own lock while holding this one).

use crate::app::SHARE_CODE_LEN;
use crate::error::RegistryError;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type ShareCode = [u8; SHARE_CODE_LEN];

const MAX_DRAW_ATTEMPTS: u32 = 32;

struct RegistryState<H> {
    awaiting: HashMap<ShareCode, H>,
    active: HashMap<ShareCode, H>,
}

/// Holds whatever a share needs a waiting receiver to find — in practice a
/// handle the receiver's HTTP handler uses to hand off its Connection.
pub struct Registry<H> {
    state: Mutex<RegistryState<H>>,
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Registry {
            state: Mutex::new(RegistryState {
                awaiting: HashMap::new(),
                active: HashMap::new(),
            }),
        }
    }

    /// Draws a share code not already present in either map and inserts
    /// `handle` into `awaiting` under it, all under one lock acquisition so
    /// the draw-and-insert is atomic (spec property 5/6).
    pub async fn register_awaiting(&self, handle: H) -> Result<ShareCode, RegistryError> {
        self.register_awaiting_with(handle, &mut rand::rng()).await
    }

    /// Same as [`Self::register_awaiting`], but draws codes from `rng`
    /// instead of the thread-local generator — the seam tests use to force
    /// a collision and exercise the redraw loop deterministically.
    async fn register_awaiting_with(
        &self,
        handle: H,
        rng: &mut impl RngCore,
    ) -> Result<ShareCode, RegistryError> {
        let mut state = self.state.lock().await;
        for _ in 0..MAX_DRAW_ATTEMPTS {
            let code = draw_code(rng);
            if !state.awaiting.contains_key(&code) && !state.active.contains_key(&code) {
                state.awaiting.insert(code, handle);
                return Ok(code);
            }
        }
        Err(RegistryError::ExhaustedRetries(MAX_DRAW_ATTEMPTS))
    }

    /// Looks up `code`, moving its entry from `awaiting` to `active` if
    /// present. Returns a clone of the handle so the caller can attach the
    /// receiver's Connection to it while the registry keeps its own
    /// reference in `active` for teardown.
    pub async fn claim(&self, code: &ShareCode) -> Result<H, RegistryError>
    where
        H: Clone,
    {
        let mut state = self.state.lock().await;
        let handle = state.awaiting.remove(code).ok_or(RegistryError::UnknownCode)?;
        state.active.insert(*code, handle.clone());
        Ok(handle)
    }

    /// Removes `code` from `active`; the sole teardown release point.
    pub async fn remove_active(&self, code: &ShareCode) {
        self.state.lock().await.active.remove(code);
    }

    /// Removes `code` from `awaiting`, used when a share fails before a
    /// receiver ever claims it.
    pub async fn remove_awaiting(&self, code: &ShareCode) {
        self.state.lock().await.awaiting.remove(code);
    }
}

fn draw_code(rng: &mut impl RngCore) -> ShareCode {
    let mut code = [0u8; SHARE_CODE_LEN];
    rng.fill_bytes(&mut code);
    code
}

pub type SharedRegistry<H> = Arc<Registry<H>>;
