//! Freeze/melt controller (§4.7).
//!
//! `MELTED` is the normal operating state. `freeze(None)` holds `FROZEN`
//! until an explicit `melt()`; `freeze(Some(timeout))` holds `FROZEN_TIMEO`
//! and schedules a delayed melt. `FROZEN_DEEP` is an internal hold used
//! during attach/detach that rejects external freeze/melt calls.
//!
//! The delayed-melt task holds only a cloned `Arc` to the controller and
//! checks an epoch counter before acting, so a freeze/melt that happens
//! during the sleep invalidates the stale timer instead of racing it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::WalbError;

/// The freeze state machine's current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    Melted,
    Frozen,
    FrozenTimeo,
    FrozenDeep,
}

struct Inner {
    state: FreezeState,
    epoch: u64,
}

/// Shared freeze/melt state for one attached engine.
pub struct FreezeController {
    inner: Mutex<Inner>,
}

impl FreezeController {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: FreezeState::Melted,
                epoch: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> FreezeState {
        self.lock().state
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        !matches!(self.state(), FreezeState::Melted)
    }

    /// Freeze, indefinitely if `timeout` is `None` or for `timeout` otherwise.
    /// Re-entering freeze while already `FROZEN`/`FROZEN_TIMEO` refreshes the
    /// timeout rather than erroring.
    pub fn freeze(self: &Arc<Self>, timeout: Option<Duration>) -> Result<(), WalbError> {
        let epoch = {
            let mut guard = self.lock();
            if guard.state == FreezeState::FrozenDeep {
                return Err(WalbError::State("cannot freeze during deep freeze".into()));
            }
            guard.epoch += 1;
            guard.state = if timeout.is_some() {
                FreezeState::FrozenTimeo
            } else {
                FreezeState::Frozen
            };
            guard.epoch
        };

        if let Some(delay) = timeout {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut guard = this.lock();
                if guard.epoch == epoch && guard.state == FreezeState::FrozenTimeo {
                    guard.state = FreezeState::Melted;
                }
            });
        }
        Ok(())
    }

    pub fn melt(&self) -> Result<(), WalbError> {
        let mut guard = self.lock();
        if guard.state == FreezeState::FrozenDeep {
            return Err(WalbError::State("cannot melt during deep freeze".into()));
        }
        guard.epoch += 1;
        guard.state = FreezeState::Melted;
        Ok(())
    }

    /// Enter `FROZEN_DEEP` for the duration of an attach/detach, rejecting
    /// external freeze/melt calls until [`Self::exit_deep_freeze`].
    pub fn enter_deep_freeze(&self) {
        let mut guard = self.lock();
        guard.epoch += 1;
        guard.state = FreezeState::FrozenDeep;
    }

    pub fn exit_deep_freeze(&self) {
        let mut guard = self.lock();
        guard.epoch += 1;
        guard.state = FreezeState::Melted;
    }
}
