//! Device-level state machine

use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::{HalError, Result};
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninitialized,
    Configuring,
    Streaming,
    Flushing,
    Error,
    Destroyed,
}

impl DeviceState {
    /// Legal transitions. `Error` and `Destroyed` are entered through
    /// [`StateCell::fail`] and [`StateCell::destroy`].
    pub fn can_transition(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Uninitialized, Configuring)
                | (Configuring, Configuring)
                | (Configuring, Streaming)
                | (Streaming, Configuring)
                | (Streaming, Flushing)
                | (Flushing, Streaming)
                | (Flushing, Configuring)
        )
    }
}

#[derive(Debug)]
pub struct StateCell(Mutex<DeviceState>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Mutex::new(DeviceState::Uninitialized))
    }
}

impl StateCell {
    pub fn get(&self) -> DeviceState {
        *lock(&self.0)
    }

    /// Fail fast for calls that need a live device.
    pub fn ensure_usable(&self) -> Result<DeviceState> {
        match self.get() {
            DeviceState::Error => Err(HalError::fatal("device is in error state")),
            DeviceState::Destroyed => Err(HalError::invalid_operation("device is closed")),
            state => Ok(state),
        }
    }

    pub fn transition(&self, next: DeviceState) -> Result<DeviceState> {
        let mut state = lock(&self.0);
        let prev = *state;
        if prev == DeviceState::Error {
            return Err(HalError::fatal("device is in error state"));
        }
        if !prev.can_transition(next) {
            return Err(HalError::invalid_operation(format!(
                "device cannot go from {prev:?} to {next:?}"
            )));
        }
        if prev != next {
            info!(from = ?prev, to = ?next, "device state");
        }
        *state = next;
        Ok(prev)
    }

    /// Enter `Error`. Returns `true` only for the call that made the change.
    pub fn fail(&self) -> bool {
        let mut state = lock(&self.0);
        if matches!(*state, DeviceState::Error | DeviceState::Destroyed) {
            return false;
        }
        warn!(from = ?*state, "device state -> Error");
        *state = DeviceState::Error;
        true
    }

    pub fn destroy(&self) -> DeviceState {
        let mut state = lock(&self.0);
        let prev = *state;
        *state = DeviceState::Destroyed;
        prev
    }
}
