//! Per-module finite state machine. The sole authority
//! over a module's live state; all transitions and hook invocations are
//! serialized on the module's owning thread, but the `Fsm` handle itself is
//! a small `parking_lot::Mutex`-guarded value any thread may read.

use crate::error::InvariantError;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Deactivated,
    Activating,
    Idle,
    Locked,
    Deactivating,
}

impl FsmState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Deactivated => "deactivated",
            FsmState::Activating => "activating",
            FsmState::Idle => "idle",
            FsmState::Locked => "locked",
            FsmState::Deactivating => "deactivating",
        }
    }

    /// A module is in `idle`/`locked` only if this holds for all of its
    /// non-optional connectors' targets too (checked by the manager, not
    /// here — this just identifies the states that rule applies to).
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, FsmState::Idle | FsmState::Locked)
    }
}

/// Owns the current state and enforces the lifecycle transition table.
/// `set_locked`/`set_unlocked` are the only entry points that flip
/// `Idle <-> Locked` (self-lock discipline) — callers on behalf of
/// "external code" must go through [`Fsm::external_set_locked`], which
/// always fails, to make the distinction observable in tests.
#[derive(Debug)]
pub struct Fsm {
    module: String,
    state: Mutex<FsmState>,
}

impl Fsm {
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            state: Mutex::new(FsmState::Deactivated),
        }
    }

    #[must_use]
    pub fn state(&self) -> FsmState {
        *self.state.lock()
    }

    fn transition(&self, expected: &[FsmState], to: FsmState) -> Result<(), InvariantError> {
        let mut guard = self.state.lock();
        if !expected.contains(&guard) {
            return Err(InvariantError::InvalidTransition {
                module: self.module.clone(),
                from: guard.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        *guard = to;
        Ok(())
    }

    /// `deactivated --activate-> activating`.
    ///
    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `deactivated`.
    pub fn begin_activate(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Deactivated], FsmState::Activating)
    }

    /// `activating --success-> idle`.
    ///
    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `activating`.
    pub fn activate_succeeded(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Activating], FsmState::Idle)
    }

    /// `activating --failure-> deactivated`.
    ///
    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `activating`.
    pub fn activate_failed(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Activating], FsmState::Deactivated)
    }

    /// `idle --deactivate-> deactivating`.
    ///
    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `idle` or
    /// `locked`.
    pub fn begin_deactivate(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Idle, FsmState::Locked], FsmState::Deactivating)
    }

    /// `deactivating --> deactivated`. Always reachable once deactivation
    /// has begun: the manager calls this unconditionally after the hook
    /// returns or raises.
    ///
    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `deactivating`.
    pub fn finish_deactivate(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Deactivating], FsmState::Deactivated)
    }

    /// Self-lock only: module code calls this from within its own
    /// hooks/dispatch; the manager never calls it on a module's behalf.
    ///
    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `idle`.
    pub fn self_lock(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Idle], FsmState::Locked)
    }

    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `locked`.
    pub fn self_unlock(&self) -> Result<(), InvariantError> {
        self.transition(&[FsmState::Locked], FsmState::Idle)
    }

    /// Always fails: external code may read `locked` but must never write
    /// it. Exists so the violation surfaces as a defined error rather
    /// than being silently impossible to express.
    ///
    /// # Errors
    /// Always [`InvariantError::ExternalStateWrite`].
    pub fn external_set_locked(&self) -> Result<(), InvariantError> {
        Err(InvariantError::ExternalStateWrite {
            module: self.module.clone(),
            attempted: FsmState::Locked.as_str().to_string(),
        })
    }
}

/// The FSM handle a module's own lifecycle hooks are given through
/// [`crate::module::ModuleCtx`]. Deliberately narrower than [`Fsm`] itself:
/// it exposes `state()` for reading and `self_lock`/`self_unlock` for the
/// self-lock discipline (I2), with no way to reach `begin_activate` or any
/// other manager-only transition.
#[derive(Debug, Clone)]
pub struct FsmHandle(Arc<Fsm>);

impl FsmHandle {
    #[must_use]
    pub fn new(fsm: Arc<Fsm>) -> Self {
        Self(fsm)
    }

    #[must_use]
    pub fn state(&self) -> FsmState {
        self.0.state()
    }

    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `idle`.
    pub fn self_lock(&self) -> Result<(), InvariantError> {
        self.0.self_lock()
    }

    /// # Errors
    /// [`InvariantError::InvalidTransition`] if not currently `locked`.
    pub fn self_unlock(&self) -> Result<(), InvariantError> {
        self.0.self_unlock()
    }
}
