//! State variable storage with change detection
//!
//! The store owns every state variable of the loaded Device API and keeps
//! their raw (device) and user (client) sides consistent:
//!
//! - `update_from_device` sets the raw side and derives the user side
//! - `set_value` sets the user side and derives the raw side
//!
//! A side only counts as changed when the new value differs from the stored
//! one, and only changes produce [`StoreEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{ScriptError, StateError, StateResult};
use crate::event::StoreEvent;
use crate::script::Resolver;
use crate::value::Value;
use crate::variable::{StateVariable, VariableKey, VariableSpec};

/// Default lower bound for auto-update intervals
pub const DEFAULT_MIN_AUTO_UPDATE: Duration = Duration::from_millis(10);

// ============================================================================
// AutoUpdateTask - periodic `UpdateRequested` emitter
// ============================================================================

/// Timer task for one variable; aborted when dropped
#[derive(Debug)]
struct AutoUpdateTask {
    interval: Duration,
    handle: JoinHandle<()>,
}

impl AutoUpdateTask {
    fn start(key: VariableKey, interval: Duration, event_tx: mpsc::UnboundedSender<StoreEvent>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let event = StoreEvent::UpdateRequested { key: key.clone() };
                if event_tx.send(event).is_err() {
                    debug!(variable = %key, "Store event channel closed, stopping auto-update");
                    break;
                }
            }
        });
        Self { interval, handle }
    }
}

impl Drop for AutoUpdateTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// StateStore
// ============================================================================

pub struct StateStore {
    variables: BTreeMap<VariableKey, StateVariable>,
    auto_updates: HashMap<VariableKey, AutoUpdateTask>,
    min_interval: Duration,
    event_tx: mpsc::UnboundedSender<StoreEvent>,
}

impl StateStore {
    /// Create an empty store and the receiving end of its event channel
    pub fn new(min_interval: Duration) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let store = Self {
            variables: BTreeMap::new(),
            auto_updates: HashMap::new(),
            min_interval,
            event_tx,
        };
        (store, event_rx)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Add a variable; returns `false` if the key already exists
    pub fn insert(&mut self, spec: VariableSpec) -> bool {
        if self.variables.contains_key(&spec.key) {
            warn!(variable = %spec.key, "Duplicate state variable ignored");
            return false;
        }
        self.variables
            .insert(spec.key.clone(), StateVariable::new(spec));
        true
    }

    /// Replace every variable with `specs`
    pub fn load<I>(&mut self, specs: I) -> usize
    where
        I: IntoIterator<Item = VariableSpec>,
    {
        self.reset();
        let mut loaded = 0;
        for spec in specs {
            if self.insert(spec) {
                loaded += 1;
            }
        }
        loaded
    }

    /// Start the device-side auto-updates declared by the loaded variables
    ///
    /// Must be called from within a tokio runtime. Variables whose
    /// declaration is refused are logged and skipped.
    pub fn arm_auto_updates(&mut self) -> usize {
        let declared: Vec<(VariableKey, Duration)> = self
            .variables
            .values()
            .filter_map(|variable| {
                let interval = variable.spec().device_poll_interval()?;
                Some((variable.key().clone(), interval))
            })
            .collect();

        let mut armed = 0;
        for (key, interval) in declared {
            match self.start_auto_update(&key, interval) {
                Ok(()) => armed += 1,
                Err(e) => warn!(variable = %key, error = %e, "Auto-update not started"),
            }
        }
        armed
    }

    /// Drop every variable and stop every timer
    pub fn reset(&mut self) {
        self.auto_updates.clear();
        self.variables.clear();
    }

    pub fn get(&self, key: &VariableKey) -> Option<&StateVariable> {
        self.variables.get(key)
    }

    pub fn contains(&self, key: &VariableKey) -> bool {
        self.variables.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Variables in key order
    pub fn iter(&self) -> impl Iterator<Item = &StateVariable> {
        self.variables.values()
    }

    /// Readable variables that currently have a user value, in key order
    pub fn snapshot(&self) -> impl Iterator<Item = (&VariableKey, &Value)> {
        self.variables.values().filter_map(|variable| {
            if !variable.access().can_read() {
                return None;
            }
            Some((variable.key(), variable.user_value()?))
        })
    }

    pub fn raw_value(&self, key: &VariableKey) -> Option<&Value> {
        self.variables.get(key)?.raw_value()
    }

    pub fn user_value(&self, key: &VariableKey) -> Option<&Value> {
        self.variables.get(key)?.user_value()
    }

    /// Apply a raw value reported by the device
    ///
    /// Returns whether the raw side changed. When it did, the user side is
    /// re-derived; if that conversion fails the previous user value is kept.
    pub fn update_from_device(
        &mut self,
        key: &VariableKey,
        raw: Value,
        timestamp: DateTime<Utc>,
    ) -> StateResult<bool> {
        let variable = self.variable(key)?;
        let raw = raw
            .cast(variable.spec().raw_type)
            .map_err(|source| StateError::InvalidValue {
                key: key.clone(),
                source,
            })?;
        if variable.raw_value() == Some(&raw) {
            trace!(variable = %key, "Raw value unchanged");
            return Ok(false);
        }

        let user = match self.derive_user(variable, &raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(variable = %key, error = %e, "toUser conversion failed, keeping previous user value");
                None
            }
        };

        let variable = self.variable_mut(key)?;
        variable.raw = Some(raw.clone());
        variable.last_update = Some(timestamp);
        if let Some(user) = &user {
            variable.user = Some(user.clone());
        }

        self.emit(StoreEvent::Updated {
            key: key.clone(),
            raw,
            user,
            timestamp,
        });
        Ok(true)
    }

    /// Apply a user value coming from a client
    ///
    /// Refused for variables without write access. Returns whether the user
    /// side changed; a change emits `SendToDevice` with the derived raw value.
    pub fn set_value(&mut self, key: &VariableKey, user: Value) -> StateResult<bool> {
        let variable = self.writable(key)?;
        let user = user
            .cast(variable.spec().user_type)
            .map_err(|source| StateError::InvalidValue {
                key: key.clone(),
                source,
            })?;
        if variable.user_value() == Some(&user) {
            trace!(variable = %key, "User value unchanged");
            return Ok(false);
        }

        let raw = self
            .derive_raw(variable, &user)
            .map_err(|source| StateError::Conversion {
                key: key.clone(),
                source,
            })?;

        let variable = self.variable_mut(key)?;
        variable.user = Some(user);
        variable.raw = Some(raw.clone());

        self.emit(StoreEvent::SendToDevice {
            key: key.clone(),
            raw,
        });
        Ok(true)
    }

    /// Compute the raw value for `user` without storing anything
    pub fn convert_to_raw(&self, key: &VariableKey, user: Value) -> StateResult<Value> {
        let variable = self.writable(key)?;
        let user = user
            .cast(variable.spec().user_type)
            .map_err(|source| StateError::InvalidValue {
                key: key.clone(),
                source,
            })?;
        self.derive_raw(variable, &user)
            .map_err(|source| StateError::Conversion {
                key: key.clone(),
                source,
            })
    }

    /// Poll the device for `key` every `interval`
    ///
    /// Replaces a running timer for the same variable. Must be called from
    /// within a tokio runtime.
    pub fn start_auto_update(&mut self, key: &VariableKey, interval: Duration) -> StateResult<()> {
        let variable = self.variable(key)?;
        if !variable.access().can_read() {
            return Err(StateError::AccessDenied {
                key: key.clone(),
                access: variable.access(),
            });
        }
        if interval < self.min_interval {
            return Err(StateError::IntervalTooShort {
                requested: interval,
                minimum: self.min_interval,
            });
        }

        let task = AutoUpdateTask::start(key.clone(), interval, self.event_tx.clone());
        self.auto_updates.insert(key.clone(), task);
        debug!(variable = %key, ?interval, "Auto-update started");
        Ok(())
    }

    /// Stop the timer for `key`; returns whether one was running
    pub fn stop_auto_update(&mut self, key: &VariableKey) -> bool {
        let stopped = self.auto_updates.remove(key).is_some();
        if stopped {
            debug!(variable = %key, "Auto-update stopped");
        }
        stopped
    }

    /// Interval of the running timer for `key`
    pub fn auto_update_interval(&self, key: &VariableKey) -> Option<Duration> {
        self.auto_updates.get(key).map(|task| task.interval)
    }

    fn variable(&self, key: &VariableKey) -> StateResult<&StateVariable> {
        self.variables
            .get(key)
            .ok_or_else(|| StateError::UnknownVariable(key.clone()))
    }

    fn variable_mut(&mut self, key: &VariableKey) -> StateResult<&mut StateVariable> {
        self.variables
            .get_mut(key)
            .ok_or_else(|| StateError::UnknownVariable(key.clone()))
    }

    fn writable(&self, key: &VariableKey) -> StateResult<&StateVariable> {
        let variable = self.variable(key)?;
        if !variable.access().can_write() {
            return Err(StateError::AccessDenied {
                key: key.clone(),
                access: variable.access(),
            });
        }
        Ok(variable)
    }

    fn derive_user(&self, variable: &StateVariable, raw: &Value) -> Result<Value, ScriptError> {
        let spec = variable.spec();
        match &spec.to_user {
            Some(script) => script.convert(raw, spec.user_type, &spec.key.hw_interface, self),
            None => Ok(raw.cast(spec.user_type)?),
        }
    }

    fn derive_raw(&self, variable: &StateVariable, user: &Value) -> Result<Value, ScriptError> {
        let spec = variable.spec();
        match &spec.to_device {
            Some(script) => script.convert(user, spec.raw_type, &spec.key.hw_interface, self),
            None => Ok(user.cast(spec.raw_type)?),
        }
    }

    fn emit(&self, event: StoreEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("Store event dropped, no receiver");
        }
    }
}

impl Resolver for StateStore {
    fn resolve(&self, hw_interface: &str, name: &str) -> Option<Value> {
        self.user_value(&VariableKey::new(hw_interface, name)).cloned()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("variable_count", &self.variables.len())
            .field("auto_updates", &self.auto_updates.len())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}
