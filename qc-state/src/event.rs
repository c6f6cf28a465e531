//! Notifications emitted by the state store
//!
//! Events carry the new values so the consumer does not need to look them
//! up again. They are delivered on a single-consumer tokio channel drained by
//! the coordinator.

use chrono::{DateTime, Utc};

use crate::value::Value;
use crate::variable::VariableKey;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The raw side changed after a device update
    Updated {
        key: VariableKey,
        raw: Value,
        /// `None` when the user value could not be derived
        user: Option<Value>,
        timestamp: DateTime<Utc>,
    },

    /// A client changed the user side; the raw value must reach the device
    SendToDevice { key: VariableKey, raw: Value },

    /// An auto-update timer fired; the device should be asked for the value
    UpdateRequested { key: VariableKey },
}

impl StoreEvent {
    /// Variable this event is about
    pub fn key(&self) -> &VariableKey {
        match self {
            Self::Updated { key, .. } | Self::SendToDevice { key, .. } | Self::UpdateRequested { key } => key,
        }
    }
}
