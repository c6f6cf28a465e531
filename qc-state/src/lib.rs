//! # qc-state
//!
//! The proxy's model of the device: typed state variables with a raw (device)
//! side and a user (client) side, kept consistent through conversion
//! scripts, and the Device API loader that declares them.
//!
//! # Features
//!
//! - **Change detection**: a side only changes, and only notifies, when the
//!   new value differs from the stored one
//! - **Conversion scripts**: small expressions such as `value * 0.1 - 40`
//!   compiled once at load time
//! - **Access modes**: read-only variables never accept client writes and
//!   write-only variables are never polled
//! - **Auto-update timers**: periodic `UpdateRequested` events for polled
//!   variables
//!
//! # Quick Start
//!
//! ```rust
//! use qc_state::{ApiCatalog, StateStore, StoreEvent, Value, VariableKey, DEFAULT_MIN_AUTO_UPDATE};
//!
//! let catalog = ApiCatalog::parse(r#"
//!     <deviceAPI>
//!       <hardwareInterfaceList><hardwareInterface name="hwiTemp"/></hardwareInterfaceList>
//!       <stateVariableList>
//!         <stateVariable name="t0" hwInterface="hwiTemp">
//!           <type><device>uint</device><user>double</user></type>
//!           <conversion><toUser>value * 0.5</toUser></conversion>
//!         </stateVariable>
//!       </stateVariableList>
//!     </deviceAPI>"#).unwrap();
//!
//! let (mut store, mut events) = StateStore::new(DEFAULT_MIN_AUTO_UPDATE);
//! store.load(catalog.variables.clone());
//!
//! let key = VariableKey::new("hwiTemp", "t0");
//! store.update_from_device(&key, Value::from("42"), chrono::Utc::now()).unwrap();
//! assert_eq!(store.user_value(&key), Some(&Value::Double(21.0)));
//! assert!(matches!(events.try_recv(), Ok(StoreEvent::Updated { .. })));
//! ```

pub mod api;
pub mod error;
pub mod event;
pub mod script;
pub mod store;
pub mod value;
pub mod variable;

pub use api::{
    load_events, parse_document, ApiCatalog, ApiEvent, FunctionArgument, FunctionSpec,
    HardwareInterface, POSITIVE_ACK_KEY,
};
pub use error::{ApiError, ApiResult, ScriptError, StateError, StateResult, ValueError};
pub use event::StoreEvent;
pub use script::{Resolver, Script};
pub use store::{StateStore, DEFAULT_MIN_AUTO_UPDATE};
pub use value::{Value, ValueType};
pub use variable::{AccessMode, AutoUpdate, StateVariable, UpdateSide, VariableKey, VariableSpec};
