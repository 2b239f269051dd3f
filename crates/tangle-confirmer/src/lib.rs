//! Client-side bundle confirmation runtime for a tangle ledger.
//!
//! - **Confirmer**: per-bundle state machine that promotes and reattaches a bundle until the
//!   ledger reports it included, emitting a [ConfirmerUpdate] for every action.
//! - **ConfirmationMonitor**: deduplicated confirmation watching; one poller per bundle hash no
//!   matter how many callers wait on it, with an optional WebSocket push shortcut.
//! - **MultiEndpointClient**: one logical ledger call over redundant endpoints (reads race,
//!   mutations go to a single designated node), accounting every outcome in [EndpointHealth].
//! - **Stopwatch**: named timers correlating a bundle's lifetime across components.

pub mod config;
pub mod confirmer;
pub mod health;
pub mod monitor;
pub mod multiapi;
pub mod node;
pub mod stopwatch;
pub mod trytes;
pub mod update;

pub use config::{
    ConfirmerConfig, EndpointConfig, MonitorConfig, ReconnectionConfig, MIN_WEIGHT_MAGNITUDE,
};
pub use confirmer::{CancelHandle, Confirmer, ConfirmerError, LoadGauge};
pub use health::{EndpointHandle, EndpointHealth, EndpointStats};
pub use monitor::{ConfirmationCallback, ConfirmationMonitor, MonitorError, RegistrationId};
pub use multiapi::{ApiError, EndpointSet, LedgerApis, MultiEndpointClient, Reply};
pub use node::{Consistency, HttpNode, LedgerNode, NodeError, PrepareOptions, Tips, Transfer};
pub use stopwatch::Stopwatch;
pub use trytes::{tail_of, Hash, Transaction, TrytesError};
pub use update::{ConfirmerUpdate, UpdateKind, UpdateStream};
