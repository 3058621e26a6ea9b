//! # workvpn-core
//!
//! Shared building blocks for the WorkVPN connection orchestrator.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **error** | `VpnError` / `VpnErrorKind` taxonomy and `VpnResult` |
//! | **types** | Connection state, statistics, status snapshots |
//! | **credentials** | Zeroize-on-drop username/password holder |
//! | **events** | `EventBus` broadcast and the `VpnEvent` payloads |

pub mod credentials;
pub mod error;
pub mod events;
pub mod types;

pub use credentials::{CredentialField, Credentials};
pub use error::{VpnError, VpnErrorKind, VpnResult};
pub use events::{EventBus, VpnEvent};
pub use types::*;
