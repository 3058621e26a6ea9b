//! # workvpn-tunnel
//!
//! Drives one VPN tunnel from config text to an established link and back.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Tunnel config model, control-protocol events |
//! | **config** | Config parsing, validation, generation |
//! | **control** | Management-interface client (TCP line protocol) |
//! | **engine** | Engine binary discovery and version probing |
//! | **backend** | `TunnelBackend` / `StatisticsSource` traits |
//! | **process** | External engine process backend |
//! | **library** | In-process backend and the loopback engine |
//! | **stats** | Periodic counter polling |
//! | **settings** | Timeouts and paths, JSON-loadable |
//! | **orchestrator** | Connection state machine actor |

pub mod tunnel;
