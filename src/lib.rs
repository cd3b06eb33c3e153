//! Client side of an IEC 60870-5-104 telecontrol stack.
//!
//! This crate implements the hard part of a SCADA south-side IEC 104
//! connector: the per-endpoint connection state machine, a redundancy
//! supervisor that elects one active endpoint out of several candidates,
//! typed ASDU decoding against a static exchange table, outstanding-command
//! tracking for two-phase (ACT-CON/ACT-TERM) commands, and a quality
//! projector that synthesizes substitute readings when the real thing can't
//! be had. The wire codec itself — frame and ASDU encode/decode, APCI
//! sequence-number bookkeeping — is delegated to `lib60870-sys`.
//!
//! Host integration (config-file discovery, TLS certificate management, the
//! audit/log sinks, and the south-service that calls [`control::ControlSurface`])
//! lives outside this crate.

pub mod audit;
pub mod codec;
pub mod commands;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod quality;
pub mod redundancy;
pub mod types;

pub use control::ControlSurface;
pub use error::{Error, Result};
