//! Peer-to-peer networking core for a Bitcoin-style full node: connection
//! pool, per-peer handshake and message dispatch, headers-first sync with
//! checkpoint acceleration, and BIP152 compact block reconstruction.
#![allow(clippy::too_many_arguments)]

pub mod fsm;

pub use fsm::{Config, DisconnectReason, Event, Io, Limits, StateMachine};
