//! # sockaudit-ebpf
//!
//! Turns decoded kernel socket trace events into flow audit records.
//!
//! - **State engine** ([`state`]): processes, sockets and flows, with
//!   timeout-driven termination and emission.
//! - **Dispatcher** ([`dispatch`]): the single consumer of the event,
//!   error and loss streams.
//! - **Clock** ([`clock`], [`clock_sync`]): kernel trace clock to
//!   wall-clock translation, calibrated through marked `uname(2)` calls.
//! - **DNS** ([`dns`]): resolutions indexed by address for enrichment.
//!
//! Attaching kernel hooks and decoding the raw ring buffer are left to the
//! capture source feeding [`dispatch::EventChannels`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bootstrap;
pub mod clock;
pub mod clock_sync;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod events;
pub mod process;
pub mod report;
pub mod sensor;
pub mod state;
