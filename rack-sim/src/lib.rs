// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated rack control plane
//!
//! A rack is a tree of small state machines: the rack itself, one PDU
//! (power), one TOR (network) and a set of compute blades. Each rack runs as
//! its own tokio task that owns all of those elements and processes one
//! [`Envelope`] at a time. Repair commands carry a logical-time guard which
//! every element compares against the last change it applied, so commands
//! issued against stale information are rejected regardless of delivery
//! order.

pub mod blade;
pub mod cable;
pub mod clock;
pub mod cmd;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod errors;
pub mod fsm;
pub mod messages;
pub mod pdu;
pub mod rack;
pub mod target;
pub mod tor;

pub use clock::{SimClock, Stepper, Tick};
pub use config::Config;
pub use coordinator::Coordinator;
pub use envelope::{Envelope, Response};
pub use errors::SimError;
pub use messages::{Payload, Status};
pub use rack::RackHandle;
pub use target::{BladeId, MessageTarget};
