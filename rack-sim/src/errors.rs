// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types returned by simulated elements

use crate::clock::Tick;
use crate::messages::Capacity;
use crate::target::MessageTarget;
use thiserror::Error;
use uuid::Uuid;

/// An error reported back to the submitter of a message in its [`Response`]
///
/// None of these unwind past the rack boundary. Staleness errors
/// (`ChangeTooLate`, `RepairMessageDropped`) are expected outcomes: the
/// submitter should re-evaluate with current information and resubmit.
///
/// [`Response`]: crate::envelope::Response
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: MessageTarget, reason: &'static str },

    #[error(
        "change issued at tick {guard} is older than the last change, \
         applied at tick {current}"
    )]
    ChangeTooLate { guard: Tick, current: Tick },

    #[error("repair message for {target} was dropped")]
    RepairMessageDropped { target: MessageTarget },

    #[error("{target} is already in the requested state")]
    NoOperation { target: MessageTarget },

    #[error("cable is faulted and cannot change state")]
    CableStuck,

    #[error("unexpected message {message} while in state {state}")]
    UnexpectedMessage { state: String, message: String },

    #[error("rack {0} has already been started")]
    AlreadyStarted(String),

    #[error(
        "workload needs {requested:?} but only {available:?} is available"
    )]
    CapacityExceeded { requested: Capacity, available: Capacity },

    #[error("no workload {0} on this blade")]
    NoSuchWorkload(Uuid),

    #[error("workload {0} is already placed on this blade")]
    DuplicateWorkload(Uuid),

    #[error("no rack named {0:?}")]
    NoSuchRack(String),

    #[error("rack {0} is no longer running")]
    RackStopped(String),

    #[error("inbound queue for rack {0} is full")]
    QueueFull(String),

    #[error("{target} did not respond")]
    NoResponse { target: MessageTarget },
}

/// An internal error that halts the rack task that hit it
///
/// These indicate a defect in the simulation itself (for example, routing
/// produced a message for an element that does not exist), not a runtime
/// condition that a submitter could correct.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RackFault {
    #[error("internal message for {target} has no handler: {reason}")]
    Unroutable { target: MessageTarget, reason: &'static str },
}
