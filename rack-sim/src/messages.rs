// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Repair commands, status queries and the status they report

use crate::blade::BladeState;
use crate::cable::Cable;
use crate::clock::{Tick, TimerId};
use crate::pdu::PduState;
use crate::target::{BladeId, MessageTarget};
use crate::tor::TorState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Compute resources of a blade, or the share of them a workload uses
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Capacity {
    pub cores: u32,
    pub memory_mib: u64,
}

impl Capacity {
    pub const ZERO: Capacity = Capacity { cores: 0, memory_mib: 0 };

    pub fn new(cores: u32, memory_mib: u64) -> Capacity {
        Capacity { cores, memory_mib }
    }

    /// `self + other`, or `None` if either dimension overflows
    pub fn checked_add(&self, other: &Capacity) -> Option<Capacity> {
        Some(Capacity {
            cores: self.cores.checked_add(other.cores)?,
            memory_mib: self.memory_mib.checked_add(other.memory_mib)?,
        })
    }

    /// `self - other`, saturating each dimension at zero
    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cores: self.cores.saturating_sub(other.cores),
            memory_mib: self.memory_mib.saturating_sub(other.memory_mib),
        }
    }

    /// Whether `other` fits entirely within `self`
    pub fn contains(&self, other: &Capacity) -> bool {
        other.cores <= self.cores && other.memory_mib <= self.memory_mib
    }
}

/// The body of a message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Turn power on or off at the PDU (whole PDU or one blade's cable)
    SetPower { on: bool },
    /// Enable or disable network at the TOR (whole TOR or one blade's cable)
    SetConnection { enabled: bool },
    GetStatus,
    /// A timer armed by the target element has fired
    TimerExpiry { id: TimerId },
    /// Start a workload on a working blade
    PlaceWorkload { id: Uuid, size: Capacity },
    /// A workload finished or was stopped
    RemoveWorkload { id: Uuid },
    /// Stop a working blade gracefully
    Shutdown,
}

/// Dispatch key for [`Payload`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageTag {
    SetPower,
    SetConnection,
    GetStatus,
    TimerExpiry,
    PlaceWorkload,
    RemoveWorkload,
    Shutdown,
}

/// The first element a message visits inside its rack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hop {
    Pdu,
    Tor,
    Blade,
}

impl Payload {
    pub fn tag(&self) -> MessageTag {
        match self {
            Payload::SetPower { .. } => MessageTag::SetPower,
            Payload::SetConnection { .. } => MessageTag::SetConnection,
            Payload::GetStatus => MessageTag::GetStatus,
            Payload::TimerExpiry { .. } => MessageTag::TimerExpiry,
            Payload::PlaceWorkload { .. } => MessageTag::PlaceWorkload,
            Payload::RemoveWorkload { .. } => MessageTag::RemoveWorkload,
            Payload::Shutdown => MessageTag::Shutdown,
        }
    }

    /// Whether this message asks for a change to simulated hardware
    pub fn is_repair(&self) -> bool {
        !matches!(self, Payload::GetStatus | Payload::TimerExpiry { .. })
    }

    /// Select how a message with this payload enters the rack
    ///
    /// Power goes through the PDU. Status for the PDU itself is read
    /// directly from the PDU; every other status query and every other
    /// command travels over the network, through the TOR. Timer expiries
    /// are delivered straight to the element that armed them.
    pub fn send_via(&self, target: &MessageTarget) -> Hop {
        match self {
            Payload::SetPower { .. } => Hop::Pdu,
            Payload::GetStatus if target.is_pdu() => Hop::Pdu,
            Payload::GetStatus
            | Payload::SetConnection { .. }
            | Payload::PlaceWorkload { .. }
            | Payload::RemoveWorkload { .. }
            | Payload::Shutdown => Hop::Tor,
            Payload::TimerExpiry { .. } => Hop::Blade,
        }
    }
}

/// Observed state of a PDU
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PduStatus {
    pub state: PduState,
    pub guard: Tick,
    pub cables: BTreeMap<BladeId, Cable>,
}

/// Observed state of a TOR
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TorStatus {
    pub state: TorState,
    pub guard: Tick,
    pub cables: BTreeMap<BladeId, Cable>,
}

/// Observed state of a blade
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BladeStatus {
    pub id: BladeId,
    pub state: BladeState,
    pub guard: Tick,
    pub capacity: Capacity,
    pub used: Capacity,
    pub workloads: BTreeSet<Uuid>,
    pub connected: bool,
}

/// Payload of a successful `GetStatus`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum Status {
    Pdu(PduStatus),
    Tor(TorStatus),
    Blade(BladeStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing() {
        let pdu = MessageTarget::pdu("r1");
        let tor = MessageTarget::tor("r1");
        let blade = MessageTarget::blade("r1", 2);

        let power = Payload::SetPower { on: true };
        assert_eq!(power.send_via(&pdu), Hop::Pdu);
        assert_eq!(power.send_via(&blade), Hop::Pdu);

        // PDU status bypasses the TOR; every other status query does not.
        assert_eq!(Payload::GetStatus.send_via(&pdu), Hop::Pdu);
        assert_eq!(Payload::GetStatus.send_via(&tor), Hop::Tor);
        assert_eq!(Payload::GetStatus.send_via(&blade), Hop::Tor);

        let connect = Payload::SetConnection { enabled: false };
        assert_eq!(connect.send_via(&blade), Hop::Tor);
        assert_eq!(Payload::Shutdown.send_via(&blade), Hop::Tor);
        assert_eq!(
            Payload::RemoveWorkload { id: Uuid::new_v4() }.send_via(&blade),
            Hop::Tor
        );

        let expiry = Payload::TimerExpiry { id: TimerId(1) };
        assert_eq!(expiry.send_via(&blade), Hop::Blade);
        assert!(!expiry.is_repair());
        assert!(!Payload::GetStatus.is_repair());
        assert!(power.is_repair());
    }

    #[test]
    fn capacity_arithmetic() {
        let blade = Capacity::new(16, 65536);
        let small = Capacity::new(4, 8192);
        let used = small.checked_add(&small).unwrap();
        assert_eq!(used, Capacity::new(8, 16384));
        assert!(blade.contains(&used));
        assert!(!small.contains(&used));
        assert_eq!(blade.saturating_sub(&used), Capacity::new(8, 49152));
        assert_eq!(small.saturating_sub(&blade), Capacity::ZERO);
        assert_eq!(Capacity::new(u32::MAX, 0).checked_add(&small), None);
    }
}
