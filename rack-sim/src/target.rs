// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Addressing for simulated rack elements

use serde::{Deserialize, Serialize};
use std::fmt;

/// Slot number of a blade within its rack
pub type BladeId = u32;

/// Names one element within a named rack
///
/// This is purely a naming value. Routing decisions are made by the rack
/// based on the message payload, using these classification helpers.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum MessageTarget {
    Tor { rack: String },
    Pdu { rack: String },
    Blade { rack: String, blade: BladeId },
}

impl MessageTarget {
    pub fn tor(rack: impl Into<String>) -> Self {
        MessageTarget::Tor { rack: rack.into() }
    }

    pub fn pdu(rack: impl Into<String>) -> Self {
        MessageTarget::Pdu { rack: rack.into() }
    }

    pub fn blade(rack: impl Into<String>, blade: BladeId) -> Self {
        MessageTarget::Blade { rack: rack.into(), blade }
    }

    /// Name of the rack containing the target element
    pub fn rack(&self) -> &str {
        match self {
            MessageTarget::Tor { rack }
            | MessageTarget::Pdu { rack }
            | MessageTarget::Blade { rack, .. } => rack,
        }
    }

    pub fn is_tor(&self) -> bool {
        matches!(self, MessageTarget::Tor { .. })
    }

    pub fn is_pdu(&self) -> bool {
        matches!(self, MessageTarget::Pdu { .. })
    }

    /// Returns the blade slot if this target names a blade
    pub fn blade_id(&self) -> Option<BladeId> {
        match self {
            MessageTarget::Blade { blade, .. } => Some(*blade),
            _ => None,
        }
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTarget::Tor { rack } => write!(f, "TOR in rack {rack}"),
            MessageTarget::Pdu { rack } => write!(f, "PDU in rack {rack}"),
            MessageTarget::Blade { rack, blade } => {
                write!(f, "blade {blade} in rack {rack}")
            }
        }
    }
}

impl slog::Value for MessageTarget {
    fn serialize(
        &self,
        _record: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}
