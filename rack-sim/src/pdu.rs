// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated power distribution unit
//!
//! The PDU holds one power cable per blade slot. Slot commands change a
//! single cable and, when the cable actually changes, pass the power notice
//! on to the blade. Turning the PDU itself off cuts every cable and notifies
//! every affected blade.

use crate::cable::CableBank;
use crate::envelope::{Envelope, Response};
use crate::errors::SimError;
use crate::fsm::{self, Ctx, Element, Entry, Machine, StateDef};
use crate::messages::{MessageTag, Payload, PduStatus, Status};
use crate::target::MessageTarget;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::fmt;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PduState {
    #[default]
    Working,
    Off,
    /// Can still be observed but no longer acts on commands
    Stuck,
}

impl fmt::Display for PduState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PduState::Working => "working",
            PduState::Off => "off",
            PduState::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

pub struct Pdu {
    rack: String,
    log: Logger,
    sm: Machine<Pdu>,
    cables: CableBank,
}

impl Element for Pdu {
    type State = PduState;
    type Msg = Envelope;

    fn machine(&self) -> &Machine<Self> {
        &self.sm
    }

    fn machine_mut(&mut self) -> &mut Machine<Self> {
        &mut self.sm
    }

    fn log(&self) -> &Logger {
        &self.log
    }
}

impl Pdu {
    pub fn new(
        rack: &str,
        initial: PduState,
        cables: CableBank,
        log: &Logger,
    ) -> Pdu {
        Pdu {
            rack: rack.to_string(),
            log: log.new(o!("element" => "pdu")),
            sm: Machine::new(PDU_STATES, initial),
            cables,
        }
    }

    pub fn state(&self) -> PduState {
        self.sm.current()
    }

    pub fn cables(&self) -> &CableBank {
        &self.cables
    }

    pub(crate) fn cables_mut(&mut self) -> &mut CableBank {
        &mut self.cables
    }

    pub fn status(&self) -> PduStatus {
        PduStatus {
            state: self.sm.current(),
            guard: self.sm.guard(),
            cables: self.cables.snapshot(),
        }
    }
}

// working: SetPower
//
// Returns true only when the whole PDU has been turned off.
fn set_power(pdu: &mut Pdu, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    let Payload::SetPower { on } = msg.payload else {
        fsm::unexpected_message(pdu, ctx, msg);
        return false;
    };
    match msg.target {
        MessageTarget::Pdu { .. } => power_pdu(pdu, ctx, msg, on),
        MessageTarget::Blade { blade, .. } => {
            let target = msg.target.clone();
            match pdu.cables.command(&target, blade, on, msg.guard, ctx.now) {
                Ok(()) => {
                    debug!(pdu.log, "power cable changed";
                        "blade" => blade,
                        "on" => on,
                        msg.link(),
                    );
                    ctx.forward(msg.acknowledge(Response::ok(ctx.now)));
                }
                Err(err) => {
                    debug!(pdu.log, "power command refused";
                        "blade" => blade,
                        "error" => %err,
                        msg.link(),
                    );
                    msg.respond(Response::failed(ctx.now, err));
                }
            }
            false
        }
        MessageTarget::Tor { .. } => {
            let target = msg.target.clone();
            msg.respond(Response::failed(
                ctx.now,
                SimError::InvalidTarget {
                    target,
                    reason: "power is not switched through the TOR",
                },
            ));
            false
        }
    }
}

// A PDU-wide power command is never acknowledged as such; its effects are
// observed through the cascaded blade notices and the PDU's own status.
fn power_pdu(
    pdu: &mut Pdu,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
    on: bool,
) -> bool {
    let target = msg.target.clone();
    if msg.guard < pdu.sm.guard() {
        msg.respond(Response::failed(
            ctx.now,
            SimError::RepairMessageDropped { target },
        ));
        return false;
    }
    pdu.sm.advance_guard(ctx.now);

    if on {
        msg.respond(Response::failed(
            ctx.now,
            SimError::RepairMessageDropped { target },
        ));
        return false;
    }

    let cut = pdu.cables.cut_all(ctx.now);
    info!(pdu.log, "powering off"; "blades" => cut.len(), msg.link());
    for blade in cut {
        let notice = msg.cascade(
            MessageTarget::blade(pdu.rack.clone(), blade),
            ctx.now,
            Payload::SetPower { on: false },
        );
        ctx.forward(notice);
    }
    msg.respond(Response::failed(
        ctx.now,
        SimError::RepairMessageDropped { target },
    ));
    true
}

// any state: GetStatus
fn report(pdu: &mut Pdu, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    if !msg.target.is_pdu() {
        let target = msg.target.clone();
        msg.respond(Response::failed(
            ctx.now,
            SimError::InvalidTarget {
                target,
                reason: "the PDU only reports its own status",
            },
        ));
        return false;
    }
    msg.respond(Response::status(ctx.now, Status::Pdu(pdu.status())));
    true
}

// off: SetPower
fn refuse(pdu: &mut Pdu, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    debug!(pdu.log, "dropping repair command while off"; msg.link());
    let target = msg.target.clone();
    msg.respond(Response::failed(
        ctx.now,
        SimError::RepairMessageDropped { target },
    ));
    false
}

// stuck: SetPower
//
// The completion channel is dropped unanswered.
fn ignore(pdu: &mut Pdu, _ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    warn!(pdu.log, "stuck, ignoring repair command";
        "target" => &msg.target,
        msg.link(),
    );
    false
}

static PDU_STATES: &[StateDef<Pdu>] = &[
    StateDef::new(
        PduState::Working,
        &[
            Entry::to(MessageTag::SetPower, set_power, PduState::Off),
            Entry::stay(MessageTag::GetStatus, report),
        ],
    ),
    StateDef::new(
        PduState::Off,
        &[
            Entry::stay(MessageTag::SetPower, refuse),
            Entry::stay(MessageTag::GetStatus, report),
        ],
    ),
    StateDef::new(
        PduState::Stuck,
        &[
            Entry::stay(MessageTag::SetPower, ignore),
            Entry::stay(MessageTag::GetStatus, report),
        ],
    ),
];
