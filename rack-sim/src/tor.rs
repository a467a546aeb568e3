// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated top-of-rack switch
//!
//! The TOR mirrors the PDU for network cables. It is also the path every
//! other network-borne message takes to reach a blade: status queries and
//! workload commands are passed through to the addressed blade, the latter
//! only while that blade's network cable is on.

use crate::cable::CableBank;
use crate::envelope::{Envelope, Response};
use crate::errors::SimError;
use crate::fsm::{self, Ctx, Element, Entry, Machine, StateDef};
use crate::messages::{MessageTag, Payload, Status, TorStatus};
use crate::target::MessageTarget;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::fmt;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TorState {
    #[default]
    Working,
    Off,
    Stuck,
}

impl fmt::Display for TorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TorState::Working => "working",
            TorState::Off => "off",
            TorState::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

pub struct Tor {
    rack: String,
    log: Logger,
    sm: Machine<Tor>,
    cables: CableBank,
}

impl Element for Tor {
    type State = TorState;
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

impl Tor {
    pub fn new(
        rack: &str,
        initial: TorState,
        cables: CableBank,
        log: &Logger,
    ) -> Tor {
        Tor {
            rack: rack.to_string(),
            log: log.new(o!("element" => "tor")),
            sm: Machine::new(TOR_STATES, initial),
            cables,
        }
    }

    pub fn state(&self) -> TorState {
        self.sm.current()
    }

    pub fn cables(&self) -> &CableBank {
        &self.cables
    }

    pub(crate) fn cables_mut(&mut self) -> &mut CableBank {
        &mut self.cables
    }

    pub fn status(&self) -> TorStatus {
        TorStatus {
            state: self.sm.current(),
            guard: self.sm.guard(),
            cables: self.cables.snapshot(),
        }
    }
}

fn invalid(ctx: &Ctx<'_>, msg: Envelope, reason: &'static str) {
    let target = msg.target.clone();
    msg.respond(Response::failed(
        ctx.now,
        SimError::InvalidTarget { target, reason },
    ));
}

fn dropped(ctx: &Ctx<'_>, msg: Envelope) {
    let target = msg.target.clone();
    msg.respond(Response::failed(
        ctx.now,
        SimError::RepairMessageDropped { target },
    ));
}

// working: SetConnection
//
// Returns true only when the whole TOR has been turned off.
fn set_connection(tor: &mut Tor, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    let Payload::SetConnection { enabled } = msg.payload else {
        fsm::unexpected_message(tor, ctx, msg);
        return false;
    };
    match msg.target {
        MessageTarget::Tor { .. } => connect_tor(tor, ctx, msg, enabled),
        MessageTarget::Blade { blade, .. } => {
            let target = msg.target.clone();
            let res =
                tor.cables.command(&target, blade, enabled, msg.guard, ctx.now);
            match res {
                Ok(()) => {
                    debug!(tor.log, "network cable changed";
                        "blade" => blade,
                        "enabled" => enabled,
                        msg.link(),
                    );
                    ctx.forward(msg.acknowledge(Response::ok(ctx.now)));
                }
                Err(err) => {
                    debug!(tor.log, "connection command refused";
                        "blade" => blade,
                        "error" => %err,
                        msg.link(),
                    );
                    msg.respond(Response::failed(ctx.now, err));
                }
            }
            false
        }
        MessageTarget::Pdu { .. } => {
            invalid(ctx, msg, "the PDU has no network cables");
            false
        }
    }
}

// Same contract as a PDU-wide power command: never acknowledged directly.
fn connect_tor(
    tor: &mut Tor,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
    enabled: bool,
) -> bool {
    if msg.guard < tor.sm.guard() {
        dropped(ctx, msg);
        return false;
    }
    tor.sm.advance_guard(ctx.now);

    if enabled {
        dropped(ctx, msg);
        return false;
    }

    let cut = tor.cables.cut_all(ctx.now);
    info!(tor.log, "disconnecting all blades";
        "blades" => cut.len(),
        msg.link(),
    );
    for blade in cut {
        let notice = msg.cascade(
            MessageTarget::blade(tor.rack.clone(), blade),
            ctx.now,
            Payload::SetConnection { enabled: false },
        );
        ctx.forward(notice);
    }
    dropped(ctx, msg);
    true
}

// any state: GetStatus
//
// Reports the TOR's own status, or passes a blade query through.
fn status(tor: &mut Tor, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    match msg.target {
        MessageTarget::Tor { .. } => {
            msg.respond(Response::status(ctx.now, Status::Tor(tor.status())));
        }
        MessageTarget::Blade { blade, .. } => {
            if tor.cables.get(blade).is_none() {
                invalid(ctx, msg, "no such blade in this rack");
            } else {
                ctx.forward(msg.forward());
            }
        }
        MessageTarget::Pdu { .. } => {
            invalid(ctx, msg, "PDU status is not served by the TOR");
        }
    }
    true
}

// working: PlaceWorkload, RemoveWorkload, Shutdown
fn pass_to_blade(tor: &mut Tor, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    let Some(blade) = msg.target.blade_id() else {
        invalid(ctx, msg, "only blades accept workload commands");
        return false;
    };
    match tor.cables.get(blade) {
        None => invalid(ctx, msg, "no such blade in this rack"),
        Some(cable) if !cable.is_on() => {
            debug!(tor.log, "blade unreachable, dropping command";
                "blade" => blade,
                "message" => ?msg.tag(),
            );
            dropped(ctx, msg);
        }
        Some(_) => ctx.forward(msg.forward()),
    }
    true
}

// off: repair commands
fn refuse(tor: &mut Tor, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    debug!(tor.log, "dropping repair command while off"; msg.link());
    dropped(ctx, msg);
    false
}

// stuck: repair commands
//
// The completion channel is dropped unanswered.
fn ignore(tor: &mut Tor, _ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    warn!(tor.log, "stuck, ignoring repair command";
        "target" => &msg.target,
        msg.link(),
    );
    false
}

static TOR_STATES: &[StateDef<Tor>] = &[
    StateDef::new(
        TorState::Working,
        &[
            Entry::to(MessageTag::SetConnection, set_connection, TorState::Off),
            Entry::stay(MessageTag::GetStatus, status),
            Entry::stay(MessageTag::PlaceWorkload, pass_to_blade),
            Entry::stay(MessageTag::RemoveWorkload, pass_to_blade),
            Entry::stay(MessageTag::Shutdown, pass_to_blade),
        ],
    ),
    StateDef::new(
        TorState::Off,
        &[
            Entry::stay(MessageTag::SetConnection, refuse),
            Entry::stay(MessageTag::GetStatus, status),
            Entry::stay(MessageTag::PlaceWorkload, refuse),
            Entry::stay(MessageTag::RemoveWorkload, refuse),
            Entry::stay(MessageTag::Shutdown, refuse),
        ],
    ),
    StateDef::new(
        TorState::Stuck,
        &[
            Entry::stay(MessageTag::SetConnection, ignore),
            Entry::stay(MessageTag::GetStatus, status),
            Entry::stay(MessageTag::PlaceWorkload, ignore),
            Entry::stay(MessageTag::RemoveWorkload, ignore),
            Entry::stay(MessageTag::Shutdown, ignore),
        ],
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::Cable;
    use crate::fsm::Effects;
    use crate::messages::Capacity;
    use rack_sim_test_utils::dev::test_setup_log;
    use uuid::Uuid;

    fn tor(log: &Logger, state: TorState, on: &[bool]) -> Tor {
        let bank = CableBank::new(
            on.iter()
                .enumerate()
                .map(|(i, on)| (i as u32, Cable::new(*on, false))),
        );
        Tor::new("r1", state, bank, log)
    }

    fn send(
        tor: &mut Tor,
        now: u64,
        target: MessageTarget,
        payload: Payload,
    ) -> (Option<Response>, Vec<Envelope>) {
        let (env, mut rx) = Envelope::request(target, now, payload);
        let mut effects = Effects::default();
        let mut ctx = Ctx::new(now, &mut effects);
        fsm::receive(tor, &mut ctx, env).unwrap();
        (rx.try_recv().ok(), effects.forwards)
    }

    #[test]
    fn blade_connection_changes_are_forwarded() {
        let logctx = test_setup_log("blade_connection_changes_are_forwarded");
        let mut tor = tor(&logctx.log, TorState::Working, &[true, true]);
        let blade = MessageTarget::blade("r1", 1);

        let (rsp, fwd) = send(
            &mut tor,
            3,
            blade.clone(),
            Payload::SetConnection { enabled: false },
        );
        assert_eq!(rsp, Some(Response::ok(3)));
        assert_eq!(fwd.len(), 1);
        assert_eq!(fwd[0].payload, Payload::SetConnection { enabled: false });
        assert!(!tor.cables().get(1).unwrap().is_on());

        let (rsp, fwd) =
            send(&mut tor, 4, blade.clone(), Payload::SetConnection {
                enabled: false,
            });
        assert_eq!(
            rsp.unwrap().result,
            Err(SimError::NoOperation { target: blade })
        );
        assert!(fwd.is_empty());
        logctx.cleanup_successful();
    }

    #[test]
    fn tor_disconnect_cascades() {
        let logctx = test_setup_log("tor_disconnect_cascades");
        let mut tor = tor(&logctx.log, TorState::Working, &[true, false, true]);
        let (rsp, fwd) = send(
            &mut tor,
            2,
            MessageTarget::tor("r1"),
            Payload::SetConnection { enabled: false },
        );
        assert!(matches!(
            rsp.unwrap().result,
            Err(SimError::RepairMessageDropped { .. })
        ));
        assert_eq!(tor.state(), TorState::Off);
        let notified: Vec<_> =
            fwd.iter().filter_map(|env| env.target.blade_id()).collect();
        assert_eq!(notified, vec![0, 2]);
        logctx.cleanup_successful();
    }

    #[test]
    fn status_queries() {
        let logctx = test_setup_log("status_queries");
        let mut tor = tor(&logctx.log, TorState::Off, &[false]);

        let (rsp, _) =
            send(&mut tor, 1, MessageTarget::tor("r1"), Payload::GetStatus);
        let Ok(Some(Status::Tor(status))) = rsp.unwrap().result else {
            panic!("expected TOR status");
        };
        assert_eq!(status.state, TorState::Off);

        // Blade queries pass through in every state, keeping the reply
        // channel.
        let blade = MessageTarget::blade("r1", 0);
        let (rsp, fwd) = send(&mut tor, 1, blade, Payload::GetStatus);
        assert_eq!(rsp, None);
        assert_eq!(fwd.len(), 1);
        assert!(fwd[0].expects_reply());

        let missing = MessageTarget::blade("r1", 5);
        let (rsp, fwd) = send(&mut tor, 1, missing, Payload::GetStatus);
        assert!(matches!(
            rsp.unwrap().result,
            Err(SimError::InvalidTarget { .. })
        ));
        assert!(fwd.is_empty());
        logctx.cleanup_successful();
    }

    #[test]
    fn workload_commands_need_a_connection() {
        let logctx = test_setup_log("workload_commands_need_a_connection");
        let mut tor = tor(&logctx.log, TorState::Working, &[true, false]);
        let place = Payload::PlaceWorkload {
            id: Uuid::new_v4(),
            size: Capacity::new(1, 512),
        };

        let (rsp, fwd) =
            send(&mut tor, 1, MessageTarget::blade("r1", 0), place.clone());
        assert_eq!(rsp, None);
        assert_eq!(fwd.len(), 1);

        let (rsp, fwd) =
            send(&mut tor, 1, MessageTarget::blade("r1", 1), place);
        assert!(matches!(
            rsp.unwrap().result,
            Err(SimError::RepairMessageDropped { .. })
        ));
        assert!(fwd.is_empty());

        let (rsp, _) =
            send(&mut tor, 1, MessageTarget::tor("r1"), Payload::Shutdown);
        assert!(matches!(
            rsp.unwrap().result,
            Err(SimError::InvalidTarget { .. })
        ));
        logctx.cleanup_successful();
    }

    #[test]
    fn stuck_tor_ignores_repairs() {
        let logctx = test_setup_log("stuck_tor_ignores_repairs");
        let mut tor = tor(&logctx.log, TorState::Stuck, &[true]);
        let (env, mut rx) = Envelope::request(
            MessageTarget::blade("r1", 0),
            1,
            Payload::SetConnection { enabled: false },
        );
        let mut effects = Effects::default();
        let mut ctx = Ctx::new(1, &mut effects);
        fsm::receive(&mut tor, &mut ctx, env).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(effects.forwards.is_empty());
        assert!(tor.cables().get(0).unwrap().is_on());
        logctx.cleanup_successful();
    }
}
