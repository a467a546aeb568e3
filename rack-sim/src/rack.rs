// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rack actor
//!
//! A [`RackTask`] owns a [`Rack`] (and through it the PDU, the TOR and every
//! blade) and processes requests from its inbound queue one at a time. No
//! state belonging to a rack is touched from anywhere else, so guard checks
//! are plain comparisons. Callers talk to the task through a [`RackHandle`].

use crate::blade::Blade;
use crate::cable::{Cable, CableBank};
use crate::clock::{SimClock, TimerDelivery};
use crate::config::{RackConfig, Timings};
use crate::envelope::{Envelope, Response, ResponseTx};
use crate::errors::{RackFault, SimError};
use crate::fsm::{
    self, Ctx, Effects, Element, Entry, Machine, Message as _, Next, StateDef,
};
use crate::messages::{Capacity, Hop, Payload, Status};
use crate::pdu::Pdu;
use crate::target::{BladeId, MessageTarget};
use crate::tor::Tor;
use crate::Tick;
use slog::{crit, debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

/// We should be able to buffer this many requests before submitters see
/// `QueueFull`
pub const RACK_CHANNEL_BOUND: usize = 32;

/// Which of a blade's two cables a fault injection applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CableKind {
    /// The blade's cable on the PDU
    Power,
    /// The blade's cable on the TOR
    Network,
}

/// A physical fault to inject into, or clear from, a cable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CableFault {
    /// The cable becomes stuck in the given position
    Stuck { on: bool },
    Fixed,
}

/// A request to a rack task
#[derive(Debug)]
pub enum RackRequest {
    Start { reply: ResponseTx },
    Stop { reply: ResponseTx },
    Disable { reply: ResponseTx },
    /// Fault or fix a cable out of band
    Inject {
        kind: CableKind,
        blade: BladeId,
        fault: CableFault,
        reply: ResponseTx,
    },
    /// A message for one of the rack's elements
    Deliver(Envelope),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RackTag {
    Start,
    Stop,
    Disable,
    Inject,
    Deliver,
}

impl RackRequest {
    // What to call this request in an `UnexpectedMessage` reply
    fn describe(&self) -> String {
        match self {
            RackRequest::Deliver(env) => format!("{:?}", env.tag()),
            other => format!("{:?}", fsm::Message::tag(other)),
        }
    }
}

impl fsm::Message for RackRequest {
    type Tag = RackTag;

    fn tag(&self) -> RackTag {
        match self {
            RackRequest::Start { .. } => RackTag::Start,
            RackRequest::Stop { .. } => RackTag::Stop,
            RackRequest::Disable { .. } => RackTag::Disable,
            RackRequest::Inject { .. } => RackTag::Inject,
            RackRequest::Deliver(_) => RackTag::Deliver,
        }
    }

    // Administrative requests are not ordered against element state.
    fn guard(&self) -> Tick {
        match self {
            RackRequest::Deliver(env) => env.guard,
            _ => 0,
        }
    }

    fn respond(self, response: Response) {
        match self {
            RackRequest::Start { reply }
            | RackRequest::Stop { reply }
            | RackRequest::Disable { reply }
            | RackRequest::Inject { reply, .. } => {
                let _ = reply.send(response);
            }
            RackRequest::Deliver(env) => env.respond(response),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RackState {
    AwaitingStart,
    Working,
    /// Administratively disabled; only `start`, `stop`, fault injection and
    /// timer expiries are accepted
    Disabled,
    /// Hit an internal fault; the task exits
    Failed,
    Terminal,
}

impl fmt::Display for RackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RackState::AwaitingStart => "awaiting-start",
            RackState::Working => "working",
            RackState::Disabled => "disabled",
            RackState::Failed => "failed",
            RackState::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// A simulated rack and everything in it
pub struct Rack {
    name: String,
    log: Logger,
    sm: Machine<Rack>,
    pdu: Pdu,
    tor: Tor,
    blades: BTreeMap<BladeId, Blade>,
    fault: Option<RackFault>,
}

impl Element for Rack {
    type State = RackState;
    type Msg = RackRequest;

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

impl Rack {
    /// Build a rack from its topology
    ///
    /// The rack starts out awaiting `start`.
    pub fn new(config: &RackConfig, timings: Timings, log: &Logger) -> Rack {
        let log = log.new(o!(
            "component" => "rack",
            "rack" => config.name.clone(),
        ));
        let power = CableBank::new(config.blades.iter().map(|b| {
            (b.id, Cable::new(b.power.on, b.power.faulted))
        }));
        let network = CableBank::new(config.blades.iter().map(|b| {
            (b.id, Cable::new(b.network.on, b.network.faulted))
        }));
        let blades = config
            .blades
            .iter()
            .map(|b| {
                let blade = Blade::new(
                    &config.name,
                    b.id,
                    Capacity::new(b.cores, b.memory_mib),
                    timings,
                    b.power.on,
                    b.network.on,
                    &log,
                );
                (b.id, blade)
            })
            .collect();
        Rack {
            name: config.name.clone(),
            sm: Machine::new(RACK_STATES, RackState::AwaitingStart),
            pdu: Pdu::new(&config.name, config.pdu.initial_state, power, &log),
            tor: Tor::new(
                &config.name,
                config.tor.initial_state,
                network,
                &log,
            ),
            blades,
            fault: None,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RackState {
        self.sm.current()
    }

    pub fn pdu(&self) -> &Pdu {
        &self.pdu
    }

    pub fn tor(&self) -> &Tor {
        &self.tor
    }

    pub fn blade(&self, id: BladeId) -> Option<&Blade> {
        self.blades.get(&id)
    }

    // Hand a message to the first element on its path, then deliver
    // everything that element forwards until nothing is left in flight.
    //
    // Returns an error only if an element forwarded a message to a blade
    // that does not exist.
    fn route(
        &mut self,
        ctx: &mut Ctx<'_>,
        env: Envelope,
    ) -> Result<(), RackFault> {
        debug!(self.log, "routing";
            "target" => &env.target,
            "message" => ?env.tag(),
            "guard" => env.guard,
            env.link(),
        );
        let res = match env.payload.send_via(&env.target) {
            Hop::Pdu => fsm::receive(&mut self.pdu, ctx, env),
            Hop::Tor => fsm::receive(&mut self.tor, ctx, env),
            Hop::Blade => {
                let blade = env
                    .target
                    .blade_id()
                    .and_then(|id| self.blades.get_mut(&id));
                match blade {
                    Some(blade) => fsm::receive(blade, ctx, env),
                    None => {
                        let target = env.target.clone();
                        env.respond(Response::failed(
                            ctx.now,
                            SimError::InvalidTarget {
                                target,
                                reason: "no such blade in this rack",
                            },
                        ));
                        Ok(())
                    }
                }
            }
        };
        if let Err(err) = res {
            warn!(self.log, "element failed to change state"; "error" => %err);
        }
        self.drain_forwards(ctx)
    }

    // Deliver every message forwarded to a blade, including whatever those
    // deliveries forward in turn.
    fn drain_forwards(&mut self, ctx: &mut Ctx<'_>) -> Result<(), RackFault> {
        while !ctx.effects.forwards.is_empty() {
            let batch = std::mem::take(&mut ctx.effects.forwards);
            for env in batch {
                let blade = env
                    .target
                    .blade_id()
                    .and_then(|id| self.blades.get_mut(&id));
                let Some(blade) = blade else {
                    return Err(RackFault::Unroutable {
                        target: env.target.clone(),
                        reason: "forwarded to a blade that does not exist",
                    });
                };
                if let Err(err) = fsm::receive(blade, ctx, env) {
                    warn!(self.log, "blade failed to change state";
                        "error" => %err,
                    );
                }
            }
        }
        Ok(())
    }
}

fn start(rack: &mut Rack, ctx: &mut Ctx<'_>, req: RackRequest) -> bool {
    info!(rack.log, "starting"; "from" => %rack.sm.current());
    req.respond(Response::ok(ctx.now));
    true
}

fn already_started(
    rack: &mut Rack,
    ctx: &mut Ctx<'_>,
    req: RackRequest,
) -> bool {
    let name = rack.name.clone();
    req.respond(Response::failed(ctx.now, SimError::AlreadyStarted(name)));
    false
}

fn stop(rack: &mut Rack, ctx: &mut Ctx<'_>, req: RackRequest) -> bool {
    info!(rack.log, "stopping"; "from" => %rack.sm.current());
    req.respond(Response::ok(ctx.now));
    true
}

fn disable(rack: &mut Rack, ctx: &mut Ctx<'_>, req: RackRequest) -> bool {
    info!(rack.log, "disabling");
    req.respond(Response::ok(ctx.now));
    true
}

// any live state: Inject
//
// A fault that moves the cable is passed on to the blade, the same way a
// PDU or TOR tells a blade about a cable it switched. Returns false if that
// notice could not be delivered.
fn inject(rack: &mut Rack, ctx: &mut Ctx<'_>, req: RackRequest) -> bool {
    let (kind, blade, fault, reply) = match req {
        RackRequest::Inject { kind, blade, fault, reply } => {
            (kind, blade, fault, reply)
        }
        other => {
            refuse(rack, ctx, other);
            return true;
        }
    };
    let target = MessageTarget::blade(rack.name.clone(), blade);
    let bank = match kind {
        CableKind::Power => rack.pdu.cables_mut(),
        CableKind::Network => rack.tor.cables_mut(),
    };
    let was_on = bank.get(blade).map(|cable| cable.is_on());
    let res = match fault {
        CableFault::Stuck { on } => bank.fault(&target, blade, on, ctx.now),
        CableFault::Fixed => bank.fix(&target, blade, ctx.now),
    };
    let now_on = bank.get(blade).map(|cable| cable.is_on());
    info!(rack.log, "injected cable fault";
        "blade" => blade,
        "cable" => ?kind,
        "fault" => ?fault,
        "ok" => res.is_ok(),
    );
    let _ = reply.send(Response { at: ctx.now, result: res.map(|()| None) });

    let on = match (was_on, now_on) {
        (Some(was), Some(on)) if was != on => on,
        _ => return true,
    };
    let payload = match kind {
        CableKind::Power => Payload::SetPower { on },
        CableKind::Network => Payload::SetConnection { enabled: on },
    };
    ctx.forward(Envelope::internal(target, ctx.now, payload));
    match rack.drain_forwards(ctx) {
        Ok(()) => true,
        Err(fault) => {
            rack.fault = Some(fault);
            false
        }
    }
}

// working: Deliver
//
// Returns false if the rack hit an internal fault.
fn deliver(rack: &mut Rack, ctx: &mut Ctx<'_>, req: RackRequest) -> bool {
    let env = match req {
        RackRequest::Deliver(env) => env,
        other => {
            refuse(rack, ctx, other);
            return true;
        }
    };
    if env.target.rack() != rack.name {
        let target = env.target.clone();
        env.respond(Response::failed(
            ctx.now,
            SimError::InvalidTarget { target, reason: "not in this rack" },
        ));
        return true;
    }
    rack.sm.advance_guard(ctx.now);
    match rack.route(ctx, env) {
        Ok(()) => true,
        Err(fault) => {
            rack.fault = Some(fault);
            false
        }
    }
}

// awaiting-start, disabled: Deliver
//
// Blades keep their timers while the rack is not routing, so expiries are
// let through. Everything else is refused.
fn deliver_timer(
    rack: &mut Rack,
    ctx: &mut Ctx<'_>,
    req: RackRequest,
) -> bool {
    let expiry = matches!(
        &req,
        RackRequest::Deliver(env)
            if matches!(env.payload, Payload::TimerExpiry { .. })
    );
    if expiry {
        deliver(rack, ctx, req)
    } else {
        refuse(rack, ctx, req);
        true
    }
}

// The default for every state that does not route: answer with the payload
// kind for deliveries so callers can tell what was refused.
fn refuse(rack: &mut Rack, ctx: &mut Ctx<'_>, req: RackRequest) {
    let state = rack.sm.current();
    let message = req.describe();
    debug!(rack.log, "refusing request";
        "state" => %state,
        "message" => &message,
    );
    req.respond(Response::failed(
        ctx.now,
        SimError::UnexpectedMessage { state: state.to_string(), message },
    ));
}

fn enter_working(
    rack: &mut Rack,
    ctx: &mut Ctx<'_>,
) -> Result<(), SimError> {
    rack.sm.advance_guard(ctx.now);
    Ok(())
}

fn enter_failed(rack: &mut Rack, _ctx: &mut Ctx<'_>) -> Result<(), SimError> {
    match &rack.fault {
        Some(fault) => crit!(rack.log, "rack failed"; "fault" => %fault),
        None => crit!(rack.log, "rack failed"),
    }
    Ok(())
}

// Entries whose action returns false when the rack hit an internal fault
const fn may_fail(
    tag: RackTag,
    action: fsm::ActionFn<Rack>,
) -> Entry<Rack> {
    Entry {
        tag,
        action,
        on_true: Next::Stay,
        on_false: Next::To(RackState::Failed),
    }
}

static RACK_STATES: &[StateDef<Rack>] = &[
    StateDef {
        default: Some(refuse),
        ..StateDef::new(
            RackState::AwaitingStart,
            &[
                Entry::to(RackTag::Start, start, RackState::Working),
                Entry::to(RackTag::Stop, stop, RackState::Terminal),
                may_fail(RackTag::Inject, inject),
                may_fail(RackTag::Deliver, deliver_timer),
            ],
        )
    },
    StateDef {
        default: Some(refuse),
        enter: Some(enter_working),
        ..StateDef::new(
            RackState::Working,
            &[
                Entry::stay(RackTag::Start, already_started),
                Entry::to(RackTag::Stop, stop, RackState::Terminal),
                Entry::to(RackTag::Disable, disable, RackState::Disabled),
                may_fail(RackTag::Inject, inject),
                may_fail(RackTag::Deliver, deliver),
            ],
        )
    },
    StateDef {
        default: Some(refuse),
        ..StateDef::new(
            RackState::Disabled,
            &[
                Entry::to(RackTag::Start, start, RackState::Working),
                Entry::to(RackTag::Stop, stop, RackState::Terminal),
                may_fail(RackTag::Inject, inject),
                may_fail(RackTag::Deliver, deliver_timer),
            ],
        )
    },
    StateDef {
        default: Some(refuse),
        enter: Some(enter_failed),
        terminal: true,
        ..StateDef::new(RackState::Failed, &[])
    },
    StateDef {
        default: Some(refuse),
        terminal: true,
        ..StateDef::new(RackState::Terminal, &[])
    },
];

/// Runs one rack
///
/// This should be spawned into its own tokio task.
pub struct RackTask {
    rack: Rack,
    log: Logger,
    clock: Arc<dyn SimClock>,
    rx: mpsc::Receiver<RackRequest>,
    // Timers hold this weakly; see `TimerDelivery`
    timer_tx: mpsc::WeakSender<RackRequest>,
}

impl RackTask {
    pub fn new(
        config: &RackConfig,
        timings: Timings,
        clock: Arc<dyn SimClock>,
        log: &Logger,
    ) -> (RackTask, RackHandle) {
        let rack = Rack::new(config, timings, log);
        let log = rack.log.clone();
        let (tx, rx) = mpsc::channel(RACK_CHANNEL_BOUND);
        let timer_tx = tx.downgrade();
        (
            RackTask { rack, log, clock, rx, timer_tx },
            RackHandle { name: config.name.clone(), tx },
        )
    }

    /// Process requests until the rack stops, fails, or every handle is
    /// dropped
    ///
    /// Requests still queued when the rack stops are answered with
    /// `RackStopped`.
    pub async fn run(mut self) -> Result<(), RackFault> {
        info!(self.log, "rack task running";
            "pdu" => %self.rack.pdu.state(),
            "tor" => %self.rack.tor.state(),
            "blades" => self.rack.blades.len(),
        );
        while let Some(req) = self.rx.recv().await {
            self.handle(req);
            if self.rack.sm.terminated() {
                break;
            }
        }

        self.rx.close();
        let now = self.clock.now();
        while let Ok(req) = self.rx.try_recv() {
            let err = SimError::RackStopped(self.rack.name.clone());
            fsm::Message::respond(req, Response::failed(now, err));
        }

        match self.rack.fault.take() {
            Some(fault) => Err(fault),
            None => {
                info!(self.log, "rack task exiting";
                    "state" => %self.rack.sm.current(),
                );
                Ok(())
            }
        }
    }

    fn handle(&mut self, req: RackRequest) {
        let mut effects = Effects::default();
        let mut ctx = Ctx::new(self.clock.now(), &mut effects);
        if let Err(err) = fsm::receive(&mut self.rack, &mut ctx, req) {
            warn!(self.log, "rack failed to change state"; "error" => %err);
        }
        for timer in effects.timers {
            let delivery =
                TimerDelivery::new(self.timer_tx.clone(), timer.envelope);
            self.clock.schedule(timer.due, delivery);
        }
    }
}

/// A cheaply cloneable way to talk to a running [`RackTask`]
#[derive(Clone, Debug)]
pub struct RackHandle {
    name: String,
    tx: mpsc::Sender<RackRequest>,
}

impl RackHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message without waiting for it to be handled
    ///
    /// The outcome arrives on the envelope's own completion channel, if it
    /// has one.
    pub fn submit(&self, env: Envelope) -> Result<(), SimError> {
        self.tx.try_send(RackRequest::Deliver(env)).map_err(|err| match err {
            TrySendError::Full(_) => SimError::QueueFull(self.name.clone()),
            TrySendError::Closed(_) => SimError::RackStopped(self.name.clone()),
        })
    }

    /// Send a message and wait for its response
    ///
    /// A message that is dropped without an answer (a stuck PDU, say)
    /// yields `NoResponse`.
    pub async fn request(
        &self,
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
    ) -> Result<Response, SimError> {
        let (env, rx) = Envelope::request(target.clone(), guard, payload);
        self.tx
            .send(RackRequest::Deliver(env))
            .await
            .map_err(|_| SimError::RackStopped(self.name.clone()))?;
        rx.await.map_err(|_| SimError::NoResponse { target })
    }

    /// Query the status of one element
    pub async fn status(
        &self,
        target: MessageTarget,
    ) -> Result<Status, SimError> {
        let rsp = self.request(target.clone(), 0, Payload::GetStatus).await?;
        match rsp.result? {
            Some(status) => Ok(status),
            None => Err(SimError::NoResponse { target }),
        }
    }

    pub async fn start(&self) -> Result<Response, SimError> {
        self.control(|reply| RackRequest::Start { reply }).await
    }

    pub async fn stop(&self) -> Result<Response, SimError> {
        self.control(|reply| RackRequest::Stop { reply }).await
    }

    pub async fn disable(&self) -> Result<Response, SimError> {
        self.control(|reply| RackRequest::Disable { reply }).await
    }

    pub async fn inject(
        &self,
        kind: CableKind,
        blade: BladeId,
        fault: CableFault,
    ) -> Result<Response, SimError> {
        self.control(|reply| RackRequest::Inject { kind, blade, fault, reply })
            .await
    }

    async fn control(
        &self,
        make: impl FnOnce(ResponseTx) -> RackRequest,
    ) -> Result<Response, SimError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| SimError::RackStopped(self.name.clone()))?;
        rx.await.map_err(|_| SimError::RackStopped(self.name.clone()))
    }
}
