// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Owner of every running rack
//!
//! The [`Coordinator`] spawns one [`RackTask`] per configured rack and is the
//! narrow surface an outer transport (or a test) uses to reach them. Its
//! request methods never fail: anything that goes wrong on the way to a rack
//! is folded into the returned [`Response`] at the current simulated time.

use crate::clock::{SimClock, Tick};
use crate::config::{Config, InvalidConfig};
use crate::envelope::{Envelope, Response};
use crate::errors::{RackFault, SimError};
use crate::messages::{Payload, Status};
use crate::rack::{CableFault, CableKind, RackHandle, RackTask};
use crate::target::{BladeId, MessageTarget};
use serde::Serialize;
use slog::{error, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct RackEntry {
    handle: RackHandle,
    blades: Vec<BladeId>,
    task: JoinHandle<Result<(), RackFault>>,
}

/// Every element's status in one rack
#[derive(Clone, Debug, Serialize)]
pub struct RackSummary {
    pub name: String,
    pub at: Tick,
    pub elements: Vec<Status>,
}

pub struct Coordinator {
    log: Logger,
    clock: Arc<dyn SimClock>,
    racks: BTreeMap<String, RackEntry>,
}

impl Coordinator {
    /// Spawn a task for each rack in `config`
    ///
    /// Racks begin awaiting `start`. Must be called from within a tokio
    /// runtime.
    pub fn new(
        config: &Config,
        clock: Arc<dyn SimClock>,
        log: &Logger,
    ) -> Result<Coordinator, InvalidConfig> {
        config.validate()?;
        let log = log.new(o!("component" => "coordinator"));
        let mut racks = BTreeMap::new();
        for rack in &config.racks {
            let (task, handle) =
                RackTask::new(rack, config.timings, clock.clone(), &log);
            let task = tokio::spawn(task.run());
            let blades = rack.blades.iter().map(|b| b.id).collect();
            racks.insert(rack.name.clone(), RackEntry { handle, blades, task });
        }
        info!(log, "spawned racks"; "count" => racks.len());
        Ok(Coordinator { log, clock, racks })
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn rack_names(&self) -> impl Iterator<Item = &str> {
        self.racks.keys().map(String::as_str)
    }

    pub fn rack(&self, name: &str) -> Result<&RackHandle, SimError> {
        self.racks
            .get(name)
            .map(|entry| &entry.handle)
            .ok_or_else(|| SimError::NoSuchRack(name.to_string()))
    }

    fn fold(&self, res: Result<Response, SimError>) -> Response {
        res.unwrap_or_else(|err| Response::failed(self.clock.now(), err))
    }

    pub async fn start_rack(&self, name: &str) -> Response {
        let res = match self.rack(name) {
            Ok(rack) => rack.start().await,
            Err(err) => Err(err),
        };
        self.fold(res)
    }

    pub async fn stop_rack(&self, name: &str) -> Response {
        let res = match self.rack(name) {
            Ok(rack) => rack.stop().await,
            Err(err) => Err(err),
        };
        self.fold(res)
    }

    pub async fn disable_rack(&self, name: &str) -> Response {
        let res = match self.rack(name) {
            Ok(rack) => rack.disable().await,
            Err(err) => Err(err),
        };
        self.fold(res)
    }

    /// Start every rack, returning each rack's response
    pub async fn start_all(&self) -> BTreeMap<String, Response> {
        let mut out = BTreeMap::new();
        for (name, entry) in &self.racks {
            let rsp = self.fold(entry.handle.start().await);
            if let Some(err) = rsp.err() {
                warn!(self.log, "rack did not start";
                    "rack" => name,
                    "error" => %err,
                );
            }
            out.insert(name.clone(), rsp);
        }
        out
    }

    /// Enqueue a message on the rack it names without waiting
    pub fn submit(&self, env: Envelope) -> Result<(), SimError> {
        self.rack(env.target.rack())?.submit(env)
    }

    /// Send a message and wait for its response
    pub async fn request(
        &self,
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
    ) -> Response {
        let res = match self.rack(target.rack()) {
            Ok(rack) => rack.request(target, guard, payload).await,
            Err(err) => Err(err),
        };
        self.fold(res)
    }

    /// Query one element's status as of now
    pub async fn status(&self, target: MessageTarget) -> Response {
        let now = self.clock.now();
        self.request(target, now, Payload::GetStatus).await
    }

    /// Fault or fix one of a blade's cables
    pub async fn inject(
        &self,
        rack: &str,
        kind: CableKind,
        blade: BladeId,
        fault: CableFault,
    ) -> Response {
        let res = match self.rack(rack) {
            Ok(handle) => handle.inject(kind, blade, fault).await,
            Err(err) => Err(err),
        };
        self.fold(res)
    }

    /// Collect the status of every element of every rack
    ///
    /// Elements that do not answer are left out.
    pub async fn summarize(&self) -> Vec<RackSummary> {
        let mut summaries = Vec::with_capacity(self.racks.len());
        for (name, entry) in &self.racks {
            let mut targets = vec![
                MessageTarget::pdu(name.clone()),
                MessageTarget::tor(name.clone()),
            ];
            targets.extend(
                entry
                    .blades
                    .iter()
                    .map(|id| MessageTarget::blade(name.clone(), *id)),
            );
            let mut elements = Vec::with_capacity(targets.len());
            for target in targets {
                match entry.handle.status(target.clone()).await {
                    Ok(status) => elements.push(status),
                    Err(err) => {
                        warn!(self.log, "no status";
                            "target" => &target,
                            "error" => %err,
                        );
                    }
                }
            }
            summaries.push(RackSummary {
                name: name.clone(),
                at: self.clock.now(),
                elements,
            });
        }
        summaries
    }

    /// Stop every rack and wait for its task to exit
    ///
    /// Returns the faults of racks that had failed.
    pub async fn shutdown(self) -> Vec<(String, RackFault)> {
        let mut faults = Vec::new();
        for (name, entry) in self.racks {
            // A rack that already stopped or failed no longer answers.
            let _ = entry.handle.stop().await;
            drop(entry.handle);
            match entry.task.await {
                Ok(Ok(())) => (),
                Ok(Err(fault)) => {
                    error!(self.log, "rack had failed";
                        "rack" => &name,
                        "fault" => %fault,
                    );
                    faults.push((name, fault));
                }
                Err(err) => {
                    error!(self.log, "rack task did not finish";
                        "rack" => &name,
                        "error" => %err,
                    );
                }
            }
        }
        info!(self.log, "all racks stopped");
        faults
    }
}
