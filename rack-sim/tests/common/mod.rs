// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for rack-sim integration tests

use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use rack_sim::blade::BladeState;
use rack_sim::config::{
    BladeConfig, CableConfig, Config, PduConfig, RackConfig, StepperConfig,
    Timings,
};
use rack_sim::messages::{BladeStatus, PduStatus, TorStatus};
use rack_sim::{
    Coordinator, MessageTarget, SimClock, SimError, Status, Stepper,
};
use rack_sim_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use rack_sim_test_utils::dev::{test_setup_log, LogContext};
use std::sync::Arc;
use std::time::Duration;

pub const TIMINGS: Timings =
    Timings { boot_delay: 4, shutdown_delay: 2, workload_stop_timeout: 6 };

/// A rack named `name` with `blades` blades whose cables all start in the
/// given positions
pub fn rack(
    name: &str,
    blades: u32,
    power_on: bool,
    network_on: bool,
) -> RackConfig {
    RackConfig {
        name: name.to_string(),
        pdu: PduConfig::default(),
        tor: Default::default(),
        blades: (0..blades)
            .map(|id| BladeConfig {
                id,
                cores: 16,
                memory_mib: 65536,
                power: CableConfig { on: power_on, faulted: false },
                network: CableConfig { on: network_on, faulted: false },
            })
            .collect(),
    }
}

pub fn config(racks: Vec<RackConfig>) -> Config {
    Config {
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info },
        timings: TIMINGS,
        stepper: StepperConfig::default(),
        racks,
    }
}

pub struct TestSim {
    pub logctx: LogContext,
    pub stepper: Arc<Stepper>,
    pub coordinator: Coordinator,
}

impl TestSim {
    /// Spawn and start every rack in `racks`
    pub async fn start(test_name: &str, racks: Vec<RackConfig>) -> TestSim {
        let sim = TestSim::new(test_name, racks);
        for (name, rsp) in sim.coordinator.start_all().await {
            assert!(rsp.is_ok(), "rack {name} did not start: {rsp:?}");
        }
        sim
    }

    /// Spawn every rack in `racks` without starting them
    pub fn new(test_name: &str, racks: Vec<RackConfig>) -> TestSim {
        let logctx = test_setup_log(test_name);
        let stepper = Arc::new(Stepper::new(&logctx.log));
        let clock: Arc<dyn SimClock> = stepper.clone();
        let coordinator =
            Coordinator::new(&config(racks), clock, &logctx.log).unwrap();
        TestSim { logctx, stepper, coordinator }
    }

    pub fn now(&self) -> u64 {
        self.stepper.now()
    }

    pub async fn pdu(&self, rack: &str) -> PduStatus {
        match self.status(MessageTarget::pdu(rack)).await {
            Status::Pdu(status) => status,
            other => panic!("expected PDU status, got {other:?}"),
        }
    }

    pub async fn tor(&self, rack: &str) -> TorStatus {
        match self.status(MessageTarget::tor(rack)).await {
            Status::Tor(status) => status,
            other => panic!("expected TOR status, got {other:?}"),
        }
    }

    pub async fn blade(&self, rack: &str, id: u32) -> BladeStatus {
        match self.status(MessageTarget::blade(rack, id)).await {
            Status::Blade(status) => status,
            other => panic!("expected blade status, got {other:?}"),
        }
    }

    async fn status(&self, target: MessageTarget) -> Status {
        let rsp = self.coordinator.status(target.clone()).await;
        match rsp.result {
            Ok(Some(status)) => status,
            other => panic!("no status for {target}: {other:?}"),
        }
    }

    /// Poll until a blade reaches `state`
    pub async fn wait_for_blade(&self, rack: &str, id: u32, state: BladeState) {
        wait_for_condition::<_, SimError, _, _>(
            || async {
                let status = self.blade(rack, id).await;
                if status.state == state {
                    Ok(())
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
            &Duration::from_millis(5),
            &Duration::from_secs(10),
        )
        .await
        .unwrap_or_else(|e| {
            panic!("blade {id} in rack {rack} never reached {state}: {e}")
        });
    }

    pub async fn teardown(self) {
        let faults = self.coordinator.shutdown().await;
        assert!(faults.is_empty(), "racks failed: {faults:?}");
        self.logctx.cleanup_successful();
    }
}
