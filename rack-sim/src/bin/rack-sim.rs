// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run simulated racks

use anyhow::{anyhow, Context};
use clap::Parser;
use rack_sim::cmd::{fatal, CmdError};
use rack_sim::{Config, Coordinator, SimClock, Stepper};
use slog::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[clap(name = "rack-sim", about = "Simulate rack power, network and blades")]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: PathBuf,

    #[clap(
        long = "status-on-start",
        help = "Print every element's status as JSON once all racks started",
        action
    )]
    status_on_start: bool,
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file_path)
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;
    let log = config
        .log
        .to_logger("rack-sim")
        .context("failed to create logger")
        .map_err(CmdError::Failure)?;

    let stepper = Arc::new(Stepper::new(&log));
    let clock: Arc<dyn SimClock> = stepper.clone();
    let coordinator = Coordinator::new(&config, clock, &log)
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;

    let interval = config.stepper.tick_interval();
    let ticker = {
        let log = log.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            loop {
                ticks.tick().await;
                let fired = stepper.advance(1);
                if fired > 0 {
                    debug!(log, "tick";
                        "now" => stepper.now(),
                        "timers" => fired,
                    );
                }
            }
        })
    };

    let started = coordinator.start_all().await;
    let failed = started.values().filter(|rsp| !rsp.is_ok()).count();
    info!(log, "racks started"; "count" => started.len(), "failed" => failed);

    if args.status_on_start {
        let summary = coordinator.summarize().await;
        let json = serde_json::to_string_pretty(&summary)
            .context("serializing rack status")
            .map_err(CmdError::Failure)?;
        println!("{json}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")
        .map_err(CmdError::Failure)?;
    info!(log, "shutting down");

    ticker.abort();
    let faults = coordinator.shutdown().await;
    for (rack, fault) in &faults {
        warn!(log, "rack failed during the run";
            "rack" => rack,
            "fault" => %fault,
        );
    }
    if faults.is_empty() {
        Ok(())
    } else {
        Err(CmdError::Failure(anyhow!("{} rack(s) failed", faults.len())))
    }
}
