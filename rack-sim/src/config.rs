// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and describing the simulated
//! rack topology

use crate::clock::Tick;
use crate::pdu::PduState;
use crate::target::BladeId;
use crate::tor::TorState;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How long simulated hardware takes to do things, in ticks
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct Timings {
    pub boot_delay: Tick,
    pub shutdown_delay: Tick,
    /// How long a blade waits for its workloads to stop before shutting
    /// down anyway
    pub workload_stop_timeout: Tick,
}

impl Default for Timings {
    fn default() -> Self {
        Timings { boot_delay: 10, shutdown_delay: 5, workload_stop_timeout: 30 }
    }
}

/// Settings for the ticker that drives simulated time in the `rack-sim`
/// binary
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct StepperConfig {
    /// Wall-clock milliseconds per simulated tick
    pub tick_interval_ms: u64,
}

impl StepperConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for StepperConfig {
    fn default() -> Self {
        StepperConfig { tick_interval_ms: 100 }
    }
}

/// Initial condition of one cable
#[derive(
    Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize,
)]
#[serde(default)]
pub struct CableConfig {
    pub on: bool,
    pub faulted: bool,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize,
)]
#[serde(default)]
pub struct PduConfig {
    pub initial_state: PduState,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize,
)]
#[serde(default)]
pub struct TorConfig {
    pub initial_state: TorState,
}

/// Configuration of a simulated blade
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct BladeConfig {
    /// Slot number, unique within the rack
    pub id: BladeId,
    pub cores: u32,
    pub memory_mib: u64,
    /// The blade's cable on the PDU
    #[serde(default)]
    pub power: CableConfig,
    /// The blade's cable on the TOR
    #[serde(default)]
    pub network: CableConfig,
}

/// Configuration of a simulated rack
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct RackConfig {
    pub name: String,
    #[serde(default)]
    pub pdu: PduConfig,
    #[serde(default)]
    pub tor: TorConfig,
    #[serde(default)]
    pub blades: Vec<BladeConfig>,
}

/// Configuration for a rack-sim
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default)]
    pub stepper: StepperConfig,
    /// Racks to simulate
    pub racks: Vec<RackConfig>,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// The topology is validated before it is returned.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, LoadError> {
        let path = path.as_ref();
        let file_contents = std::fs::read_to_string(path)
            .map_err(|e| (path.to_path_buf(), e))?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|e| (path.to_path_buf(), e))?;
        config_parsed.validate().map_err(|e| (path.to_path_buf(), e))?;
        Ok(config_parsed)
    }

    /// Check the topology for problems that `serde` cannot catch
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let mut problems = Vec::new();
        let mut names = BTreeSet::new();
        for rack in &self.racks {
            if rack.name.is_empty() {
                problems.push("rack with an empty name".to_string());
            }
            if !names.insert(rack.name.as_str()) {
                problems.push(format!("duplicate rack name {:?}", rack.name));
            }
            let mut ids = BTreeSet::new();
            for blade in &rack.blades {
                if !ids.insert(blade.id) {
                    problems.push(format!(
                        "rack {:?}: duplicate blade id {}",
                        rack.name, blade.id
                    ));
                }
                if blade.cores == 0 || blade.memory_mib == 0 {
                    problems.push(format!(
                        "rack {:?}: blade {} has no capacity",
                        rack.name, blade.id
                    ));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(InvalidConfig(problems))
        }
    }
}

/// Every problem found while validating a [`Config`]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}", .0.join("; "))]
pub struct InvalidConfig(pub Vec<String>);

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{}\": {}", path.display(), err)]
    Io { path: PathBuf, err: std::io::Error },
    #[error("error parsing \"{}\": {}", path.display(), err)]
    Parse { path: PathBuf, err: toml::de::Error },
    #[error("invalid configuration in \"{}\": {}", path.display(), err)]
    Invalid { path: PathBuf, err: InvalidConfig },
}

impl From<(PathBuf, std::io::Error)> for LoadError {
    fn from((path, err): (PathBuf, std::io::Error)) -> Self {
        LoadError::Io { path, err }
    }
}

impl From<(PathBuf, toml::de::Error)> for LoadError {
    fn from((path, err): (PathBuf, toml::de::Error)) -> Self {
        LoadError::Parse { path, err }
    }
}

impl From<(PathBuf, InvalidConfig)> for LoadError {
    fn from((path, err): (PathBuf, InvalidConfig)) -> Self {
        LoadError::Invalid { path, err }
    }
}

impl std::cmp::PartialEq<std::io::Error> for LoadError {
    fn eq(&self, other: &std::io::Error) -> bool {
        if let LoadError::Io { err, .. } = self {
            err.kind() == other.kind()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::NamedUtf8TempFile;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [log]
        mode = "stderr-terminal"
        level = "info"

        [[racks]]
        name = "r1"

        [[racks.blades]]
        id = 0
        cores = 32
        memory_mib = 131072
        power = { on = true }
        network = { on = true }

        [[racks.blades]]
        id = 1
        cores = 32
        memory_mib = 131072
    "#;

    fn write_config(contents: &str) -> NamedUtf8TempFile {
        let mut file = camino_tempfile::Builder::new()
            .prefix("rack-sim-config")
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_fill_in() {
        let file = write_config(MINIMAL);
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.timings, Timings::default());
        assert_eq!(config.stepper.tick_interval(), Duration::from_millis(100));

        let rack = &config.racks[0];
        assert_eq!(rack.pdu.initial_state, PduState::Working);
        assert_eq!(rack.tor.initial_state, TorState::Working);
        assert_eq!(rack.blades.len(), 2);
        assert_eq!(
            rack.blades[0].power,
            CableConfig { on: true, faulted: false }
        );
        assert_eq!(rack.blades[1].network, CableConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join("rack-sim-no-such-config.toml");
        let err = Config::from_file(&path).unwrap_err();
        assert_eq!(err, std::io::Error::from(std::io::ErrorKind::NotFound));
    }

    #[test]
    fn test_parse_error() {
        let file = write_config("[log]\nmode = 7\n");
        assert!(matches!(
            Config::from_file(file.path()),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_topology() {
        let contents = format!(
            "{MINIMAL}\n{}",
            r#"
            [[racks]]
            name = "r1"

            [[racks.blades]]
            id = 3
            cores = 0
            memory_mib = 1

            [[racks.blades]]
            id = 3
            cores = 1
            memory_mib = 1
            "#
        );
        let file = write_config(&contents);
        let Err(LoadError::Invalid { err, .. }) = Config::from_file(file.path())
        else {
            panic!("expected the topology to be rejected");
        };
        assert_eq!(
            err.0,
            vec![
                "duplicate rack name \"r1\"".to_string(),
                "rack \"r1\": blade 3 has no capacity".to_string(),
                "rack \"r1\": duplicate blade id 3".to_string(),
            ]
        );
    }

    #[test]
    fn test_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("configs/config.example.toml");
        let config = Config::from_file(&path).unwrap();
        assert!(!config.racks.is_empty());
    }
}
