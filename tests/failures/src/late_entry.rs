// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Devices entering a permute at different times.
//!
//! Scoped semaphores are zeroed when a device enters its scope, so a signal
//! or a copy reaching a device that has not entered the invocation yet is
//! lost. Only the barrier semaphore, which is never reset, survives that.

use meshdma::collective::{launch_ppermute, Direction, PermuteSpec};
use meshdma::{
    Config, Cycle, DeviceConfiguration, DeviceMesh, Error, FailureProperties, MeshSimulation,
    PhysicalDeviceId, SimulationReport, SimulationType, SystemSimulationCallbacks,
};
use std::collections::HashMap;

const SHARD_LEN: usize = 4 * 128;
const MAX_CYCLES: Cycle = 100_000;

fn initial_shards() -> Vec<Vec<f32>> {
    vec![vec![0.0; SHARD_LEN], vec![1.0; SHARD_LEN]]
}

fn two_devices(
    config: &Config,
    sim_type: SimulationType,
    failures: FailureProperties,
) -> Result<MeshSimulation, Error> {
    let mut sim = MeshSimulation::new(
        DeviceMesh::create(&[("x", 2)])?,
        config,
        sim_type,
        failures,
    )?;
    sim.write_shards("a", initial_shards())?;
    Ok(sim)
}

/// Two permutes launched back to back while device 1 idles `slow_by`
/// cycles before its second invocation. Returns the report and the shards,
/// which are back where they started.
pub fn back_to_back(
    spec: &PermuteSpec,
    sim_type: SimulationType,
    slow_by: Cycle,
) -> Result<(SimulationReport, Vec<Vec<f32>>), Error> {
    let failures = FailureProperties {
        invocation_delays: HashMap::from([(PhysicalDeviceId(1), slow_by)]),
        ..Default::default()
    };
    let mut sim = two_devices(&Config::default(), sim_type, failures)?;
    launch_ppermute(&mut sim, spec, "a", "b")?;
    launch_ppermute(&mut sim, spec, "b", "a")?;
    let report = sim.run(MAX_CYCLES, None, &mut SystemSimulationCallbacks::default())?;
    Ok((report, sim.read_shards("a")?))
}

/// One permute where device 1 powers up `skew` cycles after device 0.
pub fn skewed_start(spec: &PermuteSpec, skew: Cycle) -> Result<SimulationReport, Error> {
    let config = Config {
        devices: vec![
            DeviceConfiguration::default(),
            DeviceConfiguration {
                starting_cycles: skew,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let mut sim = two_devices(&config, SimulationType::Hardware, FailureProperties::default())?;
    launch_ppermute(&mut sim, spec, "a", "b")?;
    sim.run(MAX_CYCLES, None, &mut SystemSimulationCallbacks::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [SimulationType; 2] = [SimulationType::Interpret, SimulationType::Hardware];

    fn spec() -> PermuteSpec {
        PermuteSpec::new("x", Direction::Right)
    }

    #[test]
    fn back_to_back_needs_the_barrier() {
        let _ = env_logger::try_init();
        for sim_type in MODES {
            // device 0 signals device 1's ready semaphore while device 1 still
            // idles, and device 1 zeroes it on entry
            match back_to_back(&spec().without_barrier(), sim_type, 50) {
                Err(Error::Stalled { waiting, .. }) => {
                    assert!(waiting.iter().any(|w| w.device == PhysicalDeviceId(1)
                        && w.semaphore == "sem_0:Regular"));
                }
                other => panic!("{:?}: expected a stall, got {:?}", sim_type, other),
            }

            let (report, shards) = back_to_back(&spec(), sim_type, 50).unwrap();
            assert!(report.completed.iter().all(|(_, n)| *n == 2));
            assert_eq!(shards, initial_shards());
        }
    }

    #[test]
    fn back_to_back_in_lock_step() {
        for sim_type in MODES {
            let (report, shards) = back_to_back(&spec().without_barrier(), sim_type, 0).unwrap();
            assert!(report.completed.iter().all(|(_, n)| *n == 2));
            assert_eq!(shards, initial_shards());
        }
    }

    #[test]
    fn skewed_copy_without_handshake_is_lost() {
        let _ = env_logger::try_init();
        let spec = spec().without_barrier().without_handshake();
        match skewed_start(&spec, 20) {
            Err(Error::Stalled { waiting, .. }) => {
                assert_eq!(waiting.len(), 1);
                assert_eq!(waiting[0].device, PhysicalDeviceId(1));
                assert_eq!(waiting[0].semaphore, "sem_2:Dma");
                assert_eq!((waiting[0].count, waiting[0].wanted), (0, SHARD_LEN as u64));
            }
            other => panic!("expected a stall, got {:?}", other),
        }
        // no skew, nothing to lose
        assert!(skewed_start(&spec, 0).is_ok());
    }

    #[test]
    fn skewed_handshake_needs_the_barrier() {
        assert!(matches!(
            skewed_start(&spec().without_barrier(), 20),
            Err(Error::Stalled { .. })
        ));
        let report = skewed_start(&spec(), 20).unwrap();
        assert!(report.completed.iter().all(|(_, n)| *n == 1));
    }
}
