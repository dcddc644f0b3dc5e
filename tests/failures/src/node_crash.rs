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

//! Test that a device crashing inside a permute leaves its peers stuck and
//! that the simulator reports them instead of spinning.

use meshdma::collective::{launch_ppermute, shard_rows, Direction, PermuteSpec};
use meshdma::{
    Config, Cycle, DeviceMesh, Error, FailureProperties, MeshSimulation, PhysicalDeviceId,
    SimulationReport, SimulationType, SystemSimulationCallbacks,
};
use std::collections::HashMap;

const ROW_LEN: usize = 128;

/// A ring of `devices` permuting right once, crashing devices as scheduled.
pub fn run_simulate_node_crash(
    devices: usize,
    crashes: HashMap<PhysicalDeviceId, Cycle>,
    max_cycles: Cycle,
) -> Result<SimulationReport, Error> {
    let failures = FailureProperties {
        induced_crashes: crashes,
        ..Default::default()
    };
    let mut sim = MeshSimulation::new(
        DeviceMesh::create(&[("x", devices)])?,
        &Config::default(),
        SimulationType::Hardware,
        failures,
    )?;
    let global = (0..devices * 4 * ROW_LEN)
        .map(|v| v as f32)
        .collect::<Vec<_>>();
    sim.write_shards("x", shard_rows(&global, ROW_LEN, devices)?)?;
    launch_ppermute(&mut sim, &PermuteSpec::new("x", Direction::Right), "x", "y")?;
    sim.run(max_cycles, None, &mut SystemSimulationCallbacks::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_mid_permute_stalls() {
        let _ = env_logger::try_init();

        let crashed = PhysicalDeviceId(2);
        let result = run_simulate_node_crash(4, HashMap::from([(crashed, 3)]), 10_000);
        match result {
            Err(Error::Stalled { cycle, waiting }) => {
                assert!(cycle < 10_000);
                assert!(!waiting.is_empty());
                // the crashed device waits on nothing
                assert!(waiting.iter().all(|w| w.device != crashed));
                // its destination never gets its shard
                assert!(waiting.iter().any(|w| w.device == PhysicalDeviceId(3)));
            }
            other => panic!("expected a stall, got {:?}", other),
        }
    }

    #[test]
    fn crash_before_start_stalls() {
        let result = run_simulate_node_crash(2, HashMap::from([(PhysicalDeviceId(0), 0)]), 10_000);
        assert!(matches!(result, Err(Error::Stalled { .. })));
    }

    #[test]
    fn late_crash_is_harmless() {
        let report =
            run_simulate_node_crash(4, HashMap::from([(PhysicalDeviceId(1), 50_000)]), 10_000)
                .unwrap();
        assert!(report.crashed.is_empty());
        assert!(report.completed.iter().all(|(_, n)| *n == 1));
    }

    #[test]
    fn unknown_crash_target() {
        let result = run_simulate_node_crash(2, HashMap::from([(PhysicalDeviceId(7), 1)]), 100);
        assert_eq!(result.unwrap_err(), Error::UnknownDevice(PhysicalDeviceId(7)));
    }
}
