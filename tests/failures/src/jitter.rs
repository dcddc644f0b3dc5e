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

//! Permutes over an interconnect that delivers signals and frames out of
//! order.

use meshdma::collective::{launch_ppermute, rotate_shards, shard_rows, Direction, PermuteSpec};
use meshdma::{
    Config, Cycle, DeviceMesh, Error, FailureProperties, LinkConfiguration, MeshSimulation,
    PhysicalDeviceId, SimulationType, SystemSimulationCallbacks,
};
use std::collections::HashMap;

const ROW_LEN: usize = 128;

pub struct JitterRun {
    pub devices: usize,
    pub latency_jitter: Cycle,
    pub seed: u64,
    pub iterations: usize,
    /// extra idle cycles of device 0 before each invocation but the first
    pub slow_by: Cycle,
}

#[derive(Debug, PartialEq)]
pub struct JitterOutcome {
    pub received: Vec<Vec<f32>>,
    pub expected: Vec<Vec<f32>>,
    pub cycles: Cycle,
}

/// Permute right `iterations` times.
pub fn simulate_jitter(run: &JitterRun) -> Result<JitterOutcome, Error> {
    let mesh = DeviceMesh::create(&[("x", run.devices)])?;
    let global = (0..run.devices * 2 * ROW_LEN)
        .map(|v| v as f32)
        .collect::<Vec<_>>();
    let shards = shard_rows(&global, ROW_LEN, run.devices)?;
    let failures = FailureProperties {
        latency_jitter: run.latency_jitter,
        invocation_delays: HashMap::from([(PhysicalDeviceId(0), run.slow_by)]),
        ..FailureProperties::with_seed(run.seed)
    };
    // small frames, so a copy is many packets racing each other
    let config = Config {
        link: LinkConfiguration::new(16, 1, 1),
        ..Default::default()
    };
    let mut sim = MeshSimulation::new(mesh, &config, SimulationType::Hardware, failures)?;
    sim.write_shards("a", shards.clone())?;

    let spec = PermuteSpec::new("x", Direction::Right);
    let buffers = ["a", "b"];
    let mut expected = shards;
    for i in 0..run.iterations {
        launch_ppermute(&mut sim, &spec, buffers[i % 2], buffers[(i + 1) % 2])?;
        expected = rotate_shards(&expected, sim.mesh(), "x", Direction::Right)?;
    }
    let report = sim.run(1_000_000, None, &mut SystemSimulationCallbacks::default())?;
    log::info!(
        "seed {:#x}: {} permutes in {} cycles",
        run.seed,
        run.iterations,
        report.cycles
    );
    Ok(JitterOutcome {
        received: sim.read_shards(buffers[run.iterations % 2])?,
        expected,
        cycles: report.cycles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matched_signals_survive_reordering() {
        let _ = env_logger::try_init();
        for seed in 0..8 {
            for devices in [2, 3, 5] {
                let outcome = simulate_jitter(&JitterRun {
                    devices,
                    latency_jitter: 9,
                    seed,
                    iterations: 4,
                    slow_by: (seed as Cycle) * 5,
                })
                .unwrap();
                assert_eq!(
                    outcome.received, outcome.expected,
                    "seed {} devices {}",
                    seed, devices
                );
            }
        }
    }

    #[test]
    fn same_seed_same_run() {
        let run = JitterRun {
            devices: 4,
            latency_jitter: 5,
            seed: 0x5eed,
            iterations: 2,
            slow_by: 3,
        };
        let first = simulate_jitter(&run).unwrap();
        assert_eq!(first, simulate_jitter(&run).unwrap());

        let steady = simulate_jitter(&JitterRun {
            latency_jitter: 0,
            ..run
        })
        .unwrap();
        assert_eq!(steady.received, first.received);
    }
}
