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

//! Collective permutes over rings, planes and shuffled device placements.
//!
//! Every shard starts with a distinct `arange` slice, so the first element
//! of a received shard tells which device sent it.

use itertools::Itertools;
use meshdma::collective::{launch_ppermute, shard_rows, unshard, Direction, PermuteSpec};
use meshdma::{
    Config, DeviceMesh, FailureProperties, MeshSimulation, SimulationReport, SimulationType,
    SystemSimulationCallbacks,
};

const ROW_LEN: usize = 128;
const MAX_CYCLES: usize = 100_000;

fn arange(n: usize) -> Vec<f32> {
    (0..n).map(|v| v as f32).collect()
}

/// Permute `global`, split into one shard per device, `iterations` times
/// along `axis` and return the concatenated result.
fn permute(
    mesh: DeviceMesh,
    config: &Config,
    sim_type: SimulationType,
    global: &[f32],
    spec: &PermuteSpec,
    iterations: usize,
) -> anyhow::Result<(Vec<f32>, SimulationReport)> {
    let shards = shard_rows(global, ROW_LEN, mesh.device_count())?;
    let mut sim = MeshSimulation::new(mesh, config, sim_type, FailureProperties::default())?;
    sim.write_shards("a", shards)?;
    let buffers = ["a", "b"];
    for i in 0..iterations {
        launch_ppermute(&mut sim, spec, buffers[i % 2], buffers[(i + 1) % 2])?;
    }
    let report = sim.run(MAX_CYCLES, None, &mut SystemSimulationCallbacks::default())?;
    Ok((unshard(&sim.read_shards(buffers[iterations % 2])?), report))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let global = arange(16 * ROW_LEN);
    for sim_type in [SimulationType::Interpret, SimulationType::Hardware] {
        let (result, report) = permute(
            DeviceMesh::create(&[("x", 2)])?,
            &Config::default(),
            sim_type,
            &global,
            &PermuteSpec::new("x", Direction::Right),
            1,
        )?;
        log::info!(
            "{:?}: shards now start with [{}] after {} cycles",
            sim_type,
            result.iter().step_by(8 * ROW_LEN).format(", "),
            report.cycles
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshdma::{DeviceConfiguration, LinkConfiguration, LogicalCoord, PhysicalDeviceId};

    const MODES: [SimulationType; 2] = [SimulationType::Interpret, SimulationType::Hardware];

    fn ring(n: usize) -> DeviceMesh {
        DeviceMesh::create(&[("x", n)]).unwrap()
    }

    #[test]
    fn two_devices_swap_shards() {
        let _logger = env_logger::builder().is_test(true).try_init();
        // 16 rows of 128, eight rows per device
        let global = arange(16 * ROW_LEN);
        let half = 8 * ROW_LEN;
        for sim_type in MODES {
            let (result, report) = permute(
                ring(2),
                &Config::default(),
                sim_type,
                &global,
                &PermuteSpec::new("x", Direction::Right),
                1,
            )
            .unwrap();
            assert_eq!(result[..half], global[half..]);
            assert_eq!(result[half..], global[..half]);
            assert_eq!(
                report.completed,
                vec![(PhysicalDeviceId(0), 1), (PhysicalDeviceId(1), 1)]
            );
        }
    }

    #[test]
    fn rings_rotate_by_one_shard() {
        let _logger = env_logger::builder().is_test(true).try_init();
        for sim_type in MODES {
            for n in [3, 4, 8] {
                let global = arange(n * 2 * ROW_LEN);
                let shard = 2 * ROW_LEN;
                for direction in [Direction::Left, Direction::Right] {
                    let (result, _) = permute(
                        ring(n),
                        &Config::default(),
                        sim_type,
                        &global,
                        &PermuteSpec::new("x", direction),
                        1,
                    )
                    .unwrap();
                    let mut expected = global.clone();
                    match direction {
                        Direction::Right => expected.rotate_right(shard),
                        Direction::Left => expected.rotate_left(shard),
                    }
                    assert_eq!(result, expected, "{:?} n={} {}", sim_type, n, direction);
                }
            }
        }
    }

    #[test]
    fn permutes_stay_in_their_plane() {
        let mesh = DeviceMesh::create(&[("y", 2), ("x", 2)]).unwrap();
        let shard = 4 * ROW_LEN;
        let global = arange(4 * shard);
        for sim_type in MODES {
            let (result, _) = permute(
                mesh.clone(),
                &Config::default(),
                sim_type,
                &global,
                &PermuteSpec::new("x", Direction::Right),
                1,
            )
            .unwrap();
            for (pos, received) in result.chunks(shard).enumerate() {
                let sender = received[0] as usize / shard;
                // row-major: the plane is the leading coordinate
                assert_eq!(sender / 2, pos / 2, "shard left its plane");
                assert_ne!(sender, pos);
            }
        }
    }

    #[test]
    fn n_permutes_are_the_identity() {
        for sim_type in MODES {
            for direction in [Direction::Left, Direction::Right] {
                let global = arange(5 * ROW_LEN);
                let (result, report) = permute(
                    ring(5),
                    &Config::default(),
                    sim_type,
                    &global,
                    &PermuteSpec::new("x", direction),
                    5,
                )
                .unwrap();
                assert_eq!(result, global);
                assert!(report.completed.iter().all(|(_, n)| *n == 5));
            }
        }
    }

    #[test]
    fn shuffled_placement() {
        let order = [3, 1, 0, 2];
        let mesh = DeviceMesh::new(
            &[("x", 4)],
            order.iter().map(|id| PhysicalDeviceId(*id)).collect(),
        )
        .unwrap();
        assert_eq!(
            mesh.logical_coord_of(PhysicalDeviceId(3)).unwrap(),
            LogicalCoord(vec![0])
        );
        let shard = ROW_LEN;
        let global = arange(4 * shard);
        for sim_type in MODES {
            let mut sim = MeshSimulation::new(
                mesh.clone(),
                &Config::default(),
                sim_type,
                FailureProperties::default(),
            )
            .unwrap();
            sim.write_shards("a", shard_rows(&global, ROW_LEN, 4).unwrap())
                .unwrap();
            launch_ppermute(&mut sim, &PermuteSpec::new("x", Direction::Right), "a", "b").unwrap();
            sim.run(MAX_CYCLES, None, &mut SystemSimulationCallbacks::default())
                .unwrap();
            // logical 0 is device 3 and receives from logical 3, device 2
            assert_eq!(
                sim.read_buffer(PhysicalDeviceId(3), "b").unwrap(),
                sim.read_buffer(PhysicalDeviceId(2), "a").unwrap()
            );
            // logical 2 is device 0 and receives from logical 1, device 1
            assert_eq!(sim.read_buffer(PhysicalDeviceId(0), "b").unwrap()[0], shard as f32);
        }
    }

    #[test]
    fn neighbors_invert() {
        let mesh = DeviceMesh::create(&[("z", 3), ("y", 1), ("x", 4)]).unwrap();
        for coord in mesh.coords() {
            for axis in 0..mesh.rank() {
                let next = mesh.neighbor(&coord, axis, 1).unwrap();
                assert_eq!(mesh.neighbor(&next, axis, -1).unwrap(), coord);
            }
        }
    }

    #[test]
    fn mixed_device_frequencies() {
        let config = Config {
            devices: vec![
                DeviceConfiguration {
                    frequency: 2,
                    ..Default::default()
                },
                DeviceConfiguration {
                    frequency: 3,
                    ..Default::default()
                },
                DeviceConfiguration {
                    frequency: 5,
                    starting_cycles: 4,
                    ..Default::default()
                },
            ],
            link: LinkConfiguration::new(32, 1, 2),
        };
        let global = arange(3 * 3 * ROW_LEN);
        let (result, _) = permute(
            ring(3),
            &config,
            SimulationType::Hardware,
            &global,
            &PermuteSpec::new("x", Direction::Left),
            2,
        )
        .unwrap();
        let mut expected = global.clone();
        expected.rotate_left(2 * 3 * ROW_LEN);
        assert_eq!(result, expected);
    }
}
