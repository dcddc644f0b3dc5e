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

//! Collective permute driver.
//!
//! Shards an `arange` buffer of `rows` rows per device over a mesh of
//! `planes` x `devices`, permutes it `iterations` times along the device
//! axis and checks every device against the expected rotation.
//!
//! The permutes ping-pong between two buffers, so iteration `i` reads the
//! buffer iteration `i - 1` wrote.

use anyhow::{anyhow, bail};
use meshdma::collective::{launch_ppermute, rotate_shards, shard_rows, Direction, PermuteSpec};
use meshdma::plugin::{
    initialize, ExtensionModule, PlatformRegistry, PluginOptions, PluginSearchPath, Registration,
};
use meshdma::{
    Config, DeviceMesh, FailureProperties, MeshSimulation, SimulationReport,
    SystemSimulationCallbacks,
};
use std::path::PathBuf;

mod modes;

pub use modes::SimulationMode;

pub const ROW_LEN: usize = 128;
pub const DEVICE_AXIS: &str = "x";
pub const PLANE_AXIS: &str = "y";
const BUFFERS: [&str; 2] = ["a", "b"];

#[derive(Clone, Debug)]
pub struct PermuteRun {
    pub mode: SimulationMode,
    pub devices: usize,
    pub planes: usize,
    pub direction: Direction,
    pub iterations: usize,
    pub barrier: bool,
    pub rows: usize,
    pub max_cycles: usize,
    pub config: Option<PathBuf>,
    pub vcd: Option<PathBuf>,
}

impl Default for PermuteRun {
    fn default() -> Self {
        Self {
            mode: SimulationMode::Interpret,
            devices: 2,
            planes: 1,
            direction: Direction::Right,
            iterations: 1,
            barrier: true,
            rows: 8,
            max_cycles: 1_000_000,
            config: None,
            vcd: None,
        }
    }
}

impl PermuteRun {
    pub fn mesh(&self) -> anyhow::Result<DeviceMesh> {
        let mesh = if self.planes > 1 {
            DeviceMesh::create(&[(PLANE_AXIS, self.planes), (DEVICE_AXIS, self.devices)])
        } else {
            DeviceMesh::create(&[(DEVICE_AXIS, self.devices)])
        };
        Ok(mesh?)
    }

    fn config(&self) -> anyhow::Result<Config> {
        match &self.config {
            Some(path) => {
                let file = path.to_string_lossy();
                Config::from_file(&file)
                    .map_err(|e| anyhow!("Failed to read configuration {}: {}", file, e))
            }
            None => Ok(Config::default()),
        }
    }

    fn spec(&self) -> PermuteSpec {
        let spec = PermuteSpec::new(DEVICE_AXIS, self.direction);
        if self.barrier {
            spec
        } else {
            spec.without_barrier()
        }
    }
}

/// Bring up the backend for `mesh`; a missing backend only disables the
/// native path, the simulator runs either way.
pub fn bootstrap(mesh: &DeviceMesh, config: &Config) -> Registration {
    let mut registry = PlatformRegistry::default();
    let registration = match PluginSearchPath::beside_executable() {
        Some(search) => initialize(
            &mut registry,
            &search,
            PluginOptions::new(mesh, config),
            &ExtensionModule::Unavailable,
        ),
        None => Registration::Unavailable,
    };
    log::debug!("{:?}", registry);
    registration
}

pub fn run(args: &PermuteRun) -> anyhow::Result<SimulationReport> {
    if args.iterations == 0 {
        bail!("Nothing to do: zero iterations");
    }
    let mesh = args.mesh()?;
    let config = args.config()?;
    match bootstrap(&mesh, &config) {
        Registration::Available { library_path, .. } => {
            log::info!("native backend at {}", library_path.display())
        }
        Registration::Unavailable => log::info!("running on the simulator only"),
    }

    let n = mesh.device_count();
    let global = (0..n * args.rows * ROW_LEN)
        .map(|v| v as f32)
        .collect::<Vec<_>>();
    let shards = shard_rows(&global, ROW_LEN, n)?;

    let mut sim = MeshSimulation::new(
        mesh,
        &config,
        args.mode.into(),
        FailureProperties::default(),
    )?;
    sim.write_shards(BUFFERS[0], shards.clone())?;
    let spec = args.spec();
    let mut expected = shards;
    for i in 0..args.iterations {
        launch_ppermute(&mut sim, &spec, BUFFERS[i % 2], BUFFERS[(i + 1) % 2])?;
        expected = rotate_shards(&expected, sim.mesh(), DEVICE_AXIS, args.direction)?;
    }

    let mut callbacks = match &args.vcd {
        Some(path) => SystemSimulationCallbacks::with_vcd_file(path.clone())?,
        None => SystemSimulationCallbacks::default(),
    };
    let report = sim.run(args.max_cycles, None, &mut callbacks)?;

    let result = sim.read_shards(BUFFERS[args.iterations % 2])?;
    for ((id, got), want) in sim.mesh().devices().iter().zip(&result).zip(&expected) {
        if got != want {
            bail!(
                "{} holds the wrong shard after {} permutes",
                id,
                args.iterations
            );
        }
    }
    log::info!(
        "{} permutes over {} verified in {} cycles",
        args.iterations,
        sim.mesh(),
        report.cycles
    );
    Ok(report)
}
