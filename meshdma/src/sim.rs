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

use crate::config::Config;
use crate::device::Device;
use crate::kernel::Kernel;
use crate::memory::BufferRef;
use crate::mesh::{DeviceMesh, PhysicalDeviceId};
use crate::vcd::{VcdComponent, VcdWriter, DEFAULT_TOP_MODULE};
use crate::{Cycle, Error};

mod fabric;
use fabric::{DirectFabric, Fabric, LinkFabric};
use log::trace;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SimulationType {
    /// Lock-step devices; signals and copies take effect immediately.
    Interpret,
    /// Per-device clocks, frame-chunked DMA and link latency.
    Hardware,
}

/// Common interface for the interpreted and the hardware simulations
pub trait SystemSimulationTrait {
    /// Step all devices in the system by one cycle
    fn simulate_system_one_cycle(&mut self, callbacks: OptionSimCallbacks) -> Result<(), Error>;

    /// Query the simulation type
    fn sim_type(&self) -> SimulationType;
}

// Counter that wraps around on limit value. E.g., if limit = 3, then the count
// sequence is 0, 1, 2, 0, 1, 2, ...
#[derive(Clone, Debug)]
struct WrapAroundCounter {
    value: usize,
    limit: usize,
}

impl WrapAroundCounter {
    fn new(limit: usize) -> Self {
        assert!(limit > 0);
        Self { value: 0, limit }
    }

    fn advance(&mut self) {
        self.value = if self.value + 1 == self.limit {
            0
        } else {
            self.value + 1
        };
    }

    fn test(&self) -> bool {
        self.value == 0
    }
}

/// Characteristics of the failures we inject into the simulation.
pub struct FailureProperties {
    /// Upper bound of the random extra latency, in simulator cycles, added to
    /// every packet on the interconnect. Packets may overtake each other.
    pub latency_jitter: Cycle,

    /// Random number generator used to calculate probabilities.
    /// Note: the RNG provided by the Default implementation is deterministic.
    pub rng: Box<dyn RngCore>,

    /// Maps a device to the simulator cycle in which we simulate its crash.
    pub induced_crashes: HashMap<PhysicalDeviceId, Cycle>,

    /// Device cycles a device idles before each kernel invocation but its
    /// first, making it enter back-to-back invocations late.
    pub invocation_delays: HashMap<PhysicalDeviceId, Cycle>,
}

impl Default for FailureProperties {
    /// Default values, assuming no failures; no jitter, no slow devices and no
    /// induced crashes.
    /// Note the RNG provided by the Default implementation is deterministic.
    fn default() -> Self {
        Self {
            latency_jitter: 0,
            rng: Box::new(Xoshiro256StarStar::seed_from_u64(0x87654321FEDCBA09u64)),
            induced_crashes: HashMap::new(),
            invocation_delays: HashMap::new(),
        }
    }
}

impl FailureProperties {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Box::new(Xoshiro256StarStar::seed_from_u64(seed)),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct SystemSimulationCallbacks {
    vcd_writer: Option<Rc<RefCell<VcdWriter>>>,
}

impl SystemSimulationCallbacks {
    pub fn get_vcd_writer(&mut self) -> Option<Rc<RefCell<VcdWriter>>> {
        self.vcd_writer.as_ref().map(Rc::clone)
    }

    /// Dump a VCD trace to the temp directory.
    pub fn create_vcd_callbacks() -> io::Result<Self> {
        Ok(Self {
            vcd_writer: Some(Rc::new(RefCell::new(VcdWriter::in_temp_dir()?))),
        })
    }

    pub fn with_vcd_file(path: PathBuf) -> io::Result<Self> {
        Ok(Self {
            vcd_writer: Some(Rc::new(RefCell::new(VcdWriter::new(path)?))),
        })
    }

    pub fn vcd<F>(&mut self, f: F)
    where
        F: FnOnce(Rc<RefCell<VcdWriter>>),
    {
        if let Some(writer) = self.get_vcd_writer() {
            f(writer)
        }
    }
}

pub type OptionSimCallbacks<'a> = &'a mut SystemSimulationCallbacks;

/// A function to inspect the state of the simulation after every cycle.
///
/// The arguments are the current simulation cycle and the simulation.
pub type Inspect = fn(Cycle, &MeshSimulation);

/// Outcome of a completed `MeshSimulation::run`.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationReport {
    /// Simulator cycles spent in this run.
    pub cycles: Cycle,
    /// Kernel invocations each device has completed, in mesh order.
    pub completed: Vec<(PhysicalDeviceId, usize)>,
    pub crashed: Vec<PhysicalDeviceId>,
}

/// Executes kernel invocations on every device of a mesh.
pub struct MeshSimulation {
    mesh: DeviceMesh,
    sim_type: SimulationType,

    /// Devices in row-major mesh order.
    devices: Vec<Device>,

    fabric: Box<dyn Fabric>,

    // The simulator local cycles.
    sim_local_cycles: Cycle,

    /// The simulator frequency, defined as sim_freq = LCM({frequency(x)})
    /// over all devices and the links.
    ///
    /// A device of frequency f steps once every sim_freq / f simulator
    /// cycles. In interpreted mode every device steps every cycle.
    sim_freq: usize,

    /// Simulation counters deciding when a device is runnable, in mesh order.
    sim_device_counters: Vec<WrapAroundCounter>,
    sim_link_counter: WrapAroundCounter,

    /// Characteristics of the failures we inject into the simulation.
    failure_properties: FailureProperties,

    vcd_header_written: bool,
}

impl MeshSimulation {
    fn compute_sim_freq(all_freqs: &[usize]) -> usize {
        all_freqs[1..]
            .iter()
            .fold(all_freqs[0], |accum, x| num::integer::lcm(accum, *x))
    }

    pub fn new(
        mesh: DeviceMesh,
        config: &Config,
        sim_type: SimulationType,
        failure_properties: FailureProperties,
    ) -> Result<Self, Error> {
        let mut devices = mesh
            .devices()
            .iter()
            .enumerate()
            .map(|(pos, id)| Device::new(*id, &config.device(pos)))
            .collect::<Vec<_>>();
        for (id, delay) in failure_properties.invocation_delays.iter() {
            devices[mesh.position_of(*id)?].set_invocation_delay(*delay);
        }
        for id in failure_properties.induced_crashes.keys() {
            mesh.position_of(*id)?;
        }

        let (sim_freq, fabric): (usize, Box<dyn Fabric>) = match sim_type {
            SimulationType::Interpret => (1, Box::new(DirectFabric::new(&mesh))),
            SimulationType::Hardware => {
                let mut all_freqs = devices
                    .iter()
                    .map(|d| d.config().frequency)
                    .collect::<Vec<_>>();
                all_freqs.push(config.link.frequency);
                if all_freqs.contains(&0) {
                    log::error!("Frequencies must be positive: {:?}", all_freqs);
                    return Err(Error::InvalidMesh);
                }
                let sim_freq = MeshSimulation::compute_sim_freq(&all_freqs);
                let link_period = sim_freq / config.link.frequency;
                (
                    sim_freq,
                    Box::new(LinkFabric::new(&mesh, config.link, link_period)),
                )
            }
        };
        let sim_device_counters = devices
            .iter()
            .map(|d| match sim_type {
                SimulationType::Interpret => WrapAroundCounter::new(1),
                SimulationType::Hardware => WrapAroundCounter::new(sim_freq / d.config().frequency),
            })
            .collect();
        let sim_link_counter = match sim_type {
            SimulationType::Interpret => WrapAroundCounter::new(1),
            SimulationType::Hardware => WrapAroundCounter::new(sim_freq / config.link.frequency),
        };
        log::debug!("{:?} simulation of {} at frequency {}", sim_type, mesh, sim_freq);

        Ok(Self {
            mesh,
            sim_type,
            devices,
            fabric,
            sim_local_cycles: 0,
            sim_freq,
            sim_device_counters,
            sim_link_counter,
            failure_properties,
            vcd_header_written: false,
        })
    }

    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    pub fn sim_freq(&self) -> usize {
        self.sim_freq
    }

    pub fn cycles(&self) -> Cycle {
        self.sim_local_cycles
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: PhysicalDeviceId) -> Result<&Device, Error> {
        Ok(&self.devices[self.mesh.position_of(id)?])
    }

    fn device_mut(&mut self, id: PhysicalDeviceId) -> Result<&mut Device, Error> {
        let pos = self.mesh.position_of(id)?;
        Ok(&mut self.devices[pos])
    }

    pub fn write_buffer(
        &mut self,
        id: PhysicalDeviceId,
        name: &str,
        data: Vec<f32>,
    ) -> Result<(), Error> {
        self.device_mut(id)?.memory.write(name, data)
    }

    pub fn read_buffer(&self, id: PhysicalDeviceId, name: &str) -> Result<&[f32], Error> {
        self.device(id)?.memory().buffer(name)
    }

    /// Place one shard per device, in row-major mesh order.
    pub fn write_shards(&mut self, name: &str, shards: Vec<Vec<f32>>) -> Result<(), Error> {
        if shards.len() != self.devices.len() {
            return Err(Error::ShapeMismatch {
                src: shards.len(),
                dst: self.devices.len(),
            });
        }
        for (device, shard) in self.devices.iter_mut().zip(shards) {
            device.memory.write(name, shard)?;
        }
        Ok(())
    }

    /// The shards of a buffer in row-major mesh order.
    pub fn read_shards(&self, name: &str) -> Result<Vec<Vec<f32>>, Error> {
        self.devices
            .iter()
            .map(|device| device.memory().buffer(name).map(|b| b.to_vec()))
            .collect()
    }

    /// Trace `kernel` on every device and queue the programs.
    ///
    /// `inputs` name existing buffers; `outputs` are allocated with the given
    /// length where they do not exist yet. Nothing is queued on any device
    /// unless every device traced successfully.
    pub fn launch(
        &mut self,
        kernel: &Kernel,
        inputs: &[&str],
        outputs: &[(&str, usize)],
    ) -> Result<(), Error> {
        let mut programs = vec![];
        for device in self.devices.iter() {
            let input_refs = inputs
                .iter()
                .map(|name| device.memory().region(name))
                .collect::<Result<Vec<_>, _>>()?;
            let output_refs = outputs
                .iter()
                .map(|(name, len)| {
                    device
                        .memory()
                        .region(name)
                        .unwrap_or_else(|_| BufferRef::new(name, *len))
                })
                .collect::<Vec<_>>();
            programs.push(kernel.trace(
                &self.mesh,
                device.id(),
                device.config().semaphore_capacity,
                &input_refs,
                &output_refs,
            )?);
        }
        for device in self.devices.iter_mut() {
            for (name, len) in outputs {
                device.memory.allocate(name, *len)?;
            }
        }
        for (device, program) in self.devices.iter_mut().zip(programs) {
            device.enqueue(program);
        }
        log::info!(
            "launched {} on {} devices at cycle {}",
            kernel.name(),
            self.devices.len(),
            self.sim_local_cycles
        );
        Ok(())
    }

    fn induce_crashes(&mut self) {
        if self.failure_properties.induced_crashes.is_empty() {
            // No simulated crashes to induce!
            return;
        }
        for (id, &crash_at_cycle) in self.failure_properties.induced_crashes.iter() {
            if crash_at_cycle != self.sim_local_cycles {
                continue;
            }
            if let Ok(pos) = self.mesh.position_of(*id) {
                log::info!("Simulating crash of {} at cycle {}", id, self.sim_local_cycles);
                self.devices[pos].set_crashed();
            }
        }
    }

    /// All work done: no device has anything left and nothing is in flight.
    pub fn is_done(&self) -> bool {
        self.fabric.is_idle() && self.devices.iter().all(|d| d.is_idle())
    }

    /// The waiting devices, if no device can make progress any more.
    fn stalled(&self) -> Option<Vec<crate::StalledDevice>> {
        if !self.fabric.is_idle() {
            return None;
        }
        let stuck = self
            .devices
            .iter()
            .all(|d| d.is_idle() || d.is_stalled());
        let waiting = self
            .devices
            .iter()
            .filter(|d| d.is_stalled())
            .filter_map(|d| d.waiting())
            .collect::<Vec<_>>();
        if stuck && !waiting.is_empty() {
            Some(waiting)
        } else {
            None
        }
    }

    fn trace_vcd(&self, callbacks: OptionSimCallbacks) {
        callbacks.vcd(|writer| {
            let _vcd_trace_scope =
                VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            writer.borrow_mut().enter_cycle();
            writer
                .borrow_mut()
                .change_vector_immediately("sim_cycles", self.sim_local_cycles as u64);
            for device in &self.devices {
                device.vcd_trace(Rc::clone(&writer));
            }
            writer.borrow_mut().end_cycle();
        });
    }

    /// Simulate until every device has finished its queued invocations.
    ///
    /// Fails with `Stalled` once every live device waits on a semaphore no
    /// one can signal any more, and with `Timeout` after `max_cycles`.
    pub fn run(
        &mut self,
        max_cycles: Cycle,
        inspect_fn: Option<Inspect>,
        callbacks: OptionSimCallbacks,
    ) -> Result<SimulationReport, Error> {
        if !self.vcd_header_written {
            callbacks.vcd(|writer| VcdWriter::write_header(writer, &self.devices));
            self.vcd_header_written = true;
        }
        let start = self.sim_local_cycles;
        while !self.is_done() {
            if self.sim_local_cycles - start >= max_cycles {
                log::error!("{} cycles elapsed, giving up", max_cycles);
                return Err(Error::Timeout { cycles: max_cycles });
            }
            self.simulate_system_one_cycle(callbacks)?;
            // allow the caller to inspect the state of the simulation
            if let Some(inspect) = inspect_fn {
                (inspect)(self.sim_local_cycles, self);
            }
            if let Some(waiting) = self.stalled() {
                let err = Error::Stalled {
                    cycle: self.sim_local_cycles,
                    waiting,
                };
                log::error!("{}", err);
                return Err(err);
            }
        }
        callbacks.vcd(|writer| writer.borrow_mut().flush_after_simulation());
        Ok(SimulationReport {
            cycles: self.sim_local_cycles - start,
            completed: self
                .devices
                .iter()
                .map(|d| (d.id(), d.completed_invocations()))
                .collect(),
            crashed: self
                .devices
                .iter()
                .filter(|d| d.get_crashed())
                .map(|d| d.id())
                .collect(),
        })
    }
}

impl SystemSimulationTrait for MeshSimulation {
    fn sim_type(&self) -> SimulationType {
        self.sim_type
    }

    // step the entire system one cycle (one unit of root frequency), which will correspond to
    // multiple cycles for devices operating at faster frequencies than the root
    fn simulate_system_one_cycle(&mut self, callbacks: OptionSimCallbacks) -> Result<(), Error> {
        trace!(
            "simulate_system_one_cycle, sim cycle: {}, sim frequency: {}",
            self.sim_local_cycles,
            self.sim_freq,
        );
        self.induce_crashes();
        let now = self.sim_local_cycles;
        for pos in 0..self.devices.len() {
            if !self.sim_device_counters[pos].test() {
                continue;
            }
            if let Some(effect) = self.devices[pos].step()? {
                self.fabric.dispatch(
                    now,
                    pos,
                    effect,
                    &mut self.devices,
                    &mut self.failure_properties,
                )?;
            }
        }
        self.fabric.advance(
            now,
            self.sim_link_counter.test(),
            &mut self.devices,
            &mut self.failure_properties,
        )?;
        // Finally advance device and link counters.
        for counter in self.sim_device_counters.iter_mut() {
            counter.advance();
        }
        self.sim_link_counter.advance();
        self.sim_local_cycles += 1;
        self.trace_vcd(callbacks);
        Ok(())
    }
}
