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

pub mod collective;
mod config;
mod device;
mod dma;
mod error;
mod kernel;
mod memory;
mod mesh;
pub mod plugin;
mod semaphore;
mod sim;
mod topology;
mod vcd;

// Public types
// type to use for cycles
pub type Cycle = usize;

pub use crate::config::{Config, DeviceConfiguration, LinkConfiguration, FRAME_SIZE};
pub use crate::device::Device;
pub use crate::dma::{CopyState, DmaDescriptor, RemoteCopy};
pub use crate::error::{Error, StalledDevice};
pub use crate::kernel::{Instruction, Kernel, KernelContext, KernelParams, Program};
pub use crate::memory::{BufferRef, DeviceMemory};
pub use crate::mesh::{DeviceId, DeviceMesh, LogicalCoord, PhysicalDeviceId};
pub use crate::semaphore::{CollectiveId, SemaphoreFile, SemaphoreRef, SemaphoreType};
pub use crate::sim::{
    FailureProperties, Inspect, MeshSimulation, SimulationReport, SimulationType,
    SystemSimulationCallbacks, SystemSimulationTrait,
};
pub use crate::topology::Topology;
pub use crate::vcd::VcdWriter;
