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

use itertools::Itertools;
use std::fmt;

use crate::mesh::{LogicalCoord, PhysicalDeviceId};
use crate::Cycle;

/// A device that was blocked on a semaphore when the simulation stalled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StalledDevice {
    pub device: PhysicalDeviceId,
    pub kernel: String,
    pub semaphore: String,
    pub count: u64,
    pub wanted: u64,
}

impl fmt::Display for StalledDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} in {} waiting on {} (count {}, wants {})",
            self.device, self.kernel, self.semaphore, self.count, self.wanted
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    // addressing
    OutOfRange(LogicalCoord),
    CoordinateRank { expected: usize, found: usize },
    UnknownDevice(PhysicalDeviceId),
    UnknownAxis(String),
    InvalidMesh,
    // resources
    OutOfSemaphores { capacity: usize },
    OutOfMemory,
    // protocol misuse, detected while tracing a kernel
    InvalidSemaphore,
    InvalidBuffer(String),
    MissingSendSemaphore,
    MissingCollectiveId,
    CopyNotStarted,
    ShapeMismatch { src: usize, dst: usize },
    // liveness, reported by the simulator
    Stalled {
        cycle: Cycle,
        waiting: Vec<StalledDevice>,
    },
    Timeout { cycles: Cycle },
    BootstrapUnavailable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfRange(coord) => {
                write!(f, "ERROR: Logical coordinate {} is outside the mesh", coord)
            }
            Self::CoordinateRank { expected, found } => write!(
                f,
                "ERROR: Expected a {}-d device coordinate, found {} components",
                expected, found
            ),
            Self::UnknownDevice(id) => write!(f, "ERROR: Device {} is not in the mesh", id),
            Self::UnknownAxis(name) => write!(f, "ERROR: Unknown mesh axis '{}'", name),
            Self::OutOfSemaphores { capacity } => write!(
                f,
                "ERROR: Scoped semaphore pool exhausted (capacity {})",
                capacity
            ),
            Self::InvalidBuffer(name) => write!(f, "ERROR: Invalid buffer region {}", name),
            Self::ShapeMismatch { src, dst } => write!(
                f,
                "ERROR: Copy source has {} elements but destination has {}",
                src, dst
            ),
            Self::Stalled { cycle, waiting } => write!(
                f,
                "ERROR: Simulation stalled at cycle {}:\n\t{}",
                cycle,
                waiting.iter().format("\n\t")
            ),
            Self::Timeout { cycles } => {
                write!(f, "ERROR: Simulation did not finish in {} cycles", cycles)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}
