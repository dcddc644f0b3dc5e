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

use crate::Cycle;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// The number of scoped semaphores a device can hold at once.
const SEMAPHORE_CAPACITY: usize = 16;

/// Default number of f32 elements a DMA engine moves per link cycle.
pub const FRAME_SIZE: usize = 128;

/// provides a set of parameters to configure a device
///
/// constructed programmatically or read from a config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfiguration {
    pub frequency: usize,
    pub semaphore_capacity: usize,
    pub memory_size: usize, // in elements
    pub starting_cycles: Cycle,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            frequency: 1,
            semaphore_capacity: SEMAPHORE_CAPACITY,
            memory_size: std::usize::MAX, // infinite memory!
            starting_cycles: 0,
        }
    }
}

/// Interconnect links; all links of a mesh share one configuration.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LinkConfiguration {
    pub frame_size: usize,
    pub frequency: usize,
    pub latency: Cycle,
}

impl LinkConfiguration {
    pub fn new(frame_size: usize, frequency: usize, latency: Cycle) -> Self {
        Self {
            frame_size,
            frequency,
            latency,
        }
    }
}

impl Default for LinkConfiguration {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            frequency: 1,
            latency: 1,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Per device configuration, in row-major mesh order. Devices past the
    /// end of the list use `DeviceConfiguration::default()`.
    pub devices: Vec<DeviceConfiguration>,
    pub link: LinkConfiguration,
}

impl Config {
    pub fn from_file(file_name: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(Path::new(file_name))?;
        let reader = BufReader::new(file);
        Ok(serde_yaml::from_reader(reader)?)
    }

    pub fn from_str(config: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(config)
    }

    /// The configuration of the device at row-major mesh position `pos`.
    pub fn device(&self, pos: usize) -> DeviceConfiguration {
        self.devices.get(pos).cloned().unwrap_or_default()
    }
}
