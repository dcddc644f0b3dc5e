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

use meshdma::SimulationType;
use std::str::FromStr;
use structopt::StructOpt;

// Interpret runs every device in lock step with immediate copies.
// Hardware runs the devices on their own clocks over the link model.
#[derive(StructOpt, Clone, Copy, Debug, PartialEq)]
pub enum SimulationMode {
    Interpret,
    Hardware,
}

impl FromStr for SimulationMode {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Interpret" => Ok(SimulationMode::Interpret),
            "Hardware" => Ok(SimulationMode::Hardware),
            _ => Err(Self::Err::new(
                std::io::ErrorKind::Other,
                format!("Invalid simulation mode: {}", s),
            )),
        }
    }
}

impl From<SimulationMode> for SimulationType {
    fn from(mode: SimulationMode) -> Self {
        match mode {
            SimulationMode::Interpret => SimulationType::Interpret,
            SimulationMode::Hardware => SimulationType::Hardware,
        }
    }
}
