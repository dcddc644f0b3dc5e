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

use env_logger::Target;
use meshdma::collective::Direction;
use std::path::PathBuf;
use structopt::StructOpt;

use ppermute::{PermuteRun, SimulationMode};

#[derive(StructOpt)]
#[structopt(name = "ppermute", about = "Collective permute over a simulated device mesh")]
struct Arguments {
    /// supported modes: Interpret, Hardware
    #[structopt(short, long, default_value = "Interpret")]
    mode: SimulationMode,
    /// devices along the permuted axis
    #[structopt(short, long, default_value = "2")]
    devices: usize,
    /// independent planes permuting side by side
    #[structopt(short, long, default_value = "1")]
    planes: usize,
    /// left or right
    #[structopt(long, default_value = "right")]
    direction: Direction,
    #[structopt(short, long, default_value = "1")]
    iterations: usize,
    /// rendezvous before every permute
    #[structopt(long, parse(try_from_str), default_value = "true")]
    barrier: bool,
    /// rows of 128 elements per device
    #[structopt(short, long, default_value = "8")]
    rows: usize,
    #[structopt(long, default_value = "1000000")]
    cycles: usize,
    /// YAML device and link configuration
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// dump a VCD trace of the run
    #[structopt(long, parse(from_os_str))]
    vcd: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("ppermute"), log::LevelFilter::Info)
        .filter(Some("meshdma"), log::LevelFilter::Warn)
        .target(Target::Stderr)
        .init();

    let report = ppermute::run(&PermuteRun {
        mode: args.mode,
        devices: args.devices,
        planes: args.planes,
        direction: args.direction,
        iterations: args.iterations,
        barrier: args.barrier,
        rows: args.rows,
        max_cycles: args.cycles,
        config: args.config,
        vcd: args.vcd,
    })?;
    println!(
        "{} permutes completed in {} simulator cycles",
        args.iterations, report.cycles
    );
    Ok(())
}
