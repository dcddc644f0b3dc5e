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

use crate::jitter::{simulate_jitter, JitterRun};
use crate::late_entry::back_to_back;
use crate::node_crash::run_simulate_node_crash;
use crate::source_reuse::{simulate_source_reuse, SENTINEL};
use itertools::Itertools;
use meshdma::collective::{Direction, PermuteSpec};
use meshdma::{Error, PhysicalDeviceId, SimulationType};
use std::collections::HashMap;

mod jitter;
mod late_entry;
mod node_crash;
mod source_reuse;

fn describe<T>(result: &Result<T, Error>) -> String {
    match result {
        Ok(_) => "completed".to_string(),
        Err(Error::Stalled { cycle, waiting }) => format!(
            "stalled at cycle {}: {}",
            cycle,
            waiting.iter().format("; ")
        ),
        Err(e) => e.to_string(),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let spec = PermuteSpec::new("x", Direction::Right);
    for barrier in [false, true] {
        let spec = if barrier {
            spec.clone()
        } else {
            spec.clone().without_barrier()
        };
        let result = back_to_back(&spec, SimulationType::Hardware, 50);
        log::info!("back to back, barrier={}: {}", barrier, describe(&result));
    }

    let result = run_simulate_node_crash(4, HashMap::from([(PhysicalDeviceId(2), 3)]), 10_000);
    log::info!("crash of device_2: {}", describe(&result));

    let received = simulate_source_reuse(SimulationType::Hardware, 8, true)?;
    log::info!(
        "overwritten source: {} of {} elements corrupted",
        received.iter().flatten().filter(|v| **v == SENTINEL).count(),
        received.iter().map(|shard| shard.len()).sum::<usize>()
    );

    let outcome = simulate_jitter(&JitterRun {
        devices: 4,
        latency_jitter: 9,
        seed: 1,
        iterations: 4,
        slow_by: 10,
    })?;
    log::info!(
        "jitter: {} in {} cycles",
        if outcome.received == outcome.expected {
            "correct"
        } else {
            "WRONG"
        },
        outcome.cycles
    );
    Ok(())
}
