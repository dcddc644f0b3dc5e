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

//! Overwriting the source of a copy in flight.
//!
//! A DMA engine reads its source frame by frame as it drains, so the source
//! buffer may only be reused once the send semaphore says every element has
//! left.

use meshdma::collective::handshake;
use meshdma::{
    Config, DeviceId, DeviceMesh, Error, FailureProperties, Kernel, LinkConfiguration,
    MeshSimulation, SemaphoreType, SimulationType, SystemSimulationCallbacks,
};

pub const SENTINEL: f32 = -1.0;
pub const SHARD_LEN: usize = 64;

/// Copy `inputs[0]` to the right neighbour's `outputs[0]`, filling the
/// source with `SENTINEL` before or after `wait_send`.
fn send_then_overwrite(before_wait_send: bool) -> Kernel {
    Kernel::new("send_then_overwrite", move |ctx, inputs, outputs| {
        let (input, output) = match (inputs.first(), outputs.first()) {
            (Some(input), Some(output)) => (input, output),
            _ => return Err(Error::InvalidBuffer("send_then_overwrite".to_string())),
        };
        let dst = ctx.neighbor("x", 1)?;
        let src = ctx.neighbor("x", -1)?;
        ctx.run_scoped(
            &[
                SemaphoreType::Regular,
                SemaphoreType::Dma,
                SemaphoreType::Dma,
            ],
            |ctx, sems| {
                handshake(ctx, &sems[0], &src)?;
                let mut copy =
                    ctx.async_remote_copy(input, output, Some(sems[1]), sems[2], DeviceId::Logical(dst))?;
                if before_wait_send {
                    ctx.fill(input, SENTINEL);
                }
                copy.wait_send(ctx)?;
                if !before_wait_send {
                    ctx.fill(input, SENTINEL);
                }
                copy.wait_recv(ctx)
            },
        )
    })
}

/// Run the copy on two devices with `frame_size` element frames and return
/// what each device received.
pub fn simulate_source_reuse(
    sim_type: SimulationType,
    frame_size: usize,
    before_wait_send: bool,
) -> Result<Vec<Vec<f32>>, Error> {
    let config = Config {
        link: LinkConfiguration {
            frame_size,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut sim = MeshSimulation::new(
        DeviceMesh::create(&[("x", 2)])?,
        &config,
        sim_type,
        FailureProperties::default(),
    )?;
    sim.write_shards("x", vec![vec![0.0; SHARD_LEN], vec![1.0; SHARD_LEN]])?;
    sim.launch(&send_then_overwrite(before_wait_send), &["x"], &[("y", SHARD_LEN)])?;
    sim.run(10_000, None, &mut SystemSimulationCallbacks::default())?;
    sim.read_shards("y")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_after_wait_send_is_safe() {
        let _ = env_logger::try_init();
        for sim_type in [SimulationType::Interpret, SimulationType::Hardware] {
            for frame_size in [1, 8, SHARD_LEN] {
                let received = simulate_source_reuse(sim_type, frame_size, false).unwrap();
                assert_eq!(received, vec![vec![1.0; SHARD_LEN], vec![0.0; SHARD_LEN]]);
            }
        }
    }

    #[test]
    fn reuse_before_wait_send_corrupts() {
        let received = simulate_source_reuse(SimulationType::Hardware, 8, true).unwrap();
        for shard in received {
            // the first frame left before the fill, the rest after it
            assert!(shard[..8].iter().all(|v| *v != SENTINEL));
            assert!(shard[8..].iter().all(|v| *v == SENTINEL));
        }
    }

    #[test]
    fn whole_frame_copies_escape() {
        // a single frame is read as soon as the copy starts
        let received = simulate_source_reuse(SimulationType::Hardware, SHARD_LEN, true).unwrap();
        assert_eq!(received, vec![vec![1.0; SHARD_LEN], vec![0.0; SHARD_LEN]]);
        // as is every copy of the interpreter
        let received = simulate_source_reuse(SimulationType::Interpret, 8, true).unwrap();
        assert_eq!(received, vec![vec![1.0; SHARD_LEN], vec![0.0; SHARD_LEN]]);
    }
}
