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

//! Collective permute along one mesh axis, built from the remote copy and
//! semaphore primitives, plus host-side helpers to shard buffers and to
//! compute the expected result.
//!
//! Every device copies its whole shard to its neighbour one step along the
//! axis, so the shards rotate by one position. Other axes are fan-out axes:
//! each of their planes permutes independently.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::kernel::{Kernel, KernelContext};
use crate::mesh::{DeviceId, DeviceMesh, LogicalCoord};
use crate::semaphore::{CollectiveId, SemaphoreRef, SemaphoreType};
use crate::sim::MeshSimulation;
use crate::Error;

pub const PERMUTE_COLLECTIVE_ID: CollectiveId = 0;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn delta(&self) -> isize {
        match self {
            Direction::Left => -1,
            Direction::Right => 1,
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            _ => Err(format!("Invalid direction: {}", s)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PermuteSpec {
    pub axis: String,
    pub direction: Direction,
    /// Rendezvous on the barrier semaphore before the ready handshake.
    /// Needed whenever devices may enter the invocation at different times.
    pub barrier: bool,
    /// Wait for the destination to be ready before copying.
    pub handshake: bool,
}

impl PermuteSpec {
    pub fn new(axis: &str, direction: Direction) -> Self {
        Self {
            axis: axis.to_string(),
            direction,
            barrier: true,
            handshake: true,
        }
    }

    pub fn without_barrier(mut self) -> Self {
        self.barrier = false;
        self
    }

    pub fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }
}

/// Tell `peer` this device has arrived, then wait until a partner has told
/// us the same through `sem`.
pub fn handshake(
    ctx: &mut KernelContext,
    sem: &SemaphoreRef,
    peer: &LogicalCoord,
) -> Result<(), Error> {
    ctx.semaphore_signal(sem, 1, Some(DeviceId::Logical(peer.clone())))?;
    ctx.semaphore_wait(sem, 1)
}

/// Handshake on the kernel's barrier semaphore.
pub fn barrier(ctx: &mut KernelContext, peer: &LogicalCoord) -> Result<(), Error> {
    let sem = ctx.barrier_semaphore()?;
    handshake(ctx, &sem, peer)
}

/// The kernel moving `inputs[0]` of every device into `outputs[0]` of its
/// neighbour along `spec.axis`.
pub fn ppermute_kernel(spec: &PermuteSpec) -> Kernel {
    let body_spec = spec.clone();
    let kernel = Kernel::new(
        &format!("ppermute_{}_{}", spec.axis, spec.direction),
        move |ctx, inputs, outputs| {
            let spec = &body_spec;
            let dst = ctx.neighbor(&spec.axis, spec.direction.delta())?;
            let src = ctx.neighbor(&spec.axis, -spec.direction.delta())?;
            let (input, output) = match (inputs.first(), outputs.first()) {
                (Some(input), Some(output)) => (input, output),
                _ => return Err(Error::InvalidBuffer("ppermute operands".to_string())),
            };
            ctx.run_scoped(
                &[
                    SemaphoreType::Regular,
                    SemaphoreType::Dma,
                    SemaphoreType::Dma,
                ],
                |ctx, sems| {
                    let (ready, send, recv) = (sems[0], sems[1], sems[2]);
                    if spec.barrier {
                        // the source has entered this invocation, so its
                        // ready semaphore is live
                        barrier(ctx, &dst)?;
                    }
                    if spec.handshake {
                        // the destination has entered this invocation, so
                        // its receive semaphore is live
                        handshake(ctx, &ready, &src)?;
                    }
                    let mut copy = ctx.async_remote_copy(
                        input,
                        output,
                        Some(send),
                        recv,
                        DeviceId::Logical(dst.clone()),
                    )?;
                    copy.wait_send(ctx)?;
                    copy.wait_recv(ctx)
                },
            )
        },
    );
    if spec.barrier {
        kernel.with_collective_id(PERMUTE_COLLECTIVE_ID)
    } else {
        kernel
    }
}

/// Launch a permute of buffer `input` into buffer `output` on every device.
pub fn launch_ppermute(
    sim: &mut MeshSimulation,
    spec: &PermuteSpec,
    input: &str,
    output: &str,
) -> Result<(), Error> {
    let len = match sim.devices().first() {
        Some(device) => device.memory().buffer(input)?.len(),
        None => return Err(Error::InvalidMesh),
    };
    sim.launch(&ppermute_kernel(spec), &[input], &[(output, len)])
}

/// Split a row-major buffer of `row_len` wide rows into `shards` equal
/// groups of rows.
pub fn shard_rows(global: &[f32], row_len: usize, shards: usize) -> Result<Vec<Vec<f32>>, Error> {
    let rows = if row_len == 0 { 0 } else { global.len() / row_len };
    if shards == 0 || row_len == 0 || global.len() % row_len != 0 || rows % shards != 0 {
        return Err(Error::ShapeMismatch {
            src: global.len(),
            dst: shards * row_len,
        });
    }
    Ok(global
        .chunks(rows / shards * row_len)
        .map(|chunk| chunk.to_vec())
        .collect())
}

pub fn unshard(shards: &[Vec<f32>]) -> Vec<f32> {
    shards.concat()
}

/// The shards, in row-major mesh order, after one permute along `axis`.
pub fn rotate_shards(
    shards: &[Vec<f32>],
    mesh: &DeviceMesh,
    axis: &str,
    direction: Direction,
) -> Result<Vec<Vec<f32>>, Error> {
    let axis = mesh.axis(axis)?;
    let mut rotated = vec![vec![]; mesh.device_count()];
    for (pos, coord) in mesh.coords().enumerate() {
        let dst = mesh.neighbor(&coord, axis, direction.delta())?;
        let dst = mesh.position_of(mesh.physical_id_of(&dst)?)?;
        rotated[dst] = shards[pos].clone();
    }
    Ok(rotated)
}
