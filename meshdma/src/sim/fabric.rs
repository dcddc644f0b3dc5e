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

//! Interconnect models: how remote signals and DMA transfers reach their
//! destination device.

use rand::Rng;
use std::collections::VecDeque;

use super::FailureProperties;
use crate::config::LinkConfiguration;
use crate::device::{Device, Effect};
use crate::dma::DmaDescriptor;
use crate::memory::BufferRef;
use crate::mesh::DeviceMesh;
use crate::semaphore::SemaphoreRef;
use crate::topology::Topology;
use crate::{Cycle, Error};

pub(crate) trait Fabric {
    /// Accept the effect of a device step of the device at mesh position `src`.
    fn dispatch(
        &mut self,
        now: Cycle,
        src: usize,
        effect: Effect,
        devices: &mut [Device],
        failures: &mut FailureProperties,
    ) -> Result<(), Error>;

    /// Move data in flight; `link_tick` is set on cycles the links are
    /// clocked.
    fn advance(
        &mut self,
        now: Cycle,
        link_tick: bool,
        devices: &mut [Device],
        failures: &mut FailureProperties,
    ) -> Result<(), Error>;

    /// Nothing in flight and nothing queued.
    fn is_idle(&self) -> bool;
}

/// Interpreted execution: signals and copies take effect as soon as they
/// are issued.
pub(crate) struct DirectFabric {
    mesh: DeviceMesh,
}

impl DirectFabric {
    pub(crate) fn new(mesh: &DeviceMesh) -> Self {
        Self { mesh: mesh.clone() }
    }
}

impl Fabric for DirectFabric {
    fn dispatch(
        &mut self,
        _now: Cycle,
        src: usize,
        effect: Effect,
        devices: &mut [Device],
        _failures: &mut FailureProperties,
    ) -> Result<(), Error> {
        match effect {
            Effect::Signal {
                target,
                sem,
                amount,
            } => {
                let dst = self.mesh.position_of(target)?;
                if devices[dst].get_crashed() {
                    log::debug!("dropping {} for crashed {}", sem, target);
                    return Ok(());
                }
                devices[dst].semaphores.signal(&sem, amount)
            }
            Effect::Dma(desc) => {
                let data = devices[src].memory.read(&desc.src)?.to_vec();
                if let Some(send_sem) = &desc.send_sem {
                    devices[src]
                        .semaphores
                        .signal(send_sem, desc.len() as u64)?;
                }
                let dst = self.mesh.position_of(desc.target)?;
                if devices[dst].get_crashed() {
                    log::debug!("dropping copy to crashed {}", desc.target);
                    return Ok(());
                }
                devices[dst].memory.write_region(&desc.dst, &data)?;
                devices[dst]
                    .semaphores
                    .signal(&desc.recv_sem, desc.len() as u64)
            }
        }
    }

    fn advance(
        &mut self,
        _now: Cycle,
        _link_tick: bool,
        _devices: &mut [Device],
        _failures: &mut FailureProperties,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn is_idle(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Transfer {
    desc: DmaDescriptor,
    moved: usize,
}

#[derive(Debug)]
enum Payload {
    Signal {
        sem: SemaphoreRef,
        amount: u64,
    },
    Data {
        region: BufferRef,
        data: Vec<f32>,
        recv_sem: SemaphoreRef,
    },
}

#[derive(Debug)]
struct Packet {
    arrival: Cycle,
    dst: usize,
    payload: Payload,
}

/// Hardware execution: every device has a DMA engine draining its queued
/// transfers one frame per link cycle, and every frame or signal crosses the
/// torus with a latency proportional to its hop count.
pub(crate) struct LinkFabric {
    mesh: DeviceMesh,
    topology: Topology,
    link: LinkConfiguration,
    /// simulator cycles per link cycle
    link_period: Cycle,
    engines: Vec<VecDeque<Transfer>>,
    in_flight: Vec<Packet>,
}

impl LinkFabric {
    pub(crate) fn new(mesh: &DeviceMesh, link: LinkConfiguration, link_period: Cycle) -> Self {
        Self {
            topology: Topology::torus(mesh),
            engines: (0..mesh.device_count()).map(|_| VecDeque::new()).collect(),
            in_flight: vec![],
            mesh: mesh.clone(),
            link,
            link_period,
        }
    }

    fn arrival(&self, now: Cycle, src: usize, dst: usize, failures: &mut FailureProperties) -> Cycle {
        let hops = self.topology.hops(src, dst);
        let jitter = if failures.latency_jitter > 0 {
            failures.rng.gen_range(0..=failures.latency_jitter)
        } else {
            0
        };
        now + (1 + hops * self.link.latency) * self.link_period + jitter
    }

    fn deliver(&mut self, now: Cycle, devices: &mut [Device]) -> Result<(), Error> {
        let (mut arrived, pending): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(|p| p.arrival <= now);
        self.in_flight = pending;
        arrived.sort_by_key(|p| p.arrival);
        for packet in arrived {
            let device = &mut devices[packet.dst];
            if device.get_crashed() {
                log::debug!("{} crashed; dropping {:?}", device.id(), packet.payload);
                continue;
            }
            match packet.payload {
                Payload::Signal { sem, amount } => device.semaphores.signal(&sem, amount)?,
                Payload::Data {
                    region,
                    data,
                    recv_sem,
                } => {
                    device.memory.write_region(&region, &data)?;
                    device.semaphores.signal(&recv_sem, data.len() as u64)?;
                }
            }
        }
        Ok(())
    }

    fn drain_engine(
        &mut self,
        now: Cycle,
        src: usize,
        devices: &mut [Device],
        failures: &mut FailureProperties,
    ) -> Result<(), Error> {
        if devices[src].get_crashed() {
            if !self.engines[src].is_empty() {
                log::debug!("{} crashed; aborting its DMA transfers", devices[src].id());
                self.engines[src].clear();
            }
            return Ok(());
        }
        let (chunk, done, dst) = match self.engines[src].front_mut() {
            None => return Ok(()),
            Some(transfer) => {
                let size = self.link.frame_size.max(1).min(transfer.desc.len() - transfer.moved);
                let src_region = transfer.desc.src.slice(transfer.moved, size)?;
                let dst_region = transfer.desc.dst.slice(transfer.moved, size)?;
                // the source is read as it drains, not when the copy starts
                let data = devices[src].memory.read(&src_region)?.to_vec();
                if let Some(send_sem) = &transfer.desc.send_sem {
                    devices[src].semaphores.signal(send_sem, size as u64)?;
                }
                transfer.moved += size;
                let payload = Payload::Data {
                    region: dst_region,
                    data,
                    recv_sem: transfer.desc.recv_sem,
                };
                (
                    payload,
                    transfer.moved == transfer.desc.len(),
                    self.mesh.position_of(transfer.desc.target)?,
                )
            }
        };
        if done {
            self.engines[src].pop_front();
        }
        let arrival = self.arrival(now, src, dst, failures);
        self.in_flight.push(Packet {
            arrival,
            dst,
            payload: chunk,
        });
        Ok(())
    }
}

impl Fabric for LinkFabric {
    fn dispatch(
        &mut self,
        now: Cycle,
        src: usize,
        effect: Effect,
        _devices: &mut [Device],
        failures: &mut FailureProperties,
    ) -> Result<(), Error> {
        match effect {
            Effect::Signal {
                target,
                sem,
                amount,
            } => {
                let dst = self.mesh.position_of(target)?;
                let arrival = self.arrival(now, src, dst, failures);
                log::trace!("{} to {} arrives at {}", sem, target, arrival);
                self.in_flight.push(Packet {
                    arrival,
                    dst,
                    payload: Payload::Signal { sem, amount },
                });
            }
            Effect::Dma(desc) => {
                if desc.len() == 0 {
                    log::warn!("empty copy of {} ignored", desc.src);
                    return Ok(());
                }
                self.engines[src].push_back(Transfer { desc, moved: 0 });
            }
        }
        Ok(())
    }

    fn advance(
        &mut self,
        now: Cycle,
        link_tick: bool,
        devices: &mut [Device],
        failures: &mut FailureProperties,
    ) -> Result<(), Error> {
        self.deliver(now, devices)?;
        if link_tick {
            for src in 0..self.engines.len() {
                self.drain_engine(now, src, devices, failures)?;
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.engines.iter().all(|e| e.is_empty())
    }
}
