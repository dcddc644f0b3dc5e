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

//! Kernels and the per-device programs they trace to.
//!
//! A kernel body runs once per device when the kernel is launched. Instead of
//! touching device state it records instructions through the
//! `KernelContext`; the simulator then executes the recorded `Program` on the
//! device. Protocol misuse (wrong semaphore kinds, unmatched copy shapes,
//! waits on unstarted copies) is rejected while tracing, before any device
//! runs.

use std::fmt;
use std::rc::Rc;

use crate::dma::{DmaDescriptor, RemoteCopy};
use crate::memory::BufferRef;
use crate::mesh::{DeviceId, DeviceMesh, LogicalCoord, PhysicalDeviceId};
use crate::semaphore::{CollectiveId, SemaphorePool, SemaphoreRef, SemaphoreType};
use crate::{Cycle, Error};

#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// zero and take ownership of the scoped semaphores
    ScopeEnter(Vec<SemaphoreRef>),
    ScopeExit(Vec<SemaphoreRef>),
    Signal {
        sem: SemaphoreRef,
        amount: u64,
        target: PhysicalDeviceId,
    },
    Wait {
        sem: SemaphoreRef,
        amount: u64,
    },
    StartDma(DmaDescriptor),
    Fill {
        region: BufferRef,
        value: f32,
    },
    /// stand-in for compute: idle for that many device cycles
    Delay(Cycle),
}

/// The instructions one device executes for one kernel invocation.
#[derive(Clone, Debug)]
pub struct Program {
    pub kernel: String,
    pub device: PhysicalDeviceId,
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct KernelParams {
    /// Names the barrier semaphore shared by all participants.
    pub collective_id: Option<CollectiveId>,
}

pub type KernelBody = dyn Fn(&mut KernelContext, &[BufferRef], &[BufferRef]) -> Result<(), Error>;

/// A kernel: a body traced on every device of a mesh, plus its parameters.
#[derive(Clone)]
pub struct Kernel {
    name: String,
    body: Rc<KernelBody>,
    params: KernelParams,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

impl Kernel {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut KernelContext, &[BufferRef], &[BufferRef]) -> Result<(), Error> + 'static,
    {
        Self {
            name: name.to_string(),
            body: Rc::new(body),
            params: KernelParams::default(),
        }
    }

    pub fn with_collective_id(mut self, collective_id: CollectiveId) -> Self {
        self.params.collective_id = Some(collective_id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    /// Run the body for `device`, recording its program.
    pub fn trace(
        &self,
        mesh: &DeviceMesh,
        device: PhysicalDeviceId,
        semaphore_capacity: usize,
        inputs: &[BufferRef],
        outputs: &[BufferRef],
    ) -> Result<Program, Error> {
        let mut ctx = KernelContext::new(mesh, device, &self.params, semaphore_capacity)?;
        (self.body)(&mut ctx, inputs, outputs).map_err(|e| {
            log::error!("Tracing {} on {} failed: {}", self.name, device, e);
            e
        })?;
        log::trace!(
            "{} on {}: {:#?}",
            self.name,
            device,
            ctx.instructions
        );
        Ok(Program {
            kernel: self.name.clone(),
            device,
            instructions: ctx.instructions,
        })
    }
}

/// What a kernel body sees of the device it runs on.
pub struct KernelContext<'a> {
    mesh: &'a DeviceMesh,
    device: PhysicalDeviceId,
    coord: LogicalCoord,
    params: &'a KernelParams,
    pool: SemaphorePool,
    instructions: Vec<Instruction>,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        mesh: &'a DeviceMesh,
        device: PhysicalDeviceId,
        params: &'a KernelParams,
        semaphore_capacity: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            mesh,
            device,
            coord: mesh.logical_coord_of(device)?,
            params,
            pool: SemaphorePool::new(semaphore_capacity),
            instructions: vec![],
        })
    }

    pub(crate) fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn mesh(&self) -> &DeviceMesh {
        self.mesh
    }

    pub fn device_id(&self) -> PhysicalDeviceId {
        self.device
    }

    pub fn logical_coord(&self) -> &LogicalCoord {
        &self.coord
    }

    /// This device's coordinate along the named axis.
    pub fn axis_index(&self, axis: &str) -> Result<usize, Error> {
        Ok(self.coord.0[self.mesh.axis(axis)?])
    }

    pub fn axis_size(&self, axis: &str) -> Result<usize, Error> {
        self.mesh.axis_size(axis)
    }

    /// The coordinate `delta` steps from this device along the named axis.
    pub fn neighbor(&self, axis: &str, delta: isize) -> Result<LogicalCoord, Error> {
        self.mesh.neighbor(&self.coord, self.mesh.axis(axis)?, delta)
    }

    /// Allocate zeroed semaphores of the given kinds for the duration of
    /// `body`. The semaphores go back to the pool whether or not `body`
    /// succeeds.
    pub fn run_scoped<T, F>(&mut self, types: &[SemaphoreType], body: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self, &[SemaphoreRef]) -> Result<T, Error>,
    {
        let sems = self.pool.allocate(types)?;
        self.emit(Instruction::ScopeEnter(sems.clone()));
        let result = body(self, &sems);
        self.pool.release(sems.len());
        if result.is_ok() {
            self.emit(Instruction::ScopeExit(sems));
        }
        result
    }

    fn check_semaphore(&self, sem: &SemaphoreRef, kind: SemaphoreType) -> Result<(), Error> {
        if sem.kind() != kind {
            log::error!("{} used where a {:?} semaphore is required", sem, kind);
            return Err(Error::InvalidSemaphore);
        }
        match sem {
            SemaphoreRef::Scoped { slot, .. } if *slot >= self.pool.in_use() => {
                log::error!("{} used outside of its scope", sem);
                Err(Error::InvalidSemaphore)
            }
            _ => Ok(()),
        }
    }

    /// The barrier semaphore of this kernel's collective.
    pub fn barrier_semaphore(&self) -> Result<SemaphoreRef, Error> {
        self.params
            .collective_id
            .map(SemaphoreRef::Barrier)
            .ok_or(Error::MissingCollectiveId)
    }

    /// Increment `sem` by `amount` on `device`, or on this device if `None`.
    pub fn semaphore_signal(
        &mut self,
        sem: &SemaphoreRef,
        amount: u64,
        device: Option<DeviceId>,
    ) -> Result<(), Error> {
        self.check_semaphore(sem, SemaphoreType::Regular)?;
        let target = match device {
            Some(id) => self.mesh.resolve(&id)?,
            None => self.device,
        };
        self.emit(Instruction::Signal {
            sem: *sem,
            amount,
            target,
        });
        Ok(())
    }

    /// Block until `sem` holds at least `amount`, then take it.
    pub fn semaphore_wait(&mut self, sem: &SemaphoreRef, amount: u64) -> Result<(), Error> {
        self.check_semaphore(sem, SemaphoreType::Regular)?;
        self.emit(Instruction::Wait { sem: *sem, amount });
        Ok(())
    }

    /// Describe a copy of `src` on this device into `dst` on `device`,
    /// without starting it.
    pub fn make_async_remote_copy(
        &mut self,
        src: &BufferRef,
        dst: &BufferRef,
        send_sem: Option<SemaphoreRef>,
        recv_sem: SemaphoreRef,
        device: DeviceId,
    ) -> Result<RemoteCopy, Error> {
        let send_sem = send_sem.ok_or(Error::MissingSendSemaphore)?;
        self.check_semaphore(&send_sem, SemaphoreType::Dma)?;
        self.check_semaphore(&recv_sem, SemaphoreType::Dma)?;
        if src.len != dst.len {
            return Err(Error::ShapeMismatch {
                src: src.len,
                dst: dst.len,
            });
        }
        let target = self.mesh.resolve(&device)?;
        log::debug!(
            "{} copies {} to {} on {}",
            self.device,
            src,
            dst,
            target
        );
        Ok(RemoteCopy::new(DmaDescriptor {
            src: src.clone(),
            dst: dst.clone(),
            target,
            send_sem: Some(send_sem),
            recv_sem,
        }))
    }

    /// `make_async_remote_copy` followed by `start`.
    pub fn async_remote_copy(
        &mut self,
        src: &BufferRef,
        dst: &BufferRef,
        send_sem: Option<SemaphoreRef>,
        recv_sem: SemaphoreRef,
        device: DeviceId,
    ) -> Result<RemoteCopy, Error> {
        let mut copy = self.make_async_remote_copy(src, dst, send_sem, recv_sem, device)?;
        copy.start(self)?;
        Ok(copy)
    }

    /// A copy between two regions of this device, completing on one
    /// semaphore.
    pub fn make_async_copy(
        &mut self,
        src: &BufferRef,
        dst: &BufferRef,
        sem: SemaphoreRef,
    ) -> Result<RemoteCopy, Error> {
        self.check_semaphore(&sem, SemaphoreType::Dma)?;
        if src.len != dst.len {
            return Err(Error::ShapeMismatch {
                src: src.len,
                dst: dst.len,
            });
        }
        Ok(RemoteCopy::new(DmaDescriptor {
            src: src.clone(),
            dst: dst.clone(),
            target: self.device,
            send_sem: None,
            recv_sem: sem,
        }))
    }

    pub fn fill(&mut self, region: &BufferRef, value: f32) {
        self.emit(Instruction::Fill {
            region: region.clone(),
            value,
        });
    }

    pub fn delay(&mut self, cycles: Cycle) {
        if cycles > 0 {
            self.emit(Instruction::Delay(cycles));
        }
    }
}
