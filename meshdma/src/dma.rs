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

use crate::kernel::{Instruction, KernelContext};
use crate::memory::BufferRef;
use crate::mesh::PhysicalDeviceId;
use crate::semaphore::SemaphoreRef;
use crate::Error;

/// Everything a DMA engine needs to move one region.
#[derive(Clone, Debug, PartialEq)]
pub struct DmaDescriptor {
    pub src: BufferRef,
    pub dst: BufferRef,
    /// The device owning `dst`.
    pub target: PhysicalDeviceId,
    /// Incremented on the issuing device as the source drains. A local copy
    /// has none.
    pub send_sem: Option<SemaphoreRef>,
    /// Incremented on `target` as data lands.
    pub recv_sem: SemaphoreRef,
}

impl DmaDescriptor {
    pub fn len(&self) -> usize {
        self.src.len
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyState {
    Issued,
    Pending,
    Complete,
}

/// Handle on one asynchronous copy, owned by the kernel code that made it.
///
/// The send and receive tracks complete independently: `wait_send` returns
/// once the source may be reused, `wait_recv` once data addressed to this
/// device has landed. A local copy has a single semaphore covering both.
#[derive(Debug)]
pub struct RemoteCopy {
    desc: DmaDescriptor,
    send: CopyState,
    recv: CopyState,
}

impl RemoteCopy {
    pub(crate) fn new(desc: DmaDescriptor) -> Self {
        Self {
            desc,
            send: CopyState::Issued,
            recv: CopyState::Issued,
        }
    }

    pub fn descriptor(&self) -> &DmaDescriptor {
        &self.desc
    }

    pub fn send_state(&self) -> CopyState {
        self.send
    }

    pub fn recv_state(&self) -> CopyState {
        self.recv
    }

    fn is_local(&self) -> bool {
        self.desc.send_sem.is_none()
    }

    pub fn start(&mut self, ctx: &mut KernelContext) -> Result<(), Error> {
        if self.send == CopyState::Pending || self.recv == CopyState::Pending {
            log::debug!("{} restarted before it was waited on", self.desc.src);
        }
        ctx.emit(Instruction::StartDma(self.desc.clone()));
        self.send = CopyState::Pending;
        self.recv = CopyState::Pending;
        Ok(())
    }

    fn wait_on(
        ctx: &mut KernelContext,
        state: &mut CopyState,
        sem: SemaphoreRef,
        amount: usize,
        track: &str,
    ) -> Result<(), Error> {
        match state {
            CopyState::Issued => return Err(Error::CopyNotStarted),
            CopyState::Complete => log::warn!(
                "{} waited on {} after it already completed; the wait is issued again",
                track,
                sem
            ),
            CopyState::Pending => {}
        }
        ctx.emit(Instruction::Wait {
            sem,
            amount: amount as u64,
        });
        *state = CopyState::Complete;
        Ok(())
    }

    /// Block until the outgoing data has left the source region.
    pub fn wait_send(&mut self, ctx: &mut KernelContext) -> Result<(), Error> {
        match self.desc.send_sem {
            Some(sem) => Self::wait_on(ctx, &mut self.send, sem, self.desc.len(), "send"),
            None => self.wait_local(ctx),
        }
    }

    /// Block until the incoming data has landed in the destination region.
    pub fn wait_recv(&mut self, ctx: &mut KernelContext) -> Result<(), Error> {
        if self.is_local() {
            return self.wait_local(ctx);
        }
        Self::wait_on(
            ctx,
            &mut self.recv,
            self.desc.recv_sem,
            self.desc.len(),
            "recv",
        )
    }

    pub fn wait(&mut self, ctx: &mut KernelContext) -> Result<(), Error> {
        if self.is_local() {
            return self.wait_local(ctx);
        }
        self.wait_send(ctx)?;
        self.wait_recv(ctx)
    }

    fn wait_local(&mut self, ctx: &mut KernelContext) -> Result<(), Error> {
        Self::wait_on(
            ctx,
            &mut self.recv,
            self.desc.recv_sem,
            self.desc.len(),
            "copy",
        )?;
        self.send = CopyState::Complete;
        Ok(())
    }
}
