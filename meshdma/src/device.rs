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

use std::collections::VecDeque;

use crate::config::DeviceConfiguration;
use crate::dma::DmaDescriptor;
use crate::error::StalledDevice;
use crate::kernel::{Instruction, Program};
use crate::memory::DeviceMemory;
use crate::mesh::PhysicalDeviceId;
use crate::semaphore::{SemaphoreFile, SemaphoreRef};
use crate::{Cycle, Error};

/// Work a device step hands to the interconnect.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Effect {
    Signal {
        target: PhysicalDeviceId,
        sem: SemaphoreRef,
        amount: u64,
    },
    Dma(DmaDescriptor),
}

#[derive(Debug)]
struct Running {
    program: Program,
    pc: usize,
}

/// One accelerator: its memory, its semaphores and the kernel invocations
/// queued on it.
#[derive(Debug)]
pub struct Device {
    id: PhysicalDeviceId,
    config: DeviceConfiguration,
    pub(crate) memory: DeviceMemory,
    pub(crate) semaphores: SemaphoreFile,
    queue: VecDeque<Program>,
    current: Option<Running>,
    /// remaining idle device cycles
    delay: Cycle,
    /// idle cycles inserted before every invocation but the first
    invocation_delay: Cycle,
    started: usize,
    completed: usize,
    cycles: Cycle,
    crashed: bool,
    blocked: Option<(SemaphoreRef, u64)>,
}

impl Device {
    pub fn new(id: PhysicalDeviceId, config: &DeviceConfiguration) -> Self {
        Self {
            id,
            memory: DeviceMemory::new(config.memory_size),
            semaphores: SemaphoreFile::new(config.semaphore_capacity),
            queue: VecDeque::new(),
            current: None,
            delay: config.starting_cycles,
            invocation_delay: 0,
            started: 0,
            completed: 0,
            cycles: 0,
            crashed: false,
            blocked: None,
            config: config.clone(),
        }
    }

    pub fn id(&self) -> PhysicalDeviceId {
        self.id
    }

    pub fn config(&self) -> &DeviceConfiguration {
        &self.config
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn semaphores(&self) -> &SemaphoreFile {
        &self.semaphores
    }

    /// Number of device cycles stepped so far.
    pub fn cycles(&self) -> Cycle {
        self.cycles
    }

    pub fn completed_invocations(&self) -> usize {
        self.completed
    }

    pub fn get_crashed(&self) -> bool {
        self.crashed
    }

    pub(crate) fn set_crashed(&mut self) {
        self.crashed = true;
        self.blocked = None;
    }

    pub(crate) fn set_invocation_delay(&mut self, delay: Cycle) {
        self.invocation_delay = delay;
    }

    pub(crate) fn enqueue(&mut self, program: Program) {
        self.queue.push_back(program);
    }

    /// The index of the next instruction to execute, if an invocation runs.
    pub fn pc(&self) -> Option<usize> {
        self.current.as_ref().map(|r| r.pc)
    }

    /// Nothing left to run: no queued invocation and no pending delay.
    pub fn is_idle(&self) -> bool {
        self.crashed || (self.current.is_none() && self.queue.is_empty() && self.delay == 0)
    }

    /// Blocked on a wait that the current semaphore count cannot satisfy.
    pub fn is_stalled(&self) -> bool {
        match &self.blocked {
            Some((sem, amount)) if !self.crashed => {
                self.semaphores.count(sem).unwrap_or(0) < *amount
            }
            _ => false,
        }
    }

    pub(crate) fn waiting(&self) -> Option<StalledDevice> {
        let (sem, amount) = self.blocked.as_ref()?;
        Some(StalledDevice {
            device: self.id,
            kernel: self
                .current
                .as_ref()
                .map_or_else(String::new, |r| r.program.kernel.clone()),
            semaphore: sem.to_string(),
            count: self.semaphores.count(sem).unwrap_or(0),
            wanted: *amount,
        })
    }

    /// Execute at most one instruction.
    pub(crate) fn step(&mut self) -> Result<Option<Effect>, Error> {
        if self.crashed {
            return Ok(None);
        }
        self.cycles += 1;
        if self.delay > 0 {
            self.delay -= 1;
            return Ok(None);
        }
        if self.current.is_none() {
            let program = match self.queue.pop_front() {
                Some(program) => program,
                None => return Ok(None),
            };
            log::info!(
                "{} starts invocation {} of {} at cycle {}",
                self.id,
                self.started,
                program.kernel,
                self.cycles
            );
            self.current = Some(Running { program, pc: 0 });
            self.started += 1;
            if self.started > 1 && self.invocation_delay > 0 {
                self.delay = self.invocation_delay - 1;
                return Ok(None);
            }
        }
        let effect = self.execute()?;
        self.retire();
        Ok(effect)
    }

    fn execute(&mut self) -> Result<Option<Effect>, Error> {
        let running = match self.current.as_mut() {
            Some(running) => running,
            None => return Ok(None),
        };
        let instruction = match running.program.instructions.get(running.pc) {
            Some(instruction) => instruction,
            None => return Ok(None),
        };
        log::trace!("{} pc {}: {:?}", self.id, running.pc, instruction);
        let mut effect = None;
        match instruction {
            Instruction::ScopeEnter(sems) => self.semaphores.acquire(sems)?,
            Instruction::ScopeExit(sems) => self.semaphores.release(sems)?,
            Instruction::Signal {
                sem,
                amount,
                target,
            } => {
                if *target == self.id {
                    self.semaphores.signal(sem, *amount)?;
                } else {
                    effect = Some(Effect::Signal {
                        target: *target,
                        sem: *sem,
                        amount: *amount,
                    });
                }
            }
            Instruction::Wait { sem, amount } => {
                if !self.semaphores.try_wait(sem, *amount)? {
                    if self.blocked.is_none() {
                        log::debug!("{} blocks on {} for {}", self.id, sem, amount);
                    }
                    self.blocked = Some((*sem, *amount));
                    return Ok(None);
                }
                self.blocked = None;
            }
            Instruction::StartDma(desc) => effect = Some(Effect::Dma(desc.clone())),
            Instruction::Fill { region, value } => self.memory.fill(region, *value)?,
            Instruction::Delay(cycles) => self.delay = cycles.saturating_sub(1),
        }
        running.pc += 1;
        Ok(effect)
    }

    fn retire(&mut self) {
        let finished = self
            .current
            .as_ref()
            .map_or(false, |r| r.pc >= r.program.len());
        if finished {
            if let Some(running) = self.current.take() {
                log::info!(
                    "{} finished {} at cycle {}",
                    self.id,
                    running.program.kernel,
                    self.cycles
                );
            }
            self.completed += 1;
        }
    }
}
