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

use std::collections::HashMap;
use std::fmt;

use crate::Error;

/// A contiguous region of a named device buffer.
///
/// Regions are device-agnostic: a remote copy writes the region of the same
/// name on the destination device.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BufferRef {
    pub name: String,
    pub offset: usize,
    pub len: usize,
}

impl BufferRef {
    /// The whole of a buffer of `len` elements.
    pub fn new(name: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            offset: 0,
            len,
        }
    }

    /// A sub-region, relative to this one.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self, Error> {
        if offset + len > self.len {
            return Err(Error::InvalidBuffer(format!(
                "{}[{}..{}]",
                self,
                offset,
                offset + len
            )));
        }
        Ok(Self {
            name: self.name.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.name, self.offset, self.end())
    }
}

/// The buffers of one device, addressed by name.
#[derive(Clone, Debug)]
pub struct DeviceMemory {
    buffers: HashMap<String, Vec<f32>>,
    capacity: usize,
    used: usize,
}

impl DeviceMemory {
    /// `capacity` is counted in elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            capacity,
            used: 0,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Store `data` as buffer `name`, replacing any previous contents.
    pub fn write(&mut self, name: &str, data: Vec<f32>) -> Result<(), Error> {
        let previous = self.buffers.get(name).map_or(0, |b| b.len());
        if self.used - previous + data.len() > self.capacity {
            log::error!(
                "Buffer {} of {} elements does not fit; {} of {} in use",
                name,
                data.len(),
                self.used,
                self.capacity
            );
            return Err(Error::OutOfMemory);
        }
        self.used = self.used - previous + data.len();
        self.buffers.insert(name.to_string(), data);
        Ok(())
    }

    /// Allocate a zeroed buffer unless one of that name exists already.
    pub fn allocate(&mut self, name: &str, len: usize) -> Result<BufferRef, Error> {
        match self.buffers.get(name) {
            Some(buffer) => Ok(BufferRef::new(name, buffer.len())),
            None => {
                self.write(name, vec![0.0; len])?;
                Ok(BufferRef::new(name, len))
            }
        }
    }

    /// The whole-buffer region of `name`.
    pub fn region(&self, name: &str) -> Result<BufferRef, Error> {
        self.buffers
            .get(name)
            .map(|buffer| BufferRef::new(name, buffer.len()))
            .ok_or_else(|| Error::InvalidBuffer(name.to_string()))
    }

    pub fn buffer(&self, name: &str) -> Result<&[f32], Error> {
        self.buffers
            .get(name)
            .map(|b| b.as_slice())
            .ok_or_else(|| Error::InvalidBuffer(name.to_string()))
    }

    pub fn read(&self, region: &BufferRef) -> Result<&[f32], Error> {
        self.buffers
            .get(&region.name)
            .and_then(|buffer| buffer.get(region.offset..region.end()))
            .ok_or_else(|| Error::InvalidBuffer(region.to_string()))
    }

    fn region_mut(&mut self, region: &BufferRef) -> Result<&mut [f32], Error> {
        self.buffers
            .get_mut(&region.name)
            .and_then(|buffer| buffer.get_mut(region.offset..region.end()))
            .ok_or_else(|| Error::InvalidBuffer(region.to_string()))
    }

    pub fn write_region(&mut self, region: &BufferRef, data: &[f32]) -> Result<(), Error> {
        if data.len() != region.len {
            return Err(Error::ShapeMismatch {
                src: data.len(),
                dst: region.len,
            });
        }
        self.region_mut(region)?.copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, region: &BufferRef, value: f32) -> Result<(), Error> {
        self.region_mut(region)?
            .iter_mut()
            .for_each(|elem| *elem = value);
        Ok(())
    }
}
