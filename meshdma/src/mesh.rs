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

//! Logical device meshes and the translation between logical coordinates and
//! physical device identifiers.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::Error;

/// A raw hardware device identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PhysicalDeviceId(pub u32);

impl fmt::Display for PhysicalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "device_{}", self.0)
    }
}

/// A position in the mesh, one component per mesh axis.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LogicalCoord(pub Vec<usize>);

impl LogicalCoord {
    pub fn rank(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for LogicalCoord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({})", self.0.iter().format(", "))
    }
}

impl From<usize> for LogicalCoord {
    fn from(rank: usize) -> Self {
        Self(vec![rank])
    }
}

impl From<(usize, usize)> for LogicalCoord {
    fn from((major, minor): (usize, usize)) -> Self {
        Self(vec![major, minor])
    }
}

impl From<Vec<usize>> for LogicalCoord {
    fn from(coords: Vec<usize>) -> Self {
        Self(coords)
    }
}

impl From<&[usize]> for LogicalCoord {
    fn from(coords: &[usize]) -> Self {
        Self(coords.to_vec())
    }
}

/// How a remote-targeting operation names its peer.
///
/// Consumers must resolve the variant explicitly; a logical coordinate is
/// never reinterpreted as a physical id or vice versa.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceId {
    Logical(LogicalCoord),
    Physical(PhysicalDeviceId),
}

impl DeviceId {
    pub fn logical<C: Into<LogicalCoord>>(coord: C) -> Self {
        Self::Logical(coord.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Logical(coord) => write!(f, "logical{}", coord),
            Self::Physical(id) => write!(f, "{}", id),
        }
    }
}

/// return the row-major linear index of `elem` in a grid of `dims`.
pub(crate) fn linearize_index(elem: &[usize], dims: &[usize]) -> usize {
    elem.iter()
        .zip(dims.iter())
        .fold(0, |index, (c, m)| index * m + c)
}

/// inverse of `linearize_index`.
pub(crate) fn delinearize_index(index: usize, dims: &[usize]) -> Vec<usize> {
    let mut idx = index;
    let mut elem = vec![0; dims.len()];
    for (d, m) in dims.iter().enumerate().rev() {
        elem[d] = idx % m;
        idx /= m;
    }
    elem
}

/// An N-dimensional arrangement of physical devices with named axes.
///
/// The axis extents and the device placement are fixed at construction.
#[derive(Clone, Debug)]
pub struct DeviceMesh {
    axis_names: Vec<String>,
    dims: Vec<usize>,
    devices: Vec<PhysicalDeviceId>,
    positions: HashMap<PhysicalDeviceId, usize>,
}

impl DeviceMesh {
    /// Build a mesh placing `devices` in row-major order over `axes`.
    pub fn new(axes: &[(&str, usize)], devices: Vec<PhysicalDeviceId>) -> Result<Self, Error> {
        if axes.is_empty() || axes.iter().any(|(_, extent)| *extent == 0) {
            log::error!("A mesh needs at least one axis and no empty axis: {:?}", axes);
            return Err(Error::InvalidMesh);
        }
        let names = axes.iter().map(|(name, _)| *name).collect::<HashSet<_>>();
        if names.len() != axes.len() {
            log::error!("Mesh axis names must be unique: {:?}", axes);
            return Err(Error::InvalidMesh);
        }
        let dims = axes.iter().map(|(_, extent)| *extent).collect::<Vec<_>>();
        if dims.iter().product::<usize>() != devices.len() {
            log::error!(
                "Mesh of shape {:?} cannot hold {} devices",
                dims,
                devices.len()
            );
            return Err(Error::InvalidMesh);
        }
        let positions = devices
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect::<HashMap<_, _>>();
        if positions.len() != devices.len() {
            log::error!("Duplicate device in mesh: {:?}", devices);
            return Err(Error::InvalidMesh);
        }
        Ok(Self {
            axis_names: axes.iter().map(|(name, _)| name.to_string()).collect(),
            dims,
            devices,
            positions,
        })
    }

    /// A mesh over devices `0..product(extents)` in their natural order.
    pub fn create(axes: &[(&str, usize)]) -> Result<Self, Error> {
        let count = axes.iter().map(|(_, extent)| *extent).product::<usize>();
        Self::new(axes, (0..count as u32).map(PhysicalDeviceId).collect())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn axis_names(&self) -> &[String] {
        &self.axis_names
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Devices in row-major mesh order.
    pub fn devices(&self) -> &[PhysicalDeviceId] {
        &self.devices
    }

    /// Row-major position of a device.
    pub fn position_of(&self, id: PhysicalDeviceId) -> Result<usize, Error> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(Error::UnknownDevice(id))
    }

    pub fn axis(&self, name: &str) -> Result<usize, Error> {
        self.axis_names
            .iter()
            .position(|axis| axis == name)
            .ok_or_else(|| Error::UnknownAxis(name.to_string()))
    }

    pub fn axis_size(&self, name: &str) -> Result<usize, Error> {
        Ok(self.dims[self.axis(name)?])
    }

    fn validate(&self, coord: &LogicalCoord) -> Result<(), Error> {
        if coord.rank() != self.rank() {
            return Err(Error::CoordinateRank {
                expected: self.rank(),
                found: coord.rank(),
            });
        }
        if coord.0.iter().zip(self.dims.iter()).any(|(c, m)| c >= m) {
            return Err(Error::OutOfRange(coord.clone()));
        }
        Ok(())
    }

    pub fn physical_id_of(&self, coord: &LogicalCoord) -> Result<PhysicalDeviceId, Error> {
        self.validate(coord)?;
        Ok(self.devices[linearize_index(&coord.0, &self.dims)])
    }

    pub fn logical_coord_of(&self, id: PhysicalDeviceId) -> Result<LogicalCoord, Error> {
        let pos = self.position_of(id)?;
        Ok(LogicalCoord(delinearize_index(pos, &self.dims)))
    }

    /// Resolve either kind of device identifier to a physical id of this mesh.
    pub fn resolve(&self, id: &DeviceId) -> Result<PhysicalDeviceId, Error> {
        match id {
            DeviceId::Logical(coord) => self.physical_id_of(coord),
            DeviceId::Physical(id) => self.position_of(*id).map(|_| *id),
        }
    }

    /// The coordinate `delta` steps away from `coord` along `axis`, wrapping
    /// around the axis extent.
    pub fn neighbor(
        &self,
        coord: &LogicalCoord,
        axis: usize,
        delta: isize,
    ) -> Result<LogicalCoord, Error> {
        self.validate(coord)?;
        if axis >= self.rank() {
            return Err(Error::UnknownAxis(axis.to_string()));
        }
        let extent = self.dims[axis] as isize;
        let mut next = coord.clone();
        next.0[axis] = (coord.0[axis] as isize + delta).rem_euclid(extent) as usize;
        Ok(next)
    }

    /// All coordinates in row-major order.
    pub fn coords(&self) -> impl Iterator<Item = LogicalCoord> + '_ {
        self.dims
            .iter()
            .map(|&d| 0..d)
            .multi_cartesian_product()
            .map(LogicalCoord)
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "mesh[{}] devices [{}]",
            self.axis_names
                .iter()
                .zip(self.dims.iter())
                .map(|(name, d)| format!("{}={}", name, d))
                .format(", "),
            self.devices.iter().map(|d| d.0).format(", ")
        )
    }
}
