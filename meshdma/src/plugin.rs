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

//! Bootstrap of the native accelerator backend.
//!
//! `initialize` looks for the backend library, registers it with a
//! `PlatformRegistry` and registers the custom call targets of an optional
//! extension module. Neither being absent is an error: the registry is left
//! without the platform and callers check `Registration::is_available`.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{Config, LinkConfiguration};
use crate::mesh::DeviceMesh;
use crate::Error;

pub const PLATFORM_NAME: &str = "meshdma";
pub const PLUGIN_PRIORITY: i32 = 500;
const INSTALLED_LIBRARY: &str = "meshdma_plugin.so";
const LOCAL_TEST_LIBRARY: &str = "pjrt_c_api_meshdma_plugin.so";

/// A custom operation, applied in place to a device buffer.
pub type CustomCallTarget = fn(&mut [f32]);

/// Where to look for the backend library, in order.
#[derive(Clone, Debug)]
pub struct PluginSearchPath {
    pub installed: PathBuf,
    pub local_test: PathBuf,
}

impl PluginSearchPath {
    /// The default library names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            installed: dir.join(INSTALLED_LIBRARY),
            local_test: dir.join(LOCAL_TEST_LIBRARY),
        }
    }

    /// Next to the running executable.
    pub fn beside_executable() -> Option<Self> {
        let exe = std::env::current_exe().ok()?;
        exe.parent().map(Self::in_dir)
    }

    pub fn find(&self) -> Option<PathBuf> {
        if self.installed.exists() {
            return Some(self.installed.clone());
        }
        if self.local_test.exists() {
            log::debug!(
                "Native library {} does not exist. Falling back to local test library {}",
                self.installed.display(),
                self.local_test.display()
            );
            return Some(self.local_test.clone());
        }
        log::debug!(
            "Native library {} and local test library {} do not exist",
            self.installed.display(),
            self.local_test.display()
        );
        None
    }
}

/// Describes the interconnect the backend is brought up with.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PluginOptions {
    pub axes: Vec<(String, usize)>,
    pub topology: String,
    pub link: LinkConfiguration,
}

impl PluginOptions {
    pub fn new(mesh: &DeviceMesh, config: &Config) -> Self {
        Self {
            axes: mesh
                .axis_names()
                .iter()
                .cloned()
                .zip(mesh.dims().iter().copied())
                .collect(),
            topology: "torus".to_string(),
            link: config.link,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlatformRegistration {
    pub priority: i32,
    pub library_path: PathBuf,
    pub options: PluginOptions,
}

/// Named platforms and the custom call targets registered for them.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, PlatformRegistration>,
    custom_calls: BTreeMap<(String, String), CustomCallTarget>,
}

impl fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.platforms)
            .field("custom_calls", &self.custom_calls.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PlatformRegistry {
    pub fn register_plugin(
        &mut self,
        name: &str,
        priority: i32,
        library_path: &Path,
        options: PluginOptions,
    ) {
        log::info!(
            "registering platform {} (priority {}) from {}",
            name,
            priority,
            library_path.display()
        );
        self.platforms.insert(
            name.to_string(),
            PlatformRegistration {
                priority,
                library_path: library_path.to_path_buf(),
                options,
            },
        );
    }

    pub fn register_custom_call_target(
        &mut self,
        name: &str,
        target: CustomCallTarget,
        platform: &str,
    ) {
        self.custom_calls
            .insert((platform.to_string(), name.to_string()), target);
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.platforms.contains_key(name)
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformRegistration> {
        self.platforms.get(name)
    }

    pub fn custom_call(&self, name: &str, platform: &str) -> Option<CustomCallTarget> {
        self.custom_calls
            .get(&(platform.to_string(), name.to_string()))
            .copied()
    }
}

/// An optional module contributing custom call targets.
#[derive(Clone)]
pub enum ExtensionModule {
    Available {
        registrations: BTreeMap<String, CustomCallTarget>,
    },
    Unavailable,
}

impl fmt::Debug for ExtensionModule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Available { registrations } => {
                write!(f, "Available({})", registrations.keys().format(", "))
            }
            Self::Unavailable => write!(f, "Unavailable"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Registration {
    Available {
        library_path: PathBuf,
        custom_calls: usize,
    },
    Unavailable,
}

impl Registration {
    pub fn is_available(&self) -> bool {
        matches!(self, Registration::Available { .. })
    }
}

pub fn initialize(
    registry: &mut PlatformRegistry,
    search: &PluginSearchPath,
    options: PluginOptions,
    extension: &ExtensionModule,
) -> Registration {
    let library_path = match search.find() {
        Some(path) => path,
        None => {
            log::info!("{}; continuing without device support", Error::BootstrapUnavailable);
            return Registration::Unavailable;
        }
    };
    registry.register_plugin(PLATFORM_NAME, PLUGIN_PRIORITY, &library_path, options);
    let custom_calls = match extension {
        ExtensionModule::Available { registrations } => {
            for (name, target) in registrations {
                registry.register_custom_call_target(name, *target, PLATFORM_NAME);
            }
            registrations.len()
        }
        ExtensionModule::Unavailable => {
            log::warn!("{} extension module is not found.", PLATFORM_NAME);
            0
        }
    };
    Registration::Available {
        library_path,
        custom_calls,
    }
}
