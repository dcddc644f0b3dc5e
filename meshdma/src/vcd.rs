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

use crate::device::Device;
use chrono;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path;
use std::rc::Rc;
use vcd;

const DEFAULT_VCD_FILE: &str = "meshdma.vcd";
pub const DEFAULT_TOP_MODULE: &str = "mesh";
const DEFAULT_VCD_HEADER: &str = "meshdma VCD";

#[derive(Clone, Copy, PartialEq)]
struct SizedData {
    value: u64,
    width: usize,
}

pub struct VcdWriter {
    writer: vcd::Writer<fs::File>,
    is_error_state: bool,
    scope_stack: Vec<String>,
    id_map: HashMap<String, (vcd::IdCode, usize)>,
    last_value_map: HashMap<vcd::IdCode, SizedData>,
    timestamp: u64,
}

pub struct VcdTraceScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdTraceScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().leave_scope(self.scope.as_str());
    }
}

pub struct VcdDeclScope {
    writer: Rc<RefCell<VcdWriter>>,
    scope: String,
}

impl Drop for VcdDeclScope {
    fn drop(&mut self) {
        self.writer.borrow_mut().upscope(self.scope.as_str());
    }
}

impl VcdWriter {
    fn vcd_error_handler(&mut self, err: io::Error) {
        if !self.is_error_state {
            self.is_error_state = true;
            log::error!("VCD writing failed with error {:?}", err)
        }
    }

    pub fn managed_decl_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdDeclScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().add_module(scope);
        VcdDeclScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    pub fn managed_trace_scope<T>(writer: Rc<RefCell<VcdWriter>>, scope: &T) -> VcdTraceScope
    where
        T: Display + ?Sized,
    {
        writer.borrow_mut().enter_scope(scope);
        VcdTraceScope {
            writer: Rc::clone(&writer),
            scope: scope.to_string(),
        }
    }

    pub fn write_header(writer: Rc<RefCell<Self>>, devices: &[Device]) {
        {
            let mut w = writer.borrow_mut();
            if let Err(err) = w.writer.comment(DEFAULT_VCD_HEADER) {
                w.vcd_error_handler(err);
            }
            if let Err(err) = w.writer.date(chrono::Utc::now().to_string().as_str()) {
                w.vcd_error_handler(err);
            }
        }
        {
            let _vcd_decl_scope =
                VcdWriter::managed_decl_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            writer.borrow_mut().add_integer_var::<u64>("sim_cycles");
            for device in devices {
                device.vcd_write_scope(Rc::clone(&writer));
            }
        }
        {
            let mut w = writer.borrow_mut();
            if let Err(err) = w.writer.enddefinitions() {
                w.vcd_error_handler(err);
            }
        }
        {
            let _vcd_trace_scope =
                VcdWriter::managed_trace_scope(Rc::clone(&writer), DEFAULT_TOP_MODULE);
            writer.borrow_mut().enter_cycle();
            writer
                .borrow_mut()
                .change_vector_immediately("sim_cycles", 0u64);
            for device in devices {
                device.vcd_init(Rc::clone(&writer));
            }
            writer.borrow_mut().end_cycle();
        }
    }

    fn enter_scope<T: Display + ?Sized>(&mut self, name: &T) {
        self.scope_stack.push(name.to_string())
    }

    fn record_change(&mut self, id_code: vcd::IdCode, sized_data: SizedData) {
        if self.is_error_state {
            return;
        }
        self._record_change(id_code, sized_data)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _record_change(&mut self, id_code: vcd::IdCode, sized_data: SizedData) -> io::Result<()> {
        if let Some(last_sized_data) = self.last_value_map.get(&id_code) {
            if *last_sized_data == sized_data {
                return Ok(());
            }
        }
        let bits = (0..sized_data.width)
            .rev()
            .map(|i| ((sized_data.value >> i) & 1 == 1).into())
            .collect::<Vec<vcd::Value>>();
        self.writer.change_vector(id_code, bits.as_slice())?;
        self.last_value_map.insert(id_code, sized_data);
        Ok(())
    }

    pub fn flush_after_simulation(&mut self) {
        self.enter_cycle();
        self.end_cycle();
    }

    pub fn change_vector_immediately(&mut self, name: &str, value: u64) {
        if let Some((id_code, width)) = self.lookup_id_code(name) {
            if cfg!(feature = "trace-echo-vcd-signal-changes") {
                log::trace!("VCD changing {}", self.scoped_name(name));
            }
            self.record_change(
                id_code,
                SizedData {
                    value: value & mask(width),
                    width,
                },
            );
        }
    }

    fn lookup_id_code(&self, name: &str) -> Option<(vcd::IdCode, usize)> {
        let scoped_name = self.scoped_name(name);
        if let Some(entry) = self.id_map.get(scoped_name.as_str()) {
            Some(*entry)
        } else {
            log::warn!(
                "No such scoped name {} was defined for VCD dumps.",
                scoped_name
            );
            None
        }
    }

    pub fn enter_cycle(&mut self) {
        if self.is_error_state {
            return;
        }
        let timestamp = self.timestamp;
        self.writer
            .timestamp(timestamp)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    pub fn end_cycle(&mut self) {
        if self.is_error_state {
            return;
        }
        self._end_cycle()
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _end_cycle(&mut self) -> io::Result<()> {
        self.writer.end()?;
        self.timestamp += 1;
        Ok(())
    }

    fn leave_scope<T: Display + ?Sized>(&mut self, scope: &T) {
        match self.scope_stack.pop() {
            Some(popped_scope) => assert_eq!(popped_scope, scope.to_string()),
            None => log::error!("Attempted to leave VCD scope {} without entering it", scope),
        }
    }

    fn add_module<T: Display + ?Sized>(&mut self, name: &T) {
        if self.is_error_state {
            return;
        }
        self._add_module::<T>(name)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _add_module<T: Display + ?Sized>(&mut self, name: &T) -> io::Result<()> {
        self.writer.add_module(&name.to_string())?;
        self.scope_stack.push(name.to_string());
        Ok(())
    }

    fn upscope<T: Display + ?Sized>(&mut self, scope: &T) {
        if self.is_error_state {
            return;
        }
        self._upscope::<T>(scope)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _upscope<T: Display + ?Sized>(&mut self, scope: &T) -> io::Result<()> {
        self.leave_scope(scope);
        self.writer.upscope()
    }

    pub fn add_integer_var<T: Sized>(&mut self, reference: &str) {
        if self.is_error_state {
            return;
        }
        self._add_integer_var::<T>(reference)
            .unwrap_or_else(|err| self.vcd_error_handler(err));
    }

    fn _add_integer_var<T: Sized>(&mut self, reference: &str) -> io::Result<()> {
        let width = std::mem::size_of::<T>() * 8;
        let var_id = self.writer.add_var(
            vcd::VarType::Integer,
            width as u32,
            &reference.to_string(),
            None,
        )?;
        self.add_id_map(reference, var_id, width);
        Ok(())
    }

    fn scoped_name(&self, name: &str) -> String {
        self.scope_stack.join(".") + "." + name
    }

    fn add_id_map(&mut self, name: &str, vcd_id: vcd::IdCode, width: usize) {
        let scoped_name = self.scoped_name(name);
        if self.id_map.contains_key(scoped_name.as_str()) {
            log::warn!(
                "Scoped name {} is was redefined for VCD dumps.",
                scoped_name
            );
        }
        self.id_map.insert(scoped_name, (vcd_id, width));
    }

    pub fn new(dst: path::PathBuf) -> io::Result<Self> {
        let dst_file = fs::File::create(&dst)?;
        log::debug!("VCD file: {}", dst.display());
        Ok(Self {
            is_error_state: false,
            writer: vcd::Writer::new(dst_file),
            scope_stack: vec![],
            id_map: HashMap::new(),
            timestamp: 0,
            last_value_map: HashMap::new(),
        })
    }

    /// A writer dumping to the default file in the temp directory.
    pub fn in_temp_dir() -> io::Result<Self> {
        let mut vcd_path = std::env::temp_dir();
        vcd_path.push(DEFAULT_VCD_FILE);
        Self::new(vcd_path)
    }
}

fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// An object implementing the VcdComponent can declare and initialize values to
/// be traced by a VCD, and record their changes every simulated cycle.
pub trait VcdComponent {
    /// Declare the traced variables inside the component's own scope.
    fn vcd_write_scope(&self, vcd_writer: Rc<RefCell<VcdWriter>>);

    /// Record the values before the simulator has stepped.
    fn vcd_init(&self, vcd_writer: Rc<RefCell<VcdWriter>>);

    /// Record the values after a simulated cycle.
    fn vcd_trace(&self, vcd_writer: Rc<RefCell<VcdWriter>>);
}

impl VcdComponent for Device {
    fn vcd_write_scope(&self, writer: Rc<RefCell<VcdWriter>>) {
        let _scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), &self.id());
        let mut w = writer.borrow_mut();
        w.add_integer_var::<u32>("pc");
        w.add_integer_var::<u8>("stalled");
        w.add_integer_var::<u32>("completed");
        for slot in 0..self.semaphores().capacity() {
            w.add_integer_var::<u32>(&format!("sem_{}", slot));
        }
    }

    fn vcd_init(&self, writer: Rc<RefCell<VcdWriter>>) {
        self.vcd_trace(writer);
    }

    fn vcd_trace(&self, writer: Rc<RefCell<VcdWriter>>) {
        let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), &self.id());
        let mut w = writer.borrow_mut();
        w.change_vector_immediately("pc", self.pc().map_or(0, |pc| pc as u64));
        w.change_vector_immediately("stalled", self.is_stalled() as u64);
        w.change_vector_immediately("completed", self.completed_invocations() as u64);
        for (slot, count) in self.semaphores().slot_counts().enumerate() {
            w.change_vector_immediately(&format!("sem_{}", slot), count);
        }
    }
}
