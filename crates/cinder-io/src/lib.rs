//! I/O port dispatch fabric.
//!
//! A 64 Ki port space with at most one handler per port. 16- and 32-bit
//! accesses decompose into consecutive 8-bit accesses unless the handler
//! overrides them; every access updates last-access tracking on both the
//! bus and the selected handler and consults the port breakpoint set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("no handler for I/O port {port:#06x}")]
    UnhandledPort { port: u16 },
}

/// Direction of a port access, as seen by breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortAccess {
    Read,
    Write,
}

/// A device-side port handler.
///
/// Only the byte operations are mandatory; the wider widths default to the
/// little-endian composition of consecutive byte accesses, which a device
/// overrides when it needs atomic word/dword semantics.
pub trait PortHandler {
    fn read8(&mut self, port: u16) -> u8;
    fn write8(&mut self, port: u16, value: u8);

    fn read16(&mut self, port: u16) -> u16 {
        let lo = self.read8(port) as u16;
        self.update_last_port_read(port.wrapping_add(1));
        let hi = self.read8(port.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn read32(&mut self, port: u16) -> u32 {
        let lo = self.read16(port) as u32;
        self.update_last_port_read(port.wrapping_add(2));
        let hi = self.read16(port.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn write16(&mut self, port: u16, value: u16) {
        self.write8(port, value as u8);
        self.update_last_port_written(port.wrapping_add(1), (value >> 8) as u32);
        self.write8(port.wrapping_add(1), (value >> 8) as u8);
    }

    fn write32(&mut self, port: u16, value: u32) {
        self.write16(port, value as u16);
        self.update_last_port_written(port.wrapping_add(2), value >> 16);
        self.write16(port.wrapping_add(2), (value >> 16) as u16);
    }

    /// Last-access bookkeeping, mirrored from the bus onto the handler so a
    /// device (or a test) can observe what it was asked for.
    fn update_last_port_read(&mut self, _port: u16) {}
    fn update_last_port_written(&mut self, _port: u16, _value: u32) {}
}

pub type SharedPortHandler = Rc<RefCell<dyn PortHandler>>;

type BreakpointCallback = Rc<dyn Fn(u16, PortAccess)>;

/// Read/write watchpoints keyed by port number. Matching never suppresses
/// the access; the callback simply observes it. The `enabled` toggle is an
/// atomic so a UI thread can flip it without synchronising with the
/// emulation thread.
#[derive(Default)]
pub struct PortBreakpoints {
    read: HashMap<u16, Vec<BreakpointCallback>>,
    write: HashMap<u16, Vec<BreakpointCallback>>,
    enabled: Arc<AtomicBool>,
}

impl PortBreakpoints {
    pub fn new() -> Self {
        Self {
            read: HashMap::new(),
            write: HashMap::new(),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn add(&mut self, port: u16, access: PortAccess, callback: BreakpointCallback) {
        let map = match access {
            PortAccess::Read => &mut self.read,
            PortAccess::Write => &mut self.write,
        };
        map.entry(port).or_default().push(callback);
    }

    pub fn remove_all(&mut self, port: u16, access: PortAccess) {
        let map = match access {
            PortAccess::Read => &mut self.read,
            PortAccess::Write => &mut self.write,
        };
        map.remove(&port);
    }

    fn fire(&self, port: u16, access: PortAccess) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let map = match access {
            PortAccess::Read => &self.read,
            PortAccess::Write => &self.write,
        };
        if let Some(callbacks) = map.get(&port) {
            for callback in callbacks {
                callback(port, access);
            }
        }
    }
}

/// The port-number → handler registry and dispatcher.
pub struct IoPortBus {
    handlers: HashMap<u16, SharedPortHandler>,
    breakpoints: PortBreakpoints,
    fail_on_unhandled_port: bool,
    last_port_read: Option<u16>,
    last_port_written: Option<u16>,
    last_port_written_value: Option<u32>,
}

impl IoPortBus {
    pub fn new(fail_on_unhandled_port: bool) -> Self {
        Self {
            handlers: HashMap::new(),
            breakpoints: PortBreakpoints::new(),
            fail_on_unhandled_port,
            last_port_read: None,
            last_port_written: None,
            last_port_written_value: None,
        }
    }

    pub fn set_fail_on_unhandled_port(&mut self, fail: bool) {
        self.fail_on_unhandled_port = fail;
    }

    pub fn register(&mut self, port: u16, handler: SharedPortHandler) {
        self.handlers.insert(port, handler);
    }

    pub fn unregister(&mut self, port: u16) -> Option<SharedPortHandler> {
        self.handlers.remove(&port)
    }

    pub fn handler(&self, port: u16) -> Option<&SharedPortHandler> {
        self.handlers.get(&port)
    }

    pub fn breakpoints_mut(&mut self) -> &mut PortBreakpoints {
        &mut self.breakpoints
    }

    pub fn last_port_read(&self) -> Option<u16> {
        self.last_port_read
    }

    pub fn last_port_written(&self) -> Option<u16> {
        self.last_port_written
    }

    pub fn last_port_written_value(&self) -> Option<u32> {
        self.last_port_written_value
    }

    fn update_last_read(&mut self, port: u16) {
        self.last_port_read = Some(port);
        self.breakpoints.fire(port, PortAccess::Read);
    }

    fn update_last_written(&mut self, port: u16, value: u32) {
        self.last_port_written = Some(port);
        self.last_port_written_value = Some(value);
        self.breakpoints.fire(port, PortAccess::Write);
    }

    fn unhandled_read(&mut self, port: u16, width: u32) -> Result<u32, IoError> {
        if self.fail_on_unhandled_port {
            return Err(IoError::UnhandledPort { port });
        }
        tracing::debug!("unhandled {width}-bit read from port {port:#06x}");
        Ok(match width {
            8 => 0xFF,
            16 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        })
    }

    fn unhandled_write(&mut self, port: u16, width: u32, value: u32) -> Result<(), IoError> {
        if self.fail_on_unhandled_port {
            return Err(IoError::UnhandledPort { port });
        }
        tracing::debug!("unhandled {width}-bit write of {value:#x} to port {port:#06x}");
        Ok(())
    }

    pub fn read8(&mut self, port: u16) -> Result<u8, IoError> {
        self.update_last_read(port);
        match self.handlers.get(&port).cloned() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                handler.update_last_port_read(port);
                Ok(handler.read8(port))
            }
            None => Ok(self.unhandled_read(port, 8)? as u8),
        }
    }

    pub fn read16(&mut self, port: u16) -> Result<u16, IoError> {
        self.update_last_read(port);
        match self.handlers.get(&port).cloned() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                handler.update_last_port_read(port);
                Ok(handler.read16(port))
            }
            None => Ok(self.unhandled_read(port, 16)? as u16),
        }
    }

    pub fn read32(&mut self, port: u16) -> Result<u32, IoError> {
        self.update_last_read(port);
        match self.handlers.get(&port).cloned() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                handler.update_last_port_read(port);
                Ok(handler.read32(port))
            }
            None => self.unhandled_read(port, 32),
        }
    }

    pub fn write8(&mut self, port: u16, value: u8) -> Result<(), IoError> {
        self.update_last_written(port, value as u32);
        match self.handlers.get(&port).cloned() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                handler.update_last_port_written(port, value as u32);
                handler.write8(port, value);
                Ok(())
            }
            None => self.unhandled_write(port, 8, value as u32),
        }
    }

    pub fn write16(&mut self, port: u16, value: u16) -> Result<(), IoError> {
        self.update_last_written(port, value as u32);
        match self.handlers.get(&port).cloned() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                handler.update_last_port_written(port, value as u32);
                handler.write16(port, value);
                Ok(())
            }
            None => self.unhandled_write(port, 16, value as u32),
        }
    }

    pub fn write32(&mut self, port: u16, value: u32) -> Result<(), IoError> {
        self.update_last_written(port, value);
        match self.handlers.get(&port).cloned() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                handler.update_last_port_written(port, value);
                handler.write32(port, value);
                Ok(())
            }
            None => self.unhandled_write(port, 32, value),
        }
    }
}

pub type ReadDelegate = Rc<dyn Fn(u16) -> u8>;
pub type WriteDelegate = Rc<dyn Fn(u16, u8)>;

/// Handler created by the delegate-registration layer: byte-granularity
/// closures, wider accesses via the default composition rules.
pub struct DelegatePortHandler {
    read: Option<ReadDelegate>,
    write: Option<WriteDelegate>,
    last_port_read: Option<u16>,
    last_port_written: Option<(u16, u32)>,
}

impl DelegatePortHandler {
    pub fn new(read: Option<ReadDelegate>, write: Option<WriteDelegate>) -> Self {
        Self {
            read,
            write,
            last_port_read: None,
            last_port_written: None,
        }
    }

    pub fn last_port_read(&self) -> Option<u16> {
        self.last_port_read
    }

    pub fn last_port_written(&self) -> Option<(u16, u32)> {
        self.last_port_written
    }
}

impl PortHandler for DelegatePortHandler {
    fn read8(&mut self, port: u16) -> u8 {
        match &self.read {
            Some(read) => read(port),
            None => 0xFF,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        if let Some(write) = &self.write {
            write(port, value);
        }
    }

    fn update_last_port_read(&mut self, port: u16) {
        self.last_port_read = Some(port);
    }

    fn update_last_port_written(&mut self, port: u16, value: u32) {
        self.last_port_written = Some((port, value));
    }
}

/// Install byte delegates over a contiguous port range.
///
/// The range must be non-empty; it is clipped to the 16-bit port space. One
/// handler object is created per port so unregistration stays per-port.
pub fn register_delegates(
    bus: &mut IoPortBus,
    start: u16,
    len: u32,
    read: Option<ReadDelegate>,
    write: Option<WriteDelegate>,
) -> Result<(), RangeError> {
    if len == 0 {
        return Err(RangeError::EmptyRange);
    }
    let end = (start as u32).saturating_add(len).min(0x1_0000);
    for port in start as u32..end {
        let handler = DelegatePortHandler::new(read.clone(), write.clone());
        bus.register(port as u16, Rc::new(RefCell::new(handler)));
    }
    Ok(())
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("delegate registration over an empty port range")]
    EmptyRange,
}
