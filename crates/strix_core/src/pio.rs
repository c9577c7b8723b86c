/*
    Strix
    https://github.com/dbalsom/strix

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    pio.rs

    Port-I/O interface between emulated devices and the hypervisor's
    port-I/O emulation dispatcher.

*/

//! Guest port accesses are trapped by the hypervisor and routed to the
//! device that registered the port range. The dispatcher itself lives
//! outside this crate; devices see it only through [`PioDispatcher`].

use std::sync::Arc;

// The byte read from an unclaimed I/O address.
pub const NO_IO_BYTE: u8 = 0xFF;

/// A contiguous range of I/O ports claimed by a device.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PioRange {
    pub base: u16,
    pub len:  u16,
}

impl PioRange {
    pub fn new(base: u16, len: u16) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && port < self.base + self.len
    }
}

/// A device reachable through guest port I/O.
///
/// Handlers receive the access width as reported by the instruction
/// emulation; devices that only decode byte accesses must reject wider
/// ones rather than truncate. Handlers take `&self` since they may be
/// invoked concurrently from any vCPU; devices serialize internally.
pub trait PioDevice: Send + Sync {
    /// Read from the specified port. `bytes` is the guest access width.
    fn pio_read(&self, port: u16, bytes: usize) -> anyhow::Result<u32>;

    /// Write to the specified port. `bytes` is the guest access width.
    fn pio_write(&self, port: u16, bytes: usize, value: u32) -> anyhow::Result<()>;

    /// Return a list of ports this device responds to, for diagnostics.
    fn port_list(&self) -> Vec<(String, u16)>;
}

/// Registration surface of the hypervisor's port-I/O dispatcher.
pub trait PioDispatcher {
    fn register_pio_handler(&mut self, range: PioRange, device: Arc<dyn PioDevice>) -> anyhow::Result<()>;
}
