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

    vm.rs

    VM-side context seen by the interrupt controller: downstream delivery
    targets and the passthrough-device remap layer.

*/

use strum_macros::Display;

/// How PIC interrupts reach the guest's CPU, per the MPtable spec's three
/// interrupt modes. `Intr` covers Legacy PIC Mode (LINT0 reconfigured as
/// INTR); `VirtualWire` covers both virtual-wire variants, delivering via
/// LINT0 on the local APIC and I/O APIC input 0.
#[derive(Copy, Clone, Debug, Display, PartialEq)]
pub enum WireMode {
    Intr,
    VirtualWire,
}

/// Interrupt-delivery and passthrough hooks supplied by the owning VM.
///
/// The VM owns its interrupt controller; the controller holds a non-owning
/// `Arc` to this sibling context object. Implementations must not block:
/// every method here is called with the controller's lock held.
pub trait VmIntrContext: Send + Sync {
    /// The VM's configured wire mode.
    fn wire_mode(&self) -> WireMode;

    /// Inject an external interrupt into vCPU 0.
    fn inject_extint(&self);

    /// Set the LINT0 local interrupt on the virtual LAPIC (broadcast).
    fn set_lint0(&self);

    /// Pulse an input pin on the virtual I/O APIC.
    fn pulse_ioapic_pin(&self, pin: u8);

    /// A passthrough device's virtual pin transitioned masked -> unmasked;
    /// the remap layer should (re)establish its interrupt routing.
    fn remap_passthrough_pin(&self, virt_pin: u8);

    /// Level-triggered EOI for a passthrough device's virtual pin.
    fn ack_passthrough_pin(&self, virt_pin: u8);
}
