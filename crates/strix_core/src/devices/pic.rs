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

    devices::pic.rs

    Implements the virtual 8259 PIC pair (Programmable Interrupt Controller)
    presented to a guest VM: two cascaded chips behind the legacy command/data
    ports plus the ELCR trigger-mode register.

*/

use std::sync::Arc;

use spin::Mutex;
use strum_macros::Display;
use thiserror::Error;

use crate::{
    pio::{PioDevice, PioDispatcher, PioRange, NO_IO_BYTE},
    vm::{VmIntrContext, WireMode},
};

pub const PIC_MASTER_CMD_PORT: u16 = 0x20;
pub const PIC_MASTER_DATA_PORT: u16 = 0x21;
pub const PIC_SLAVE_CMD_PORT: u16 = 0xA0;
pub const PIC_SLAVE_DATA_PORT: u16 = 0xA1;
pub const ELCR_PORT_MASTER: u16 = 0x4D0;
pub const ELCR_PORT_SLAVE: u16 = 0x4D1;

const ICW1_IC4: u8 = 0b0000_0001; // Bit set if ICW4 will be sent (required)
const ICW1_SNGL: u8 = 0b0000_0010; // Bit set for single mode (cascade required)
const ICW1_IS_ICW1: u8 = 0b0001_0000; // Bit determines if a command write is ICW1

const ICW2_BASE_MASK: u8 = 0b1111_1000; // Bit mask for the ICW2 vector base

const ICW4_8086: u8 = 0b0000_0001; // Bit on if 8086/8088 mode (required)
const ICW4_AEOI: u8 = 0b0000_0010; // Bit on if Auto-EOI is enabled
const ICW4_SFNM: u8 = 0b0001_0000; // Bit on if Special Fully-Nested mode

const OCW_IS_OCW3: u8 = 0b0000_1000; // Bit selects OCW3 over OCW2

const OCW2_EOI: u8 = 0b0010_0000;
const OCW2_SL: u8 = 0b0100_0000;
const OCW2_R: u8 = 0b1000_0000;

const OCW3_RIS: u8 = 0b0000_0001;
const OCW3_RR: u8 = 0b0000_0010;
const OCW3_P: u8 = 0b0000_0100;
const OCW3_SMM: u8 = 0b0010_0000;
const OCW3_ESMM: u8 = 0b0100_0000;

// Master pin 2 carries the slave's INT output, never a device.
const CASCADE_PIN: u8 = 2;

// IRQ 0-2 on the master and IRQ 8/13 on the slave are fixed edge triggered;
// ELCR writes cannot set their bits.
const ELCR_MASTER_MASK: u8 = 0xF8;
const ELCR_SLAVE_MASK: u8 = 0xDE;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum PicError {
    #[error("IRQ {0} out of range for the cascaded pair")]
    InvalidIrq(u8),
    #[error("{0}-byte access to PIC port; only byte accesses are supported")]
    InvalidAccessWidth(usize),
    #[error("IRQ {0} is fixed edge triggered and cannot be set to level mode")]
    EdgeOnlyIrq(u8),
    #[error("ICW1 requested single mode; cascade mode is required")]
    CascadeRequired,
    #[error("ICW1 did not request ICW4")]
    Icw4Required,
    #[error("ICW4 did not select 8086 microprocessor mode")]
    MicroprocessorModeRequired,
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

#[derive(Copy, Clone, Debug)]
enum IrqState {
    Assert,
    Deassert,
    Pulse,
}

#[derive(Copy, Clone, Debug)]
enum ReadSelect {
    Isr,
    Irr,
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
enum PicBank {
    Master,
    Slave,
}

impl PicBank {
    #[inline]
    fn from_pin(pin: u8) -> Self {
        if pin < 8 {
            PicBank::Master
        }
        else {
            PicBank::Slave
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            PicBank::Master => 0,
            PicBank::Slave => 1,
        }
    }

    #[inline]
    fn is_master(self) -> bool {
        matches!(self, PicBank::Master)
    }
}

#[derive(Copy, Clone)]
pub struct InterruptStats {
    imr_masked_count: u64,
    serviced_count:   u64,
}

impl InterruptStats {
    pub fn new() -> Self {
        Self {
            imr_masked_count: 0,
            serviced_count:   0,
        }
    }
}

/// One 8259 chip of the cascaded pair.
struct Pic {
    ready: bool,          // ICW sequence completed; chip operates as programmed
    icw_num: u8,          // Position in the ICW sequence; 0 once initialized
    rd_cmd_reg: ReadSelect, // Register returned by a command-port read
    aeoi: bool,           // Auto-EOI mode
    poll: bool,           // One-shot: next read returns the polled pin
    rotate: bool,         // Rotate priority on EOI
    sfn: bool,            // Special fully-nested mode (master only)
    irq_base: u8,         // High 5 bits of the vectors emitted by this chip
    request: u8,          // Interrupt Request Register (IRR)
    service: u8,          // Interrupt Service Register (ISR)
    mask: u8,             // Interrupt Mask Register (IMR)
    smm: bool,            // Special mask mode
    acnt: [i32; 8],       // Per-pin sum of asserts and deasserts
    lowprio: u8,          // Pin currently assigned lowest priority
    intr_raised: bool,    // Latched until an accepted vector is confirmed
    elc: u8,              // Edge/Level Control Register shadow

    stats: [InterruptStats; 8],
}

impl Default for Pic {
    fn default() -> Self {
        Self {
            ready: false,
            icw_num: 0,
            rd_cmd_reg: ReadSelect::Irr,
            aeoi: false,
            poll: false,
            rotate: false,
            sfn: false,
            irq_base: 0,
            request: 0,
            service: 0,
            mask: 0xFF, // All IRQs initially masked
            smm: false,
            acnt: [0; 8],
            lowprio: 7,
            intr_raised: false,
            elc: 0,

            stats: [InterruptStats::new(); 8],
        }
    }
}

impl Pic {
    /// Walk the pins in priority order, from highest priority to lowest.
    fn priority_order(&self) -> impl Iterator<Item = u8> {
        let start = (self.lowprio + 1) & 0x07;
        (0..8u8).map(move |i| (start + i) & 0x07)
    }

    /// Return the highest-priority pin with its ISR bit set, if any.
    fn highest_isr_pin(&self) -> Option<u8> {
        for pin in self.priority_order() {
            let bit = 1u8 << pin;
            if self.service & bit != 0 {
                // An IS bit that is masked by an IMR bit is not cleared by a
                // non-specific EOI in special mask mode.
                if self.smm && self.mask & bit != 0 {
                    continue;
                }
                return Some(pin);
            }
        }
        None
    }

    /// Return the highest-priority pin that is requesting, unmasked, and not
    /// locked out by an equal-or-higher-priority interrupt in service.
    fn highest_irr_pin(&self) -> Option<u8> {
        // In special fully-nested mode an interrupt in service from the
        // slave does not lock the slave out of the master's priority logic.
        let mut serviced = self.service;
        if self.sfn {
            serviced &= !(1u8 << CASCADE_PIN);
        }

        // In special mask mode the ISR has no bearing on which levels can
        // generate interrupts; masking alone decides.
        if self.smm {
            serviced = 0;
        }

        for pin in self.priority_order() {
            let bit = 1u8 << pin;

            // An interrupt in service at the same or higher priority locks
            // out everything behind it.
            if serviced & bit != 0 {
                break;
            }
            if self.request & bit != 0 && self.mask & bit == 0 {
                return Some(pin);
            }
        }
        None
    }

    fn icw1(&mut self, val: u8) -> Result<(), PicError> {
        self.ready = false;
        self.icw_num = 1;
        self.request = 0;
        self.mask = 0;
        self.lowprio = 7;
        self.rd_cmd_reg = ReadSelect::Irr;
        self.poll = false;
        self.smm = false;

        if val & ICW1_SNGL != 0 {
            log::error!("PIC: ICW1 requested single mode; cascade mode is required");
            return Err(PicError::CascadeRequired);
        }
        if val & ICW1_IC4 == 0 {
            log::error!("PIC: ICW1 did not request ICW4");
            return Err(PicError::Icw4Required);
        }

        self.icw_num += 1;
        Ok(())
    }

    fn icw2(&mut self, val: u8) {
        self.irq_base = val & ICW2_BASE_MASK;
        self.icw_num += 1;
    }

    fn icw3(&mut self, _val: u8) {
        // Cascade wiring is fixed (slave on master pin 2, slave ID 2) so the
        // content is irrelevant.
        self.icw_num += 1;
    }

    fn icw4(&mut self, is_master: bool, val: u8) -> Result<(), PicError> {
        if val & ICW4_8086 == 0 {
            log::error!("PIC: ICW4 did not select 8086 microprocessor mode");
            return Err(PicError::MicroprocessorModeRequired);
        }

        if val & ICW4_AEOI != 0 {
            self.aeoi = true;
        }

        if val & ICW4_SFNM != 0 {
            if is_master {
                self.sfn = true;
            }
            else {
                log::debug!("PIC (Slave): ignoring special fully-nested mode: {:02X}", val);
            }
        }

        self.icw_num = 0;
        self.ready = true;
        Ok(())
    }

    fn ocw3(&mut self, val: u8) {
        if val & OCW3_ESMM != 0 {
            self.smm = val & OCW3_SMM != 0;
        }
        if val & OCW3_RR != 0 {
            // Read register command, plus polling mode.
            self.rd_cmd_reg = if val & OCW3_RIS != 0 { ReadSelect::Isr } else { ReadSelect::Irr };
            self.poll = val & OCW3_P != 0;
        }
    }

    /// The CPU-injection layer confirmed delivery of a vector from this chip.
    fn pin_accepted(&mut self, pin: u8) {
        self.intr_raised = false;

        if self.elc & (1u8 << pin) == 0 {
            // Edge triggered; the request latch clears on accept. A level
            // triggered pin stays requested until the device deasserts.
            self.request &= !(1u8 << pin);
        }

        if self.aeoi {
            if self.rotate {
                self.lowprio = pin;
            }
        }
        else {
            self.service |= 1u8 << pin;
        }

        self.stats[pin as usize].serviced_count += 1;
    }
}

/// Register state of both chips; lives behind the controller lock. Every
/// method here runs with the lock held, so none of them may re-enter the
/// public API.
struct VPicState {
    pics: [Pic; 2],
}

impl Default for VPicState {
    fn default() -> Self {
        Self {
            pics: [Pic::default(), Pic::default()],
        }
    }
}

impl VPicState {
    #[inline]
    fn pic(&self, bank: PicBank) -> &Pic {
        &self.pics[bank.index()]
    }

    #[inline]
    fn pic_mut(&mut self, bank: PicBank) -> &mut Pic {
        &mut self.pics[bank.index()]
    }

    /// Apply an assert or deassert to one of the 16 pins and re-run the
    /// notification path. Pin 2 transitions arrive only from the cascade.
    fn set_pinstate(&mut self, vm: &dyn VmIntrContext, pin: u8, asserted: bool) {
        let bank = PicBank::from_pin(pin);
        let local = (pin & 0x07) as usize;
        let pic = self.pic_mut(bank);

        let oldcnt = pic.acnt[local];
        pic.acnt[local] += if asserted { 1 } else { -1 };
        let newcnt = pic.acnt[local];

        if newcnt < 0 {
            log::warn!("PIC ({}): pin {} bad assertion count {}", bank, local, newcnt);
        }

        let bit = 1u8 << local;
        let level = pic.elc & bit != 0;

        if (oldcnt == 0 && newcnt == 1) || (newcnt > 0 && level) {
            // Rising edge, or still-asserted level.
            log::trace!("PIC ({}): pin {} asserted", bank, local);
            pic.request |= bit;
            if pic.mask & bit != 0 {
                pic.stats[local].imr_masked_count += 1;
            }
        }
        else if oldcnt == 1 && newcnt == 0 {
            // Falling edge. An edge pin's request latch survives until the
            // vector is accepted.
            log::trace!("PIC ({}): pin {} deasserted", bank, local);
            if level {
                pic.request &= !bit;
            }
        }
        else {
            log::trace!(
                "PIC ({}): pin {} {}, ignored, acnt {}",
                bank,
                local,
                if asserted { "asserted" } else { "deasserted" },
                newcnt
            );
        }

        self.notify_intr(vm);
    }

    /// Poke the delivery layer if either chip has a newly eligible request.
    /// Idempotent while `intr_raised` stays latched; recursion through the
    /// cascade pulse terminates because the latch is set before pulsing.
    fn notify_intr(&mut self, vm: &dyn VmIntrContext) {
        // The slave first: an eligible request cascades onto master pin 2.
        let slave = self.pic(PicBank::Slave);
        if !slave.intr_raised {
            if let Some(pin) = slave.highest_irr_pin() {
                log::debug!(
                    "PIC (Slave): notify pin {} (imr {:02X} irr {:02X} isr {:02X})",
                    pin,
                    slave.mask,
                    slave.request,
                    slave.service
                );
                self.pic_mut(PicBank::Slave).intr_raised = true;
                self.set_pinstate(vm, CASCADE_PIN, true);
                self.set_pinstate(vm, CASCADE_PIN, false);
            }
        }

        let master = self.pic(PicBank::Master);
        if !master.intr_raised {
            if let Some(pin) = master.highest_irr_pin() {
                log::debug!(
                    "PIC (Master): notify pin {} (imr {:02X} irr {:02X} isr {:02X})",
                    pin,
                    master.mask,
                    master.request,
                    master.service
                );
                self.pic_mut(PicBank::Master).intr_raised = true;
                match vm.wire_mode() {
                    WireMode::Intr => {
                        // Legacy PIC mode: LINT0 acts as INTR, the interrupt
                        // goes straight into vCPU 0.
                        vm.inject_extint();
                    }
                    WireMode::VirtualWire => {
                        // Virtual wire delivers through LINT0 on the LAPIC;
                        // the master's output is also connected to I/O APIC
                        // input 0 for the virtual-wire-via-I/O-APIC setup.
                        vm.set_lint0();
                        vm.pulse_ioapic_pin(0);
                    }
                }
            }
        }
    }

    /// OCW1 sets the interrupt mask. Pins transitioning masked -> unmasked
    /// may belong to passthrough devices whose routing must be
    /// (re)established.
    fn ocw1(&mut self, vm: &dyn VmIntrContext, bank: PicBank, val: u8) {
        log::debug!("PIC ({}): ocw1 {:02X}", bank, val);

        let pic = self.pic_mut(bank);
        let old = pic.mask;
        pic.mask = val;

        for pin in pic.priority_order() {
            let bit = 1u8 << pin;
            if pic.mask & bit == 0 && old & bit != 0 {
                // The cascade line has no device behind it.
                if bank.is_master() && pin == CASCADE_PIN {
                    continue;
                }
                let virt_pin = if bank.is_master() { pin } else { pin + 8 };
                vm.remap_passthrough_pin(virt_pin);
            }
        }
    }

    fn ocw2(&mut self, vm: &dyn VmIntrContext, bank: PicBank, val: u8) {
        log::debug!("PIC ({}): ocw2 {:02X}", bank, val);

        let pic = self.pic_mut(bank);
        pic.rotate = val & OCW2_R != 0;

        if val & OCW2_EOI != 0 {
            let isr_pin = if val & OCW2_SL != 0 {
                // Specific EOI.
                Some(val & 0x07)
            }
            else {
                // Non-specific EOI: the highest priority in-service pin.
                pic.highest_isr_pin()
            };

            if let Some(pin) = isr_pin {
                pic.service &= !(1u8 << pin);
                if pic.rotate {
                    pic.lowprio = pin;
                }

                // A level-triggered pin's EOI is forwarded to the
                // passthrough remap layer.
                if pic.elc & (1u8 << pin) != 0 {
                    let virt_pin = if bank.is_master() { pin } else { pin + 8 };
                    vm.ack_passthrough_pin(virt_pin);
                }
            }
        }
        else if val & OCW2_SL != 0 && pic.rotate {
            // Set-priority command.
            pic.lowprio = val & 0x07;
        }
    }

    /// Decode a guest write to a command or data port of one chip.
    fn write(&mut self, vm: &dyn VmIntrContext, bank: PicBank, port: u16, val: u8) -> Result<(), PicError> {
        let result = if port & 0x01 != 0 {
            // Data port: ICW2..ICW4 while an init sequence is in progress,
            // OCW1 otherwise.
            match self.pic(bank).icw_num {
                2 => {
                    log::debug!("PIC ({}): icw2 {:02X}", bank, val);
                    self.pic_mut(bank).icw2(val);
                    Ok(())
                }
                3 => {
                    log::debug!("PIC ({}): ignoring icw3 {:02X}", bank, val);
                    self.pic_mut(bank).icw3(val);
                    Ok(())
                }
                4 => {
                    log::debug!("PIC ({}): icw4 {:02X}", bank, val);
                    self.pic_mut(bank).icw4(bank.is_master(), val)
                }
                _ => {
                    self.ocw1(vm, bank, val);
                    Ok(())
                }
            }
        }
        else {
            // Command port: ICW1 restarts initialization at any time; OCW2
            // and OCW3 are only decoded once the chip is programmed.
            let mut result = Ok(());
            if val & ICW1_IS_ICW1 != 0 {
                log::debug!("PIC ({}): icw1 {:02X}", bank, val);
                result = self.pic_mut(bank).icw1(val);
            }

            if self.pic(bank).ready {
                if val & OCW_IS_OCW3 != 0 {
                    log::debug!("PIC ({}): ocw3 {:02X}", bank, val);
                    self.pic_mut(bank).ocw3(val);
                }
                else {
                    self.ocw2(vm, bank, val);
                }
            }
            result
        };

        if self.pic(bank).ready {
            self.notify_intr(vm);
        }

        result
    }

    /// Decode a guest read from a command or data port of one chip.
    fn read(&mut self, bank: PicBank, port: u16) -> u8 {
        let pic = self.pic_mut(bank);

        if pic.poll {
            // One-shot poll: acknowledge the highest pending pin and return
            // it with bit 7 set, or 0 if nothing is pending.
            pic.poll = false;
            match pic.highest_irr_pin() {
                Some(pin) => {
                    pic.pin_accepted(pin);
                    0x80 | pin
                }
                None => 0,
            }
        }
        else if port & 0x01 != 0 {
            pic.mask
        }
        else {
            match pic.rd_cmd_reg {
                ReadSelect::Isr => pic.service,
                ReadSelect::Irr => pic.request,
            }
        }
    }

    fn elc_read(&self, port: u16) -> u8 {
        if port == ELCR_PORT_MASTER {
            self.pics[0].elc
        }
        else {
            self.pics[1].elc
        }
    }

    fn elc_write(&mut self, port: u16, val: u8) {
        // The cascade channel (IRQ2), timer (IRQ0) and keyboard (IRQ1) on
        // the master, and the RTC (IRQ8) and FPU error (IRQ13) on the
        // slave, cannot be programmed for level mode.
        if port == ELCR_PORT_MASTER {
            self.pics[0].elc = val & ELCR_MASTER_MASK;
        }
        else {
            self.pics[1].elc = val & ELCR_SLAVE_MASK;
        }
    }
}

#[derive(Clone, Default)]
pub struct PicStringState {
    pub ready: String,
    pub imr: String,
    pub isr: String,
    pub irr: String,
    pub elc: String,
    pub irq_base: String,
    pub lowprio: String,
    pub autoeoi: String,
    pub smm: String,
    pub sfn: String,
    pub intr_raised: String,
    pub interrupt_stats: Vec<(String, String)>,
}

/// The virtual PIC pair owned by a VM.
///
/// All public entry points are callable from any vCPU or device-emulation
/// context; a single spinlock serializes both chips. The VM context handle
/// is non-owning with respect to the VM itself (the VM owns this
/// controller; the context is a sibling object).
pub struct VPic {
    vm:    Arc<dyn VmIntrContext>,
    state: Mutex<VPicState>,
}

impl VPic {
    pub fn new(vm: Arc<dyn VmIntrContext>) -> Self {
        Self {
            vm,
            state: Mutex::new(VPicState::default()),
        }
    }

    /// Return the controller to its power-on state, for VM reboot.
    pub fn reset(&self) {
        *self.state.lock() = VPicState::default();
    }

    fn set_irqstate(&self, irq: u8, irqstate: IrqState) -> Result<(), PicError> {
        if irq > 15 {
            return Err(PicError::InvalidIrq(irq));
        }

        let mut state = self.state.lock();

        // Assertions against an unprogrammed chip succeed silently.
        if !state.pic(PicBank::from_pin(irq)).ready {
            return Ok(());
        }

        match irqstate {
            IrqState::Assert => state.set_pinstate(&*self.vm, irq, true),
            IrqState::Deassert => state.set_pinstate(&*self.vm, irq, false),
            IrqState::Pulse => {
                state.set_pinstate(&*self.vm, irq, true);
                state.set_pinstate(&*self.vm, irq, false);
            }
        }
        Ok(())
    }

    /// Called by a device to raise an IRQ line.
    pub fn assert_irq(&self, irq: u8) -> Result<(), PicError> {
        self.set_irqstate(irq, IrqState::Assert)
    }

    /// Called by a device to withdraw an IRQ line.
    pub fn deassert_irq(&self, irq: u8) -> Result<(), PicError> {
        self.set_irqstate(irq, IrqState::Deassert)
    }

    /// Called by a device that pulses its IRQ line to request service.
    pub fn pulse_irq(&self, irq: u8) -> Result<(), PicError> {
        self.set_irqstate(irq, IrqState::Pulse)
    }

    pub fn set_irq_trigger(&self, irq: u8, trigger: TriggerMode) -> Result<(), PicError> {
        if irq > 15 {
            return Err(PicError::InvalidIrq(irq));
        }

        // See elc_write for the pins that must stay edge triggered.
        if trigger == TriggerMode::Level && matches!(irq, 0 | 1 | 2 | 8 | 13) {
            return Err(PicError::EdgeOnlyIrq(irq));
        }

        let mut state = self.state.lock();
        let bit = 1u8 << (irq & 0x07);
        let pic = state.pic_mut(PicBank::from_pin(irq));

        match trigger {
            TriggerMode::Level => pic.elc |= bit,
            TriggerMode::Edge => pic.elc &= !bit,
        }
        Ok(())
    }

    pub fn get_irq_trigger(&self, irq: u8) -> Result<TriggerMode, PicError> {
        if irq > 15 {
            return Err(PicError::InvalidIrq(irq));
        }

        let state = self.state.lock();
        if state.pic(PicBank::from_pin(irq)).elc & (1u8 << (irq & 0x07)) != 0 {
            Ok(TriggerMode::Level)
        }
        else {
            Ok(TriggerMode::Edge)
        }
    }

    /// Whether a virtual pin is currently masked. Out-of-range pins report
    /// masked.
    pub fn is_pin_masked(&self, virt_pin: u8) -> bool {
        if virt_pin > 15 {
            return true;
        }

        let state = self.state.lock();
        state.pic(PicBank::from_pin(virt_pin)).mask & (1u8 << (virt_pin & 0x07)) != 0
    }

    /// Highest-priority pending vector, if any. A cascade request on master
    /// pin 2 resolves through the slave.
    pub fn pending_intr(&self) -> Option<u8> {
        let state = self.state.lock();

        let mut pic = state.pic(PicBank::Master);
        let mut pin = pic.highest_irr_pin()?;
        if pin == CASCADE_PIN {
            pic = state.pic(PicBank::Slave);
            pin = pic.highest_irr_pin()?;
        }

        let vector = pic.irq_base + pin;
        log::debug!("PIC: pending vector {:02X}", vector);
        Some(vector)
    }

    /// The CPU-injection layer confirmed delivery of `vector`; update the
    /// originating chip (and the master's cascade pin for slave vectors)
    /// and re-arm notification for the next pending interrupt.
    pub fn intr_accepted(&self, vector: u8) {
        let mut state = self.state.lock();
        let pin = vector & 0x07;

        if vector & !0x07 == state.pic(PicBank::Slave).irq_base {
            state.pic_mut(PicBank::Slave).pin_accepted(pin);
            // A slave vector was delivered through master pin 2; accept the
            // cascaded request too.
            state.pic_mut(PicBank::Master).pin_accepted(CASCADE_PIN);
        }
        else {
            state.pic_mut(PicBank::Master).pin_accepted(pin);
        }

        state.notify_intr(&*self.vm);
    }

    fn chip_string_state(pic: &Pic) -> PicStringState {
        PicStringState {
            ready: format!("{}", pic.ready),
            imr: format!("{:08b}", pic.mask),
            isr: format!("{:08b}", pic.service),
            irr: format!("{:08b}", pic.request),
            elc: format!("{:08b}", pic.elc),
            irq_base: format!("{:02X}", pic.irq_base),
            lowprio: format!("{}", pic.lowprio),
            autoeoi: format!("{:?}", pic.aeoi),
            smm: format!("{:?}", pic.smm),
            sfn: format!("{:?}", pic.sfn),
            intr_raised: format!("{}", pic.intr_raised),
            interrupt_stats: pic
                .stats
                .iter()
                .map(|s| (format!("{}", s.imr_masked_count), format!("{}", s.serviced_count)))
                .collect(),
        }
    }

    pub fn get_string_state(&self) -> [PicStringState; 2] {
        let state = self.state.lock();
        [
            VPic::chip_string_state(state.pic(PicBank::Master)),
            VPic::chip_string_state(state.pic(PicBank::Slave)),
        ]
    }
}

impl PioDevice for VPic {
    fn pio_read(&self, port: u16, bytes: usize) -> anyhow::Result<u32> {
        if bytes != 1 {
            return Err(PicError::InvalidAccessWidth(bytes).into());
        }

        let mut state = self.state.lock();
        let val = match port {
            PIC_MASTER_CMD_PORT | PIC_MASTER_DATA_PORT => state.read(PicBank::Master, port),
            PIC_SLAVE_CMD_PORT | PIC_SLAVE_DATA_PORT => state.read(PicBank::Slave, port),
            ELCR_PORT_MASTER | ELCR_PORT_SLAVE => state.elc_read(port),
            _ => {
                log::warn!("PIC: read from unhandled port {:04X}", port);
                NO_IO_BYTE
            }
        };
        Ok(val as u32)
    }

    fn pio_write(&self, port: u16, bytes: usize, value: u32) -> anyhow::Result<()> {
        if bytes != 1 {
            return Err(PicError::InvalidAccessWidth(bytes).into());
        }

        let val = value as u8;
        let mut state = self.state.lock();
        match port {
            PIC_MASTER_CMD_PORT | PIC_MASTER_DATA_PORT => state.write(&*self.vm, PicBank::Master, port, val)?,
            PIC_SLAVE_CMD_PORT | PIC_SLAVE_DATA_PORT => state.write(&*self.vm, PicBank::Slave, port, val)?,
            ELCR_PORT_MASTER | ELCR_PORT_SLAVE => state.elc_write(port, val),
            _ => {
                log::warn!("PIC: write to unhandled port {:04X}", port);
            }
        }
        Ok(())
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("PIC Master Command Port"), PIC_MASTER_CMD_PORT),
            (String::from("PIC Master Data Port"), PIC_MASTER_DATA_PORT),
            (String::from("PIC Slave Command Port"), PIC_SLAVE_CMD_PORT),
            (String::from("PIC Slave Data Port"), PIC_SLAVE_DATA_PORT),
            (String::from("ELCR Master"), ELCR_PORT_MASTER),
            (String::from("ELCR Slave"), ELCR_PORT_SLAVE),
        ]
    }
}

/// Claim the controller's three I/O windows with the hypervisor's port-I/O
/// dispatcher.
pub fn register_io_handlers(dispatcher: &mut dyn PioDispatcher, vpic: &Arc<VPic>) -> anyhow::Result<()> {
    dispatcher.register_pio_handler(PioRange::new(PIC_MASTER_CMD_PORT, 2), vpic.clone())?;
    dispatcher.register_pio_handler(PioRange::new(PIC_SLAVE_CMD_PORT, 2), vpic.clone())?;
    dispatcher.register_pio_handler(PioRange::new(ELCR_PORT_MASTER, 2), vpic.clone())?;
    Ok(())
}
