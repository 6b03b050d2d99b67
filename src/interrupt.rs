//! Interrupt and exception dispatch through the IVT or IDT.

use tracing::debug;

use crate::cpu::{Cpu, Trap};
use crate::descriptor::{DescriptorKind, Selector};
use crate::exception::{idt_error_code, CpuException, Vector};
use crate::memory::Bus;
use crate::regs::{CpuMode, Flags, OpSize, SegReg, ESP};
use crate::tss::TaskSwitch;

/// Origin of an event. Software interrupts are subject to the gate DPL check
/// (and IOPL in V86 mode); exceptions and external interrupts are not, and
/// set the EXT bit of any error code raised while delivering them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// INT n.
    Software,
    /// INT3, INTO.
    SoftwareTrap,
    Exception,
    /// Hardware interrupt line, or INT1 (ICEBP).
    External,
}

impl EventKind {
    fn is_software(self) -> bool {
        matches!(self, EventKind::Software | EventKind::SoftwareTrap)
    }

    fn is_external(self) -> bool {
        matches!(self, EventKind::Exception | EventKind::External)
    }
}

impl Cpu {
    /// Enters the handler for `vector`. EIP must already hold the return
    /// address (the faulting instruction for faults, the next one otherwise).
    pub(crate) fn dispatch_interrupt<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        error_code: Option<u16>,
        kind: EventKind,
    ) -> Result<(), Trap> {
        match self.regs.mode() {
            CpuMode::Real => self.real_mode_interrupt(bus, vector),
            _ => self.protected_mode_interrupt(bus, vector, error_code, kind),
        }
    }

    fn real_mode_interrupt<B: Bus + ?Sized>(&mut self, bus: &mut B, vector: u8) -> Result<(), Trap> {
        let offset = vector as u32 * 4;
        if offset + 3 > self.regs.idtr.limit as u32 {
            return Err(CpuException::gp(idt_error_code(vector, false)).into());
        }
        let addr = self.regs.idtr.base.wrapping_add(offset);
        let ip = self.read_system_u16(bus, addr)?;
        let cs = self.read_system_u16(bus, addr.wrapping_add(2))?;
        let flags = self.regs.eflags.bits();
        let ret_cs = self.regs.seg(SegReg::Cs).selector();
        let ret_ip = self.regs.eip as u16;
        self.push16(bus, flags as u16)?;
        self.push16(bus, ret_cs)?;
        self.push16(bus, ret_ip)?;
        self.regs.eflags.remove(Flags::IF | Flags::TF | Flags::AC);
        self.regs.seg_mut(SegReg::Cs).load_real_mode(cs);
        self.regs.eip = ip as u32;
        Ok(())
    }

    fn protected_mode_interrupt<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        error_code: Option<u16>,
        kind: EventKind,
    ) -> Result<(), Trap> {
        let ext = kind.is_external();
        let idt_fault = CpuException::gp(idt_error_code(vector, ext));
        let gate = self.get_gate(bus, vector)?.ok_or(idt_fault)?;
        let (target, offset, is32, trap_gate) = match gate.kind {
            DescriptorKind::InterruptGate {
                selector,
                offset,
                is32,
            } => (selector, offset, is32, false),
            DescriptorKind::TrapGate {
                selector,
                offset,
                is32,
            } => (selector, offset, is32, true),
            DescriptorKind::TaskGate { .. } => (0, 0, false, false),
            _ => return Err(idt_fault.into()),
        };
        let cpl = self.regs.cpl();
        if kind.is_software() {
            if self.regs.eflags.contains(Flags::VM) && self.regs.eflags.iopl() < 3 {
                return Err(CpuException::gp0().into());
            }
            if gate.dpl < cpl {
                return Err(idt_fault.into());
            }
        }
        if !gate.present {
            return Err(CpuException::np(idt_error_code(vector, ext)).into());
        }

        if let DescriptorKind::TaskGate { selector } = gate.kind {
            return self.interrupt_task(bus, Selector(selector), error_code, ext);
        }

        let target = Selector(target);
        let sel_fault = |vector: Vector, s: Selector| CpuException::for_selector(vector, s.0, ext);
        if target.is_null() {
            return Err(CpuException::gp(ext as u16).into());
        }
        let code = self
            .get_descriptor(bus, target)?
            .ok_or(sel_fault(Vector::GeneralProtection, target))?;
        if !code.is_code() || code.dpl > cpl {
            return Err(sel_fault(Vector::GeneralProtection, target).into());
        }
        if !code.present {
            return Err(sel_fault(Vector::SegmentNotPresent, target).into());
        }

        let size = OpSize::from_32(is32);
        let from_v86 = self.regs.eflags.contains(Flags::VM);
        let old_flags = self.regs.eflags;
        let ret_cs = self.regs.seg(SegReg::Cs).selector() as u32;
        let ret_eip = self.regs.eip;

        if !code.is_conforming_code() && code.dpl < cpl {
            if from_v86 && code.dpl != 0 {
                return Err(sel_fault(Vector::GeneralProtection, target).into());
            }
            let dpl = code.dpl;
            let (ss, esp) = self.tss_stack(bus, dpl)?;
            let ss = Selector(ss);
            let ss_desc = self
                .check_stack_segment(bus, ss, dpl, Vector::InvalidTss)
                .map_err(|t| match t {
                    Trap::Exception(e) => Trap::Exception(e.with_external(ext)),
                    t => t,
                })?;
            if code.limit < offset {
                return Err(CpuException::gp(ext as u16).into());
            }
            let old_ss = self.regs.seg(SegReg::Ss).selector() as u32;
            let old_esp = self.regs.gpr[ESP];
            debug!(vector, from = cpl, to = dpl, "interrupt stack switch");

            self.load_code_segment(bus, target, &code, dpl)?;
            self.regs.eflags.remove(Flags::VM);
            self.mark_accessed(bus, ss)?;
            self.regs.seg_mut(SegReg::Ss).load_protected_mode(ss.0, &ss_desc);
            self.regs.gpr[ESP] = esp;
            if from_v86 {
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    let sel = self.regs.seg(seg).selector() as u32;
                    self.push(bus, sel, size)?;
                }
            }
            self.push(bus, old_ss, size)?;
            self.push(bus, old_esp, size)?;
            if from_v86 {
                for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                    self.regs.seg_mut(seg).load_null(0);
                }
            }
        } else {
            if from_v86 {
                return Err(sel_fault(Vector::GeneralProtection, target).into());
            }
            if code.limit < offset {
                return Err(CpuException::gp(ext as u16).into());
            }
            self.load_code_segment(bus, target, &code, cpl)?;
        }

        self.push(bus, old_flags.bits(), size)?;
        self.push(bus, ret_cs, size)?;
        self.push(bus, ret_eip, size)?;
        if let Some(code) = error_code {
            self.push(bus, code as u32, size)?;
        }
        self.regs.eflags.remove(Flags::TF | Flags::NT | Flags::VM | Flags::RF);
        if !trap_gate {
            self.regs.eflags.remove(Flags::IF);
        }
        self.regs.eip = offset;
        Ok(())
    }

    fn interrupt_task<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        tss_sel: Selector,
        error_code: Option<u16>,
        ext: bool,
    ) -> Result<(), Trap> {
        let ts = CpuException::for_selector(Vector::InvalidTss, tss_sel.0, ext);
        if tss_sel.is_local() {
            return Err(ts.into());
        }
        let tss = self.get_descriptor(bus, tss_sel)?.ok_or(ts)?;
        if !tss.is_available_tss() {
            return Err(ts.into());
        }
        self.switch_to_task(bus, tss_sel, &tss, TaskSwitch::Interrupt)?;
        if let Some(code) = error_code {
            let is32 = self.regs.tr.is32;
            self.push(bus, code as u32, OpSize::from_32(is32))?;
        }
        Ok(())
    }
}
