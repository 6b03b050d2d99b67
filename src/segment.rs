//! Segment register loads with the per-mode protection checks.

use tracing::debug;

use crate::cpu::{Cpu, Trap};
use crate::descriptor::{Descriptor, Selector};
use crate::exception::{CpuException, Vector};
use crate::memory::Bus;
use crate::regs::{CpuMode, SegReg};

impl Cpu {
    /// MOV/POP Sreg and the LxS family. CS is never loaded through here.
    pub fn load_segment<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        selector: u16,
    ) -> Result<(), Trap> {
        match self.regs.mode() {
            CpuMode::Real => self.regs.seg_mut(seg).load_real_mode(selector),
            CpuMode::Virtual8086 => self.regs.seg_mut(seg).load_virtual_mode(selector),
            CpuMode::Protected if seg == SegReg::Ss => {
                let cpl = self.regs.cpl();
                let desc = self.check_stack_segment(bus, Selector(selector), cpl, Vector::GeneralProtection)?;
                self.mark_accessed(bus, Selector(selector))?;
                self.regs.seg_mut(seg).load_protected_mode(selector, &desc);
            }
            CpuMode::Protected => self.load_data_segment(bus, seg, selector)?,
        }
        if seg == SegReg::Ss {
            self.interrupt_shadow = true;
        }
        Ok(())
    }

    fn load_data_segment<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        selector: u16,
    ) -> Result<(), Trap> {
        let sel = Selector(selector);
        if sel.is_null() {
            self.regs.seg_mut(seg).load_null(selector);
            return Ok(());
        }
        let gp = CpuException::gp(sel.error_code(false));
        let desc = self.get_descriptor(bus, sel)?.ok_or(gp)?;
        if !(desc.is_data() || (desc.is_code() && desc.is_readable())) {
            return Err(gp.into());
        }
        if !desc.is_conforming_code() && sel.rpl().max(self.regs.cpl()) > desc.dpl {
            return Err(gp.into());
        }
        if !desc.present {
            return Err(CpuException::np(sel.error_code(false)).into());
        }
        self.mark_accessed(bus, sel)?;
        self.regs.seg_mut(seg).load_protected_mode(selector, &desc);
        Ok(())
    }

    /// Validates a stack segment for privilege level `dpl`. Type, RPL and DPL
    /// violations raise `fault` (#GP for MOV SS and RETF, #TS for stacks taken
    /// from a TSS); a missing segment raises #SS.
    pub(crate) fn check_stack_segment<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        dpl: u8,
        fault: Vector,
    ) -> Result<Descriptor, Trap> {
        let err = CpuException::for_selector(fault, selector.0, false);
        if selector.is_null() {
            return Err(if fault == Vector::GeneralProtection {
                CpuException::gp0()
            } else {
                err
            }
            .into());
        }
        let desc = self.get_descriptor(bus, selector)?.ok_or(err)?;
        if selector.rpl() != dpl || !desc.is_writable_data() || desc.dpl != dpl {
            return Err(err.into());
        }
        if !desc.present {
            return Err(CpuException::ss(selector.error_code(false)).into());
        }
        Ok(desc)
    }

    /// After a return to an outer privilege level, data segment registers the
    /// new CPL may not use are nulled.
    pub(crate) fn revalidate_data_segments(&mut self) {
        let cpl = self.regs.cpl();
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let s = self.regs.seg(seg);
            if !s.is_usable() {
                continue;
            }
            let data_or_plain_code = !s.is_executable() || !s.is_conforming();
            if data_or_plain_code && s.dpl() < cpl {
                debug!(seg = seg.name(), cpl, "nulling inaccessible segment");
                self.regs.seg_mut(seg).load_null(0);
            }
        }
    }
}
