//! Near and far control transfers with the protected-mode privilege rules.
//!
//! Every transfer runs under [`Cpu::with_rollback`]: all descriptor, privilege
//! and limit checks come before the first push, and a fault in the middle of
//! the transfer restores the registers (ESP and CS in particular) to the state
//! before the instruction.

use tracing::debug;

use crate::cpu::{Cpu, CpuType, Trap};
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::{CpuException, Vector};
use crate::memory::Bus;
use crate::regs::{CpuMode, Flags, OpSize, SegReg, Segment, ESP};
use crate::tss::TaskSwitch;

fn gp_sel(sel: Selector) -> CpuException {
    CpuException::gp(sel.error_code(false))
}

fn np_sel(sel: Selector) -> CpuException {
    CpuException::np(sel.error_code(false))
}

/// Offset truncated to the operand size of the transfer.
fn sized(offset: u32, size: OpSize) -> u32 {
    offset & size.mask()
}

impl Cpu {
    pub(crate) fn check_code_limit(&self, eip: u32) -> Result<(), Trap> {
        if self.regs.seg(SegReg::Cs).is_outside_limit(eip, 1) {
            return Err(CpuException::gp0().into());
        }
        Ok(())
    }

    /// Loads CS from a validated code descriptor; RPL becomes the new CPL.
    pub(crate) fn load_code_segment<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        desc: &Descriptor,
        cpl: u8,
    ) -> Result<(), Trap> {
        self.mark_accessed(bus, selector)?;
        self.regs
            .seg_mut(SegReg::Cs)
            .load_protected_mode(selector.with_rpl(cpl).0, desc);
        Ok(())
    }

    /// Fetches and checks the code segment a direct far JMP/CALL, or a call
    /// gate, lands in. Returns the descriptor; the caller decides the CPL.
    fn code_target<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: Selector,
    ) -> Result<Descriptor, Trap> {
        if sel.is_null() {
            return Err(CpuException::gp0().into());
        }
        let desc = self.get_descriptor(bus, sel)?.ok_or(gp_sel(sel))?;
        if !desc.is_code() {
            return Err(gp_sel(sel).into());
        }
        Ok(desc)
    }

    pub fn near_jump(&mut self, target: u32, size: OpSize) -> Result<(), Trap> {
        let eip = sized(target, size);
        self.check_code_limit(eip)?;
        self.regs.eip = eip;
        Ok(())
    }

    pub fn near_call<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        target: u32,
        size: OpSize,
    ) -> Result<(), Trap> {
        self.with_rollback(bus, |cpu, bus| {
            let eip = sized(target, size);
            cpu.check_code_limit(eip)?;
            let ret = cpu.regs.eip;
            cpu.push(bus, ret, size)?;
            cpu.regs.eip = eip;
            Ok(())
        })
    }

    /// RET / RET imm16.
    pub fn near_ret<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        size: OpSize,
        release: u16,
    ) -> Result<(), Trap> {
        self.with_rollback(bus, |cpu, bus| {
            let eip = cpu.peek_stack(bus, 0, size)?;
            cpu.check_code_limit(eip)?;
            cpu.adjust_stack(size.bytes() + release as u32);
            cpu.regs.eip = eip;
            Ok(())
        })
    }

    pub fn far_jump<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: u16,
        offset: u32,
        size: OpSize,
    ) -> Result<(), Trap> {
        self.with_rollback(bus, |cpu, bus| cpu.far_jump_inner(bus, selector, offset, size))
    }

    fn far_jump_inner<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: u16,
        offset: u32,
        size: OpSize,
    ) -> Result<(), Trap> {
        let offset = sized(offset, size);
        match self.regs.mode() {
            CpuMode::Real | CpuMode::Virtual8086 => {
                self.load_plain_cs(selector);
                self.check_code_limit(offset)?;
                self.regs.eip = offset;
                return Ok(());
            }
            CpuMode::Protected => {}
        }
        let sel = Selector(selector);
        if sel.is_null() {
            return Err(CpuException::gp0().into());
        }
        let desc = self.get_descriptor(bus, sel)?.ok_or(gp_sel(sel))?;
        let cpl = self.regs.cpl();
        match desc.kind {
            DescriptorKind::Code { .. } => {
                self.check_direct_code(sel, &desc, cpl)?;
                self.enter_code(bus, sel, &desc, cpl, offset)
            }
            DescriptorKind::CallGate {
                selector: target,
                offset: gate_offset,
                ..
            } => {
                self.check_gate(sel, &desc, cpl)?;
                let target = Selector(target);
                let code = self.code_target(bus, target)?;
                let ok = if code.is_conforming_code() {
                    code.dpl <= cpl
                } else {
                    code.dpl == cpl
                };
                if !ok {
                    return Err(gp_sel(target).into());
                }
                if !code.present {
                    return Err(np_sel(target).into());
                }
                self.enter_code(bus, target, &code, cpl, gate_offset)
            }
            DescriptorKind::TaskGate { .. } | DescriptorKind::Tss { .. } => {
                self.task_target(bus, sel, &desc, cpl, TaskSwitch::Jmp)
            }
            _ => Err(gp_sel(sel).into()),
        }
    }

    pub fn far_call<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: u16,
        offset: u32,
        size: OpSize,
    ) -> Result<(), Trap> {
        self.with_rollback(bus, |cpu, bus| cpu.far_call_inner(bus, selector, offset, size))
    }

    fn far_call_inner<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: u16,
        offset: u32,
        size: OpSize,
    ) -> Result<(), Trap> {
        let offset = sized(offset, size);
        let ret_cs = self.regs.seg(SegReg::Cs).selector() as u32;
        let ret_eip = self.regs.eip;
        match self.regs.mode() {
            CpuMode::Real | CpuMode::Virtual8086 => {
                self.push(bus, ret_cs, size)?;
                self.push(bus, ret_eip, size)?;
                self.load_plain_cs(selector);
                self.check_code_limit(offset)?;
                self.regs.eip = offset;
                return Ok(());
            }
            CpuMode::Protected => {}
        }
        let sel = Selector(selector);
        if sel.is_null() {
            return Err(CpuException::gp0().into());
        }
        let desc = self.get_descriptor(bus, sel)?.ok_or(gp_sel(sel))?;
        let cpl = self.regs.cpl();
        match desc.kind {
            DescriptorKind::Code { .. } => {
                self.check_direct_code(sel, &desc, cpl)?;
                if desc.limit < offset {
                    return Err(CpuException::gp0().into());
                }
                self.push(bus, ret_cs, size)?;
                self.push(bus, ret_eip, size)?;
                self.enter_code(bus, sel, &desc, cpl, offset)
            }
            DescriptorKind::CallGate {
                selector: target,
                offset: gate_offset,
                param_count,
                is32,
            } => {
                self.check_gate(sel, &desc, cpl)?;
                let target = Selector(target);
                let code = self.code_target(bus, target)?;
                if code.dpl > cpl {
                    return Err(gp_sel(target).into());
                }
                if !code.present {
                    return Err(np_sel(target).into());
                }
                let gate_size = OpSize::from_32(is32);
                if !code.is_conforming_code() && code.dpl < cpl {
                    self.call_gate_inner(bus, target, &code, gate_offset, gate_size, param_count)
                } else {
                    if code.limit < gate_offset {
                        return Err(CpuException::gp0().into());
                    }
                    self.push(bus, ret_cs, gate_size)?;
                    self.push(bus, ret_eip, gate_size)?;
                    self.enter_code(bus, target, &code, cpl, gate_offset)
                }
            }
            DescriptorKind::TaskGate { .. } | DescriptorKind::Tss { .. } => {
                self.task_target(bus, sel, &desc, cpl, TaskSwitch::Call)
            }
            _ => Err(gp_sel(sel).into()),
        }
    }

    /// CALL through a gate to a more privileged, non-conforming segment: the
    /// stack switches to the one in the TSS and `params` words/dwords are
    /// copied across.
    fn call_gate_inner<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        target: Selector,
        code: &Descriptor,
        offset: u32,
        size: OpSize,
        params: u8,
    ) -> Result<(), Trap> {
        let dpl = code.dpl;
        let (ss, esp) = self.tss_stack(bus, dpl)?;
        let ss = Selector(ss);
        let ss_desc = self.check_stack_segment(bus, ss, dpl, Vector::InvalidTss)?;
        let frame = (4 + params as u32) * size.bytes();
        let mut stack = Segment::reset(0, 0);
        stack.load_protected_mode(ss.0, &ss_desc);
        let top = if stack.is_size32() { esp } else { esp & 0xFFFF };
        if stack.is_outside_limit(top.wrapping_sub(frame), frame) {
            return Err(CpuException::ss(ss.error_code(false)).into());
        }
        if code.limit < offset {
            return Err(CpuException::gp0().into());
        }

        let mut copied = Vec::with_capacity(params as usize);
        for i in 0..params as u32 {
            copied.push(self.peek_stack(bus, i * size.bytes(), size)?);
        }
        let old_ss = self.regs.seg(SegReg::Ss).selector() as u32;
        let old_esp = self.regs.gpr[ESP];
        let ret_cs = self.regs.seg(SegReg::Cs).selector() as u32;
        let ret_eip = self.regs.eip;
        debug!(from = self.regs.cpl(), to = dpl, params, "call gate stack switch");

        self.load_code_segment(bus, target, code, dpl)?;
        self.mark_accessed(bus, ss)?;
        self.regs.seg_mut(SegReg::Ss).load_protected_mode(ss.0, &ss_desc);
        self.regs.gpr[ESP] = esp;
        self.push(bus, old_ss, size)?;
        self.push(bus, old_esp, size)?;
        for &p in copied.iter().rev() {
            self.push(bus, p, size)?;
        }
        self.push(bus, ret_cs, size)?;
        self.push(bus, ret_eip, size)?;
        self.regs.eip = offset;
        Ok(())
    }

    pub fn far_ret<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        size: OpSize,
        release: u16,
    ) -> Result<(), Trap> {
        self.with_rollback(bus, |cpu, bus| cpu.far_ret_inner(bus, size, release))
    }

    fn far_ret_inner<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        size: OpSize,
        release: u16,
    ) -> Result<(), Trap> {
        let n = size.bytes();
        let eip = self.peek_stack(bus, 0, size)?;
        let cs = self.peek_stack(bus, n, size)? as u16;
        if self.regs.mode() != CpuMode::Protected {
            self.load_plain_cs(cs);
            self.check_code_limit(eip)?;
            self.adjust_stack(2 * n + release as u32);
            self.regs.eip = eip;
            return Ok(());
        }
        let sel = Selector(cs);
        let desc = self.return_target(bus, sel)?;
        let cpl = self.regs.cpl();
        if sel.rpl() == cpl {
            if desc.limit < eip {
                return Err(CpuException::gp0().into());
            }
            self.load_code_segment(bus, sel, &desc, cpl)?;
            self.adjust_stack(2 * n + release as u32);
            self.regs.eip = eip;
            return Ok(());
        }

        let new_esp = self.peek_stack(bus, 2 * n + release as u32, size)?;
        let new_ss = self.peek_stack(bus, 3 * n + release as u32, size)? as u16;
        self.return_outer(bus, sel, &desc, eip, new_ss, new_esp, release)?;
        Ok(())
    }

    pub fn iret<B: Bus + ?Sized>(&mut self, bus: &mut B, size: OpSize) -> Result<(), Trap> {
        self.with_rollback(bus, |cpu, bus| cpu.iret_inner(bus, size))
    }

    fn iret_inner<B: Bus + ?Sized>(&mut self, bus: &mut B, size: OpSize) -> Result<(), Trap> {
        let n = size.bytes();
        match self.regs.mode() {
            CpuMode::Real => {
                let eip = self.peek_stack(bus, 0, size)?;
                let cs = self.peek_stack(bus, n, size)? as u16;
                let flags = self.peek_stack(bus, 2 * n, size)?;
                self.load_plain_cs(cs);
                self.check_code_limit(eip)?;
                self.adjust_stack(3 * n);
                self.regs.eip = eip;
                self.write_flags(flags, size, true);
                return Ok(());
            }
            CpuMode::Virtual8086 => {
                if self.regs.eflags.iopl() < 3 {
                    return Err(CpuException::gp0().into());
                }
                let eip = self.peek_stack(bus, 0, size)?;
                let cs = self.peek_stack(bus, n, size)? as u16;
                let flags = self.peek_stack(bus, 2 * n, size)?;
                self.load_plain_cs(cs);
                self.check_code_limit(eip)?;
                self.adjust_stack(3 * n);
                self.regs.eip = eip;
                self.write_flags(flags, size, true);
                return Ok(());
            }
            CpuMode::Protected => {}
        }

        if self.regs.eflags.contains(Flags::NT) {
            let link = Selector(self.get_back_link(bus)?);
            let ts = CpuException::ts(link.error_code(false));
            if link.is_local() {
                return Err(ts.into());
            }
            let desc = self.get_descriptor(bus, link)?.ok_or(ts)?;
            if !desc.is_busy_tss() {
                return Err(ts.into());
            }
            return self.switch_to_task(bus, link, &desc, TaskSwitch::Iret);
        }

        let eip = self.peek_stack(bus, 0, size)?;
        let cs = self.peek_stack(bus, n, size)? as u16;
        let flags = self.peek_stack(bus, 2 * n, size)?;
        let cpl = self.regs.cpl();
        if size == OpSize::Dword && flags & Flags::VM.bits() != 0 && cpl == 0 {
            return self.iret_to_v86(bus, eip, cs, flags);
        }

        let sel = Selector(cs);
        let desc = self.return_target(bus, sel)?;
        if sel.rpl() == cpl {
            if desc.limit < eip {
                return Err(CpuException::gp0().into());
            }
            self.load_code_segment(bus, sel, &desc, cpl)?;
            self.adjust_stack(3 * n);
            self.regs.eip = eip;
            self.write_flags(flags, size, true);
            return Ok(());
        }

        let new_esp = self.peek_stack(bus, 3 * n, size)?;
        let new_ss = self.peek_stack(bus, 4 * n, size)? as u16;
        // Flags are restored under the privilege the frame was built at.
        self.write_flags(flags, size, true);
        self.return_outer(bus, sel, &desc, eip, new_ss, new_esp, 0)
    }

    fn iret_to_v86<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        eip: u32,
        cs: u16,
        flags: u32,
    ) -> Result<(), Trap> {
        let mut frame = [0u32; 6];
        for (i, v) in frame.iter_mut().enumerate() {
            *v = self.peek_stack(bus, 12 + 4 * i as u32, OpSize::Dword)?;
        }
        let [esp, ss, es, ds, fs, gs] = frame;
        debug!(cs, eip, "iret to virtual-8086 mode");
        self.regs.set_flags(Flags::from_bits_retain(flags));
        self.regs.seg_mut(SegReg::Cs).load_virtual_mode(cs);
        self.regs.seg_mut(SegReg::Ss).load_virtual_mode(ss as u16);
        self.regs.seg_mut(SegReg::Es).load_virtual_mode(es as u16);
        self.regs.seg_mut(SegReg::Ds).load_virtual_mode(ds as u16);
        self.regs.seg_mut(SegReg::Fs).load_virtual_mode(fs as u16);
        self.regs.seg_mut(SegReg::Gs).load_virtual_mode(gs as u16);
        self.regs.gpr[ESP] = esp;
        self.regs.eip = eip & 0xFFFF;
        self.check_code_limit(self.regs.eip)
    }

    /// Code segment checks shared by RETF and IRET.
    fn return_target<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: Selector,
    ) -> Result<Descriptor, Trap> {
        if sel.is_null() {
            return Err(CpuException::gp0().into());
        }
        if sel.rpl() < self.regs.cpl() {
            return Err(gp_sel(sel).into());
        }
        let desc = self.get_descriptor(bus, sel)?.ok_or(gp_sel(sel))?;
        if !desc.is_code() {
            return Err(gp_sel(sel).into());
        }
        let ok = if desc.is_conforming_code() {
            desc.dpl <= sel.rpl()
        } else {
            desc.dpl == sel.rpl()
        };
        if !ok {
            return Err(gp_sel(sel).into());
        }
        if !desc.present {
            return Err(np_sel(sel).into());
        }
        Ok(desc)
    }

    /// Return to an outer privilege level: switch to the caller's stack and
    /// drop data segments the caller may not use.
    #[allow(clippy::too_many_arguments)]
    fn return_outer<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        desc: &Descriptor,
        eip: u32,
        ss: u16,
        esp: u32,
        release: u16,
    ) -> Result<(), Trap> {
        let rpl = sel.rpl();
        let ss = Selector(ss);
        let ss_desc = self.check_stack_segment(bus, ss, rpl, Vector::GeneralProtection)?;
        if desc.limit < eip {
            return Err(CpuException::gp0().into());
        }
        debug!(from = self.regs.cpl(), to = rpl, "return to outer privilege");
        self.load_code_segment(bus, sel, desc, rpl)?;
        self.mark_accessed(bus, ss)?;
        self.regs.seg_mut(SegReg::Ss).load_protected_mode(ss.0, &ss_desc);
        self.regs.set_stack_pointer(esp.wrapping_add(release as u32));
        self.regs.eip = eip;
        self.revalidate_data_segments();
        Ok(())
    }

    /// Privilege checks for a direct far JMP/CALL to a code segment.
    fn check_direct_code(&self, sel: Selector, desc: &Descriptor, cpl: u8) -> Result<(), Trap> {
        let ok = if desc.is_conforming_code() {
            desc.dpl <= cpl
        } else {
            sel.rpl() <= cpl && desc.dpl == cpl
        };
        if !ok {
            return Err(gp_sel(sel).into());
        }
        if !desc.present {
            return Err(np_sel(sel).into());
        }
        Ok(())
    }

    fn check_gate(&self, sel: Selector, gate: &Descriptor, cpl: u8) -> Result<(), Trap> {
        if gate.dpl < cpl || gate.dpl < sel.rpl() {
            return Err(gp_sel(sel).into());
        }
        if !gate.present {
            return Err(np_sel(sel).into());
        }
        Ok(())
    }

    fn enter_code<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        desc: &Descriptor,
        cpl: u8,
        offset: u32,
    ) -> Result<(), Trap> {
        if desc.limit < offset {
            return Err(CpuException::gp0().into());
        }
        self.load_code_segment(bus, sel, desc, cpl)?;
        self.regs.eip = offset;
        Ok(())
    }

    /// JMP/CALL to a task gate or directly to a TSS descriptor.
    fn task_target<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        desc: &Descriptor,
        cpl: u8,
        reason: TaskSwitch,
    ) -> Result<(), Trap> {
        if desc.dpl < cpl || desc.dpl < sel.rpl() {
            return Err(gp_sel(sel).into());
        }
        let (tss_sel, tss) = match desc.kind {
            DescriptorKind::TaskGate { selector } => {
                if !desc.present {
                    return Err(np_sel(sel).into());
                }
                let tss_sel = Selector(selector);
                if tss_sel.is_local() {
                    return Err(gp_sel(tss_sel).into());
                }
                let tss = self.get_descriptor(bus, tss_sel)?.ok_or(gp_sel(tss_sel))?;
                (tss_sel, tss)
            }
            _ => (sel, *desc),
        };
        if !tss.is_available_tss() {
            return Err(gp_sel(tss_sel).into());
        }
        self.switch_to_task(bus, tss_sel, &tss, reason)
    }

    /// CS load outside protected mode.
    fn load_plain_cs(&mut self, selector: u16) {
        let vm = self.regs.eflags.contains(Flags::VM);
        let cs = self.regs.seg_mut(SegReg::Cs);
        if vm {
            cs.load_virtual_mode(selector);
        } else {
            cs.load_real_mode(selector);
        }
    }

    /// EFLAGS write for POPF and IRET. IOPL only changes at CPL 0 and IF only
    /// when CPL <= IOPL; VM is never touched here. RF is taken from the image
    /// for IRET and cleared for POPF.
    pub(crate) fn write_flags(&mut self, value: u32, size: OpSize, with_rf: bool) {
        let old = self.regs.eflags;
        let cpl = self.regs.cpl();
        let mut mask = Flags::STATUS | Flags::TF | Flags::DF | Flags::NT;
        if with_rf {
            mask |= Flags::RF;
        }
        if self.cfg.cpu_type == CpuType::I486 {
            mask |= Flags::AC | Flags::ID;
        }
        if cpl == 0 {
            mask |= Flags::IOPL;
        }
        if cpl <= old.iopl() {
            mask |= Flags::IF;
        }
        let mask = mask.bits() & size.mask();
        let mut bits = (old.bits() & !mask) | (value & mask);
        if !with_rf {
            bits &= !Flags::RF.bits();
        }
        self.regs.set_flags(Flags::from_bits_retain(bits));
    }
}
