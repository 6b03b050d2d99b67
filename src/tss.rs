//! Task state segments: privileged stacks, the I/O permission bitmap and
//! hardware task switches.

use tracing::debug;

use crate::cpu::{Cpu, Trap};
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::{CpuException, Vector};
use crate::memory::Bus;
use crate::regs::{Cr0, Flags, SegReg, SystemSegment};

/// Field offsets of the 32-bit (386) TSS.
mod tss32 {
    pub const BACK_LINK: u32 = 0x00;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const GPR: u32 = 0x28;
    pub const SEGS: u32 = 0x48;
    pub const LDT: u32 = 0x60;
    pub const IOMAP: u32 = 0x66;
    pub const MIN_LIMIT: u32 = 0x67;
}

/// Field offsets of the 16-bit (286) TSS.
mod tss16 {
    pub const IP: u32 = 0x0E;
    pub const FLAGS: u32 = 0x10;
    pub const GPR: u32 = 0x12;
    pub const SEGS: u32 = 0x22;
    pub const LDT: u32 = 0x2A;
    pub const MIN_LIMIT: u32 = 0x2B;
}

/// What caused a task switch. Decides busy-bit, back-link and NT handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitch {
    Jmp,
    Call,
    Iret,
    Interrupt,
}

/// Architectural state held in a TSS image.
#[derive(Debug, Clone, Copy, Default)]
struct TaskState {
    cr3: u32,
    eip: u32,
    eflags: u32,
    gpr: [u32; 8],
    /// ES, CS, SS, DS, FS, GS (FS/GS are zero in a 16-bit TSS).
    segs: [u16; 6],
    ldt: u16,
}

impl Cpu {
    /// SS:ESP for privilege level `dpl` from the current TSS.
    pub(crate) fn tss_stack<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        dpl: u8,
    ) -> Result<(u16, u32), Trap> {
        let tr = self.regs.tr;
        let ts = CpuException::ts(Selector(tr.selector).error_code(false));
        if tr.is32 {
            let off = 4 + dpl as u32 * 8;
            if off + 5 > tr.limit {
                return Err(ts.into());
            }
            let esp = self.read_system_u32(bus, tr.base.wrapping_add(off))?;
            let ss = self.read_system_u16(bus, tr.base.wrapping_add(off + 4))?;
            Ok((ss, esp))
        } else {
            let off = 2 + dpl as u32 * 4;
            if off + 3 > tr.limit {
                return Err(ts.into());
            }
            let sp = self.read_system_u16(bus, tr.base.wrapping_add(off))?;
            let ss = self.read_system_u16(bus, tr.base.wrapping_add(off + 2))?;
            Ok((ss, sp as u32))
        }
    }

    /// Selector of the task that called into the current one.
    pub(crate) fn get_back_link<B: Bus + ?Sized>(&mut self, bus: &mut B) -> Result<u16, Trap> {
        let base = self.regs.tr.base;
        self.read_system_u16(bus, base.wrapping_add(tss32::BACK_LINK))
    }

    /// Port access check for IN/OUT/INS/OUTS. Protected mode with CPL > IOPL,
    /// and V86 mode always, consult the I/O permission bitmap of a 32-bit TSS.
    pub(crate) fn check_io_access<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        port: u16,
        bytes: u32,
    ) -> Result<(), Trap> {
        if self.regs.is_in_real_mode() {
            return Ok(());
        }
        let vm = self.regs.eflags.contains(Flags::VM);
        if !vm && self.regs.cpl() <= self.regs.eflags.iopl() {
            return Ok(());
        }
        let tr = self.regs.tr;
        if !tr.is32 || tr.limit < tss32::MIN_LIMIT {
            return Err(CpuException::gp0().into());
        }
        let map = self.read_system_u16(bus, tr.base.wrapping_add(tss32::IOMAP))? as u32;
        let at = map + port as u32 / 8;
        if at + 1 > tr.limit {
            return Err(CpuException::gp0().into());
        }
        let bits = self.read_system_u16(bus, tr.base.wrapping_add(at))? as u32;
        let mask = ((1u32 << bytes) - 1) << (port & 7);
        if bits & mask != 0 {
            return Err(CpuException::gp0().into());
        }
        Ok(())
    }

    /// LDTR load shared by LLDT and task switches. `fault` is #GP for LLDT
    /// and #TS for a task switch.
    pub(crate) fn load_ldt<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: u16,
        fault: Vector,
    ) -> Result<(), Trap> {
        let sel = Selector(selector);
        if sel.is_null() {
            self.regs.ldtr = SystemSegment {
                selector,
                ..SystemSegment::default()
            };
            return Ok(());
        }
        let err = CpuException::for_selector(fault, selector, false);
        if sel.is_local() {
            return Err(err.into());
        }
        let desc = self.get_descriptor(bus, sel)?.ok_or(err)?;
        if desc.kind != DescriptorKind::Ldt {
            return Err(err.into());
        }
        if !desc.present {
            return Err(CpuException::np(sel.error_code(false)).into());
        }
        self.regs.ldtr = SystemSegment {
            selector,
            base: desc.base,
            limit: desc.limit,
            is32: false,
        };
        Ok(())
    }

    fn save_task_state<B: Bus + ?Sized>(&mut self, bus: &mut B, eflags: u32) -> Result<(), Trap> {
        let tr = self.regs.tr;
        let base = tr.base;
        if tr.is32 {
            self.write_system_u32(bus, base + tss32::EIP, self.regs.eip)?;
            self.write_system_u32(bus, base + tss32::EFLAGS, eflags)?;
            for i in 0..8 {
                self.write_system_u32(bus, base + tss32::GPR + 4 * i as u32, self.regs.gpr[i])?;
            }
            for seg in SegReg::ALL {
                let sel = self.regs.seg(seg).selector();
                self.write_system_u16(bus, base + tss32::SEGS + 4 * seg as u32, sel)?;
            }
        } else {
            self.write_system_u16(bus, base + tss16::IP, self.regs.eip as u16)?;
            self.write_system_u16(bus, base + tss16::FLAGS, eflags as u16)?;
            for i in 0..8 {
                self.write_system_u16(bus, base + tss16::GPR + 2 * i as u32, self.regs.gpr[i] as u16)?;
            }
            for seg in [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds] {
                let sel = self.regs.seg(seg).selector();
                self.write_system_u16(bus, base + tss16::SEGS + 2 * seg as u32, sel)?;
            }
        }
        Ok(())
    }

    fn read_task_state<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        base: u32,
        is32: bool,
    ) -> Result<TaskState, Trap> {
        let mut t = TaskState::default();
        if is32 {
            t.cr3 = self.read_system_u32(bus, base + tss32::CR3)?;
            t.eip = self.read_system_u32(bus, base + tss32::EIP)?;
            t.eflags = self.read_system_u32(bus, base + tss32::EFLAGS)?;
            for i in 0..8 {
                t.gpr[i] = self.read_system_u32(bus, base + tss32::GPR + 4 * i as u32)?;
            }
            for i in 0..6 {
                t.segs[i] = self.read_system_u16(bus, base + tss32::SEGS + 4 * i as u32)?;
            }
            t.ldt = self.read_system_u16(bus, base + tss32::LDT)?;
        } else {
            t.eip = self.read_system_u16(bus, base + tss16::IP)? as u32;
            t.eflags = self.read_system_u16(bus, base + tss16::FLAGS)? as u32;
            for i in 0..8 {
                // Upper halves are undefined after a 286 task switch; keep them.
                let lo = self.read_system_u16(bus, base + tss16::GPR + 2 * i as u32)? as u32;
                t.gpr[i] = (self.regs.gpr[i] & 0xFFFF_0000) | lo;
            }
            for i in 0..4 {
                t.segs[i] = self.read_system_u16(bus, base + tss16::SEGS + 2 * i as u32)?;
            }
            t.ldt = self.read_system_u16(bus, base + tss16::LDT)?;
        }
        Ok(t)
    }

    /// Switches to the task whose TSS descriptor is `desc`. The caller has
    /// checked the gate/TSS privilege and the busy state the reason requires.
    pub(crate) fn switch_to_task<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        desc: &Descriptor,
        reason: TaskSwitch,
    ) -> Result<(), Trap> {
        let DescriptorKind::Tss { is32, .. } = desc.kind else {
            return Err(CpuException::gp(selector.error_code(false)).into());
        };
        if !desc.present {
            return Err(CpuException::np(selector.error_code(false)).into());
        }
        let min = if is32 { tss32::MIN_LIMIT } else { tss16::MIN_LIMIT };
        if desc.limit < min {
            return Err(CpuException::ts(selector.error_code(false)).into());
        }
        debug!(
            from = self.regs.tr.selector,
            to = selector.0,
            ?reason,
            "task switch"
        );

        let old = self.regs.tr;
        let mut old_flags = self.regs.eflags;
        if reason == TaskSwitch::Iret {
            old_flags.remove(Flags::NT);
        }
        if old.selector & 0xFFFC != 0 {
            self.save_task_state(bus, old_flags.bits())?;
            if matches!(reason, TaskSwitch::Jmp | TaskSwitch::Iret) {
                self.set_tss_busy(bus, Selector(old.selector), false)?;
            }
        }
        let nested = matches!(reason, TaskSwitch::Call | TaskSwitch::Interrupt);
        if nested {
            self.write_system_u16(bus, desc.base.wrapping_add(tss32::BACK_LINK), old.selector)?;
        }
        if reason != TaskSwitch::Iret {
            self.set_tss_busy(bus, selector, true)?;
        }

        self.regs.tr = SystemSegment {
            selector: selector.0,
            base: desc.base,
            limit: desc.limit,
            is32,
        };
        self.regs.cr0.insert(Cr0::TS);
        // From here on the new task owns every fault.
        self.task_switched = true;

        let t = self.read_task_state(bus, desc.base, is32)?;
        if is32 && self.regs.cr0.contains(Cr0::PG) {
            self.regs.cr3 = t.cr3;
            self.flush_translations();
        }
        self.regs.eip = t.eip;
        let mut flags = Flags::from_bits_retain(t.eflags);
        if !is32 {
            flags = Flags::from_bits_retain((self.regs.eflags.bits() & 0xFFFF_0000) | (t.eflags & 0xFFFF));
            flags.remove(Flags::VM);
        }
        if nested {
            flags.insert(Flags::NT);
        }
        self.regs.set_flags(flags);
        self.regs.gpr = t.gpr;
        self.load_ldt(bus, t.ldt, Vector::InvalidTss)?;

        if flags.contains(Flags::VM) {
            for seg in SegReg::ALL {
                self.regs.seg_mut(seg).load_virtual_mode(t.segs[seg as usize]);
            }
        } else {
            self.load_task_segments(bus, &t)?;
        }
        if self.regs.seg(SegReg::Cs).is_outside_limit(self.regs.eip, 1) {
            return Err(CpuException::gp0().into());
        }
        Ok(())
    }

    fn load_task_segments<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        t: &TaskState,
    ) -> Result<(), Trap> {
        let cs = Selector(t.segs[SegReg::Cs as usize]);
        let ts = |s: Selector| CpuException::ts(s.error_code(false));
        if cs.is_null() {
            return Err(ts(cs).into());
        }
        let desc = self.get_descriptor(bus, cs)?.ok_or(ts(cs))?;
        let privilege_ok = if desc.is_conforming_code() {
            desc.dpl <= cs.rpl()
        } else {
            desc.dpl == cs.rpl()
        };
        if !desc.is_code() || !privilege_ok {
            return Err(ts(cs).into());
        }
        if !desc.present {
            return Err(CpuException::np(cs.error_code(false)).into());
        }
        self.regs.seg_mut(SegReg::Cs).load_protected_mode(cs.0, &desc);
        let cpl = cs.rpl();

        let ss = Selector(t.segs[SegReg::Ss as usize]);
        let ss_desc = self.check_stack_segment(bus, ss, cpl, Vector::InvalidTss)?;
        self.regs.seg_mut(SegReg::Ss).load_protected_mode(ss.0, &ss_desc);

        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let sel = Selector(t.segs[seg as usize]);
            if sel.is_null() {
                self.regs.seg_mut(seg).load_null(sel.0);
                continue;
            }
            let desc = self.get_descriptor(bus, sel)?.ok_or(ts(sel))?;
            if !desc.is_readable() {
                return Err(ts(sel).into());
            }
            if !desc.is_conforming_code() && sel.rpl().max(cpl) > desc.dpl {
                return Err(ts(sel).into());
            }
            if !desc.present {
                return Err(CpuException::np(sel.error_code(false)).into());
            }
            self.regs.seg_mut(seg).load_protected_mode(sel.0, &desc);
        }
        Ok(())
    }
}
