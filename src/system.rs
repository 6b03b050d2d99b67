//! Control registers, descriptor-table registers and the other privileged
//! or protection-related instructions.

use tracing::debug;

use crate::cpu::{Cpu, CpuType, Trap};
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::{CpuException, Vector};
use crate::memory::Bus;
use crate::operand::MemRef;
use crate::regs::{Cr0, CpuMode, OpSize, SystemSegment, TableRegister, EAX, EBX, ECX, EDX};

/// Which protection query LAR/LSL/VERR/VERW is making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Lar,
    Lsl,
    Verr,
    Verw,
}

impl Cpu {
    pub(crate) fn require_cpl0(&self) -> Result<(), Trap> {
        if self.regs.cpl() != 0 {
            return Err(CpuException::gp0().into());
        }
        Ok(())
    }

    /// Instructions that only exist in protected mode (#UD in real and V86).
    pub(crate) fn require_protected(&self) -> Result<(), Trap> {
        if self.regs.mode() != CpuMode::Protected {
            return Err(CpuException::ud().into());
        }
        Ok(())
    }

    pub fn read_control(&self, n: u8) -> Result<u32, Trap> {
        match n {
            0 => Ok(self.regs.cr0.bits()),
            2 => Ok(self.regs.cr2),
            3 => Ok(self.regs.cr3),
            4 if self.cfg.cpu_type == CpuType::I486 => Ok(self.regs.cr4),
            _ => Err(CpuException::ud().into()),
        }
    }

    pub fn write_control(&mut self, n: u8, value: u32) -> Result<(), Trap> {
        match n {
            0 => {
                let new = Cr0::from_bits_truncate(value) | Cr0::ET;
                if new.contains(Cr0::PG) && !new.contains(Cr0::PE) {
                    return Err(CpuException::gp0().into());
                }
                let old = self.regs.cr0;
                self.regs.cr0 = new;
                let mode_bits = Cr0::PE | Cr0::PG | Cr0::WP;
                if (old ^ new).intersects(mode_bits) {
                    debug!(old = old.bits(), new = new.bits(), "CR0 mode change");
                    self.flush_translations();
                }
            }
            2 => self.regs.cr2 = value,
            3 => {
                self.regs.cr3 = value & 0xFFFF_F018;
                self.flush_translations();
            }
            4 if self.cfg.cpu_type == CpuType::I486 => self.regs.cr4 = value,
            _ => return Err(CpuException::ud().into()),
        }
        Ok(())
    }

    /// LGDT/LIDT operand: limit word followed by the base (24 bits with a
    /// 16-bit operand size).
    pub(crate) fn read_table_register<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        m: &MemRef,
        size: OpSize,
    ) -> Result<TableRegister, Trap> {
        let limit = self.read_mem16(bus, m.seg, m.offset(&self.regs))?;
        let mut base = self.read_mem32(bus, m.seg, m.offset_plus(&self.regs, 2))?;
        if size == OpSize::Word {
            base &= 0x00FF_FFFF;
        }
        Ok(TableRegister { base, limit })
    }

    pub(crate) fn write_table_register<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        m: &MemRef,
        table: TableRegister,
    ) -> Result<(), Trap> {
        self.write_mem16(bus, m.seg, m.offset(&self.regs), table.limit)?;
        self.write_mem32(bus, m.seg, m.offset_plus(&self.regs, 2), table.base)
    }

    pub(crate) fn lldt<B: Bus + ?Sized>(&mut self, bus: &mut B, selector: u16) -> Result<(), Trap> {
        self.require_protected()?;
        self.require_cpl0()?;
        self.load_ldt(bus, selector, Vector::GeneralProtection)
    }

    pub(crate) fn ltr<B: Bus + ?Sized>(&mut self, bus: &mut B, selector: u16) -> Result<(), Trap> {
        self.require_protected()?;
        self.require_cpl0()?;
        let sel = Selector(selector);
        if sel.is_null() {
            return Err(CpuException::gp0().into());
        }
        let gp = CpuException::gp(sel.error_code(false));
        if sel.is_local() {
            return Err(gp.into());
        }
        let desc = self.get_descriptor(bus, sel)?.ok_or(gp)?;
        let DescriptorKind::Tss { busy: false, is32 } = desc.kind else {
            return Err(gp.into());
        };
        if !desc.present {
            return Err(CpuException::np(sel.error_code(false)).into());
        }
        self.set_tss_busy(bus, sel, true)?;
        self.regs.tr = SystemSegment {
            selector,
            base: desc.base,
            limit: desc.limit,
            is32,
        };
        Ok(())
    }

    /// LAR, LSL, VERR and VERW. `Some(value)` (ZF=1) when the selector is
    /// visible at the current privilege for the query, with the access rights
    /// or limit for LAR/LSL.
    pub(crate) fn probe_selector<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: u16,
        probe: Probe,
    ) -> Result<Option<u32>, Trap> {
        self.require_protected()?;
        let sel = Selector(selector);
        if sel.is_null() {
            return Ok(None);
        }
        let Some(desc) = self.get_descriptor(bus, sel)? else {
            return Ok(None);
        };
        if !self.probe_type_ok(&desc, probe) {
            return Ok(None);
        }
        if !desc.is_conforming_code() && desc.dpl < sel.rpl().max(self.regs.cpl()) {
            return Ok(None);
        }
        Ok(Some(match probe {
            Probe::Lar => ((desc.raw >> 32) as u32) & 0x00F0_FF00,
            Probe::Lsl => desc.limit,
            Probe::Verr | Probe::Verw => 0,
        }))
    }

    fn probe_type_ok(&self, desc: &Descriptor, probe: Probe) -> bool {
        match probe {
            Probe::Lar => !matches!(
                desc.kind,
                DescriptorKind::InterruptGate { .. }
                    | DescriptorKind::TrapGate { .. }
                    | DescriptorKind::Invalid
            ),
            Probe::Lsl => matches!(
                desc.kind,
                DescriptorKind::Code { .. }
                    | DescriptorKind::Data { .. }
                    | DescriptorKind::Ldt
                    | DescriptorKind::Tss { .. }
            ),
            Probe::Verr => desc.is_readable(),
            Probe::Verw => desc.is_writable_data(),
        }
    }

    /// LMSW: loads MP/EM/TS/PE; PE can be set but not cleared.
    pub(crate) fn lmsw(&mut self, value: u16) -> Result<(), Trap> {
        self.require_cpl0()?;
        let keep_pe = self.regs.cr0 & Cr0::PE;
        let low = Cr0::from_bits_truncate(value as u32) & (Cr0::PE | Cr0::MP | Cr0::EM | Cr0::TS);
        let cr0 = (self.regs.cr0 - (Cr0::MP | Cr0::EM | Cr0::TS)) | low | keep_pe;
        self.write_control(0, cr0.bits())
    }

    pub(crate) fn invlpg(&mut self, linear: u32) -> Result<(), Trap> {
        self.require_cpl0()?;
        self.mmu.invalidate(linear);
        Ok(())
    }

    pub(crate) fn cpuid(&mut self) {
        let leaf = self.regs.gpr[EAX];
        let (a, b, c, d) = match leaf {
            0 => (1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69),
            1 => (self.cfg.cpu_type.signature(), 0, 0, self.cfg.has_fpu as u32),
            _ => (0, 0, 0, 0),
        };
        self.regs.gpr[EAX] = a;
        self.regs.gpr[EBX] = b;
        self.regs.gpr[ECX] = c;
        self.regs.gpr[EDX] = d;
    }

    /// ESC and WAIT: the coprocessor availability checks of CR0.
    pub(crate) fn check_coprocessor(&self, wait: bool) -> Result<(), Trap> {
        let cr0 = self.regs.cr0;
        let unavailable = if wait {
            cr0.contains(Cr0::TS | Cr0::MP)
        } else {
            cr0.intersects(Cr0::EM | Cr0::TS)
        };
        if unavailable {
            return Err(CpuException::nm().into());
        }
        Ok(())
    }
}
