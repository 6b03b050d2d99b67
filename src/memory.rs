use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::cpu::{Cpu, Trap};
use crate::exception::CpuException;
use crate::mmu::{Access, PagingContext};
use crate::regs::{Cr0, OpSize, SegReg, ESP};

/// Physical memory as seen by the CPU.
pub trait Bus {
    fn read_u8(&mut self, addr: u32) -> Result<u8>;
    fn read_u16(&mut self, addr: u32) -> Result<u16>;
    fn read_u32(&mut self, addr: u32) -> Result<u32>;
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<()>;
    fn write_u16(&mut self, addr: u32, val: u16) -> Result<()>;
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<()>;
}

pub(crate) fn bus_err(addr: u32) -> impl FnOnce(anyhow::Error) -> Trap {
    move |source| Trap::Bus { addr, source }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Ram {
    pub mem: Vec<u8>,
    pub base: u32,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            base: 0,
        }
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize> {
        let off = addr.wrapping_sub(self.base) as usize;
        if off.checked_add(len).map_or(true, |end| end > self.mem.len()) {
            bail!("physical address {addr:#010x} is outside RAM");
        }
        Ok(off)
    }

    /// Copies an image into RAM at a physical address.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let off = self.offset(addr, bytes.len())?;
        self.mem[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Bus for Ram {
    fn read_u8(&mut self, addr: u32) -> Result<u8> {
        let off = self.offset(addr, 1)?;
        Ok(self.mem[off])
    }
    fn read_u16(&mut self, addr: u32) -> Result<u16> {
        let off = self.offset(addr, 2)?;
        Ok(u16::from_le_bytes([self.mem[off], self.mem[off + 1]]))
    }
    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        let off = self.offset(addr, 4)?;
        Ok(u32::from_le_bytes([
            self.mem[off],
            self.mem[off + 1],
            self.mem[off + 2],
            self.mem[off + 3],
        ]))
    }
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<()> {
        let off = self.offset(addr, 1)?;
        self.mem[off] = val;
        Ok(())
    }
    fn write_u16(&mut self, addr: u32, val: u16) -> Result<()> {
        let off = self.offset(addr, 2)?;
        self.mem[off..off + 2].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<()> {
        let off = self.offset(addr, 4)?;
        self.mem[off..off + 4].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }
}

fn segment_fault(seg: SegReg) -> CpuException {
    if seg == SegReg::Ss {
        CpuException::ss(0)
    } else {
        CpuException::gp0()
    }
}

// Segmented and paged access gateway. Every guest data access goes through
// here so segment checks, paging and code-cache notification stay in one place.
impl Cpu {
    fn paging_context(&self, privileged: bool) -> PagingContext {
        PagingContext {
            enabled: self.regs.cr0.contains(Cr0::PG),
            cr3: self.regs.cr3,
            user: !privileged && self.regs.cpl() == 3,
            write_protect: self.regs.cr0.contains(Cr0::WP),
        }
    }

    fn translate<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        access: Access,
        privileged: bool,
    ) -> Result<u32, Trap> {
        let ctx = self.paging_context(privileged);
        self.mmu.translate(bus, ctx, linear, access)
    }

    pub fn get_physical_address<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        is_write: bool,
        is_execute: bool,
    ) -> Result<u32, Trap> {
        let access = match (is_write, is_execute) {
            (true, _) => Access::Write,
            (false, true) => Access::Execute,
            (false, false) => Access::Read,
        };
        self.translate(bus, linear, access, false)
    }

    /// Applies segment type and limit checks and returns the linear address.
    pub fn linear_address(
        &self,
        seg: SegReg,
        offset: u32,
        size: u32,
        access: Access,
    ) -> Result<u32, Trap> {
        let s = self.regs.seg(seg);
        if !self.regs.is_in_real_mode() {
            if !s.is_usable() {
                return Err(segment_fault(seg).into());
            }
            let allowed = match access {
                Access::Read => s.is_readable(),
                Access::Write => s.is_writable(),
                Access::Execute => s.is_executable(),
            };
            if !allowed {
                return Err(segment_fault(seg).into());
            }
        }
        if s.is_outside_limit(offset, size) {
            return Err(segment_fault(seg).into());
        }
        Ok(s.base().wrapping_add(offset))
    }

    pub(crate) fn read_linear<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        size: OpSize,
        privileged: bool,
    ) -> Result<u32, Trap> {
        let n = size.bytes();
        if (linear & 0xFFF) + n <= 0x1000 {
            let phys = self.translate(bus, linear, Access::Read, privileged)?;
            return match size {
                OpSize::Byte => bus.read_u8(phys).map(u32::from),
                OpSize::Word => bus.read_u16(phys).map(u32::from),
                OpSize::Dword => bus.read_u32(phys),
            }
            .map_err(bus_err(phys));
        }
        let mut phys = [0u32; 4];
        for (i, p) in phys.iter_mut().enumerate().take(n as usize) {
            *p = self.translate(bus, linear.wrapping_add(i as u32), Access::Read, privileged)?;
        }
        let mut v = 0u32;
        for (i, &p) in phys.iter().enumerate().take(n as usize) {
            v |= (bus.read_u8(p).map_err(bus_err(p))? as u32) << (8 * i);
        }
        Ok(v)
    }

    pub(crate) fn write_linear<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        size: OpSize,
        value: u32,
        privileged: bool,
    ) -> Result<(), Trap> {
        let n = size.bytes();
        if (linear & 0xFFF) + n <= 0x1000 {
            let phys = self.translate(bus, linear, Access::Write, privileged)?;
            match size {
                OpSize::Byte => bus.write_u8(phys, value as u8),
                OpSize::Word => bus.write_u16(phys, value as u16),
                OpSize::Dword => bus.write_u32(phys, value),
            }
            .map_err(bus_err(phys))?;
            self.note_physical_write(phys, n);
            return Ok(());
        }
        // Translate every byte first: a fault on the second page must leave the
        // first page untouched.
        let mut phys = [0u32; 4];
        for (i, p) in phys.iter_mut().enumerate().take(n as usize) {
            *p = self.translate(bus, linear.wrapping_add(i as u32), Access::Write, privileged)?;
        }
        for (i, &p) in phys.iter().enumerate().take(n as usize) {
            bus.write_u8(p, (value >> (8 * i)) as u8).map_err(bus_err(p))?;
            self.note_physical_write(p, 1);
        }
        Ok(())
    }

    pub fn read_mem<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
        size: OpSize,
    ) -> Result<u32, Trap> {
        let linear = self.linear_address(seg, offset, size.bytes(), Access::Read)?;
        self.read_linear(bus, linear, size, false)
    }

    pub fn write_mem<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
        size: OpSize,
        value: u32,
    ) -> Result<(), Trap> {
        let linear = self.linear_address(seg, offset, size.bytes(), Access::Write)?;
        self.write_linear(bus, linear, size, value, false)
    }

    pub fn read_mem8<B: Bus + ?Sized>(&mut self, bus: &mut B, seg: SegReg, offset: u32) -> Result<u8, Trap> {
        self.read_mem(bus, seg, offset, OpSize::Byte).map(|v| v as u8)
    }

    pub fn read_mem16<B: Bus + ?Sized>(&mut self, bus: &mut B, seg: SegReg, offset: u32) -> Result<u16, Trap> {
        self.read_mem(bus, seg, offset, OpSize::Word).map(|v| v as u16)
    }

    pub fn read_mem32<B: Bus + ?Sized>(&mut self, bus: &mut B, seg: SegReg, offset: u32) -> Result<u32, Trap> {
        self.read_mem(bus, seg, offset, OpSize::Dword)
    }

    pub fn write_mem8<B: Bus + ?Sized>(&mut self, bus: &mut B, seg: SegReg, offset: u32, v: u8) -> Result<(), Trap> {
        self.write_mem(bus, seg, offset, OpSize::Byte, v as u32)
    }

    pub fn write_mem16<B: Bus + ?Sized>(&mut self, bus: &mut B, seg: SegReg, offset: u32, v: u16) -> Result<(), Trap> {
        self.write_mem(bus, seg, offset, OpSize::Word, v as u32)
    }

    pub fn write_mem32<B: Bus + ?Sized>(&mut self, bus: &mut B, seg: SegReg, offset: u32, v: u32) -> Result<(), Trap> {
        self.write_mem(bus, seg, offset, OpSize::Dword, v)
    }

    // Descriptor tables, the IDT and the TSS are accessed with supervisor
    // rights regardless of CPL.
    pub(crate) fn read_system_u8<B: Bus + ?Sized>(&mut self, bus: &mut B, linear: u32) -> Result<u8, Trap> {
        self.read_linear(bus, linear, OpSize::Byte, true).map(|v| v as u8)
    }

    pub(crate) fn read_system_u16<B: Bus + ?Sized>(&mut self, bus: &mut B, linear: u32) -> Result<u16, Trap> {
        self.read_linear(bus, linear, OpSize::Word, true).map(|v| v as u16)
    }

    pub(crate) fn read_system_u32<B: Bus + ?Sized>(&mut self, bus: &mut B, linear: u32) -> Result<u32, Trap> {
        self.read_linear(bus, linear, OpSize::Dword, true)
    }

    pub(crate) fn write_system_u8<B: Bus + ?Sized>(&mut self, bus: &mut B, linear: u32, v: u8) -> Result<(), Trap> {
        self.write_linear(bus, linear, OpSize::Byte, v as u32, true)
    }

    pub(crate) fn write_system_u16<B: Bus + ?Sized>(&mut self, bus: &mut B, linear: u32, v: u16) -> Result<(), Trap> {
        self.write_linear(bus, linear, OpSize::Word, v as u32, true)
    }

    pub(crate) fn write_system_u32<B: Bus + ?Sized>(&mut self, bus: &mut B, linear: u32, v: u32) -> Result<(), Trap> {
        self.write_linear(bus, linear, OpSize::Dword, v, true)
    }

    /// Fetches one instruction byte at CS:`offset`, returning it together with
    /// its physical address.
    pub(crate) fn fetch_code_byte<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        offset: u32,
    ) -> Result<(u8, u32), Trap> {
        let cs = self.regs.seg(SegReg::Cs);
        if cs.is_outside_limit(offset, 1) {
            return Err(CpuException::gp0().into());
        }
        let linear = cs.base().wrapping_add(offset);
        let phys = self.translate(bus, linear, Access::Execute, false)?;
        let b = bus.read_u8(phys).map_err(bus_err(phys))?;
        Ok((b, phys))
    }

    pub fn push<B: Bus + ?Sized>(&mut self, bus: &mut B, value: u32, size: OpSize) -> Result<(), Trap> {
        let sp = self.regs.stack_pointer().wrapping_sub(size.bytes());
        let sp = if self.regs.seg(SegReg::Ss).is_size32() {
            sp
        } else {
            sp & 0xFFFF
        };
        self.write_mem(bus, SegReg::Ss, sp, size, value)?;
        self.regs.set_stack_pointer(sp);
        Ok(())
    }

    pub fn push16<B: Bus + ?Sized>(&mut self, bus: &mut B, value: u16) -> Result<(), Trap> {
        self.push(bus, value as u32, OpSize::Word)
    }

    pub fn push32<B: Bus + ?Sized>(&mut self, bus: &mut B, value: u32) -> Result<(), Trap> {
        self.push(bus, value, OpSize::Dword)
    }

    pub fn pop<B: Bus + ?Sized>(&mut self, bus: &mut B, size: OpSize) -> Result<u32, Trap> {
        let v = self.peek_stack(bus, 0, size)?;
        let sp = self.regs.stack_pointer().wrapping_add(size.bytes());
        self.regs.set_stack_pointer(sp);
        Ok(v)
    }

    pub fn pop16<B: Bus + ?Sized>(&mut self, bus: &mut B) -> Result<u16, Trap> {
        self.pop(bus, OpSize::Word).map(|v| v as u16)
    }

    pub fn pop32<B: Bus + ?Sized>(&mut self, bus: &mut B) -> Result<u32, Trap> {
        self.pop(bus, OpSize::Dword)
    }

    /// Reads the stack at SP + `delta` without moving SP.
    pub fn peek_stack<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        delta: u32,
        size: OpSize,
    ) -> Result<u32, Trap> {
        let sp = self.regs.stack_pointer().wrapping_add(delta);
        let sp = if self.regs.seg(SegReg::Ss).is_size32() {
            sp
        } else {
            sp & 0xFFFF
        };
        self.read_mem(bus, SegReg::Ss, sp, size)
    }

    /// Adds `delta` to SP/ESP according to the stack size.
    pub(crate) fn adjust_stack(&mut self, delta: u32) {
        let sp = self.regs.stack_pointer().wrapping_add(delta);
        self.regs.set_stack_pointer(sp);
    }

    pub(crate) fn esp(&self) -> u32 {
        self.regs.gpr[ESP]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_rejects_out_of_range() {
        let mut ram = Ram::new(16);
        assert!(ram.read_u32(14).is_err());
        assert!(ram.write_u8(16, 1).is_err());
        ram.write_u32(12, 0xAABB_CCDD).unwrap();
        assert_eq!(ram.read_u16(12).unwrap(), 0xCCDD);
    }

    #[test]
    fn ram_honours_base() {
        let mut ram = Ram::new(16);
        ram.base = 0x8000_0000;
        ram.load(0x8000_0004, &[1, 2, 3]).unwrap();
        assert_eq!(ram.read_u8(0x8000_0005).unwrap(), 2);
        assert!(ram.read_u8(0x10).is_err());
    }
}
