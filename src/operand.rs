//! Lazily resolved instruction operands.
//!
//! The decoder binds each operand to a register, an address expression or an
//! immediate. Nothing is read until the instruction executes, so an operand
//! always sees the register and memory state of the moment it runs.

use serde::{Deserialize, Serialize};

use crate::cpu::{Cpu, Trap};
use crate::isa::modrm::EffectiveAddress;
use crate::memory::Bus;
use crate::regs::{OpSize, Registers, SegReg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRef {
    /// Effective segment: the override prefix if present, else the default.
    pub seg: SegReg,
    pub ea: EffectiveAddress,
    pub size: OpSize,
}

impl MemRef {
    pub fn offset(&self, regs: &Registers) -> u32 {
        self.ea.offset(regs)
    }

    /// Offset `delta` bytes past the operand, wrapped to the address size.
    pub fn offset_plus(&self, regs: &Registers, delta: u32) -> u32 {
        let off = self.offset(regs).wrapping_add(delta);
        if self.ea.addr32 {
            off
        } else {
            off & 0xFFFF
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    None,
    Reg { index: u8, size: OpSize },
    Seg(SegReg),
    Mem(MemRef),
    Imm(u32),
    /// ptr16:16 / ptr16:32 immediate of a direct far transfer.
    Far { selector: u16, offset: u32 },
    /// x87 stack register ST(i).
    St(u8),
    Control(u8),
    Debug(u8),
    Test(u8),
}

impl Operand {
    pub fn reg(index: u8, size: OpSize) -> Self {
        Operand::Reg { index, size }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    pub fn mem(&self) -> Option<&MemRef> {
        match self {
            Operand::Mem(m) => Some(m),
            _ => None,
        }
    }

    pub fn read<B: Bus + ?Sized>(&self, cpu: &mut Cpu, bus: &mut B) -> Result<u32, Trap> {
        match *self {
            Operand::Reg { index, size } => Ok(cpu.regs.read_reg(index, size)),
            Operand::Mem(m) => {
                let off = m.offset(&cpu.regs);
                cpu.read_mem(bus, m.seg, off, m.size)
            }
            Operand::Imm(v) => Ok(v),
            Operand::Seg(s) => Ok(cpu.regs.seg(s).selector() as u32),
            Operand::Control(n) => cpu.read_control(n),
            Operand::Debug(n) => Ok(cpu.regs.dr[n as usize & 7]),
            Operand::Test(_) => Ok(0),
            Operand::None | Operand::Far { .. } | Operand::St(_) => {
                Err(Trap::Internal("read of a non-value operand"))
            }
        }
    }

    pub fn write<B: Bus + ?Sized>(
        &self,
        cpu: &mut Cpu,
        bus: &mut B,
        value: u32,
    ) -> Result<(), Trap> {
        match *self {
            Operand::Reg { index, size } => {
                cpu.regs.write_reg(index, size, value);
                Ok(())
            }
            Operand::Mem(m) => {
                let off = m.offset(&cpu.regs);
                cpu.write_mem(bus, m.seg, off, m.size, value)
            }
            Operand::Seg(s) => cpu.load_segment(bus, s, value as u16),
            Operand::Control(n) => cpu.write_control(n, value),
            Operand::Debug(n) => {
                cpu.regs.dr[n as usize & 7] = value;
                Ok(())
            }
            Operand::Test(_) => Ok(()),
            Operand::None | Operand::Imm(_) | Operand::Far { .. } | Operand::St(_) => {
                Err(Trap::Internal("write to a non-lvalue operand"))
            }
        }
    }
}
