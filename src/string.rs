//! String instructions and their REP forms.

use crate::alu;
use crate::cpu::{Cpu, Trap};
use crate::instructions::{Instruction, Op, RepKind};
use crate::io::Platform;
use crate::mmu::Access;
use crate::regs::{Flags, OpSize, SegReg, EAX, EDI, EDX, ESI};

impl Cpu {
    /// Runs a string instruction to completion. Under REP the counter is
    /// updated after every element, so a fault leaves (E)CX, (E)SI and (E)DI
    /// describing exactly the elements already done and the instruction
    /// restarts from there.
    pub(crate) fn string_op<P: Platform>(
        &mut self,
        sys: &mut P,
        instr: &Instruction,
    ) -> Result<(), Trap> {
        let Some(rep) = instr.rep else {
            return self.string_step(sys, instr);
        };
        loop {
            let count = rep.counter.read(self, sys)?;
            if count == 0 {
                return Ok(());
            }
            self.string_step(sys, instr)?;
            let count = count.wrapping_sub(1);
            rep.counter.write(self, sys, count)?;
            let zf = self.regs.eflags.contains(Flags::ZF);
            let done = match rep.kind {
                RepKind::Rep => false,
                RepKind::Repz => instr.op.is_string_compare() && !zf,
                RepKind::Repnz => instr.op.is_string_compare() && zf,
            };
            if done || count & OpSize::from_32(instr.addr32).mask() == 0 {
                return Ok(());
            }
            if self.block_abort {
                // The loop overwrote code in the running block; finish from a
                // freshly decoded copy.
                self.regs.eip = instr.start;
                return Ok(());
            }
        }
    }

    fn string_step<P: Platform>(&mut self, sys: &mut P, instr: &Instruction) -> Result<(), Trap> {
        let size = instr.size;
        let a32 = instr.addr32;
        let src_seg = instr.seg_override.unwrap_or(SegReg::Ds);
        let si = self.regs.addr_reg(ESI, a32);
        let di = self.regs.addr_reg(EDI, a32);
        let acc = self.regs.read_reg(EAX as u8, size);
        let port = self.regs.reg16(EDX as u8);

        match instr.op {
            Op::Movs => {
                let v = self.read_mem(sys, src_seg, si, size)?;
                self.write_mem(sys, SegReg::Es, di, size, v)?;
            }
            Op::Cmps => {
                let a = self.read_mem(sys, src_seg, si, size)?;
                let b = self.read_mem(sys, SegReg::Es, di, size)?;
                alu::sub(&mut self.regs.eflags, a, b, false, size);
            }
            Op::Stos => self.write_mem(sys, SegReg::Es, di, size, acc)?,
            Op::Lods => {
                let v = self.read_mem(sys, src_seg, si, size)?;
                self.regs.write_reg(EAX as u8, size, v);
            }
            Op::Scas => {
                let b = self.read_mem(sys, SegReg::Es, di, size)?;
                alu::sub(&mut self.regs.eflags, acc, b, false, size);
            }
            Op::Ins => {
                self.check_io_access(sys, port, size.bytes())?;
                // Probe the destination before the port read has side effects.
                self.linear_address(SegReg::Es, di, size.bytes(), Access::Write)?;
                let v = sys.port_read(port, size);
                self.write_mem(sys, SegReg::Es, di, size, v)?;
            }
            Op::Outs => {
                self.check_io_access(sys, port, size.bytes())?;
                let v = self.read_mem(sys, src_seg, si, size)?;
                sys.port_write(port, size, v);
            }
            _ => return Err(Trap::Internal("not a string instruction")),
        }

        let step = if self.regs.eflags.contains(Flags::DF) {
            size.bytes().wrapping_neg()
        } else {
            size.bytes()
        };
        if matches!(instr.op, Op::Movs | Op::Cmps | Op::Lods | Op::Outs) {
            self.regs.set_addr_reg(ESI, a32, si.wrapping_add(step));
        }
        if matches!(instr.op, Op::Movs | Op::Cmps | Op::Stos | Op::Scas | Op::Ins) {
            self.regs.set_addr_reg(EDI, a32, di.wrapping_add(step));
        }
        Ok(())
    }
}
