use crate::alu;
use crate::cpu::{Cpu, Trap};
use crate::exception::CpuException;
use crate::instructions::{Instruction, Op};
use crate::interrupt::EventKind;
use crate::io::Platform;
use crate::memory::Bus;
use crate::operand::{MemRef, Operand};
use crate::regs::{CpuMode, Cr0, Flags, OpSize, SegReg, EAX, EBP, EBX, ECX, EDX, ESP};
use crate::system::Probe;

pub trait Executor {
    fn exec<P: Platform>(&self, cpu: &mut Cpu, sys: &mut P, instr: &Instruction) -> Result<(), Trap>;
}

/// Integer-unit executor: everything except x87 arithmetic.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntExecutor;

impl IntExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn width(op: &Operand, default: OpSize) -> OpSize {
    match op {
        Operand::Reg { size, .. } => *size,
        Operand::Mem(m) => m.size,
        _ => default,
    }
}

fn mem_of(op: &Operand) -> Result<&MemRef, Trap> {
    op.mem().ok_or(Trap::Internal("memory operand expected"))
}

/// Near branch destination: a relative immediate is taken from the end of
/// the instruction, anything else is an absolute offset.
fn branch_target<B: Bus + ?Sized>(cpu: &mut Cpu, bus: &mut B, instr: &Instruction) -> Result<u32, Trap> {
    match instr.src {
        Operand::Imm(rel) => Ok(instr.end.wrapping_add(rel)),
        ref other => other.read(cpu, bus),
    }
}

/// ptr16:16/ptr16:32 from an immediate or memory (offset first, then selector).
fn far_pointer<B: Bus + ?Sized>(
    cpu: &mut Cpu,
    bus: &mut B,
    op: &Operand,
    size: OpSize,
) -> Result<(u16, u32), Trap> {
    match op {
        Operand::Far { selector, offset } => Ok((*selector, *offset)),
        Operand::Mem(m) => {
            let offset = cpu.read_mem(bus, m.seg, m.offset(&cpu.regs), size)?;
            let at = m.offset_plus(&cpu.regs, size.bytes());
            let selector = cpu.read_mem16(bus, m.seg, at)?;
            Ok((selector, offset))
        }
        _ => Err(Trap::Internal("far pointer operand expected")),
    }
}

/// CLI/STI are IOPL-sensitive outside real mode.
fn check_iopl(cpu: &Cpu) -> Result<(), Trap> {
    if cpu.regs.mode() != CpuMode::Real && cpu.regs.cpl() > cpu.regs.eflags.iopl() {
        return Err(CpuException::gp0().into());
    }
    Ok(())
}

/// PUSHF/POPF/INT n in V86 mode need IOPL 3.
fn check_v86_iopl(cpu: &Cpu) -> Result<(), Trap> {
    if cpu.regs.mode() == CpuMode::Virtual8086 && cpu.regs.eflags.iopl() < 3 {
        return Err(CpuException::gp0().into());
    }
    Ok(())
}

impl Executor for IntExecutor {
    fn exec<P: Platform>(&self, cpu: &mut Cpu, sys: &mut P, instr: &Instruction) -> Result<(), Trap> {
        let size = instr.size;
        let (dst, src) = (instr.dst, instr.src);
        match instr.op {
            op @ (Op::Add | Op::Or | Op::Adc | Op::Sbb | Op::And | Op::Sub | Op::Xor | Op::Cmp | Op::Test) => {
                let a = dst.read(cpu, sys)?;
                let b = src.read(cpu, sys)?;
                let f = &mut cpu.regs.eflags;
                let cf = f.contains(Flags::CF);
                let r = match op {
                    Op::Add => alu::add(f, a, b, false, size),
                    Op::Adc => alu::add(f, a, b, cf, size),
                    Op::Sub | Op::Cmp => alu::sub(f, a, b, false, size),
                    Op::Sbb => alu::sub(f, a, b, cf, size),
                    Op::Or => alu::logic(f, a | b, size),
                    Op::Xor => alu::logic(f, a ^ b, size),
                    _ => alu::logic(f, a & b, size),
                };
                if !matches!(op, Op::Cmp | Op::Test) {
                    dst.write(cpu, sys, r)?;
                }
            }
            op @ (Op::Inc | Op::Dec | Op::Neg | Op::Not) => {
                let a = dst.read(cpu, sys)?;
                let f = &mut cpu.regs.eflags;
                let r = match op {
                    Op::Inc => alu::inc(f, a, size),
                    Op::Dec => alu::dec(f, a, size),
                    Op::Neg => alu::neg(f, a, size),
                    _ => !a & size.mask(),
                };
                dst.write(cpu, sys, r)?;
            }
            op @ (Op::Mul | Op::Imul) => {
                let b = src.read(cpu, sys)?;
                let a = cpu.regs.read_reg(EAX as u8, size);
                let f = &mut cpu.regs.eflags;
                let p = if op == Op::Mul {
                    alu::mul(f, a, b, size)
                } else {
                    alu::imul(f, a, b, size)
                };
                match size {
                    OpSize::Byte => cpu.regs.set_reg16(EAX as u8, p as u16),
                    _ => {
                        cpu.regs.write_reg(EAX as u8, size, p as u32);
                        cpu.regs.write_reg(EDX as u8, size, (p >> size.bits()) as u32);
                    }
                }
            }
            Op::ImulTrunc => {
                let a = src.read(cpu, sys)?;
                let b = instr.aux.read(cpu, sys)?;
                let p = alu::imul(&mut cpu.regs.eflags, a, b, size);
                dst.write(cpu, sys, p as u32)?;
            }
            op @ (Op::Div | Op::Idiv) => {
                let divisor = src.read(cpu, sys)?;
                let dividend = match size {
                    OpSize::Byte => cpu.regs.reg16(EAX as u8) as u64,
                    _ => {
                        let lo = cpu.regs.read_reg(EAX as u8, size) as u64;
                        let hi = cpu.regs.read_reg(EDX as u8, size) as u64;
                        (hi << size.bits()) | lo
                    }
                };
                let (q, r) = if op == Op::Div {
                    alu::div(dividend, divisor, size)?
                } else {
                    alu::idiv(dividend, divisor, size)?
                };
                match size {
                    OpSize::Byte => cpu.regs.set_reg16(EAX as u8, ((r as u16) << 8) | q as u16),
                    _ => {
                        cpu.regs.write_reg(EAX as u8, size, q);
                        cpu.regs.write_reg(EDX as u8, size, r);
                    }
                }
            }
            op @ (Op::Rol | Op::Ror | Op::Rcl | Op::Rcr | Op::Shl | Op::Shr | Op::Sar) => {
                let count = src.read(cpu, sys)?;
                let a = dst.read(cpu, sys)?;
                let r = alu::shift(&mut cpu.regs.eflags, op, a, count, size);
                dst.write(cpu, sys, r)?;
            }
            op @ (Op::Shld | Op::Shrd) => {
                let count = instr.aux.read(cpu, sys)?;
                let a = dst.read(cpu, sys)?;
                let b = src.read(cpu, sys)?;
                let f = &mut cpu.regs.eflags;
                let r = if op == Op::Shld {
                    alu::shld(f, a, b, count, size)
                } else {
                    alu::shrd(f, a, b, count, size)
                };
                dst.write(cpu, sys, r)?;
            }
            op @ (Op::Bt | Op::Bts | Op::Btr | Op::Btc) => bit_test(cpu, sys, instr, op)?,
            op @ (Op::Bsf | Op::Bsr) => {
                let v = src.read(cpu, sys)? & size.mask();
                if v == 0 {
                    cpu.regs.eflags.insert(Flags::ZF);
                } else {
                    cpu.regs.eflags.remove(Flags::ZF);
                    let index = if op == Op::Bsf {
                        v.trailing_zeros()
                    } else {
                        31 - v.leading_zeros()
                    };
                    dst.write(cpu, sys, index)?;
                }
            }
            Op::Setcc(cond) => {
                let v = cond.eval(cpu.regs.eflags) as u32;
                dst.write(cpu, sys, v)?;
            }
            Op::Bswap => {
                let v = dst.read(cpu, sys)?;
                dst.write(cpu, sys, v.swap_bytes())?;
            }
            Op::Daa | Op::Das => {
                let al = cpu.regs.reg8(EAX as u8);
                let f = &mut cpu.regs.eflags;
                let al = if instr.op == Op::Daa {
                    alu::daa(f, al)
                } else {
                    alu::das(f, al)
                };
                cpu.regs.set_reg8(EAX as u8, al);
            }
            Op::Aaa | Op::Aas => {
                let ax = cpu.regs.reg16(EAX as u8);
                let ax = alu::ascii_adjust(&mut cpu.regs.eflags, ax, instr.op == Op::Aas);
                cpu.regs.set_reg16(EAX as u8, ax);
            }
            Op::Aam => {
                let base = src.read(cpu, sys)? as u8;
                let al = cpu.regs.reg8(EAX as u8);
                let ax = alu::aam(&mut cpu.regs.eflags, al, base)?;
                cpu.regs.set_reg16(EAX as u8, ax);
            }
            Op::Aad => {
                let base = src.read(cpu, sys)? as u8;
                let ax = cpu.regs.reg16(EAX as u8);
                let ax = alu::aad(&mut cpu.regs.eflags, ax, base);
                cpu.regs.set_reg16(EAX as u8, ax);
            }

            Op::Nop => {}
            Op::Mov | Op::Movzx => {
                let v = src.read(cpu, sys)?;
                dst.write(cpu, sys, v)?;
            }
            Op::Movsx => {
                let v = src.read(cpu, sys)?;
                dst.write(cpu, sys, width(&src, size).sign_extend(v))?;
            }
            Op::Lea => {
                let off = mem_of(&src)?.offset(&cpu.regs);
                dst.write(cpu, sys, off)?;
            }
            Op::Xchg => {
                let a = dst.read(cpu, sys)?;
                let b = src.read(cpu, sys)?;
                dst.write(cpu, sys, b)?;
                src.write(cpu, sys, a)?;
            }
            Op::Cmpxchg => {
                let acc = cpu.regs.read_reg(EAX as u8, size);
                let d = dst.read(cpu, sys)?;
                alu::sub(&mut cpu.regs.eflags, acc, d, false, size);
                if cpu.regs.eflags.contains(Flags::ZF) {
                    let s = src.read(cpu, sys)?;
                    dst.write(cpu, sys, s)?;
                } else {
                    // The destination is always written back.
                    dst.write(cpu, sys, d)?;
                    cpu.regs.write_reg(EAX as u8, size, d);
                }
            }
            Op::Xadd => {
                let d = dst.read(cpu, sys)?;
                let s = src.read(cpu, sys)?;
                let sum = alu::add(&mut cpu.regs.eflags, d, s, false, size);
                src.write(cpu, sys, d)?;
                dst.write(cpu, sys, sum)?;
            }
            Op::Cbw => {
                let half = if size == OpSize::Word { OpSize::Byte } else { OpSize::Word };
                let v = half.sign_extend(cpu.regs.read_reg(EAX as u8, half));
                cpu.regs.write_reg(EAX as u8, size, v);
            }
            Op::Cwd => {
                let a = cpu.regs.read_reg(EAX as u8, size);
                let fill = if a & size.sign_bit() != 0 { size.mask() } else { 0 };
                cpu.regs.write_reg(EDX as u8, size, fill);
            }
            Op::Xlat => {
                let seg = instr.seg_override.unwrap_or(SegReg::Ds);
                let base = cpu.regs.addr_reg(EBX, instr.addr32);
                let mut off = base.wrapping_add(cpu.regs.reg8(EAX as u8) as u32);
                if !instr.addr32 {
                    off &= 0xFFFF;
                }
                let v = cpu.read_mem8(sys, seg, off)?;
                cpu.regs.set_reg8(EAX as u8, v);
            }
            Op::Lahf => {
                let v = cpu.regs.eflags.bits() as u8;
                cpu.regs.set_reg8(4, v);
            }
            Op::Sahf => {
                let ah = cpu.regs.reg8(4) as u32;
                let keep = Flags::CF | Flags::PF | Flags::AF | Flags::ZF | Flags::SF;
                let f = (cpu.regs.eflags - keep) | (Flags::from_bits_retain(ah) & keep);
                cpu.regs.set_flags(f);
            }
            Op::Salc => {
                let v = if cpu.regs.eflags.contains(Flags::CF) { 0xFF } else { 0 };
                cpu.regs.set_reg8(EAX as u8, v);
            }

            Op::Push => {
                let v = src.read(cpu, sys)?;
                cpu.push(sys, v, size)?;
            }
            Op::Pop => cpu.with_rollback(sys, |cpu, sys| {
                let v = cpu.pop(sys, size)?;
                dst.write(cpu, sys, v)
            })?,
            Op::Pusha => cpu.with_rollback(sys, |cpu, sys| {
                let sp = cpu.regs.read_reg(ESP as u8, size);
                for i in 0..8u8 {
                    let v = if i as usize == ESP { sp } else { cpu.regs.read_reg(i, size) };
                    cpu.push(sys, v, size)?;
                }
                Ok(())
            })?,
            Op::Popa => cpu.with_rollback(sys, |cpu, sys| {
                for i in (0..8u8).rev() {
                    let v = cpu.pop(sys, size)?;
                    if i as usize != ESP {
                        cpu.regs.write_reg(i, size, v);
                    }
                }
                Ok(())
            })?,
            Op::Pushf => {
                check_v86_iopl(cpu)?;
                let v = (cpu.regs.eflags - (Flags::VM | Flags::RF)).bits();
                cpu.push(sys, v, size)?;
            }
            Op::Popf => {
                check_v86_iopl(cpu)?;
                let v = cpu.peek_stack(sys, 0, size)?;
                cpu.adjust_stack(size.bytes());
                cpu.write_flags(v, size, false);
            }
            Op::Enter => enter(cpu, sys, instr)?,
            Op::Leave => cpu.with_rollback(sys, |cpu, sys| {
                let stack32 = cpu.regs.seg(SegReg::Ss).is_size32();
                let frame = cpu.regs.addr_reg(EBP, stack32);
                cpu.regs.set_stack_pointer(frame);
                let bp = cpu.pop(sys, size)?;
                cpu.regs.write_reg(EBP as u8, size, bp);
                Ok(())
            })?,
            Op::LoadFar(seg) => cpu.with_rollback(sys, |cpu, sys| {
                let (selector, offset) = far_pointer(cpu, sys, &src, size)?;
                cpu.load_segment(sys, seg, selector)?;
                dst.write(cpu, sys, offset)
            })?,

            Op::Movs | Op::Cmps | Op::Stos | Op::Lods | Op::Scas | Op::Ins | Op::Outs => {
                cpu.string_op(sys, instr)?
            }
            Op::In => {
                let port = src.read(cpu, sys)? as u16;
                cpu.check_io_access(sys, port, size.bytes())?;
                let v = sys.port_read(port, size);
                dst.write(cpu, sys, v)?;
            }
            Op::Out => {
                let port = dst.read(cpu, sys)? as u16;
                let v = src.read(cpu, sys)?;
                cpu.check_io_access(sys, port, size.bytes())?;
                sys.port_write(port, size, v & size.mask());
            }

            Op::Clc => cpu.regs.eflags.remove(Flags::CF),
            Op::Stc => cpu.regs.eflags.insert(Flags::CF),
            Op::Cmc => cpu.regs.eflags.toggle(Flags::CF),
            Op::Cld => cpu.regs.eflags.remove(Flags::DF),
            Op::Std => cpu.regs.eflags.insert(Flags::DF),
            Op::Cli => {
                check_iopl(cpu)?;
                cpu.regs.eflags.remove(Flags::IF);
            }
            Op::Sti => {
                check_iopl(cpu)?;
                if !cpu.regs.eflags.contains(Flags::IF) {
                    cpu.interrupt_shadow = true;
                }
                cpu.regs.eflags.insert(Flags::IF);
            }

            Op::Jmp => {
                let target = branch_target(cpu, sys, instr)?;
                cpu.near_jump(target, size)?;
            }
            Op::Jcc(cond) => {
                if cond.eval(cpu.regs.eflags) {
                    let target = branch_target(cpu, sys, instr)?;
                    cpu.near_jump(target, size)?;
                }
            }
            Op::Jcxz => {
                if cpu.regs.addr_reg(ECX, instr.addr32) == 0 {
                    let target = branch_target(cpu, sys, instr)?;
                    cpu.near_jump(target, size)?;
                }
            }
            op @ (Op::Loop | Op::Loope | Op::Loopne) => {
                let count = cpu.regs.addr_reg(ECX, instr.addr32).wrapping_sub(1);
                cpu.regs.set_addr_reg(ECX, instr.addr32, count);
                let count = count & OpSize::from_32(instr.addr32).mask();
                let zf = cpu.regs.eflags.contains(Flags::ZF);
                let taken = count != 0
                    && match op {
                        Op::Loope => zf,
                        Op::Loopne => !zf,
                        _ => true,
                    };
                if taken {
                    let target = branch_target(cpu, sys, instr)?;
                    cpu.near_jump(target, size)?;
                }
            }
            Op::Call => {
                let target = branch_target(cpu, sys, instr)?;
                cpu.near_call(sys, target, size)?;
            }
            Op::JmpFar => {
                let (selector, offset) = far_pointer(cpu, sys, &src, size)?;
                cpu.far_jump(sys, selector, offset, size)?;
            }
            Op::CallFar => {
                let (selector, offset) = far_pointer(cpu, sys, &src, size)?;
                cpu.far_call(sys, selector, offset, size)?;
            }
            Op::Ret => {
                let release = src.read(cpu, sys)? as u16;
                cpu.near_ret(sys, size, release)?;
            }
            Op::RetFar => {
                let release = src.read(cpu, sys)? as u16;
                cpu.far_ret(sys, size, release)?;
            }
            Op::Int => {
                let vector = src.read(cpu, sys)? as u8;
                cpu.software_interrupt(sys, vector, EventKind::Software)?;
            }
            Op::Int3 => cpu.software_interrupt(sys, 3, EventKind::SoftwareTrap)?,
            Op::Into => {
                if cpu.regs.eflags.contains(Flags::OF) {
                    cpu.software_interrupt(sys, 4, EventKind::SoftwareTrap)?;
                }
            }
            Op::Int1 => cpu.software_interrupt(sys, 1, EventKind::External)?,
            Op::Iret => cpu.iret(sys, size)?,
            Op::Hlt => {
                cpu.require_cpl0()?;
                cpu.halted = true;
            }
            Op::Bound => {
                let m = *mem_of(&src)?;
                let index = size.sign_extend(dst.read(cpu, sys)?) as i32;
                let lower = cpu.read_mem(sys, m.seg, m.offset(&cpu.regs), size)?;
                let upper = cpu.read_mem(sys, m.seg, m.offset_plus(&cpu.regs, size.bytes()), size)?;
                if index < size.sign_extend(lower) as i32 || index > size.sign_extend(upper) as i32 {
                    return Err(CpuException::br().into());
                }
            }

            op @ (Op::Lgdt | Op::Lidt) => {
                cpu.require_cpl0()?;
                let table = cpu.read_table_register(sys, mem_of(&src)?, size)?;
                if op == Op::Lgdt {
                    cpu.regs.gdtr = table;
                } else {
                    cpu.regs.idtr = table;
                }
            }
            op @ (Op::Sgdt | Op::Sidt) => {
                let table = if op == Op::Sgdt { cpu.regs.gdtr } else { cpu.regs.idtr };
                cpu.write_table_register(sys, mem_of(&dst)?, table)?;
            }
            Op::Lldt => {
                let sel = src.read(cpu, sys)? as u16;
                cpu.lldt(sys, sel)?;
            }
            Op::Ltr => {
                let sel = src.read(cpu, sys)? as u16;
                cpu.ltr(sys, sel)?;
            }
            Op::Sldt => {
                cpu.require_protected()?;
                let sel = cpu.regs.ldtr.selector as u32;
                dst.write(cpu, sys, sel)?;
            }
            Op::Str => {
                cpu.require_protected()?;
                let sel = cpu.regs.tr.selector as u32;
                dst.write(cpu, sys, sel)?;
            }
            op @ (Op::Lar | Op::Lsl | Op::Verr | Op::Verw) => {
                let sel = src.read(cpu, sys)? as u16;
                let probe = match op {
                    Op::Lar => Probe::Lar,
                    Op::Lsl => Probe::Lsl,
                    Op::Verr => Probe::Verr,
                    _ => Probe::Verw,
                };
                let found = cpu.probe_selector(sys, sel, probe)?;
                cpu.regs.eflags.set(Flags::ZF, found.is_some());
                if let (Some(v), Op::Lar | Op::Lsl) = (found, op) {
                    dst.write(cpu, sys, v)?;
                }
            }
            Op::Arpl => {
                cpu.require_protected()?;
                let d = dst.read(cpu, sys)?;
                let s = src.read(cpu, sys)?;
                if d & 3 < s & 3 {
                    dst.write(cpu, sys, (d & !3) | (s & 3))?;
                    cpu.regs.eflags.insert(Flags::ZF);
                } else {
                    cpu.regs.eflags.remove(Flags::ZF);
                }
            }
            Op::Clts => {
                cpu.require_cpl0()?;
                cpu.regs.cr0.remove(Cr0::TS);
            }
            Op::Lmsw => {
                let v = src.read(cpu, sys)? as u16;
                cpu.lmsw(v)?;
            }
            Op::Smsw => {
                let v = cpu.regs.cr0.bits();
                dst.write(cpu, sys, v)?;
            }
            Op::MovCr | Op::MovDr | Op::MovTr => {
                cpu.require_cpl0()?;
                let v = src.read(cpu, sys)?;
                dst.write(cpu, sys, v)?;
            }
            Op::Invlpg => {
                let m = mem_of(&src)?;
                let linear = cpu.regs.seg(m.seg).base().wrapping_add(m.offset(&cpu.regs));
                cpu.invlpg(linear)?;
            }
            Op::Invd | Op::Wbinvd => cpu.require_cpl0()?,
            Op::Cpuid => cpu.cpuid(),

            Op::Wait => cpu.check_coprocessor(true)?,
            Op::Escape => cpu.check_coprocessor(false)?,
            Op::Fpu(_) => {
                if instr.wait {
                    cpu.check_coprocessor(true)?;
                }
                cpu.check_coprocessor(false)?;
                return Err(Trap::Unimplemented {
                    mnemonic: instr.op.mnemonic(),
                    cs: cpu.regs.seg(SegReg::Cs).selector(),
                    eip: instr.start,
                });
            }
            Op::Raise(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// BT/BTS/BTR/BTC. With a memory destination and a register bit offset the
/// offset is signed and may address any bit relative to the operand.
fn bit_test<P: Platform>(cpu: &mut Cpu, sys: &mut P, instr: &Instruction, op: Op) -> Result<(), Trap> {
    let size = instr.size;
    let bits = size.bits();
    let offset = instr.src.read(cpu, sys)?;
    let target = match (instr.dst, instr.src) {
        (Operand::Mem(m), Operand::Reg { .. }) => {
            let signed = size.sign_extend(offset) as i32;
            let delta = (signed >> bits.trailing_zeros()).wrapping_mul(size.bytes() as i32);
            let mut m = m;
            m.ea.disp = m.ea.disp.wrapping_add(delta as u32);
            Operand::Mem(m)
        }
        (dst, _) => dst,
    };
    let bit = offset & (bits - 1);
    let v = target.read(cpu, sys)?;
    cpu.regs.eflags.set(Flags::CF, v >> bit & 1 != 0);
    let r = match op {
        Op::Bts => v | 1 << bit,
        Op::Btr => v & !(1 << bit),
        Op::Btc => v ^ 1 << bit,
        _ => return Ok(()),
    };
    target.write(cpu, sys, r)
}

fn enter<P: Platform>(cpu: &mut Cpu, sys: &mut P, instr: &Instruction) -> Result<(), Trap> {
    let size = instr.size;
    let frame = instr.src.read(cpu, sys)?;
    let level = instr.aux.read(cpu, sys)? & 0x1F;
    cpu.with_rollback(sys, |cpu, sys| {
        let stack32 = cpu.regs.seg(SegReg::Ss).is_size32();
        let bp = cpu.regs.read_reg(EBP as u8, size);
        cpu.push(sys, bp, size)?;
        let frame_ptr = cpu.regs.stack_pointer();
        if level > 0 {
            let mut outer = cpu.regs.addr_reg(EBP, stack32);
            for _ in 1..level {
                outer = outer.wrapping_sub(size.bytes());
                if !stack32 {
                    outer &= 0xFFFF;
                }
                let v = cpu.read_mem(sys, SegReg::Ss, outer, size)?;
                cpu.push(sys, v, size)?;
            }
            cpu.push(sys, frame_ptr, size)?;
        }
        cpu.regs.write_reg(EBP as u8, size, frame_ptr);
        cpu.adjust_stack(frame.wrapping_neg());
        Ok(())
    })
}
