//! Two-byte opcode map (0F xx).

use crate::cpu::CpuType;
use crate::decoder::{DecodeCtx, Handler, Stop};
use crate::exception::CpuException;
use crate::instructions::{Cond, Instruction, Op};
use crate::isa::i386::load_far_into;
use crate::operand::Operand;
use crate::regs::{OpSize, SegReg, ECX};

type R = Result<Instruction, Stop>;

pub static TABLE: [Handler; 256] = build();

const fn build() -> [Handler; 256] {
    let mut t: [Handler; 256] = [invalid as Handler; 256];
    t[0x00] = grp6;
    t[0x01] = grp7;
    t[0x02] = lar_lsl;
    t[0x03] = lar_lsl;
    t[0x06] = clts;
    t[0x08] = cache_control;
    t[0x09] = cache_control;
    t[0x20] = mov_special;
    t[0x21] = mov_special;
    t[0x22] = mov_special;
    t[0x23] = mov_special;
    t[0x24] = mov_special;
    t[0x26] = mov_special;
    let mut i = 0x80;
    while i < 0x90 {
        t[i] = jcc_near;
        i += 1;
    }
    while i < 0xA0 {
        t[i] = setcc;
        i += 1;
    }
    t[0xA0] = push_pop_fs_gs;
    t[0xA1] = push_pop_fs_gs;
    t[0xA2] = cpuid;
    t[0xA3] = bit_test;
    t[0xA4] = double_shift;
    t[0xA5] = double_shift;
    t[0xA8] = push_pop_fs_gs;
    t[0xA9] = push_pop_fs_gs;
    t[0xAB] = bit_test;
    t[0xAC] = double_shift;
    t[0xAD] = double_shift;
    t[0xAF] = imul;
    t[0xB0] = cmpxchg;
    t[0xB1] = cmpxchg;
    t[0xB2] = load_far;
    t[0xB3] = bit_test;
    t[0xB4] = load_far;
    t[0xB5] = load_far;
    t[0xB6] = extend;
    t[0xB7] = extend;
    t[0xBA] = grp8;
    t[0xBB] = bit_test;
    t[0xBC] = bit_scan;
    t[0xBD] = bit_scan;
    t[0xBE] = extend;
    t[0xBF] = extend;
    t[0xC0] = xadd;
    t[0xC1] = xadd;
    i = 0xC8;
    while i < 0xD0 {
        t[i] = bswap;
        i += 1;
    }
    t
}

/// Unassigned opcodes, UD2 (0F 0B) included.
fn invalid(_d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Err(CpuException::ud().into())
}

/// Register destinations of SLDT/STR/SMSW follow the operand size; memory
/// destinations are always a word.
fn store_width(d: &DecodeCtx<'_>, register: bool) -> OpSize {
    if register {
        d.osize()
    } else {
        OpSize::Word
    }
}

fn grp6(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let m = d.modrm()?;
    let kind = match m.reg {
        0 => Op::Sldt,
        1 => Op::Str,
        2 => Op::Lldt,
        3 => Op::Ltr,
        4 => Op::Verr,
        5 => Op::Verw,
        _ => return Err(CpuException::ud().into()),
    };
    Ok(if m.reg < 2 {
        let size = store_width(d, m.ea.is_none());
        d.make(kind, size, d.rm(size)?, Operand::None)
    } else {
        d.make(kind, OpSize::Word, Operand::None, d.rm(OpSize::Word)?)
    })
}

fn grp7(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let m = d.modrm()?;
    let size = d.osize();
    Ok(match m.reg {
        0 => d.make(Op::Sgdt, size, d.mem(size)?, Operand::None),
        1 => d.make(Op::Sidt, size, d.mem(size)?, Operand::None),
        2 => d.make(Op::Lgdt, size, Operand::None, d.mem(size)?),
        3 => d.make(Op::Lidt, size, Operand::None, d.mem(size)?),
        4 => {
            let size = store_width(d, m.ea.is_none());
            d.make(Op::Smsw, size, d.rm(size)?, Operand::None)
        }
        6 => d.make(Op::Lmsw, OpSize::Word, Operand::None, d.rm(OpSize::Word)?),
        7 => {
            d.require(CpuType::I486)?;
            d.make(Op::Invlpg, OpSize::Byte, Operand::None, d.mem(OpSize::Byte)?)
        }
        _ => return Err(CpuException::ud().into()),
    })
}

fn lar_lsl(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op == 0x02 { Op::Lar } else { Op::Lsl };
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.rm(OpSize::Word)?);
    Ok(d.make(kind, size, dst, src))
}

fn clts(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Ok(d.make(Op::Clts, OpSize::Byte, Operand::None, Operand::None))
}

fn cache_control(d: &mut DecodeCtx<'_>, op: u8) -> R {
    d.require(CpuType::I486)?;
    let kind = if op == 0x08 { Op::Invd } else { Op::Wbinvd };
    Ok(d.make(kind, OpSize::Byte, Operand::None, Operand::None))
}

/// MOV to/from CRn, DRn, TRn. The mod field is ignored: the r/m operand is
/// always a 32-bit general register.
fn mov_special(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let b = d.fetch()?;
    let (n, gpr) = ((b >> 3) & 7, Operand::reg(b & 7, OpSize::Dword));
    let (kind, special) = match op {
        0x20 | 0x22 => {
            if matches!(n, 1 | 5..=7) || (n == 4 && d.cfg.cpu_type == CpuType::I386) {
                return Err(CpuException::ud().into());
            }
            (Op::MovCr, Operand::Control(n))
        }
        0x21 | 0x23 => (Op::MovDr, Operand::Debug(n)),
        _ => {
            if n < 3 || (n < 6 && d.cfg.cpu_type == CpuType::I386) {
                return Err(CpuException::ud().into());
            }
            (Op::MovTr, Operand::Test(n))
        }
    };
    Ok(if op & 2 == 0 {
        d.make(kind, OpSize::Dword, gpr, special)
    } else {
        d.make(kind, OpSize::Dword, special, gpr)
    })
}

fn jcc_near(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    let src = d.rel(size)?;
    Ok(d.make(Op::Jcc(Cond::from_nibble(op)), size, Operand::None, src))
}

fn setcc(d: &mut DecodeCtx<'_>, op: u8) -> R {
    d.modrm()?;
    let dst = d.rm(OpSize::Byte)?;
    Ok(d.make(Op::Setcc(Cond::from_nibble(op)), OpSize::Byte, dst, Operand::None))
}

fn push_pop_fs_gs(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let seg = Operand::Seg(if op < 0xA8 { SegReg::Fs } else { SegReg::Gs });
    let size = d.osize();
    Ok(if op & 1 == 0 {
        d.make(Op::Push, size, Operand::None, seg)
    } else {
        d.make(Op::Pop, size, seg, Operand::None)
    })
}

fn cpuid(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    d.require(CpuType::I486)?;
    Ok(d.make(Op::Cpuid, OpSize::Dword, Operand::None, Operand::None))
}

fn bit_test(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = match op {
        0xA3 => Op::Bt,
        0xAB => Op::Bts,
        0xB3 => Op::Btr,
        _ => Op::Btc,
    };
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.rm(size)?, d.reg(size)?);
    Ok(d.make(kind, size, dst, src))
}

fn double_shift(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op < 0xAC { Op::Shld } else { Op::Shrd };
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.rm(size)?, d.reg(size)?);
    let count = if op & 1 == 0 {
        d.imm(OpSize::Byte)?
    } else {
        Operand::reg(ECX as u8, OpSize::Byte)
    };
    let mut ins = d.make(kind, size, dst, src);
    ins.aux = count;
    Ok(ins)
}

fn imul(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.rm(size)?);
    let mut ins = d.make(Op::ImulTrunc, size, dst, src);
    ins.aux = dst;
    Ok(ins)
}

fn cmpxchg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    d.require(CpuType::I486)?;
    let size = if op == 0xB0 { OpSize::Byte } else { d.osize() };
    d.modrm()?;
    let (dst, src) = (d.rm(size)?, d.reg(size)?);
    Ok(d.make(Op::Cmpxchg, size, dst, src))
}

fn load_far(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let seg = match op {
        0xB2 => SegReg::Ss,
        0xB4 => SegReg::Fs,
        _ => SegReg::Gs,
    };
    load_far_into(d, seg)
}

fn extend(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op < 0xBE { Op::Movzx } else { Op::Movsx };
    let from = if op & 1 == 0 { OpSize::Byte } else { OpSize::Word };
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.rm(from)?);
    Ok(d.make(kind, size, dst, src))
}

fn grp8(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let size = d.osize();
    let m = d.modrm()?;
    let kind = match m.reg {
        4 => Op::Bt,
        5 => Op::Bts,
        6 => Op::Btr,
        7 => Op::Btc,
        _ => return Err(CpuException::ud().into()),
    };
    let dst = d.rm(size)?;
    let src = d.imm(OpSize::Byte)?;
    Ok(d.make(kind, size, dst, src))
}

fn bit_scan(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op == 0xBC { Op::Bsf } else { Op::Bsr };
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.rm(size)?);
    Ok(d.make(kind, size, dst, src))
}

fn xadd(d: &mut DecodeCtx<'_>, op: u8) -> R {
    d.require(CpuType::I486)?;
    let size = if op == 0xC0 { OpSize::Byte } else { d.osize() };
    d.modrm()?;
    let (dst, src) = (d.rm(size)?, d.reg(size)?);
    Ok(d.make(Op::Xadd, size, dst, src))
}

fn bswap(d: &mut DecodeCtx<'_>, op: u8) -> R {
    d.require(CpuType::I486)?;
    Ok(d.make(Op::Bswap, OpSize::Dword, Operand::reg(op & 7, OpSize::Dword), Operand::None))
}
