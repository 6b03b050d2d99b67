use crate::block::CodeBlock;
use crate::cpu::{Cpu, Trap};
use crate::decoder::{decode_block_with, DecodeCtx, Decoder, Handler, Stop};
use crate::exception::CpuException;
use crate::instructions::{Cond, Instruction, Op};
use crate::isa::{i386_0f, x87};
use crate::memory::Bus;
use crate::operand::Operand;
use crate::regs::{OpSize, SegReg, EAX, ECX, EDX};

/// i386/i486 decoder: one-byte opcode map, with 0x0F escaping into
/// [`i386_0f::TABLE`] and D8..DF into [`x87`].
#[derive(Debug, Default, Clone, Copy)]
pub struct I386Decoder;

impl I386Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for I386Decoder {
    fn decode_block(&self, cpu: &mut Cpu, bus: &mut dyn Bus) -> Result<CodeBlock, Trap> {
        decode_block_with(cpu, bus, &TABLE)
    }
}

type R = Result<Instruction, Stop>;

pub static TABLE: [Handler; 256] = build();

const fn build() -> [Handler; 256] {
    let mut t: [Handler; 256] = [alu as Handler; 256];
    // 00..3F: ALU block rows with segment pushes, prefixes and BCD in columns 6/7
    t[0x06] = push_seg;
    t[0x07] = pop_seg;
    t[0x0E] = push_seg;
    t[0x0F] = escape_0f;
    t[0x16] = push_seg;
    t[0x17] = pop_seg;
    t[0x1E] = push_seg;
    t[0x1F] = pop_seg;
    t[0x26] = prefix;
    t[0x27] = bcd;
    t[0x2E] = prefix;
    t[0x2F] = bcd;
    t[0x36] = prefix;
    t[0x37] = bcd;
    t[0x3E] = prefix;
    t[0x3F] = bcd;
    let mut i = 0x40;
    while i < 0x50 {
        t[i] = inc_dec_reg;
        i += 1;
    }
    while i < 0x58 {
        t[i] = push_reg;
        i += 1;
    }
    while i < 0x60 {
        t[i] = pop_reg;
        i += 1;
    }
    t[0x60] = pusha_popa;
    t[0x61] = pusha_popa;
    t[0x62] = bound;
    t[0x63] = arpl;
    t[0x64] = prefix;
    t[0x65] = prefix;
    t[0x66] = prefix;
    t[0x67] = prefix;
    t[0x68] = push_imm;
    t[0x69] = imul_imm;
    t[0x6A] = push_imm;
    t[0x6B] = imul_imm;
    t[0x6C] = string;
    t[0x6D] = string;
    t[0x6E] = string;
    t[0x6F] = string;
    i = 0x70;
    while i < 0x80 {
        t[i] = jcc_short;
        i += 1;
    }
    t[0x80] = grp1;
    t[0x81] = grp1;
    t[0x82] = grp1;
    t[0x83] = grp1;
    t[0x84] = test_xchg;
    t[0x85] = test_xchg;
    t[0x86] = test_xchg;
    t[0x87] = test_xchg;
    t[0x88] = mov_rm;
    t[0x89] = mov_rm;
    t[0x8A] = mov_rm;
    t[0x8B] = mov_rm;
    t[0x8C] = mov_from_sreg;
    t[0x8D] = lea;
    t[0x8E] = mov_to_sreg;
    t[0x8F] = pop_rm;
    t[0x90] = nop;
    i = 0x91;
    while i < 0x98 {
        t[i] = xchg_ax;
        i += 1;
    }
    t[0x98] = convert;
    t[0x99] = convert;
    t[0x9A] = far_direct;
    t[0x9B] = wait;
    t[0x9C] = flags_stack;
    t[0x9D] = flags_stack;
    t[0x9E] = flags_stack;
    t[0x9F] = flags_stack;
    t[0xA0] = mov_moffs;
    t[0xA1] = mov_moffs;
    t[0xA2] = mov_moffs;
    t[0xA3] = mov_moffs;
    t[0xA4] = string;
    t[0xA5] = string;
    t[0xA6] = string;
    t[0xA7] = string;
    t[0xA8] = test_acc;
    t[0xA9] = test_acc;
    i = 0xAA;
    while i < 0xB0 {
        t[i] = string;
        i += 1;
    }
    while i < 0xC0 {
        t[i] = mov_reg_imm;
        i += 1;
    }
    t[0xC0] = grp2;
    t[0xC1] = grp2;
    t[0xC2] = ret_near;
    t[0xC3] = ret_near;
    t[0xC4] = load_far;
    t[0xC5] = load_far;
    t[0xC6] = mov_rm_imm;
    t[0xC7] = mov_rm_imm;
    t[0xC8] = enter;
    t[0xC9] = leave;
    t[0xCA] = ret_far;
    t[0xCB] = ret_far;
    t[0xCC] = int;
    t[0xCD] = int;
    t[0xCE] = int;
    t[0xCF] = iret;
    t[0xD0] = grp2;
    t[0xD1] = grp2;
    t[0xD2] = grp2;
    t[0xD3] = grp2;
    t[0xD4] = aam_aad;
    t[0xD5] = aam_aad;
    t[0xD6] = salc;
    t[0xD7] = xlat;
    i = 0xD8;
    while i < 0xE0 {
        t[i] = x87::decode;
        i += 1;
    }
    t[0xE0] = loop_jcxz;
    t[0xE1] = loop_jcxz;
    t[0xE2] = loop_jcxz;
    t[0xE3] = loop_jcxz;
    t[0xE4] = port_io;
    t[0xE5] = port_io;
    t[0xE6] = port_io;
    t[0xE7] = port_io;
    t[0xE8] = call_jmp_rel;
    t[0xE9] = call_jmp_rel;
    t[0xEA] = far_direct;
    t[0xEB] = call_jmp_rel;
    t[0xEC] = port_io;
    t[0xED] = port_io;
    t[0xEE] = port_io;
    t[0xEF] = port_io;
    t[0xF0] = prefix;
    t[0xF1] = int;
    t[0xF2] = prefix;
    t[0xF3] = prefix;
    t[0xF4] = simple;
    t[0xF5] = simple;
    t[0xF6] = grp3;
    t[0xF7] = grp3;
    i = 0xF8;
    while i < 0xFE {
        t[i] = simple;
        i += 1;
    }
    t[0xFE] = grp4;
    t[0xFF] = grp5;
    t
}

const ALU: [Op; 8] = [
    Op::Add,
    Op::Or,
    Op::Adc,
    Op::Sbb,
    Op::And,
    Op::Sub,
    Op::Xor,
    Op::Cmp,
];

const SHIFT: [Op; 8] = [
    Op::Rol,
    Op::Ror,
    Op::Rcl,
    Op::Rcr,
    Op::Shl,
    Op::Shr,
    Op::Shl, // SAL
    Op::Sar,
];

fn byte_or_full(d: &DecodeCtx<'_>, op: u8) -> OpSize {
    if op & 1 == 0 {
        OpSize::Byte
    } else {
        d.osize()
    }
}

fn acc(size: OpSize) -> Operand {
    Operand::reg(EAX as u8, size)
}

/// The four ModRM directions shared by the ALU rows and MOV 88..8B:
/// Eb,Gb / Ev,Gv / Gb,Eb / Gv,Ev.
fn rm_reg_pair(d: &mut DecodeCtx<'_>, op: u8) -> Result<(OpSize, Operand, Operand), Stop> {
    let size = byte_or_full(d, op);
    d.modrm()?;
    let (rm, reg) = (d.rm(size)?, d.reg(size)?);
    Ok(if op & 2 == 0 { (size, rm, reg) } else { (size, reg, rm) })
}

fn alu(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = ALU[(op >> 3) as usize & 7];
    match op & 7 {
        0..=3 => {
            let (size, dst, src) = rm_reg_pair(d, op)?;
            Ok(d.make(kind, size, dst, src))
        }
        4 => {
            let src = d.imm(OpSize::Byte)?;
            Ok(d.make(kind, OpSize::Byte, acc(OpSize::Byte), src))
        }
        _ => {
            let size = d.osize();
            let src = d.imm(size)?;
            Ok(d.make(kind, size, acc(size), src))
        }
    }
}

fn prefix(d: &mut DecodeCtx<'_>, op: u8) -> R {
    match op {
        0x26 => d.prefixes.seg = Some(SegReg::Es),
        0x2E => d.prefixes.seg = Some(SegReg::Cs),
        0x36 => d.prefixes.seg = Some(SegReg::Ss),
        0x3E => d.prefixes.seg = Some(SegReg::Ds),
        0x64 => d.prefixes.seg = Some(SegReg::Fs),
        0x65 => d.prefixes.seg = Some(SegReg::Gs),
        0x66 => d.prefixes.opsize = true,
        0x67 => d.prefixes.addrsize = true,
        0xF0 => d.prefixes.lock = true,
        _ => d.prefixes.rep = Some(op),
    }
    let next = d.fetch()?;
    TABLE[next as usize](d, next)
}

fn escape_0f(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let next = d.fetch()?;
    i386_0f::TABLE[next as usize](d, next)
}

fn seg_of(op: u8) -> SegReg {
    match op >> 3 {
        0 => SegReg::Es,
        1 => SegReg::Cs,
        2 => SegReg::Ss,
        _ => SegReg::Ds,
    }
}

fn push_seg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    Ok(d.make(Op::Push, d.osize(), Operand::None, Operand::Seg(seg_of(op))))
}

fn pop_seg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    Ok(d.make(Op::Pop, d.osize(), Operand::Seg(seg_of(op)), Operand::None))
}

fn bcd(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = match op {
        0x27 => Op::Daa,
        0x2F => Op::Das,
        0x37 => Op::Aaa,
        _ => Op::Aas,
    };
    Ok(d.make(kind, OpSize::Byte, Operand::None, Operand::None))
}

fn inc_dec_reg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op < 0x48 { Op::Inc } else { Op::Dec };
    let size = d.osize();
    Ok(d.make(kind, size, Operand::reg(op & 7, size), Operand::None))
}

fn push_reg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    Ok(d.make(Op::Push, size, Operand::None, Operand::reg(op & 7, size)))
}

fn pop_reg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    Ok(d.make(Op::Pop, size, Operand::reg(op & 7, size), Operand::None))
}

fn pusha_popa(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op == 0x60 { Op::Pusha } else { Op::Popa };
    Ok(d.make(kind, d.osize(), Operand::None, Operand::None))
}

fn bound(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.mem(size)?);
    Ok(d.make(Op::Bound, size, dst, src))
}

fn arpl(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    d.modrm()?;
    let (dst, src) = (d.rm(OpSize::Word)?, d.reg(OpSize::Word)?);
    Ok(d.make(Op::Arpl, OpSize::Word, dst, src))
}

fn push_imm(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    let src = if op == 0x68 { d.imm(size)? } else { d.simm8(size)? };
    Ok(d.make(Op::Push, size, Operand::None, src))
}

fn imul_imm(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.rm(size)?);
    let mut ins = d.make(Op::ImulTrunc, size, dst, src);
    ins.aux = if op == 0x69 { d.imm(size)? } else { d.simm8(size)? };
    Ok(ins)
}

fn string(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = match op & !1 {
        0x6C => Op::Ins,
        0x6E => Op::Outs,
        0xA4 => Op::Movs,
        0xA6 => Op::Cmps,
        0xAA => Op::Stos,
        0xAC => Op::Lods,
        _ => Op::Scas,
    };
    let size = byte_or_full(d, op);
    Ok(d.make(kind, size, Operand::None, Operand::None))
}

fn jcc_short(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let src = d.rel(OpSize::Byte)?;
    Ok(d.make(Op::Jcc(Cond::from_nibble(op)), d.osize(), Operand::None, src))
}

fn grp1(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let m = d.modrm()?;
    let dst = d.rm(size)?;
    let src = match op {
        0x81 => d.imm(size)?,
        0x83 => d.simm8(size)?,
        _ => d.imm(OpSize::Byte)?,
    };
    Ok(d.make(ALU[m.reg as usize], size, dst, src))
}

fn test_xchg(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op < 0x86 { Op::Test } else { Op::Xchg };
    let size = byte_or_full(d, op);
    d.modrm()?;
    let (dst, src) = (d.rm(size)?, d.reg(size)?);
    Ok(d.make(kind, size, dst, src))
}

fn mov_rm(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let (size, dst, src) = rm_reg_pair(d, op)?;
    Ok(d.make(Op::Mov, size, dst, src))
}

fn mov_from_sreg(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let m = d.modrm()?;
    let seg = SegReg::from_index(m.reg).ok_or(CpuException::ud())?;
    // A register destination takes the operand size; memory is always 16 bits.
    let size = if m.ea.is_none() { d.osize() } else { OpSize::Word };
    let dst = d.rm(size)?;
    Ok(d.make(Op::Mov, size, dst, Operand::Seg(seg)))
}

fn lea(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.mem(size)?);
    Ok(d.make(Op::Lea, size, dst, src))
}

fn mov_to_sreg(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let m = d.modrm()?;
    let seg = match SegReg::from_index(m.reg) {
        Some(SegReg::Cs) | None => return Err(CpuException::ud().into()),
        Some(s) => s,
    };
    let src = d.rm(OpSize::Word)?;
    Ok(d.make(Op::Mov, OpSize::Word, Operand::Seg(seg), src))
}

fn pop_rm(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let size = d.osize();
    let m = d.modrm()?;
    if m.reg != 0 {
        return Err(CpuException::ud().into());
    }
    let dst = d.rm(size)?;
    Ok(d.make(Op::Pop, size, dst, Operand::None))
}

fn nop(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Ok(d.make(Op::Nop, d.osize(), Operand::None, Operand::None))
}

fn xchg_ax(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    Ok(d.make(Op::Xchg, size, acc(size), Operand::reg(op & 7, size)))
}

fn convert(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op == 0x98 { Op::Cbw } else { Op::Cwd };
    Ok(d.make(kind, d.osize(), Operand::None, Operand::None))
}

fn far_direct(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    let offset = d.imm_of(size)?;
    let selector = d.imm16()?;
    let kind = if op == 0x9A { Op::CallFar } else { Op::JmpFar };
    Ok(d.make(kind, size, Operand::None, Operand::Far { selector, offset }))
}

/// 9B in front of an escape opcode is folded into the x87 instruction;
/// elsewhere it is a standalone WAIT.
fn wait(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    match d.peek() {
        Some(next @ 0xD8..=0xDF) => {
            d.fetch()?;
            d.prefixes.wait = true;
            x87::decode(d, next)
        }
        _ => Ok(d.make(Op::Wait, OpSize::Byte, Operand::None, Operand::None)),
    }
}

fn flags_stack(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let (kind, size) = match op {
        0x9C => (Op::Pushf, d.osize()),
        0x9D => (Op::Popf, d.osize()),
        0x9E => (Op::Sahf, OpSize::Byte),
        _ => (Op::Lahf, OpSize::Byte),
    };
    Ok(d.make(kind, size, Operand::None, Operand::None))
}

fn mov_moffs(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let mem = d.moffs(size)?;
    Ok(if op < 0xA2 {
        d.make(Op::Mov, size, acc(size), mem)
    } else {
        d.make(Op::Mov, size, mem, acc(size))
    })
}

fn test_acc(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let src = d.imm(size)?;
    Ok(d.make(Op::Test, size, acc(size), src))
}

fn mov_reg_imm(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = if op < 0xB8 { OpSize::Byte } else { d.osize() };
    let src = d.imm(size)?;
    Ok(d.make(Op::Mov, size, Operand::reg(op & 7, size), src))
}

fn grp2(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let m = d.modrm()?;
    let dst = d.rm(size)?;
    let count = match op {
        0xC0 | 0xC1 => d.imm(OpSize::Byte)?,
        0xD0 | 0xD1 => Operand::Imm(1),
        _ => Operand::reg(ECX as u8, OpSize::Byte),
    };
    Ok(d.make(SHIFT[m.reg as usize], size, dst, count))
}

fn ret_near(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let src = if op == 0xC2 {
        d.imm(OpSize::Word)?
    } else {
        Operand::Imm(0)
    };
    Ok(d.make(Op::Ret, d.osize(), Operand::None, src))
}

fn load_far(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let seg = if op == 0xC4 { SegReg::Es } else { SegReg::Ds };
    load_far_into(d, seg)
}

/// LDS/LES/LSS/LFS/LGS: Gv, Mp.
pub(crate) fn load_far_into(d: &mut DecodeCtx<'_>, seg: SegReg) -> R {
    let size = d.osize();
    d.modrm()?;
    let (dst, src) = (d.reg(size)?, d.mem(size)?);
    Ok(d.make(Op::LoadFar(seg), size, dst, src))
}

fn mov_rm_imm(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let m = d.modrm()?;
    if m.reg != 0 {
        return Err(CpuException::ud().into());
    }
    let dst = d.rm(size)?;
    let src = d.imm(size)?;
    Ok(d.make(Op::Mov, size, dst, src))
}

fn enter(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let frame = d.imm(OpSize::Word)?;
    let mut ins = d.make(Op::Enter, d.osize(), Operand::None, frame);
    ins.aux = d.imm(OpSize::Byte)?;
    Ok(ins)
}

fn leave(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Ok(d.make(Op::Leave, d.osize(), Operand::None, Operand::None))
}

fn ret_far(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let src = if op == 0xCA {
        d.imm(OpSize::Word)?
    } else {
        Operand::Imm(0)
    };
    Ok(d.make(Op::RetFar, d.osize(), Operand::None, src))
}

fn int(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let (kind, vector) = match op {
        0xCC => (Op::Int3, Operand::Imm(3)),
        0xCD => (Op::Int, d.imm(OpSize::Byte)?),
        0xCE => (Op::Into, Operand::Imm(4)),
        _ => (Op::Int1, Operand::Imm(1)),
    };
    Ok(d.make(kind, d.osize(), Operand::None, vector))
}

fn iret(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Ok(d.make(Op::Iret, d.osize(), Operand::None, Operand::None))
}

fn aam_aad(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = if op == 0xD4 { Op::Aam } else { Op::Aad };
    let base = d.imm(OpSize::Byte)?;
    Ok(d.make(kind, OpSize::Byte, Operand::None, base))
}

fn salc(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Ok(d.make(Op::Salc, OpSize::Byte, acc(OpSize::Byte), Operand::None))
}

fn xlat(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    Ok(d.make(Op::Xlat, OpSize::Byte, acc(OpSize::Byte), Operand::None))
}

fn loop_jcxz(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = match op {
        0xE0 => Op::Loopne,
        0xE1 => Op::Loope,
        0xE2 => Op::Loop,
        _ => Op::Jcxz,
    };
    let src = d.rel(OpSize::Byte)?;
    Ok(d.make(kind, d.osize(), Operand::None, src))
}

fn port_io(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let port = if op < 0xE8 {
        d.imm(OpSize::Byte)?
    } else {
        Operand::reg(EDX as u8, OpSize::Word)
    };
    Ok(if op & 2 == 0 {
        d.make(Op::In, size, acc(size), port)
    } else {
        d.make(Op::Out, size, port, acc(size))
    })
}

fn call_jmp_rel(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = d.osize();
    let (kind, rel) = match op {
        0xE8 => (Op::Call, d.rel(size)?),
        0xE9 => (Op::Jmp, d.rel(size)?),
        _ => (Op::Jmp, d.rel(OpSize::Byte)?),
    };
    Ok(d.make(kind, size, Operand::None, rel))
}

fn simple(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let kind = match op {
        0xF4 => Op::Hlt,
        0xF5 => Op::Cmc,
        0xF8 => Op::Clc,
        0xF9 => Op::Stc,
        0xFA => Op::Cli,
        0xFB => Op::Sti,
        0xFC => Op::Cld,
        _ => Op::Std,
    };
    Ok(d.make(kind, OpSize::Byte, Operand::None, Operand::None))
}

fn grp3(d: &mut DecodeCtx<'_>, op: u8) -> R {
    let size = byte_or_full(d, op);
    let m = d.modrm()?;
    let rm = d.rm(size)?;
    Ok(match m.reg {
        0 | 1 => {
            let src = d.imm(size)?;
            d.make(Op::Test, size, rm, src)
        }
        2 => d.make(Op::Not, size, rm, Operand::None),
        3 => d.make(Op::Neg, size, rm, Operand::None),
        4 => d.make(Op::Mul, size, Operand::None, rm),
        5 => d.make(Op::Imul, size, Operand::None, rm),
        6 => d.make(Op::Div, size, Operand::None, rm),
        _ => d.make(Op::Idiv, size, Operand::None, rm),
    })
}

fn grp4(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let m = d.modrm()?;
    let kind = match m.reg {
        0 => Op::Inc,
        1 => Op::Dec,
        _ => return Err(CpuException::ud().into()),
    };
    let dst = d.rm(OpSize::Byte)?;
    Ok(d.make(kind, OpSize::Byte, dst, Operand::None))
}

fn grp5(d: &mut DecodeCtx<'_>, _op: u8) -> R {
    let size = d.osize();
    let m = d.modrm()?;
    Ok(match m.reg {
        0 => d.make(Op::Inc, size, d.rm(size)?, Operand::None),
        1 => d.make(Op::Dec, size, d.rm(size)?, Operand::None),
        2 => d.make(Op::Call, size, Operand::None, d.rm(size)?),
        3 => d.make(Op::CallFar, size, Operand::None, d.mem(size)?),
        4 => d.make(Op::Jmp, size, Operand::None, d.rm(size)?),
        5 => d.make(Op::JmpFar, size, Operand::None, d.mem(size)?),
        6 => d.make(Op::Push, size, Operand::None, d.rm(size)?),
        _ => return Err(CpuException::ud().into()),
    })
}
