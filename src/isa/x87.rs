//! Coprocessor escapes D8..DF.
//!
//! Numeric behaviour lives outside the core; decoding only has to know which
//! encodings exist, how long they are and what they are called.

use crate::decoder::{DecodeCtx, Stop};
use crate::exception::CpuException;
use crate::instructions::{FpuOp, Instruction, Op};
use crate::operand::Operand;
use crate::regs::OpSize;

const ARITH: [&str; 8] = ["fadd", "fmul", "fcom", "fcomp", "fsub", "fsubr", "fdiv", "fdivr"];

const MEM: [[Option<&str>; 8]; 8] = [
    [
        Some("fadd"),
        Some("fmul"),
        Some("fcom"),
        Some("fcomp"),
        Some("fsub"),
        Some("fsubr"),
        Some("fdiv"),
        Some("fdivr"),
    ],
    [
        Some("fld"),
        None,
        Some("fst"),
        Some("fstp"),
        Some("fldenv"),
        Some("fldcw"),
        Some("fnstenv"),
        Some("fnstcw"),
    ],
    [
        Some("fiadd"),
        Some("fimul"),
        Some("ficom"),
        Some("ficomp"),
        Some("fisub"),
        Some("fisubr"),
        Some("fidiv"),
        Some("fidivr"),
    ],
    [
        Some("fild"),
        None,
        Some("fist"),
        Some("fistp"),
        None,
        Some("fld"),
        None,
        Some("fstp"),
    ],
    [
        Some("fadd"),
        Some("fmul"),
        Some("fcom"),
        Some("fcomp"),
        Some("fsub"),
        Some("fsubr"),
        Some("fdiv"),
        Some("fdivr"),
    ],
    [
        Some("fld"),
        None,
        Some("fst"),
        Some("fstp"),
        Some("frstor"),
        None,
        Some("fnsave"),
        Some("fnstsw"),
    ],
    [
        Some("fiadd"),
        Some("fimul"),
        Some("ficom"),
        Some("ficomp"),
        Some("fisub"),
        Some("fisubr"),
        Some("fidiv"),
        Some("fidivr"),
    ],
    [
        Some("fild"),
        None,
        Some("fist"),
        Some("fistp"),
        Some("fbld"),
        Some("fild"),
        Some("fbstp"),
        Some("fistp"),
    ],
];

const D9_E0: [Option<&str>; 8] = [
    Some("fchs"),
    Some("fabs"),
    None,
    None,
    Some("ftst"),
    Some("fxam"),
    None,
    None,
];
const D9_E8: [Option<&str>; 8] = [
    Some("fld1"),
    Some("fldl2t"),
    Some("fldl2e"),
    Some("fldpi"),
    Some("fldlg2"),
    Some("fldln2"),
    Some("fldz"),
    None,
];
const D9_F0: [&str; 8] = [
    "f2xm1", "fyl2x", "fptan", "fpatan", "fxtract", "fprem1", "fdecstp", "fincstp",
];
const D9_F8: [&str; 8] = [
    "fprem", "fyl2xp1", "fsqrt", "fsincos", "frndint", "fscale", "fsin", "fcos",
];

/// Name of the x87 instruction encoded by `escape` (D8..DF) and its ModRM
/// byte, `None` for unassigned encodings.
pub fn mnemonic(escape: u8, modrm: u8) -> Option<&'static str> {
    let esc = (escape & 7) as usize;
    let reg = ((modrm >> 3) & 7) as usize;
    if modrm < 0xC0 {
        return MEM[esc][reg];
    }
    match (esc, reg) {
        (0, _) => Some(ARITH[reg]),
        (1, 0) => Some("fld"),
        (1, 1) => Some("fxch"),
        (1, 2) => (modrm == 0xD0).then_some("fnop"),
        (1, 4) => D9_E0[(modrm & 7) as usize],
        (1, 5) => D9_E8[(modrm & 7) as usize],
        (1, 6) => Some(D9_F0[(modrm & 7) as usize]),
        (1, 7) => Some(D9_F8[(modrm & 7) as usize]),
        (2, _) => (modrm == 0xE9).then_some("fucompp"),
        (3, _) => match modrm {
            0xE0 => Some("feni"),
            0xE1 => Some("fndisi"),
            0xE2 => Some("fnclex"),
            0xE3 => Some("fninit"),
            0xE4 => Some("fsetpm"),
            _ => None,
        },
        // DC reverses the sub/div pairs relative to D8.
        (4, 4) => Some("fsubr"),
        (4, 5) => Some("fsub"),
        (4, 6) => Some("fdivr"),
        (4, 7) => Some("fdiv"),
        (4, _) => Some(ARITH[reg]),
        (5, 0) => Some("ffree"),
        (5, 2) => Some("fst"),
        (5, 3) => Some("fstp"),
        (5, 4) => Some("fucom"),
        (5, 5) => Some("fucomp"),
        (6, 0) => Some("faddp"),
        (6, 1) => Some("fmulp"),
        (6, 3) => (modrm == 0xD9).then_some("fcompp"),
        (6, 4) => Some("fsubrp"),
        (6, 5) => Some("fsubp"),
        (6, 6) => Some("fdivrp"),
        (6, 7) => Some("fdivp"),
        (7, 4) => (modrm == 0xE0).then_some("fnstsw"),
        _ => None,
    }
}

/// Width keyword of a memory-form operand, for listings.
pub fn memory_width(escape: u8, modrm: u8) -> &'static str {
    let reg = (modrm >> 3) & 7;
    match (escape & 7, reg) {
        (0, _) | (1, 0 | 2 | 3) | (2, _) | (3, 0..=3) => "dword",
        (4, _) | (5, 0..=3) | (7, 5 | 7) => "qword",
        (3, 5 | 7) | (7, 4 | 6) => "tbyte",
        (6, _) | (7, _) | (1, 5 | 7) | (5, 7) => "word",
        _ => "",
    }
}

/// D8..DF. Without a coprocessor every encoding is an ESCAPE placeholder that
/// still consumes its ModRM and displacement bytes.
pub fn decode(d: &mut DecodeCtx<'_>, op: u8) -> Result<Instruction, Stop> {
    let m = d.modrm()?;
    let raw = (m.md << 6) | (m.reg << 3) | m.rm;
    let operand = match m.ea {
        Some(_) => d.rm(OpSize::Dword)?,
        None => Operand::St(m.rm),
    };
    if !d.cfg.has_fpu {
        let dst = if operand.is_mem() { operand } else { Operand::None };
        return Ok(d.make(Op::Escape, OpSize::Byte, dst, Operand::None));
    }
    if mnemonic(op, raw).is_none() {
        return Err(CpuException::ud().into());
    }
    let fpu = FpuOp {
        escape: op,
        modrm: raw,
    };
    Ok(d.make(Op::Fpu(fpu), OpSize::Dword, operand, Operand::None))
}
