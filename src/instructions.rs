use serde::{Deserialize, Serialize};

use crate::exception::CpuException;
use crate::operand::Operand;
use crate::regs::{Flags, OpSize, SegReg};

/// Condition codes in opcode order (low nibble of Jcc/SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cond {
    O,
    No,
    B,
    Nb,
    Z,
    Nz,
    Be,
    Nbe,
    S,
    Ns,
    P,
    Np,
    L,
    Nl,
    Le,
    Nle,
}

impl Cond {
    pub fn from_nibble(n: u8) -> Self {
        const ALL: [Cond; 16] = [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Nb,
            Cond::Z,
            Cond::Nz,
            Cond::Be,
            Cond::Nbe,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Nl,
            Cond::Le,
            Cond::Nle,
        ];
        ALL[(n & 0xF) as usize]
    }

    pub fn eval(self, f: Flags) -> bool {
        let cf = f.contains(Flags::CF);
        let zf = f.contains(Flags::ZF);
        let sf = f.contains(Flags::SF);
        let of = f.contains(Flags::OF);
        let pf = f.contains(Flags::PF);
        match self {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Nb => !cf,
            Cond::Z => zf,
            Cond::Nz => !zf,
            Cond::Be => cf || zf,
            Cond::Nbe => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Nl => sf == of,
            Cond::Le => zf || sf != of,
            Cond::Nle => !zf && sf == of,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Nb => "ae",
            Cond::Z => "e",
            Cond::Nz => "ne",
            Cond::Be => "be",
            Cond::Nbe => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Nl => "ge",
            Cond::Le => "le",
            Cond::Nle => "g",
        }
    }
}

/// An x87 instruction: escape opcode (D8..DF) and its ModRM byte. Numeric
/// behaviour is outside the core; the pair is enough to name and size it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpuOp {
    pub escape: u8,
    pub modrm: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    // arithmetic and logic
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    /// One-operand signed multiply into (E)DX:(E)AX.
    Imul,
    /// Two/three-operand signed multiply: dst = src * aux.
    ImulTrunc,
    Div,
    Idiv,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
    Shld,
    Shrd,
    Bt,
    Bts,
    Btr,
    Btc,
    Bsf,
    Bsr,
    Setcc(Cond),
    Bswap,
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,
    // data movement
    Nop,
    Mov,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Cmpxchg,
    Xadd,
    /// CBW / CWDE.
    Cbw,
    /// CWD / CDQ.
    Cwd,
    Xlat,
    Lahf,
    Sahf,
    Salc,
    Push,
    Pop,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,
    /// LDS/LES/LFS/LGS/LSS.
    LoadFar(SegReg),
    // strings
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
    // port I/O
    In,
    Out,
    // flags
    Clc,
    Stc,
    Cmc,
    Cli,
    Sti,
    Cld,
    Std,
    // control transfer
    Jmp,
    Jcc(Cond),
    Jcxz,
    Loop,
    Loope,
    Loopne,
    Call,
    JmpFar,
    CallFar,
    Ret,
    RetFar,
    Int,
    Int3,
    Into,
    Int1,
    Iret,
    Hlt,
    Bound,
    // system
    Lgdt,
    Lidt,
    Sgdt,
    Sidt,
    Lldt,
    Sldt,
    Ltr,
    Str,
    Lar,
    Lsl,
    Verr,
    Verw,
    Arpl,
    Clts,
    Lmsw,
    Smsw,
    MovCr,
    MovDr,
    MovTr,
    Invlpg,
    Invd,
    Wbinvd,
    Cpuid,
    // coprocessor
    Wait,
    /// Coprocessor escape placeholder; zero-length when synthesised ahead of
    /// the first x87 instruction of a block.
    Escape,
    Fpu(FpuOp),
    /// A fault found while decoding, raised when execution reaches it.
    Raise(CpuException),
}

impl Op {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Or => "or",
            Op::Adc => "adc",
            Op::Sbb => "sbb",
            Op::And => "and",
            Op::Sub => "sub",
            Op::Xor => "xor",
            Op::Cmp => "cmp",
            Op::Test => "test",
            Op::Inc => "inc",
            Op::Dec => "dec",
            Op::Neg => "neg",
            Op::Not => "not",
            Op::Mul => "mul",
            Op::Imul | Op::ImulTrunc => "imul",
            Op::Div => "div",
            Op::Idiv => "idiv",
            Op::Rol => "rol",
            Op::Ror => "ror",
            Op::Rcl => "rcl",
            Op::Rcr => "rcr",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Sar => "sar",
            Op::Shld => "shld",
            Op::Shrd => "shrd",
            Op::Bt => "bt",
            Op::Bts => "bts",
            Op::Btr => "btr",
            Op::Btc => "btc",
            Op::Bsf => "bsf",
            Op::Bsr => "bsr",
            Op::Setcc(_) => "set",
            Op::Bswap => "bswap",
            Op::Daa => "daa",
            Op::Das => "das",
            Op::Aaa => "aaa",
            Op::Aas => "aas",
            Op::Aam => "aam",
            Op::Aad => "aad",
            Op::Nop => "nop",
            Op::Mov | Op::MovCr | Op::MovDr | Op::MovTr => "mov",
            Op::Movzx => "movzx",
            Op::Movsx => "movsx",
            Op::Lea => "lea",
            Op::Xchg => "xchg",
            Op::Cmpxchg => "cmpxchg",
            Op::Xadd => "xadd",
            Op::Cbw => "cbw",
            Op::Cwd => "cwd",
            Op::Xlat => "xlat",
            Op::Lahf => "lahf",
            Op::Sahf => "sahf",
            Op::Salc => "salc",
            Op::Push => "push",
            Op::Pop => "pop",
            Op::Pusha => "pusha",
            Op::Popa => "popa",
            Op::Pushf => "pushf",
            Op::Popf => "popf",
            Op::Enter => "enter",
            Op::Leave => "leave",
            Op::LoadFar(SegReg::Ds) => "lds",
            Op::LoadFar(SegReg::Es) => "les",
            Op::LoadFar(SegReg::Fs) => "lfs",
            Op::LoadFar(SegReg::Gs) => "lgs",
            Op::LoadFar(_) => "lss",
            Op::Movs => "movs",
            Op::Cmps => "cmps",
            Op::Stos => "stos",
            Op::Lods => "lods",
            Op::Scas => "scas",
            Op::Ins => "ins",
            Op::Outs => "outs",
            Op::In => "in",
            Op::Out => "out",
            Op::Clc => "clc",
            Op::Stc => "stc",
            Op::Cmc => "cmc",
            Op::Cli => "cli",
            Op::Sti => "sti",
            Op::Cld => "cld",
            Op::Std => "std",
            Op::Jmp | Op::JmpFar => "jmp",
            Op::Jcc(_) => "j",
            Op::Jcxz => "jcxz",
            Op::Loop => "loop",
            Op::Loope => "loope",
            Op::Loopne => "loopne",
            Op::Call | Op::CallFar => "call",
            Op::Ret => "ret",
            Op::RetFar => "retf",
            Op::Int => "int",
            Op::Int3 => "int3",
            Op::Into => "into",
            Op::Int1 => "int1",
            Op::Iret => "iret",
            Op::Hlt => "hlt",
            Op::Bound => "bound",
            Op::Lgdt => "lgdt",
            Op::Lidt => "lidt",
            Op::Sgdt => "sgdt",
            Op::Sidt => "sidt",
            Op::Lldt => "lldt",
            Op::Sldt => "sldt",
            Op::Ltr => "ltr",
            Op::Str => "str",
            Op::Lar => "lar",
            Op::Lsl => "lsl",
            Op::Verr => "verr",
            Op::Verw => "verw",
            Op::Arpl => "arpl",
            Op::Clts => "clts",
            Op::Lmsw => "lmsw",
            Op::Smsw => "smsw",
            Op::Invlpg => "invlpg",
            Op::Invd => "invd",
            Op::Wbinvd => "wbinvd",
            Op::Cpuid => "cpuid",
            Op::Wait => "wait",
            Op::Escape => "esc",
            Op::Fpu(f) => crate::isa::x87::mnemonic(f.escape, f.modrm).unwrap_or("fpu?"),
            Op::Raise(_) => "(fault)",
        }
    }

    /// String and string-I/O moves: REP of either flavour repeats on (E)CX.
    pub fn is_string_move(&self) -> bool {
        matches!(self, Op::Movs | Op::Stos | Op::Lods | Op::Ins | Op::Outs)
    }

    /// String compare/scan: REPZ/REPNZ also test ZF.
    pub fn is_string_compare(&self) -> bool {
        matches!(self, Op::Cmps | Op::Scas)
    }

    pub fn is_fpu(&self) -> bool {
        matches!(self, Op::Fpu(_))
    }

    /// Instructions that accept a LOCK prefix (with a memory destination).
    pub fn lockable(&self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Or
                | Op::Adc
                | Op::Sbb
                | Op::And
                | Op::Sub
                | Op::Xor
                | Op::Inc
                | Op::Dec
                | Op::Neg
                | Op::Not
                | Op::Xchg
                | Op::Bts
                | Op::Btr
                | Op::Btc
                | Op::Cmpxchg
                | Op::Xadd
        )
    }

    /// Instructions after which the rest of the block cannot be assumed to run
    /// with the same CS:EIP, mode or mapping.
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Op::Jmp
                | Op::Jcc(_)
                | Op::Jcxz
                | Op::Loop
                | Op::Loope
                | Op::Loopne
                | Op::Call
                | Op::JmpFar
                | Op::CallFar
                | Op::Ret
                | Op::RetFar
                | Op::Int
                | Op::Int3
                | Op::Into
                | Op::Int1
                | Op::Iret
                | Op::Hlt
                | Op::Sti
                | Op::Popf
                | Op::Lmsw
                | Op::Clts
                | Op::Invlpg
                | Op::Raise(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepKind {
    Rep,
    Repz,
    Repnz,
}

/// Repeat control attached to a string instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeat {
    pub kind: RepKind,
    /// CX or ECX, per address size.
    pub counter: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    /// Operand size.
    pub size: OpSize,
    pub addr32: bool,
    pub dst: Operand,
    pub src: Operand,
    /// Third operand: IMUL immediate, SHLD/SHRD count, ENTER nesting level.
    pub aux: Operand,
    /// EIP of the first byte (prefixes included); faults restart here.
    pub start: u32,
    /// EIP of the next instruction.
    pub end: u32,
    pub rep: Option<Repeat>,
    pub lock: bool,
    pub wait: bool,
    pub seg_override: Option<SegReg>,
}

impl Instruction {
    pub fn new(op: Op, size: OpSize) -> Self {
        Self {
            op,
            size,
            addr32: false,
            dst: Operand::None,
            src: Operand::None,
            aux: Operand::None,
            start: 0,
            end: 0,
            rep: None,
            lock: false,
            wait: false,
            seg_override: None,
        }
    }

    pub fn with(op: Op, size: OpSize, dst: Operand, src: Operand) -> Self {
        Self {
            dst,
            src,
            ..Self::new(op, size)
        }
    }

    pub fn len(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// MOV to a control register switches modes or mappings.
    pub fn ends_block(&self) -> bool {
        self.op.ends_block()
            || (self.op == Op::MovCr && matches!(self.dst, Operand::Control(_)))
    }
}
