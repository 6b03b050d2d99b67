//! Byte-stream decoding into [`CodeBlock`]s.
//!
//! [`DecodeCtx`] is the cursor the opcode handlers in [`crate::isa`] pull bytes
//! from. It owns the per-instruction scratch state (prefixes, ModRM) and the
//! page-crossing rule: once a block holds one instruction, any byte outside
//! the block's first page stops the block with [`Stop::PageCross`] so the
//! instruction is decoded again at the head of the next block.

use crate::block::{CodeBlock, PhysRange};
use crate::cpu::{Cpu, CpuConfig, CpuType, Trap};
use crate::exception::CpuException;
use crate::instructions::{Instruction, Op, RepKind, Repeat};
use crate::isa::modrm::{decode_modrm, ByteSource, EffectiveAddress, ModRm};
use crate::memory::Bus;
use crate::operand::{MemRef, Operand};
use crate::regs::{OpSize, SegReg, ECX};

const MAX_INSTRUCTION_LEN: u32 = 15;

pub trait Decoder {
    /// Decodes the block starting at the current CS:EIP.
    fn decode_block(&self, cpu: &mut Cpu, bus: &mut dyn Bus) -> Result<CodeBlock, Trap>;
}

/// Why decoding of the current instruction did not produce one.
#[derive(Debug)]
pub enum Stop {
    /// The instruction reaches into the next page; end the block before it.
    PageCross,
    Trap(Trap),
}

impl From<Trap> for Stop {
    fn from(t: Trap) -> Self {
        Stop::Trap(t)
    }
}

impl From<CpuException> for Stop {
    fn from(e: CpuException) -> Self {
        Stop::Trap(Trap::Exception(e))
    }
}

/// Decode handler for one opcode byte.
pub type Handler = fn(&mut DecodeCtx<'_>, u8) -> Result<Instruction, Stop>;

#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub opsize: bool,
    pub addrsize: bool,
    /// 0xF2 or 0xF3.
    pub rep: Option<u8>,
    pub lock: bool,
    pub wait: bool,
    pub seg: Option<SegReg>,
}

pub struct DecodeCtx<'a> {
    cpu: &'a mut Cpu,
    bus: &'a mut dyn Bus,
    pub cfg: CpuConfig,
    cs_base: u32,
    code32: bool,
    block_page: u32,
    cursor: u32,
    instr_start: u32,
    length: u32,
    decoded: usize,
    pub prefixes: Prefixes,
    modrm: Option<ModRm>,
    head: Option<PhysRange>,
    tail: Option<PhysRange>,
    tail_linear: Option<u32>,
}

impl<'a> DecodeCtx<'a> {
    pub fn new(cpu: &'a mut Cpu, bus: &'a mut dyn Bus) -> Self {
        let cs = *cpu.regs.seg(SegReg::Cs);
        let eip = cpu.regs.eip;
        Self {
            cfg: cpu.cfg,
            cs_base: cs.base(),
            code32: cs.is_size32(),
            block_page: cs.base().wrapping_add(eip) >> 12,
            cursor: eip,
            instr_start: eip,
            length: 0,
            decoded: 0,
            prefixes: Prefixes::default(),
            modrm: None,
            head: None,
            tail: None,
            tail_linear: None,
            cpu,
            bus,
        }
    }

    fn begin_instruction(&mut self) {
        self.instr_start = self.cursor;
        self.length = 0;
        self.prefixes = Prefixes::default();
        self.modrm = None;
    }

    pub fn fetch(&mut self) -> Result<u8, Stop> {
        if self.length >= MAX_INSTRUCTION_LEN {
            return Err(CpuException::gp0().into());
        }
        let offset = self.cursor;
        let linear = self.cs_base.wrapping_add(offset);
        let in_block_page = linear >> 12 == self.block_page;
        if !in_block_page && self.decoded > 0 {
            return Err(Stop::PageCross);
        }
        let (b, phys) = self.cpu.fetch_code_byte(&mut *self.bus, offset)?;
        if !in_block_page {
            self.tail_linear = Some(linear & !0xFFF);
        }
        let range = if in_block_page { &mut self.head } else { &mut self.tail };
        *range = Some(match *range {
            Some(mut r) => {
                r.extend(phys);
                r
            }
            None => PhysRange::at(phys),
        });
        self.cursor = if self.code32 {
            offset.wrapping_add(1)
        } else {
            offset.wrapping_add(1) & 0xFFFF
        };
        self.length += 1;
        Ok(b)
    }

    /// Looks at the next byte without consuming it. `None` when it cannot be
    /// fetched from here.
    pub fn peek(&mut self) -> Option<u8> {
        let saved = (
            self.cursor,
            self.length,
            self.head,
            self.tail,
            self.tail_linear,
        );
        let b = self.fetch().ok();
        (
            self.cursor,
            self.length,
            self.head,
            self.tail,
            self.tail_linear,
        ) = saved;
        b
    }

    pub fn imm8(&mut self) -> Result<u8, Stop> {
        self.fetch()
    }

    pub fn imm16(&mut self) -> Result<u16, Stop> {
        self.next_u16()
    }

    pub fn imm32(&mut self) -> Result<u32, Stop> {
        self.next_u32()
    }

    /// Immediate of the given width, zero-extended.
    pub fn imm_of(&mut self, size: OpSize) -> Result<u32, Stop> {
        Ok(match size {
            OpSize::Byte => self.imm8()? as u32,
            OpSize::Word => self.imm16()? as u32,
            OpSize::Dword => self.imm32()?,
        })
    }

    pub fn imm(&mut self, size: OpSize) -> Result<Operand, Stop> {
        Ok(Operand::Imm(self.imm_of(size)?))
    }

    /// Sign-extended imm8, truncated to `size`.
    pub fn simm8(&mut self, size: OpSize) -> Result<Operand, Stop> {
        let v = self.imm8()? as i8 as i32 as u32;
        Ok(Operand::Imm(v & size.mask()))
    }

    /// Branch displacement of the operand size, sign-extended to 32 bits.
    pub fn rel(&mut self, size: OpSize) -> Result<Operand, Stop> {
        let v = match size {
            OpSize::Byte => self.imm8()? as i8 as i32 as u32,
            OpSize::Word => self.imm16()? as i16 as i32 as u32,
            OpSize::Dword => self.imm32()?,
        };
        Ok(Operand::Imm(v))
    }

    pub fn op32(&self) -> bool {
        self.code32 ^ self.prefixes.opsize
    }

    pub fn addr32(&self) -> bool {
        self.code32 ^ self.prefixes.addrsize
    }

    /// Word or dword per the effective operand size.
    pub fn osize(&self) -> OpSize {
        OpSize::from_32(self.op32())
    }

    pub fn require(&self, cpu_type: CpuType) -> Result<(), Stop> {
        if cpu_type == CpuType::I486 && self.cfg.cpu_type == CpuType::I386 {
            return Err(CpuException::ud().into());
        }
        Ok(())
    }

    /// Decodes the ModRM byte (plus SIB and displacement). Legal once per
    /// instruction.
    pub fn modrm(&mut self) -> Result<ModRm, Stop> {
        if self.modrm.is_some() {
            return Err(Trap::Internal("ModRM decoded twice").into());
        }
        let byte = self.fetch()?;
        let addr32 = self.addr32();
        let m = decode_modrm(self, byte, addr32)?;
        self.modrm = Some(m);
        Ok(m)
    }

    fn current_modrm(&self) -> Result<ModRm, Stop> {
        self.modrm
            .ok_or(Stop::Trap(Trap::Internal("operand requested before ModRM")))
    }

    pub fn mem_operand(&self, ea: EffectiveAddress, size: OpSize) -> Operand {
        Operand::Mem(MemRef {
            seg: self.prefixes.seg.unwrap_or(ea.default_seg),
            ea,
            size,
        })
    }

    /// The r/m operand: a register for `mod == 3`, memory otherwise.
    pub fn rm(&self, size: OpSize) -> Result<Operand, Stop> {
        let m = self.current_modrm()?;
        Ok(match m.ea {
            Some(ea) => self.mem_operand(ea, size),
            None => Operand::reg(m.rm, size),
        })
    }

    /// The r/m operand where only memory is legal (LEA, LDS, LGDT, ...).
    pub fn mem(&self, size: OpSize) -> Result<Operand, Stop> {
        let m = self.current_modrm()?;
        match m.ea {
            Some(ea) => Ok(self.mem_operand(ea, size)),
            None => Err(CpuException::ud().into()),
        }
    }

    /// The register named by the ModRM reg field.
    pub fn reg(&self, size: OpSize) -> Result<Operand, Stop> {
        let m = self.current_modrm()?;
        Ok(Operand::reg(m.reg, size))
    }

    /// `moffs` operand of MOV A0..A3.
    pub fn moffs(&mut self, size: OpSize) -> Result<Operand, Stop> {
        let addr32 = self.addr32();
        let disp = if addr32 {
            self.imm32()?
        } else {
            self.imm16()? as u32
        };
        Ok(self.mem_operand(EffectiveAddress::direct(disp, addr32), size))
    }

    pub fn make(&self, op: Op, size: OpSize, dst: Operand, src: Operand) -> Instruction {
        Instruction::with(op, size, dst, src)
    }

    /// Applies the prefix rules to a decoded instruction and stamps its extent.
    fn finish(&self, mut ins: Instruction) -> Result<Instruction, Stop> {
        ins.start = self.instr_start;
        ins.end = self.cursor;
        ins.addr32 = self.addr32();
        ins.seg_override = self.prefixes.seg;
        ins.wait |= self.prefixes.wait;
        if let Some(prefix) = self.prefixes.rep {
            let kind = if ins.op.is_string_move() {
                RepKind::Rep
            } else if ins.op.is_string_compare() {
                if prefix == 0xF3 {
                    RepKind::Repz
                } else {
                    RepKind::Repnz
                }
            } else {
                return Err(CpuException::ud().into());
            };
            ins.rep = Some(Repeat {
                kind,
                counter: Operand::reg(ECX as u8, OpSize::from_32(ins.addr32)),
            });
        }
        if self.prefixes.lock {
            if !(ins.op.lockable() && ins.dst.is_mem()) {
                return Err(CpuException::ud().into());
            }
            ins.lock = true;
        }
        Ok(ins)
    }

    fn decode_one(&mut self, table: &[Handler; 256]) -> Result<Instruction, Stop> {
        self.begin_instruction();
        let op = self.fetch()?;
        let ins = table[op as usize](self, op)?;
        self.finish(ins)
    }
}

impl ByteSource for DecodeCtx<'_> {
    type Error = Stop;

    fn next_u8(&mut self) -> Result<u8, Stop> {
        self.fetch()
    }
}

/// Decodes one block at CS:EIP using `table` as the primary opcode map.
pub fn decode_block_with(
    cpu: &mut Cpu,
    bus: &mut dyn Bus,
    table: &[Handler; 256],
) -> Result<CodeBlock, Trap> {
    let cs_selector = cpu.regs.seg(SegReg::Cs).selector();
    let cs_limit = cpu.regs.seg(SegReg::Cs).limit();
    let start_eip = cpu.regs.eip;
    let stack32 = cpu.regs.seg(SegReg::Ss).is_size32();
    let mut d = DecodeCtx::new(cpu, bus);
    let code32 = d.code32;
    let max = d.cfg.max_block_instructions.max(1);

    let mut instructions = Vec::new();
    let mut cacheable = true;
    let mut escaped = false;
    loop {
        match d.decode_one(table) {
            Ok(ins) => {
                if ins.op.is_fpu() && d.cfg.has_fpu && !escaped {
                    let mut esc = Instruction::new(Op::Escape, OpSize::Byte);
                    esc.start = ins.start;
                    esc.end = ins.start;
                    instructions.push(esc);
                    escaped = true;
                }
                let ends = ins.ends_block();
                instructions.push(ins);
                d.decoded += 1;
                if ends || d.decoded >= max {
                    break;
                }
            }
            Err(Stop::PageCross) => break,
            Err(Stop::Trap(Trap::Exception(e))) => {
                let mut raise = Instruction::new(Op::Raise(e), OpSize::Byte);
                raise.start = d.instr_start;
                raise.end = d.instr_start;
                instructions.push(raise);
                cacheable = false;
                break;
            }
            Err(Stop::Trap(t)) => return Err(t),
        }
    }

    Ok(CodeBlock {
        instructions,
        cs_selector,
        cs_limit,
        start_eip,
        phys: d.head,
        tail: d.tail,
        tail_linear: d.tail_linear,
        code32,
        stack32,
        cacheable,
    })
}
