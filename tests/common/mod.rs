#![allow(dead_code)]

use i386_rs::decoder::Decoder;
use i386_rs::descriptor::{gate_descriptor, segment_descriptor, Descriptor};
use i386_rs::regs::{Cr0, SegReg, SystemSegment, ESP};
use i386_rs::{Board, Bus, Cpu, CpuConfig, I386Decoder, IntExecutor, Trap};

pub const GDT: u32 = 0x1000;
pub const IDT: u32 = 0x2000;
pub const TSS: u32 = 0x3000;
pub const STACK0: u32 = 0x9000;
pub const STACK3: u32 = 0x8000;

pub const CODE0: u16 = 0x08;
pub const DATA0: u16 = 0x10;
pub const CODE3: u16 = 0x1B;
pub const DATA3: u16 = 0x23;
pub const TSS_SEL: u16 = 0x28;

/// Flat 4 GiB segments in slots 1-4, a 386 TSS in slot 5.
pub fn standard_gdt() -> [u64; 6] {
    [
        0,
        segment_descriptor(0, 0xFFFFF, 0x9A, 0xC),
        segment_descriptor(0, 0xFFFFF, 0x92, 0xC),
        segment_descriptor(0, 0xFFFFF, 0xFA, 0xC),
        segment_descriptor(0, 0xFFFFF, 0xF2, 0xC),
        segment_descriptor(TSS, 0x67, 0x89, 0),
    ]
}

pub struct Machine {
    pub cpu: Cpu,
    pub board: Board,
    dec: I386Decoder,
    exec: IntExecutor,
}

impl Machine {
    pub fn new(cfg: CpuConfig) -> Self {
        Self {
            cpu: Cpu::new(cfg),
            board: Board::new(1 << 20),
            dec: I386Decoder::new(),
            exec: IntExecutor,
        }
    }

    /// Real mode, `code` at CS:IP.
    pub fn real(cfg: CpuConfig, cs: u16, ip: u16, code: &[u8]) -> Self {
        let mut m = Self::new(cfg);
        m.load(((cs as u32) << 4) + ip as u32, code);
        m.cpu.set_entry(cs, ip);
        m
    }

    /// Ring 0 flat protected mode with `code` at EIP 0x4000, ESP at
    /// [`STACK0`], an empty 256-entry IDT and TR pointing at the TSS.
    pub fn protected(cfg: CpuConfig, code: &[u8]) -> Self {
        let mut m = Self::new(cfg);
        for (i, raw) in standard_gdt().iter().enumerate() {
            m.set_gdt(i as u16, *raw);
        }
        m.cpu.regs.gdtr.base = GDT;
        m.cpu.regs.gdtr.limit = 16 * 8 - 1;
        m.cpu.regs.idtr.base = IDT;
        m.cpu.regs.idtr.limit = 256 * 8 - 1;
        m.cpu.regs.cr0 = Cr0::PE | Cr0::ET;
        m.load_seg(SegReg::Cs, CODE0, 1);
        for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            m.load_seg(seg, DATA0, 2);
        }
        m.cpu.regs.gpr[ESP] = STACK0;
        m.cpu.regs.tr = SystemSegment {
            selector: TSS_SEL,
            base: TSS,
            limit: 0x67,
            is32: true,
        };
        m.w32(TSS + 4, STACK0);
        m.w32(TSS + 8, DATA0 as u32);
        m.w32(TSS + 0x64, 0x0068_0000);
        m.load(0x4000, code);
        m.cpu.regs.eip = 0x4000;
        m
    }

    /// Switches the loaded state to ring 3 flat segments.
    pub fn enter_ring3(&mut self, eip: u32, esp: u32) {
        self.load_seg(SegReg::Cs, CODE3, 3);
        for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
            self.load_seg(seg, DATA3, 4);
        }
        self.cpu.regs.eip = eip;
        self.cpu.regs.gpr[ESP] = esp;
    }

    pub fn load_seg(&mut self, seg: SegReg, selector: u16, slot: u32) {
        let raw = self.r32(GDT + slot * 8) as u64 | (self.r32(GDT + slot * 8 + 4) as u64) << 32;
        self.cpu
            .regs
            .seg_mut(seg)
            .load_protected_mode(selector, &Descriptor::parse(raw));
    }

    pub fn set_gdt(&mut self, index: u16, raw: u64) {
        self.w32(GDT + index as u32 * 8, raw as u32);
        self.w32(GDT + index as u32 * 8 + 4, (raw >> 32) as u32);
    }

    /// 32-bit interrupt gate (type E) or trap gate (type F) at `vector`.
    pub fn set_idt(&mut self, vector: u8, selector: u16, offset: u32, access: u8) {
        let raw = gate_descriptor(selector, offset, access, 0);
        self.w32(IDT + vector as u32 * 8, raw as u32);
        self.w32(IDT + vector as u32 * 8 + 4, (raw >> 32) as u32);
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        self.board.load(addr, bytes).unwrap();
    }

    pub fn r8(&mut self, addr: u32) -> u8 {
        self.board.read_u8(addr).unwrap()
    }

    pub fn r16(&mut self, addr: u32) -> u16 {
        self.board.read_u16(addr).unwrap()
    }

    pub fn r32(&mut self, addr: u32) -> u32 {
        self.board.read_u32(addr).unwrap()
    }

    pub fn w32(&mut self, addr: u32, v: u32) {
        self.board.write_u32(addr, v).unwrap();
    }

    pub fn step(&mut self) -> Result<(), Trap> {
        self.cpu.step(&mut self.board, &self.dec, &self.exec)
    }

    /// Steps until HLT, failing after `max` blocks.
    pub fn run(&mut self, max: usize) -> Result<(), Trap> {
        for _ in 0..max {
            self.step()?;
            if self.cpu.halted {
                return Ok(());
            }
        }
        panic!("no HLT within {max} blocks");
    }

    pub fn decode(&mut self) -> i386_rs::block::CodeBlock {
        self.dec.decode_block(&mut self.cpu, &mut self.board).unwrap()
    }

    pub fn esp(&self) -> u32 {
        self.cpu.regs.gpr[ESP]
    }

    pub fn cs(&self) -> u16 {
        self.cpu.regs.seg(SegReg::Cs).selector()
    }
}
