use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::descriptor::{Descriptor, DescriptorKind};

pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
}

impl OpSize {
    pub fn from_32(is32: bool) -> Self {
        if is32 {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::Dword => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub fn mask(self) -> u32 {
        match self {
            OpSize::Byte => 0xFF,
            OpSize::Word => 0xFFFF,
            OpSize::Dword => 0xFFFF_FFFF,
        }
    }

    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `self` bits of `v` to 32 bits.
    pub fn sign_extend(self, v: u32) -> u32 {
        match self {
            OpSize::Byte => v as u8 as i8 as i32 as u32,
            OpSize::Word => v as u16 as i16 as i32 as u32,
            OpSize::Dword => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    /// Decodes the `reg` field of a ModRM byte naming a segment register.
    pub fn from_index(i: u8) -> Option<Self> {
        Self::ALL.get(i as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SegReg::Es => "es",
            SegReg::Cs => "cs",
            SegReg::Ss => "ss",
            SegReg::Ds => "ds",
            SegReg::Fs => "fs",
            SegReg::Gs => "gs",
        }
    }
}

bitflags! {
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags: u32 {
const CF = 1 << 0;
const RESERVED1 = 1 << 1;
const PF = 1 << 2;
const AF = 1 << 4;
const ZF = 1 << 6;
const SF = 1 << 7;
const TF = 1 << 8;
const IF = 1 << 9;
const DF = 1 << 10;
const OF = 1 << 11;
const IOPL = 3 << 12;
const NT = 1 << 14;
const RF = 1 << 16;
const VM = 1 << 17;
const AC = 1 << 18; // 486+
const ID = 1 << 21; // late 486 CPUID detection
}
}

impl Flags {
    /// Arithmetic status flags.
    pub const STATUS: Flags = Flags::CF
        .union(Flags::PF)
        .union(Flags::AF)
        .union(Flags::ZF)
        .union(Flags::SF)
        .union(Flags::OF);

    pub fn iopl(self) -> u8 {
        ((self.bits() >> 12) & 3) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        *self = Flags::from_bits_retain((self.bits() & !(3 << 12)) | ((iopl as u32 & 3) << 12));
    }
}

bitflags! {
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cr0: u32 {
const PE = 1 << 0;
const MP = 1 << 1;
const EM = 1 << 2;
const TS = 1 << 3;
const ET = 1 << 4;
const NE = 1 << 5;  // 486+
const WP = 1 << 16; // 486+
const AM = 1 << 18; // 486+
const NW = 1 << 29; // 486+
const CD = 1 << 30; // 486+
const PG = 1 << 31;
}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuMode {
    Real,
    Virtual8086,
    Protected,
}

/// A segment register: the visible selector plus its hidden descriptor cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    selector: u16,
    base: u32,
    limit: u32,
    dpl: u8,
    present: bool,
    /// False for a null selector loaded in protected mode.
    usable: bool,
    executable: bool,
    conforming: bool,
    readable: bool,
    writable: bool,
    expand_down: bool,
    big: bool,
}

impl Segment {
    /// Power-on state of a data segment register.
    pub fn reset(selector: u16, base: u32) -> Self {
        Self {
            selector,
            base,
            limit: 0xFFFF,
            dpl: 0,
            present: true,
            usable: true,
            executable: false,
            conforming: false,
            readable: true,
            writable: true,
            expand_down: false,
            big: false,
        }
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn dpl(&self) -> u8 {
        self.dpl
    }

    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    pub fn is_size32(&self) -> bool {
        self.big
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn is_conforming(&self) -> bool {
        self.conforming
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Real-mode load: only the selector and base change. The hidden limit and
    /// attributes persist, which is what makes "unreal" mode work.
    pub fn load_real_mode(&mut self, selector: u16) {
        self.selector = selector;
        self.base = (selector as u32) << 4;
        self.usable = true;
        self.present = true;
        self.dpl = 0;
    }

    pub fn load_virtual_mode(&mut self, selector: u16) {
        *self = Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            dpl: 3,
            present: true,
            usable: true,
            executable: true,
            conforming: false,
            readable: true,
            writable: true,
            expand_down: false,
            big: false,
        };
    }

    pub fn load_protected_mode(&mut self, selector: u16, desc: &Descriptor) {
        let (executable, conforming, readable, writable, expand_down) = match desc.kind {
            DescriptorKind::Code {
                conforming,
                readable,
            } => (true, conforming, readable, false, false),
            DescriptorKind::Data {
                writable,
                expand_down,
            } => (false, false, true, writable, expand_down),
            _ => (false, false, false, false, false),
        };
        *self = Self {
            selector,
            base: desc.base,
            limit: desc.limit,
            dpl: desc.dpl,
            present: desc.present,
            usable: true,
            executable,
            conforming,
            readable,
            writable,
            expand_down,
            big: desc.big,
        };
    }

    /// Protected-mode load of a null selector into DS/ES/FS/GS.
    pub fn load_null(&mut self, selector: u16) {
        self.selector = selector;
        self.usable = false;
        self.present = false;
    }

    /// Whether any byte of `[offset, offset + size)` falls outside the limit.
    pub fn is_outside_limit(&self, offset: u32, size: u32) -> bool {
        let first = offset as u64;
        let last = first + size.max(1) as u64 - 1;
        if self.expand_down {
            let upper = if self.big { 0xFFFF_FFFFu64 } else { 0xFFFF };
            first <= self.limit as u64 || last > upper
        } else {
            last > self.limit as u64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegister {
    pub base: u32,
    pub limit: u16,
}

/// LDTR or TR: a selector with the base/limit cached from its descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// For TR: the loaded TSS is a 386 (32-bit) TSS.
    pub is32: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registers {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: Flags,
    pub segs: [Segment; 6],
    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
    pub ldtr: SystemSegment,
    pub tr: SystemSegment,
}

impl Registers {
    pub fn new() -> Self {
        let mut segs = [Segment::reset(0, 0); 6];
        segs[SegReg::Cs as usize] = Segment {
            executable: true,
            writable: false,
            ..Segment::reset(0xF000, 0xFFFF_0000)
        };
        Self {
            gpr: [0; 8],
            eip: 0xFFF0,
            eflags: Flags::RESERVED1,
            segs,
            cr0: Cr0::empty(),
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0, 0, 0, 0, 0, 0, 0xFFFF_0FF0, 0x0000_0400],
            gdtr: TableRegister {
                base: 0,
                limit: 0xFFFF,
            },
            idtr: TableRegister {
                base: 0,
                limit: 0x03FF,
            },
            ldtr: SystemSegment::default(),
            tr: SystemSegment::default(),
        }
    }

    pub fn seg(&self, s: SegReg) -> &Segment {
        &self.segs[s as usize]
    }

    pub fn seg_mut(&mut self, s: SegReg) -> &mut Segment {
        &mut self.segs[s as usize]
    }

    pub fn mode(&self) -> CpuMode {
        if !self.cr0.contains(Cr0::PE) {
            CpuMode::Real
        } else if self.eflags.contains(Flags::VM) {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    pub fn is_in_real_mode(&self) -> bool {
        self.mode() == CpuMode::Real
    }

    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::Virtual8086 => 3,
            CpuMode::Protected => self.seg(SegReg::Cs).rpl(),
        }
    }

    pub fn reg8(&self, i: u8) -> u8 {
        let i = i as usize & 7;
        if i < 4 {
            self.gpr[i] as u8
        } else {
            (self.gpr[i - 4] >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, i: u8, v: u8) {
        let i = i as usize & 7;
        if i < 4 {
            self.gpr[i] = (self.gpr[i] & !0xFF) | v as u32;
        } else {
            self.gpr[i - 4] = (self.gpr[i - 4] & !0xFF00) | ((v as u32) << 8);
        }
    }

    pub fn reg16(&self, i: u8) -> u16 {
        self.gpr[i as usize & 7] as u16
    }

    pub fn set_reg16(&mut self, i: u8, v: u16) {
        let r = &mut self.gpr[i as usize & 7];
        *r = (*r & 0xFFFF_0000) | v as u32;
    }

    pub fn reg32(&self, i: u8) -> u32 {
        self.gpr[i as usize & 7]
    }

    pub fn set_reg32(&mut self, i: u8, v: u32) {
        self.gpr[i as usize & 7] = v;
    }

    pub fn read_reg(&self, i: u8, size: OpSize) -> u32 {
        match size {
            OpSize::Byte => self.reg8(i) as u32,
            OpSize::Word => self.reg16(i) as u32,
            OpSize::Dword => self.reg32(i),
        }
    }

    pub fn write_reg(&mut self, i: u8, size: OpSize, v: u32) {
        match size {
            OpSize::Byte => self.set_reg8(i, v as u8),
            OpSize::Word => self.set_reg16(i, v as u16),
            OpSize::Dword => self.set_reg32(i, v),
        }
    }

    /// Reads a counter/index register sized by the address size.
    pub fn addr_reg(&self, i: usize, addr32: bool) -> u32 {
        if addr32 {
            self.gpr[i]
        } else {
            self.gpr[i] & 0xFFFF
        }
    }

    pub fn set_addr_reg(&mut self, i: usize, addr32: bool, v: u32) {
        if addr32 {
            self.gpr[i] = v;
        } else {
            self.gpr[i] = (self.gpr[i] & 0xFFFF_0000) | (v & 0xFFFF);
        }
    }

    /// ESP or SP depending on the stack segment's B bit.
    pub fn stack_pointer(&self) -> u32 {
        self.addr_reg(ESP, self.seg(SegReg::Ss).is_size32())
    }

    pub fn set_stack_pointer(&mut self, v: u32) {
        let big = self.seg(SegReg::Ss).is_size32();
        self.set_addr_reg(ESP, big, v);
    }

    /// Replaces the flags image, keeping the always-one bit set.
    pub fn set_flags(&mut self, f: Flags) {
        self.eflags = f | Flags::RESERVED1;
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_registers_alias_high_and_low_halves() {
        let mut r = Registers::new();
        r.gpr[EAX] = 0x1234_5678;
        assert_eq!(r.reg8(0), 0x78);
        assert_eq!(r.reg8(4), 0x56);
        r.set_reg8(4, 0xAB);
        assert_eq!(r.gpr[EAX], 0x1234_AB78);
        r.set_reg16(0, 0xBEEF);
        assert_eq!(r.gpr[EAX], 0x1234_BEEF);
    }

    #[test]
    fn expand_down_limit_check() {
        let desc = Descriptor::parse(crate::descriptor::segment_descriptor(0, 0x0FFF, 0x96, 0x0));
        let mut s = Segment::reset(0, 0);
        s.load_protected_mode(0x10, &desc);
        assert!(s.is_outside_limit(0x0FFF, 1));
        assert!(!s.is_outside_limit(0x1000, 2));
        assert!(s.is_outside_limit(0xFFFF, 2));
    }

    #[test]
    fn mode_follows_pe_and_vm() {
        let mut r = Registers::new();
        assert_eq!(r.mode(), CpuMode::Real);
        r.cr0 |= Cr0::PE;
        assert_eq!(r.mode(), CpuMode::Protected);
        r.eflags |= Flags::VM;
        assert_eq!(r.mode(), CpuMode::Virtual8086);
        assert_eq!(r.cpl(), 3);
    }
}
