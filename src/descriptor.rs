//! Segment, gate and TSS descriptors and the tables they live in.

use serde::{Deserialize, Serialize};

use crate::cpu::{Cpu, Trap};
use crate::exception::selector_error_code;
use crate::memory::Bus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector(pub u16);

impl Selector {
    pub fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Table indicator: selects the LDT instead of the GDT.
    pub fn is_local(self) -> bool {
        self.0 & 4 != 0
    }

    pub fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    pub fn is_null(self) -> bool {
        self.0 & 0xFFFC == 0
    }

    /// Byte offset of the entry within its descriptor table.
    pub fn offset(self) -> u32 {
        (self.0 & 0xFFF8) as u32
    }

    pub fn with_rpl(self, rpl: u8) -> Self {
        Selector((self.0 & !3) | (rpl as u16 & 3))
    }

    pub fn error_code(self, external: bool) -> u16 {
        selector_error_code(self.0, external)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorKind {
    Code {
        conforming: bool,
        readable: bool,
    },
    Data {
        writable: bool,
        expand_down: bool,
    },
    Ldt,
    Tss {
        busy: bool,
        is32: bool,
    },
    CallGate {
        selector: u16,
        offset: u32,
        param_count: u8,
        is32: bool,
    },
    TaskGate {
        selector: u16,
    },
    InterruptGate {
        selector: u16,
        offset: u32,
        is32: bool,
    },
    TrapGate {
        selector: u16,
        offset: u32,
        is32: bool,
    },
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub raw: u64,
    pub base: u32,
    /// Byte-granular limit (already scaled when G is set).
    pub limit: u32,
    pub dpl: u8,
    pub present: bool,
    /// D/B bit.
    pub big: bool,
    pub kind: DescriptorKind,
}

impl Descriptor {
    pub fn parse(raw: u64) -> Self {
        let base = (((raw >> 16) & 0x00FF_FFFF) | (((raw >> 56) & 0xFF) << 24)) as u32;
        let mut limit = ((raw & 0xFFFF) | (((raw >> 48) & 0xF) << 16)) as u32;
        if raw & (1 << 55) != 0 {
            limit = (limit << 12) | 0xFFF;
        }
        let access = (raw >> 40) as u8;
        let ty = access & 0xF;
        let dpl = (access >> 5) & 3;
        let present = access & 0x80 != 0;
        let big = raw & (1 << 54) != 0;

        let gate_selector = ((raw >> 16) & 0xFFFF) as u16;
        let gate_offset16 = (raw & 0xFFFF) as u32;
        let gate_offset32 = gate_offset16 | (((raw >> 48) & 0xFFFF) << 16) as u32;

        let kind = if access & 0x10 != 0 {
            if ty & 0x8 != 0 {
                DescriptorKind::Code {
                    conforming: ty & 0x4 != 0,
                    readable: ty & 0x2 != 0,
                }
            } else {
                DescriptorKind::Data {
                    writable: ty & 0x2 != 0,
                    expand_down: ty & 0x4 != 0,
                }
            }
        } else {
            match ty {
                0x1 | 0x3 | 0x9 | 0xB => DescriptorKind::Tss {
                    busy: ty & 0x2 != 0,
                    is32: ty & 0x8 != 0,
                },
                0x2 => DescriptorKind::Ldt,
                0x4 => DescriptorKind::CallGate {
                    selector: gate_selector,
                    offset: gate_offset16,
                    param_count: ((raw >> 32) & 0x1F) as u8,
                    is32: false,
                },
                0xC => DescriptorKind::CallGate {
                    selector: gate_selector,
                    offset: gate_offset32,
                    param_count: ((raw >> 32) & 0x1F) as u8,
                    is32: true,
                },
                0x5 => DescriptorKind::TaskGate {
                    selector: gate_selector,
                },
                0x6 | 0xE => DescriptorKind::InterruptGate {
                    selector: gate_selector,
                    offset: if ty & 0x8 != 0 { gate_offset32 } else { gate_offset16 },
                    is32: ty & 0x8 != 0,
                },
                0x7 | 0xF => DescriptorKind::TrapGate {
                    selector: gate_selector,
                    offset: if ty & 0x8 != 0 { gate_offset32 } else { gate_offset16 },
                    is32: ty & 0x8 != 0,
                },
                _ => DescriptorKind::Invalid,
            }
        };

        Self {
            raw,
            base,
            limit,
            dpl,
            present,
            big,
            kind,
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, DescriptorKind::Code { .. })
    }

    pub fn is_conforming_code(&self) -> bool {
        matches!(self.kind, DescriptorKind::Code { conforming: true, .. })
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, DescriptorKind::Data { .. })
    }

    pub fn is_writable_data(&self) -> bool {
        matches!(self.kind, DescriptorKind::Data { writable: true, .. })
    }

    /// Readable data or readable code.
    pub fn is_readable(&self) -> bool {
        matches!(
            self.kind,
            DescriptorKind::Data { .. } | DescriptorKind::Code { readable: true, .. }
        )
    }

    pub fn is_available_tss(&self) -> bool {
        matches!(self.kind, DescriptorKind::Tss { busy: false, .. })
    }

    pub fn is_busy_tss(&self) -> bool {
        matches!(self.kind, DescriptorKind::Tss { busy: true, .. })
    }
}

/// Encodes a code/data/system segment descriptor. `access` is the byte at
/// bits 40..47 (P, DPL, S, type); `flags` is the G/D/AVL nibble.
pub fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xFFFF)
        | ((base as u64 & 0x00FF_FFFF) << 16)
        | ((access as u64) << 40)
        | (((limit as u64 >> 16) & 0xF) << 48)
        | (((flags as u64) & 0xF) << 52)
        | (((base as u64) >> 24) << 56)
}

/// Encodes a call/interrupt/trap/task gate. `access` holds P, DPL and type.
pub fn gate_descriptor(selector: u16, offset: u32, access: u8, param_count: u8) -> u64 {
    (offset as u64 & 0xFFFF)
        | ((selector as u64) << 16)
        | (((param_count & 0x1F) as u64) << 32)
        | ((access as u64) << 40)
        | (((offset as u64) >> 16) << 48)
}

const RING_SLOTS: usize = 4;

/// Small rotating memo of recently parsed descriptors. Control transfers look
/// up the same handful of entries over and over; this avoids re-parsing them.
#[derive(Debug, Clone, Default)]
pub struct DescriptorRing {
    slots: [Option<Descriptor>; RING_SLOTS],
    next: usize,
}

impl DescriptorRing {
    pub fn decode(&mut self, raw: u64) -> Descriptor {
        if let Some(d) = self.slots.iter().flatten().find(|d| d.raw == raw) {
            return *d;
        }
        let d = Descriptor::parse(raw);
        self.slots[self.next] = Some(d);
        self.next = (self.next + 1) % RING_SLOTS;
        d
    }
}

impl Cpu {
    /// Linear address and table limit for the table `selector` points into, or
    /// `None` when the entry lies beyond the table limit.
    fn descriptor_address(&self, selector: Selector) -> Option<u32> {
        let (base, limit) = if selector.is_local() {
            let ldtr = self.regs.ldtr;
            if ldtr.selector & 0xFFFC == 0 {
                return None;
            }
            (ldtr.base, ldtr.limit)
        } else {
            (self.regs.gdtr.base, self.regs.gdtr.limit as u32)
        };
        let offset = selector.offset();
        if offset + 7 > limit {
            return None;
        }
        Some(base.wrapping_add(offset))
    }

    /// Reads the descriptor a selector refers to. `Ok(None)` means the entry lies
    /// outside the GDT/LDT limit; the caller turns that into its own fault.
    pub fn get_descriptor<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
    ) -> Result<Option<Descriptor>, Trap> {
        let Some(addr) = self.descriptor_address(selector) else {
            return Ok(None);
        };
        let lo = self.read_system_u32(bus, addr)? as u64;
        let hi = self.read_system_u32(bus, addr.wrapping_add(4))? as u64;
        Ok(Some(self.descriptors.decode(lo | (hi << 32))))
    }

    /// Reads IDT entry `vector`, `Ok(None)` when beyond the IDT limit.
    pub fn get_gate<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
    ) -> Result<Option<Descriptor>, Trap> {
        let offset = vector as u32 * 8;
        if offset + 7 > self.regs.idtr.limit as u32 {
            return Ok(None);
        }
        let addr = self.regs.idtr.base.wrapping_add(offset);
        let lo = self.read_system_u32(bus, addr)? as u64;
        let hi = self.read_system_u32(bus, addr.wrapping_add(4))? as u64;
        Ok(Some(self.descriptors.decode(lo | (hi << 32))))
    }

    /// Sets the accessed bit of a code/data descriptor.
    pub(crate) fn mark_accessed<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
    ) -> Result<(), Trap> {
        let Some(addr) = self.descriptor_address(selector) else {
            return Ok(());
        };
        let addr = addr.wrapping_add(5);
        let access = self.read_system_u8(bus, addr)?;
        if access & 1 == 0 {
            self.write_system_u8(bus, addr, access | 1)?;
        }
        Ok(())
    }

    /// Flips the busy bit of a TSS descriptor in the GDT.
    pub(crate) fn set_tss_busy<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        busy: bool,
    ) -> Result<(), Trap> {
        let Some(addr) = self.descriptor_address(Selector(selector.0 & !4)) else {
            return Ok(());
        };
        let addr = addr.wrapping_add(5);
        let access = self.read_system_u8(bus, addr)?;
        let access = if busy { access | 0x02 } else { access & !0x02 };
        self.write_system_u8(bus, addr, access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_code_segment() {
        let d = Descriptor::parse(segment_descriptor(0, 0xFFFFF, 0x9A, 0xC));
        assert_eq!(d.base, 0);
        assert_eq!(d.limit, 0xFFFF_FFFF);
        assert!(d.big);
        assert!(d.present);
        assert_eq!(
            d.kind,
            DescriptorKind::Code {
                conforming: false,
                readable: true
            }
        );
    }

    #[test]
    fn parses_call_gate() {
        let d = Descriptor::parse(gate_descriptor(0x0008, 0x1234_5678, 0xEC, 3));
        assert_eq!(d.dpl, 3);
        assert_eq!(
            d.kind,
            DescriptorKind::CallGate {
                selector: 8,
                offset: 0x1234_5678,
                param_count: 3,
                is32: true
            }
        );
    }

    #[test]
    fn ring_reuses_and_wraps() {
        let mut ring = DescriptorRing::default();
        let raws: Vec<u64> = (0..6u32)
            .map(|i| segment_descriptor(i * 0x1000, 0xFFFF, 0x92, 0))
            .collect();
        for &r in &raws {
            assert_eq!(ring.decode(r).raw, r);
        }
        assert_eq!(ring.decode(raws[5]).base, 0x5000);
        assert_eq!(ring.next, 2);
    }

    #[test]
    fn selector_fields() {
        let s = Selector(0x002F);
        assert_eq!(s.index(), 5);
        assert!(s.is_local());
        assert_eq!(s.rpl(), 3);
        assert!(!s.is_null());
        assert!(Selector(0x0003).is_null());
        assert_eq!(s.with_rpl(0).0, 0x002C);
    }
}
