//! ModRM and SIB decoding for 16- and 32-bit addressing.

use serde::{Deserialize, Serialize};

use crate::regs::{Registers, SegReg, EBP, EBX, EDI, ESI, ESP};

/// A memory operand's address expression: `base + (index << scale) + disp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveAddress {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
    pub addr32: bool,
    /// SS for BP/EBP/ESP based forms, DS otherwise.
    pub default_seg: SegReg,
}

impl EffectiveAddress {
    /// A bare displacement (`moffs` forms and `mod=0` direct addressing).
    pub fn direct(disp: u32, addr32: bool) -> Self {
        Self {
            base: None,
            index: None,
            scale: 0,
            disp,
            addr32,
            default_seg: SegReg::Ds,
        }
    }

    pub fn offset(&self, regs: &Registers) -> u32 {
        let mut ea = self.disp;
        if let Some(b) = self.base {
            ea = ea.wrapping_add(regs.reg32(b));
        }
        if let Some(i) = self.index {
            ea = ea.wrapping_add(regs.reg32(i) << self.scale);
        }
        if self.addr32 {
            ea
        } else {
            ea & 0xFFFF
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
    /// `None` for register-direct (`mod == 3`).
    pub ea: Option<EffectiveAddress>,
}

/// Source of the SIB and displacement bytes following a ModRM byte.
pub trait ByteSource {
    type Error;

    fn next_u8(&mut self) -> Result<u8, Self::Error>;

    fn next_u16(&mut self) -> Result<u16, Self::Error> {
        let lo = self.next_u8()?;
        let hi = self.next_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn next_u32(&mut self) -> Result<u32, Self::Error> {
        let lo = self.next_u16()?;
        let hi = self.next_u16()?;
        Ok(lo as u32 | (hi as u32) << 16)
    }
}

pub fn decode_modrm<S: ByteSource + ?Sized>(
    src: &mut S,
    byte: u8,
    addr32: bool,
) -> Result<ModRm, S::Error> {
    let md = byte >> 6;
    let reg = (byte >> 3) & 7;
    let rm = byte & 7;
    let ea = match (md, addr32) {
        (3, _) => None,
        (_, false) => Some(decode16(src, md, rm)?),
        (_, true) => Some(decode32(src, md, rm)?),
    };
    Ok(ModRm { md, reg, rm, ea })
}

fn displacement<S: ByteSource + ?Sized>(
    src: &mut S,
    md: u8,
    addr32: bool,
) -> Result<u32, S::Error> {
    Ok(match md {
        1 => src.next_u8()? as i8 as i32 as u32,
        2 if addr32 => src.next_u32()?,
        2 => src.next_u16()? as u32,
        _ => 0,
    })
}

fn decode16<S: ByteSource + ?Sized>(src: &mut S, md: u8, rm: u8) -> Result<EffectiveAddress, S::Error> {
    if md == 0 && rm == 6 {
        let disp = src.next_u16()? as u32;
        return Ok(EffectiveAddress::direct(disp, false));
    }
    let (base, index) = match rm {
        0 => (EBX, Some(ESI)),
        1 => (EBX, Some(EDI)),
        2 => (EBP, Some(ESI)),
        3 => (EBP, Some(EDI)),
        4 => (ESI, None),
        5 => (EDI, None),
        6 => (EBP, None),
        _ => (EBX, None),
    };
    let disp = displacement(src, md, false)?;
    Ok(EffectiveAddress {
        base: Some(base as u8),
        index: index.map(|i| i as u8),
        scale: 0,
        disp,
        addr32: false,
        default_seg: if base == EBP { SegReg::Ss } else { SegReg::Ds },
    })
}

fn decode32<S: ByteSource + ?Sized>(src: &mut S, md: u8, rm: u8) -> Result<EffectiveAddress, S::Error> {
    if rm == 4 {
        let sib = src.next_u8()?;
        let scale = sib >> 6;
        let index = match (sib >> 3) & 7 {
            4 => None,
            i => Some(i),
        };
        let base = sib & 7;
        if base == 5 && md == 0 {
            let disp = src.next_u32()?;
            return Ok(EffectiveAddress {
                base: None,
                index,
                scale,
                disp,
                addr32: true,
                default_seg: SegReg::Ds,
            });
        }
        let disp = displacement(src, md, true)?;
        let stack = base as usize == ESP || base as usize == EBP;
        return Ok(EffectiveAddress {
            base: Some(base),
            index,
            scale,
            disp,
            addr32: true,
            default_seg: if stack { SegReg::Ss } else { SegReg::Ds },
        });
    }
    if md == 0 && rm == 5 {
        let disp = src.next_u32()?;
        return Ok(EffectiveAddress::direct(disp, true));
    }
    let disp = displacement(src, md, true)?;
    Ok(EffectiveAddress {
        base: Some(rm),
        index: None,
        scale: 0,
        disp,
        addr32: true,
        default_seg: if rm as usize == EBP { SegReg::Ss } else { SegReg::Ds },
    })
}

/// Decodes from a plain byte slice; handy for tools and tests.
pub struct SliceSource<'a> {
    pub bytes: &'a [u8],
    pub pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    type Error = ();

    fn next_u8(&mut self) -> Result<u8, ()> {
        let b = *self.bytes.get(self.pos).ok_or(())?;
        self.pos += 1;
        Ok(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{EAX, ECX};
    use pretty_assertions::assert_eq;

    fn mem(
        base: Option<usize>,
        index: Option<usize>,
        scale: u8,
        disp: u32,
        addr32: bool,
        default_seg: SegReg,
    ) -> EffectiveAddress {
        EffectiveAddress {
            base: base.map(|b| b as u8),
            index: index.map(|i| i as u8),
            scale,
            disp,
            addr32,
            default_seg,
        }
    }

    #[test]
    fn every_sixteen_bit_form() {
        let pairs = [
            (EBX, Some(ESI)),
            (EBX, Some(EDI)),
            (EBP, Some(ESI)),
            (EBP, Some(EDI)),
            (ESI, None),
            (EDI, None),
            (EBP, None),
            (EBX, None),
        ];
        for byte in 0..0xC0u8 {
            let (md, reg, rm) = (byte >> 6, (byte >> 3) & 7, byte & 7);
            let mut src = SliceSource::new(&[0x80, 0x12]);
            let m = decode_modrm(&mut src, byte, false).unwrap();
            let (base, index) = pairs[rm as usize];
            let seg = if base == EBP { SegReg::Ss } else { SegReg::Ds };
            let (want, used) = match md {
                0 if rm == 6 => (EffectiveAddress::direct(0x1280, false), 2),
                0 => (mem(Some(base), index, 0, 0, false, seg), 0),
                1 => (mem(Some(base), index, 0, 0xFFFF_FF80, false, seg), 1),
                _ => (mem(Some(base), index, 0, 0x1280, false, seg), 2),
            };
            assert_eq!((m.md, m.reg, m.rm), (md, reg, rm), "modrm {byte:#04x}");
            assert_eq!(m.ea, Some(want), "modrm {byte:#04x}");
            assert_eq!(src.pos, used, "modrm {byte:#04x}");
        }
        let mut src = SliceSource::new(&[]);
        for byte in 0xC0..=0xFFu8 {
            assert_eq!(decode_modrm(&mut src, byte, false).unwrap().ea, None);
        }
    }

    #[test]
    fn every_thirty_two_bit_form_without_sib() {
        for byte in (0..0xC0u8).filter(|b| b & 7 != 4) {
            let (md, reg, rm) = (byte >> 6, (byte >> 3) & 7, byte & 7);
            let mut src = SliceSource::new(&[0x80, 0x34, 0x12, 0x00]);
            let m = decode_modrm(&mut src, byte, true).unwrap();
            assert_eq!((m.md, m.reg, m.rm), (md, reg, rm), "modrm {byte:#04x}");
            let base = Some(rm as usize);
            let seg = if rm as usize == EBP { SegReg::Ss } else { SegReg::Ds };
            let (want, used) = match md {
                0 if rm == 5 => (EffectiveAddress::direct(0x0012_3480, true), 4),
                0 => (mem(base, None, 0, 0, true, seg), 0),
                1 => (mem(base, None, 0, 0xFFFF_FF80, true, seg), 1),
                _ => (mem(base, None, 0, 0x0012_3480, true, seg), 4),
            };
            assert_eq!(m.ea, Some(want), "modrm {byte:#04x}");
            assert_eq!(src.pos, used, "modrm {byte:#04x}");
        }
    }

    #[test]
    fn sib_forms() {
        let cases: [(u8, &[u8], EffectiveAddress, usize); 7] = [
            // [esp]
            (0x04, &[0x24], mem(Some(ESP), None, 0, 0, true, SegReg::Ss), 1),
            // [disp32], index 4 means none
            (0x04, &[0x25, 0x78, 0x56, 0x34, 0x12], mem(None, None, 0, 0x1234_5678, true, SegReg::Ds), 5),
            // [ebp + disp8], scale ignored without an index
            (0x44, &[0x65, 0x10], mem(Some(EBP), None, 1, 0x10, true, SegReg::Ss), 2),
            // [ebp + disp32]
            (0x84, &[0x2D, 0x00, 0x01, 0x00, 0x00], mem(Some(EBP), None, 0, 0x100, true, SegReg::Ss), 5),
            // [eax + ebx*8 + disp32]
            (0x84, &[0xD8, 0x00, 0x01, 0x00, 0x00], mem(Some(EAX), Some(EBX), 3, 0x100, true, SegReg::Ds), 5),
            // [esp + ecx*2]
            (0x04, &[0x4C], mem(Some(ESP), Some(ECX), 1, 0, true, SegReg::Ss), 1),
            // [esi + edi*4 - 2]
            (0x44, &[0xBE, 0xFE], mem(Some(ESI), Some(EDI), 2, 0xFFFF_FFFE, true, SegReg::Ds), 2),
        ];
        for (byte, rest, want, used) in cases {
            let mut src = SliceSource::new(rest);
            let m = decode_modrm(&mut src, byte, true).unwrap();
            assert_eq!(m.ea, Some(want), "modrm {byte:#04x} sib {:#04x}", rest[0]);
            assert_eq!(src.pos, used);
        }
    }

    #[test]
    fn every_sib_byte() {
        for md in 0..3u8 {
            for sib in 0..=0xFFu8 {
                let bytes = [sib, 0x80, 0x34, 0x12, 0x00];
                let mut src = SliceSource::new(&bytes);
                let m = decode_modrm(&mut src, md << 6 | 0x04, true).unwrap();
                let scale = sib >> 6;
                let index = match (sib >> 3) & 7 {
                    4 => None,
                    i => Some(i as usize),
                };
                let base = (sib & 7) as usize;
                let seg = if base == ESP || base == EBP { SegReg::Ss } else { SegReg::Ds };
                let (want, used) = match md {
                    0 if base == EBP => (mem(None, index, scale, 0x0012_3480, true, SegReg::Ds), 5),
                    0 => (mem(Some(base), index, scale, 0, true, seg), 1),
                    1 => (mem(Some(base), index, scale, 0xFFFF_FF80, true, seg), 2),
                    _ => (mem(Some(base), index, scale, 0x0012_3480, true, seg), 5),
                };
                assert_eq!(m.ea, Some(want), "mod {md} sib {sib:#04x}");
                assert_eq!(src.pos, used, "mod {md} sib {sib:#04x}");
            }
        }
    }

    #[test]
    fn truncated_displacement_is_an_error() {
        let mut src = SliceSource::new(&[0x34]);
        assert!(decode_modrm(&mut src, 0x06, false).is_err());
        let mut src = SliceSource::new(&[0x25, 0x00]);
        assert!(decode_modrm(&mut src, 0x04, true).is_err());
    }

    #[test]
    fn sixteen_bit_direct_displacement() {
        let mut src = SliceSource::new(&[0x34, 0x12]);
        let m = decode_modrm(&mut src, 0x06, false).unwrap();
        assert_eq!(m.ea, Some(EffectiveAddress::direct(0x1234, false)));
        assert_eq!(src.pos, 2);
    }

    #[test]
    fn bp_disp8_defaults_to_ss_and_wraps() {
        let mut src = SliceSource::new(&[0xFF]);
        let m = decode_modrm(&mut src, 0x46, false).unwrap();
        let ea = m.ea.unwrap();
        assert_eq!(ea.default_seg, SegReg::Ss);
        let mut regs = Registers::new();
        regs.gpr[EBP] = 0x0000_0000;
        assert_eq!(ea.offset(&regs), 0xFFFF);
    }

    #[test]
    fn sib_without_base() {
        // mod=0 rm=4, SIB: scale=2 index=ECX base=5 -> [ecx*4 + disp32]
        let mut src = SliceSource::new(&[0x8D, 0x00, 0x10, 0x00, 0x00]);
        let m = decode_modrm(&mut src, 0x04, true).unwrap();
        let ea = m.ea.unwrap();
        assert_eq!(ea.base, None);
        assert_eq!(ea.index, Some(1));
        assert_eq!(ea.scale, 2);
        assert_eq!(ea.disp, 0x1000);
        assert_eq!(ea.default_seg, SegReg::Ds);
    }
}
