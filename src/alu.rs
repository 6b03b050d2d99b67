//! Integer arithmetic with EFLAGS.
//!
//! Every function takes the flags image by reference and returns the result
//! masked to the operand size. Flags the architecture leaves undefined are
//! cleared.

use crate::exception::CpuException;
use crate::instructions::Op;
use crate::regs::{Flags, OpSize};

fn msb(v: u32, size: OpSize) -> bool {
    v & size.sign_bit() != 0
}

pub fn set_szp(f: &mut Flags, r: u32, size: OpSize) {
    f.set(Flags::ZF, r & size.mask() == 0);
    f.set(Flags::SF, msb(r, size));
    f.set(Flags::PF, (r as u8).count_ones() % 2 == 0);
}

pub fn add(f: &mut Flags, a: u32, b: u32, carry: bool, size: OpSize) -> u32 {
    let mask = size.mask();
    let (a, b) = (a & mask, b & mask);
    let wide = a as u64 + b as u64 + carry as u64;
    let r = wide as u32 & mask;
    f.set(Flags::CF, wide > mask as u64);
    f.set(Flags::OF, msb((a ^ r) & (b ^ r), size));
    f.set(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
    set_szp(f, r, size);
    r
}

pub fn sub(f: &mut Flags, a: u32, b: u32, borrow: bool, size: OpSize) -> u32 {
    let mask = size.mask();
    let (a, b) = (a & mask, b & mask);
    let r = a.wrapping_sub(b).wrapping_sub(borrow as u32) & mask;
    f.set(Flags::CF, (b as u64 + borrow as u64) > a as u64);
    f.set(Flags::OF, msb((a ^ b) & (a ^ r), size));
    f.set(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
    set_szp(f, r, size);
    r
}

/// AND/OR/XOR/TEST: CF and OF cleared.
pub fn logic(f: &mut Flags, r: u32, size: OpSize) -> u32 {
    let r = r & size.mask();
    f.remove(Flags::CF | Flags::OF | Flags::AF);
    set_szp(f, r, size);
    r
}

/// INC/DEC leave CF alone.
pub fn inc(f: &mut Flags, a: u32, size: OpSize) -> u32 {
    let cf = f.contains(Flags::CF);
    let r = add(f, a, 1, false, size);
    f.set(Flags::CF, cf);
    r
}

pub fn dec(f: &mut Flags, a: u32, size: OpSize) -> u32 {
    let cf = f.contains(Flags::CF);
    let r = sub(f, a, 1, false, size);
    f.set(Flags::CF, cf);
    r
}

pub fn neg(f: &mut Flags, a: u32, size: OpSize) -> u32 {
    let r = sub(f, 0, a, false, size);
    f.set(Flags::CF, a & size.mask() != 0);
    r
}

/// Rotates and shifts (ROL..SAR). The count is masked to five bits; a zero
/// count changes nothing, flags included.
pub fn shift(f: &mut Flags, op: Op, a: u32, count: u32, size: OpSize) -> u32 {
    let bits = size.bits();
    let mask = size.mask();
    let a = a & mask;
    let count = count & 0x1F;
    if count == 0 {
        return a;
    }
    let cf_in = f.contains(Flags::CF);
    let (r, cf, of) = match op {
        Op::Rol => {
            let n = count % bits;
            let r = if n == 0 { a } else { ((a << n) | (a >> (bits - n))) & mask };
            let cf = r & 1 != 0;
            (r, cf, msb(r, size) ^ cf)
        }
        Op::Ror => {
            let n = count % bits;
            let r = if n == 0 { a } else { ((a >> n) | (a << (bits - n))) & mask };
            (r, msb(r, size), msb(r ^ (r << 1), size))
        }
        Op::Rcl => {
            let n = (count % (bits + 1)) as u64;
            let width = bits as u64 + 1;
            let all = (1u64 << width) - 1;
            let v = a as u64 | (cf_in as u64) << bits;
            let v = ((v << n) | (v >> (width - n))) & all;
            let r = v as u32 & mask;
            let cf = (v >> bits) & 1 != 0;
            (r, cf, msb(r, size) ^ cf)
        }
        Op::Rcr => {
            let n = (count % (bits + 1)) as u64;
            let width = bits as u64 + 1;
            let all = (1u64 << width) - 1;
            let v = a as u64 | (cf_in as u64) << bits;
            let v = ((v >> n) | (v << (width - n))) & all;
            let r = v as u32 & mask;
            let cf = (v >> bits) & 1 != 0;
            (r, cf, msb(r ^ (r << 1), size))
        }
        Op::Shl => {
            let wide = (a as u64) << count;
            let r = wide as u32 & mask;
            let cf = (wide >> bits) & 1 != 0;
            let r = logic_shift(f, r, size);
            (r, cf, msb(r, size) ^ cf)
        }
        Op::Shr => {
            let r = (a as u64 >> count) as u32;
            let cf = (a as u64 >> (count - 1)) & 1 != 0;
            let r = logic_shift(f, r, size);
            (r, cf, msb(a, size))
        }
        _ => {
            let s = size.sign_extend(a) as i32;
            let r = (s >> count.min(31)) as u32 & mask;
            let cf = (s >> (count - 1).min(31)) & 1 != 0;
            let r = logic_shift(f, r, size);
            (r, cf, false)
        }
    };
    f.set(Flags::CF, cf);
    f.set(Flags::OF, of);
    r
}

fn logic_shift(f: &mut Flags, r: u32, size: OpSize) -> u32 {
    f.remove(Flags::AF);
    set_szp(f, r, size);
    r
}

/// SHLD: `dst` shifted left, vacated bits filled from the top of `src`.
pub fn shld(f: &mut Flags, dst: u32, src: u32, count: u32, size: OpSize) -> u32 {
    let count = count & 0x1F;
    let bits = size.bits();
    let mask = size.mask();
    if count == 0 {
        return dst & mask;
    }
    let v = ((dst as u64 & mask as u64) << bits) | (src & mask) as u64;
    let r = ((v << count) >> bits) as u32 & mask;
    let cf = (v << (count - 1)) >> (2 * bits - 1) & 1 != 0;
    f.set(Flags::CF, cf);
    f.set(Flags::OF, msb(r ^ dst, size));
    logic_shift(f, r, size)
}

/// SHRD: `dst` shifted right, vacated bits filled from the bottom of `src`.
pub fn shrd(f: &mut Flags, dst: u32, src: u32, count: u32, size: OpSize) -> u32 {
    let count = count & 0x1F;
    let bits = size.bits();
    let mask = size.mask();
    if count == 0 {
        return dst & mask;
    }
    let v = (((src & mask) as u64) << bits) | (dst & mask) as u64;
    let r = (v >> count) as u32 & mask;
    f.set(Flags::CF, (v >> (count - 1)) & 1 != 0);
    f.set(Flags::OF, msb(r ^ dst, size));
    logic_shift(f, r, size)
}

/// Unsigned widening multiply; the double-width product.
pub fn mul(f: &mut Flags, a: u32, b: u32, size: OpSize) -> u64 {
    let p = (a & size.mask()) as u64 * (b & size.mask()) as u64;
    let high = p >> size.bits() != 0;
    f.set(Flags::CF, high);
    f.set(Flags::OF, high);
    p
}

/// Signed widening multiply; CF/OF report that the product does not fit the
/// operand size.
pub fn imul(f: &mut Flags, a: u32, b: u32, size: OpSize) -> u64 {
    let sa = size.sign_extend(a) as i32 as i64;
    let sb = size.sign_extend(b) as i32 as i64;
    let p = sa * sb;
    let lo = p as u32 & size.mask();
    let overflow = size.sign_extend(lo) as i32 as i64 != p;
    f.set(Flags::CF, overflow);
    f.set(Flags::OF, overflow);
    p as u64 & (u64::MAX >> (64 - 2 * size.bits()))
}

/// Unsigned divide of a double-width dividend. Returns (quotient, remainder).
pub fn div(dividend: u64, divisor: u32, size: OpSize) -> Result<(u32, u32), CpuException> {
    let d = (divisor & size.mask()) as u64;
    if d == 0 {
        return Err(CpuException::de());
    }
    let q = dividend / d;
    if q > size.mask() as u64 {
        return Err(CpuException::de());
    }
    Ok((q as u32, (dividend % d) as u32))
}

pub fn idiv(dividend: u64, divisor: u32, size: OpSize) -> Result<(u32, u32), CpuException> {
    let n = match size {
        OpSize::Byte => dividend as u16 as i16 as i64,
        OpSize::Word => dividend as u32 as i32 as i64,
        OpSize::Dword => dividend as i64,
    };
    let d = size.sign_extend(divisor) as i32 as i64;
    if d == 0 {
        return Err(CpuException::de());
    }
    let q = n.checked_div(d).ok_or(CpuException::de())?;
    let r = n % d;
    let limit = size.sign_bit() as i64;
    if q < -limit || q >= limit {
        return Err(CpuException::de());
    }
    Ok((q as u32 & size.mask(), r as u32 & size.mask()))
}

pub fn daa(f: &mut Flags, al: u8) -> u8 {
    let (old_al, old_cf) = (al, f.contains(Flags::CF));
    let mut al = al;
    if al & 0xF > 9 || f.contains(Flags::AF) {
        al = al.wrapping_add(6);
        f.insert(Flags::AF);
    } else {
        f.remove(Flags::AF);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        f.insert(Flags::CF);
    } else {
        f.remove(Flags::CF);
    }
    set_szp(f, al as u32, OpSize::Byte);
    al
}

pub fn das(f: &mut Flags, al: u8) -> u8 {
    let (old_al, old_cf) = (al, f.contains(Flags::CF));
    let mut al = al;
    f.remove(Flags::CF);
    if al & 0xF > 9 || f.contains(Flags::AF) {
        f.set(Flags::CF, old_cf || al < 6);
        al = al.wrapping_sub(6);
        f.insert(Flags::AF);
    } else {
        f.remove(Flags::AF);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        f.insert(Flags::CF);
    }
    set_szp(f, al as u32, OpSize::Byte);
    al
}

/// AAA/AAS on AX. Returns the adjusted AX.
pub fn ascii_adjust(f: &mut Flags, ax: u16, subtract: bool) -> u16 {
    let al = ax as u8;
    let mut ah = (ax >> 8) as u8;
    let adjust = al & 0xF > 9 || f.contains(Flags::AF);
    let al = if adjust {
        if subtract {
            ah = ah.wrapping_sub(1);
            al.wrapping_sub(6)
        } else {
            ah = ah.wrapping_add(1);
            al.wrapping_add(6)
        }
    } else {
        al
    };
    f.set(Flags::AF, adjust);
    f.set(Flags::CF, adjust);
    ((ah as u16) << 8) | (al & 0xF) as u16
}

/// AAM: AH = AL / base, AL = AL % base.
pub fn aam(f: &mut Flags, al: u8, base: u8) -> Result<u16, CpuException> {
    if base == 0 {
        return Err(CpuException::de());
    }
    let (ah, al) = (al / base, al % base);
    set_szp(f, al as u32, OpSize::Byte);
    Ok(((ah as u16) << 8) | al as u16)
}

/// AAD: AL = AL + AH * base, AH = 0.
pub fn aad(f: &mut Flags, ax: u16, base: u8) -> u16 {
    let al = (ax as u8).wrapping_add(((ax >> 8) as u8).wrapping_mul(base));
    set_szp(f, al as u32, OpSize::Byte);
    al as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> Flags {
        Flags::RESERVED1
    }

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut f = flags();
        assert_eq!(add(&mut f, 0xFF, 1, false, OpSize::Byte), 0);
        assert!(f.contains(Flags::CF | Flags::ZF | Flags::AF));
        assert!(!f.contains(Flags::OF));

        let mut f = flags();
        assert_eq!(add(&mut f, 0x7FFF, 1, false, OpSize::Word), 0x8000);
        assert!(f.contains(Flags::OF | Flags::SF));
        assert!(!f.contains(Flags::CF));
    }

    #[test]
    fn sub_borrow_and_compare() {
        let mut f = flags();
        assert_eq!(sub(&mut f, 5, 5, false, OpSize::Byte), 0);
        assert!(f.contains(Flags::ZF | Flags::PF));
        assert_eq!(sub(&mut f, 0, 1, false, OpSize::Dword), 0xFFFF_FFFF);
        assert!(f.contains(Flags::CF | Flags::SF));
        assert_eq!(sub(&mut f, 0x80, 1, false, OpSize::Byte), 0x7F);
        assert!(f.contains(Flags::OF));
    }

    #[test]
    fn inc_keeps_carry() {
        let mut f = flags() | Flags::CF;
        assert_eq!(inc(&mut f, 0xFFFF, OpSize::Word), 0);
        assert!(f.contains(Flags::CF | Flags::ZF));
    }

    #[test]
    fn shifts_and_rotates() {
        let mut f = flags();
        assert_eq!(shift(&mut f, Op::Shl, 0x81, 1, OpSize::Byte), 0x02);
        assert!(f.contains(Flags::CF | Flags::OF));
        assert_eq!(shift(&mut f, Op::Sar, 0x80, 3, OpSize::Byte), 0xF0);
        assert_eq!(shift(&mut f, Op::Rol, 0x8001, 4, OpSize::Word), 0x0018);
        let mut f = flags() | Flags::CF;
        assert_eq!(shift(&mut f, Op::Rcl, 0x00, 1, OpSize::Byte), 0x01);
        assert!(!f.contains(Flags::CF));
        let before = f;
        assert_eq!(shift(&mut f, Op::Shr, 0x10, 0, OpSize::Byte), 0x10);
        assert_eq!(f, before);
    }

    #[test]
    fn double_shifts() {
        let mut f = flags();
        assert_eq!(shld(&mut f, 0x1234, 0xABCD, 4, OpSize::Word), 0x234A);
        assert_eq!(shrd(&mut f, 0x1234, 0xABCD, 4, OpSize::Word), 0xD123);
    }

    #[test]
    fn divide_faults() {
        assert_eq!(div(0x0100, 0, OpSize::Byte), Err(CpuException::de()));
        assert_eq!(div(0x1000, 2, OpSize::Byte), Err(CpuException::de()));
        assert_eq!(div(0x0101, 2, OpSize::Byte), Ok((0x80, 1)));
        assert_eq!(idiv(0xFFF9, 2, OpSize::Byte), Ok((0xFD, 0xFF)));
        assert_eq!(
            idiv(0x8000_0000_0000_0000, 0xFFFF_FFFF, OpSize::Dword),
            Err(CpuException::de())
        );
    }

    #[test]
    fn signed_multiply_overflow() {
        let mut f = flags();
        assert_eq!(imul(&mut f, 0xFF, 0xFF, OpSize::Byte), 0x0001);
        assert!(!f.contains(Flags::CF));
        assert_eq!(imul(&mut f, 0x40, 0x02, OpSize::Byte), 0x0080);
        assert!(f.contains(Flags::CF | Flags::OF));
    }

    #[test]
    fn bcd_adjust() {
        let mut f = flags();
        // 0x19 + 0x28 = 0x41, adjusted to 47
        let r = add(&mut f, 0x19, 0x28, false, OpSize::Byte) as u8;
        assert_eq!(daa(&mut f, r), 0x47);
        let mut f = flags();
        assert_eq!(aam(&mut f, 47, 10), Ok(0x0407));
        assert_eq!(aad(&mut f, 0x0407, 10), 47);
    }
}
