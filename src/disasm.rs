use std::fmt::Write as _;

use crate::block::CodeBlock;
use crate::cpu::Cpu;
use crate::instructions::{Instruction, Op, RepKind};
use crate::isa::modrm::EffectiveAddress;
use crate::isa::x87;
use crate::operand::{MemRef, Operand};
use crate::regs::{OpSize, SegReg};

const REG8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
const REG16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const REG32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

pub fn reg_name(index: u8, size: OpSize) -> &'static str {
    let i = index as usize & 7;
    match size {
        OpSize::Byte => REG8[i],
        OpSize::Word => REG16[i],
        OpSize::Dword => REG32[i],
    }
}

fn width_name(size: OpSize) -> &'static str {
    match size {
        OpSize::Byte => "byte",
        OpSize::Word => "word",
        OpSize::Dword => "dword",
    }
}

fn fmt_ea(ea: &EffectiveAddress) -> String {
    let names = if ea.addr32 { &REG32 } else { &REG16 };
    let mut s = String::new();
    if let Some(b) = ea.base {
        s.push_str(names[b as usize & 7]);
    }
    if let Some(i) = ea.index {
        if !s.is_empty() {
            s.push('+');
        }
        s.push_str(names[i as usize & 7]);
        if ea.scale != 0 {
            let _ = write!(s, "*{}", 1u32 << ea.scale);
        }
    }
    if s.is_empty() {
        let _ = write!(s, "{:#x}", ea.disp);
    } else if ea.disp != 0 {
        let disp = if ea.addr32 { ea.disp } else { ea.disp & 0xFFFF };
        let signed = if ea.addr32 { disp as i32 } else { disp as u16 as i16 as i32 };
        if signed < 0 {
            let _ = write!(s, "-{:#x}", signed.unsigned_abs());
        } else {
            let _ = write!(s, "+{:#x}", signed);
        }
    }
    s
}

fn fmt_mem(m: &MemRef, width: &str) -> String {
    let seg = m.seg.name();
    if width.is_empty() {
        format!("[{seg}:{}]", fmt_ea(&m.ea))
    } else {
        format!("{width} [{seg}:{}]", fmt_ea(&m.ea))
    }
}

pub fn fmt_operand(op: &Operand) -> String {
    match op {
        Operand::None => String::new(),
        Operand::Reg { index, size } => reg_name(*index, *size).to_string(),
        Operand::Seg(s) => s.name().to_string(),
        Operand::Mem(m) => fmt_mem(m, width_name(m.size)),
        Operand::Imm(v) => format!("{v:#x}"),
        Operand::Far { selector, offset } => format!("{selector:#06x}:{offset:#x}"),
        Operand::St(i) => format!("st({i})"),
        Operand::Control(n) => format!("cr{n}"),
        Operand::Debug(n) => format!("dr{n}"),
        Operand::Test(n) => format!("tr{n}"),
    }
}

fn mnemonic(i: &Instruction) -> String {
    let base = match i.op {
        Op::Jcc(c) => format!("j{}", c.suffix()),
        Op::Setcc(c) => format!("set{}", c.suffix()),
        op if op.is_string_move() || op.is_string_compare() => {
            let suffix = match i.size {
                OpSize::Byte => 'b',
                OpSize::Word => 'w',
                OpSize::Dword => 'd',
            };
            format!("{}{suffix}", op.mnemonic())
        }
        Op::Cbw if i.size == OpSize::Dword => "cwde".to_string(),
        Op::Cwd if i.size == OpSize::Dword => "cdq".to_string(),
        Op::Iret if i.size == OpSize::Dword => "iretd".to_string(),
        op => op.mnemonic().to_string(),
    };
    let mut s = String::new();
    if i.lock {
        s.push_str("lock ");
    }
    if let Some(rep) = i.rep {
        s.push_str(match (rep.kind, i.op.is_string_compare()) {
            (RepKind::Rep, _) => "rep ",
            (RepKind::Repz, true) => "repe ",
            (RepKind::Repnz, true) => "repne ",
            _ => "rep ",
        });
    }
    s.push_str(&base);
    s
}

/// One instruction in Intel-like syntax. Relative branch targets are shown
/// resolved against the end of the instruction.
pub fn fmt_instruction(i: &Instruction) -> String {
    let mut ops: Vec<String> = Vec::new();
    let branch = matches!(
        i.op,
        Op::Jmp | Op::Jcc(_) | Op::Call | Op::Jcxz | Op::Loop | Op::Loope | Op::Loopne
    );
    match i.op {
        Op::Fpu(f) => {
            let op = match &i.dst {
                Operand::Mem(m) => fmt_mem(m, x87::memory_width(f.escape, f.modrm)),
                other => fmt_operand(other),
            };
            if !op.is_empty() {
                ops.push(op);
            }
        }
        _ if branch => {
            if let Operand::Imm(rel) = i.src {
                ops.push(format!("{:#x}", i.end.wrapping_add(rel)));
            } else {
                ops.push(fmt_operand(&i.src));
            }
        }
        _ => {
            for op in [&i.dst, &i.src, &i.aux] {
                if !op.is_none() {
                    ops.push(fmt_operand(op));
                }
            }
        }
    }
    let m = mnemonic(i);
    if ops.is_empty() {
        m
    } else {
        format!("{m} {}", ops.join(", "))
    }
}

pub fn fmt_block(block: &CodeBlock) -> String {
    let mut s = String::new();
    for i in &block.instructions {
        let _ = writeln!(s, "{:04x}:{:08x}  {}", block.cs_selector, i.start, fmt_instruction(i));
    }
    s
}

/// Register file, segment state and (when given) the block being run.
pub fn dump_state(cpu: &Cpu, block: Option<&CodeBlock>) -> String {
    let r = &cpu.regs;
    let mut s = String::new();
    let _ = writeln!(
        s,
        "eax={:08x} ebx={:08x} ecx={:08x} edx={:08x} esi={:08x} edi={:08x}",
        r.gpr[0], r.gpr[3], r.gpr[1], r.gpr[2], r.gpr[6], r.gpr[7]
    );
    let _ = writeln!(
        s,
        "ebp={:08x} esp={:08x} eip={:08x} eflags={:08x} cpl={} mode={:?}",
        r.gpr[5],
        r.gpr[4],
        r.eip,
        r.eflags.bits(),
        r.cpl(),
        r.mode()
    );
    for seg in SegReg::ALL {
        let d = r.seg(seg);
        let _ = writeln!(
            s,
            "{}={:04x} base={:08x} limit={:08x} dpl={} {}",
            seg.name(),
            d.selector(),
            d.base(),
            d.limit(),
            d.dpl(),
            if d.is_size32() { "32" } else { "16" }
        );
    }
    let _ = writeln!(
        s,
        "cr0={:08x} cr2={:08x} cr3={:08x} gdt={:08x}/{:04x} idt={:08x}/{:04x} ldtr={:04x} tr={:04x}",
        r.cr0.bits(),
        r.cr2,
        r.cr3,
        r.gdtr.base,
        r.gdtr.limit,
        r.idtr.base,
        r.idtr.limit,
        r.ldtr.selector,
        r.tr.selector
    );
    if let Some(b) = block {
        s.push_str(&fmt_block(b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mem(base: Option<u8>, index: Option<u8>, scale: u8, disp: u32, addr32: bool) -> Operand {
        Operand::Mem(MemRef {
            seg: SegReg::Ds,
            ea: EffectiveAddress {
                base,
                index,
                scale,
                disp,
                addr32,
                default_seg: SegReg::Ds,
            },
            size: OpSize::Dword,
        })
    }

    #[test]
    fn formats_memory_operands() {
        assert_eq!(fmt_operand(&mem(Some(3), Some(6), 2, 0x10, true)), "dword [ds:ebx+esi*4+0x10]");
        assert_eq!(fmt_operand(&mem(Some(5), None, 0, 0xFFFE, false)), "dword [ds:bp-0x2]");
        assert_eq!(fmt_operand(&mem(None, None, 0, 0x1234, false)), "dword [ds:0x1234]");
    }

    #[test]
    fn resolves_relative_branches() {
        let mut i = Instruction::with(Op::Call, OpSize::Word, Operand::None, Operand::Imm(5));
        i.start = 0xFFF0;
        i.end = 0xFFF3;
        assert_eq!(fmt_instruction(&i), "call 0xfff8");
    }

    #[test]
    fn two_operand_form() {
        let i = Instruction::with(
            Op::Cmp,
            OpSize::Byte,
            Operand::reg(0, OpSize::Byte),
            Operand::Imm(5),
        );
        assert_eq!(fmt_instruction(&i), "cmp al, 0x5");
    }
}
