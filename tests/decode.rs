mod common;

use common::Machine;
use pretty_assertions::assert_eq;

use i386_rs::instructions::{FpuOp, Op};
use i386_rs::operand::Operand;
use i386_rs::regs::OpSize;
use i386_rs::{CpuConfig, CpuException, CpuType};

fn i486() -> CpuConfig {
    CpuConfig {
        cpu_type: CpuType::I486,
        ..CpuConfig::default()
    }
}

#[test]
fn cmp_al_imm8() {
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0x80, 0xF8, 0x05, 0xF4]);
    let block = m.decode();
    let i = block.instructions[0];
    assert_eq!(i.op, Op::Cmp);
    assert_eq!(i.size, OpSize::Byte);
    assert_eq!(i.dst, Operand::reg(0, OpSize::Byte));
    assert_eq!(i.src, Operand::Imm(5));
    assert_eq!((i.start, i.end), (0x7C00, 0x7C03));
    assert_eq!(block.instructions[1].op, Op::Hlt);
    assert_eq!(block.instructions.len(), 2);
}

#[test]
fn operand_size_prefix_toggles_width() {
    let mut m = Machine::real(
        CpuConfig::default(),
        0,
        0x7C00,
        &[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12, 0xB8, 0x34, 0x12, 0xF4],
    );
    let block = m.decode();
    let wide = block.instructions[0];
    assert_eq!(wide.size, OpSize::Dword);
    assert_eq!(wide.src, Operand::Imm(0x1234_5678));
    assert_eq!(wide.len(), 6);
    // The prefix only applies to its own instruction.
    let narrow = block.instructions[1];
    assert_eq!(narrow.size, OpSize::Word);
    assert_eq!(narrow.src, Operand::Imm(0x1234));
}

#[test]
fn sign_extended_group1_immediate() {
    // add sp, -2
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0x83, 0xC4, 0xFE, 0xF4]);
    let i = m.decode().instructions[0];
    assert_eq!(i.op, Op::Add);
    assert_eq!(i.dst, Operand::reg(4, OpSize::Word));
    assert_eq!(i.src, Operand::Imm(0xFFFE));
}

#[test]
fn rep_on_non_string_is_invalid() {
    // rep inc ax
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0xF3, 0x40, 0xF4]);
    let block = m.decode();
    assert_eq!(block.instructions.len(), 1);
    assert_eq!(block.instructions[0].op, Op::Raise(CpuException::ud()));
    assert!(!block.cacheable);
}

#[test]
fn rep_string_counts_with_address_size() {
    // rep movsb ; a32 rep stosb
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0xF3, 0xA4, 0x67, 0xF3, 0xAA, 0xF4]);
    let block = m.decode();
    let movs = block.instructions[0];
    assert_eq!(movs.rep.map(|r| r.counter), Some(Operand::reg(1, OpSize::Word)));
    let stos = block.instructions[1];
    assert!(stos.addr32);
    assert_eq!(stos.rep.map(|r| r.counter), Some(Operand::reg(1, OpSize::Dword)));
}

#[test]
fn i486_opcodes_need_a_486() {
    let code = [0x0F, 0xC8, 0xF4];
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &code);
    assert_eq!(m.decode().instructions[0].op, Op::Raise(CpuException::ud()));

    let mut m = Machine::real(i486(), 0, 0x7C00, &code);
    let i = m.decode().instructions[0];
    assert_eq!(i.op, Op::Bswap);
    assert_eq!(i.dst, Operand::reg(0, OpSize::Dword));
}

#[test]
fn escape_is_inserted_once_ahead_of_x87() {
    // fld1 ; fldz ; hlt
    let code = [0xD9, 0xE8, 0xD9, 0xEE, 0xF4];
    let cfg = CpuConfig {
        has_fpu: true,
        ..CpuConfig::default()
    };
    let mut m = Machine::real(cfg, 0, 0x7C00, &code);
    let ops: Vec<Op> = m.decode().instructions.iter().map(|i| i.op).collect();
    assert_eq!(
        ops,
        vec![
            Op::Escape,
            Op::Fpu(FpuOp {
                escape: 0xD9,
                modrm: 0xE8
            }),
            Op::Fpu(FpuOp {
                escape: 0xD9,
                modrm: 0xEE
            }),
            Op::Hlt,
        ]
    );

    // Without a coprocessor the escape opcodes decode to bare ESC.
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &code);
    let block = m.decode();
    assert_eq!(block.instructions[0].op, Op::Escape);
    assert_eq!(block.instructions[0].len(), 2);
}

#[test]
fn block_stops_before_an_instruction_crossing_the_page() {
    // nop at 0FFD, then mov ax,1234 spanning 0FFE..1000
    let mut m = Machine::real(CpuConfig::default(), 0, 0x0FFD, &[0x90, 0xB8, 0x34, 0x12, 0xF4]);
    let block = m.decode();
    assert_eq!(block.instructions.len(), 1);
    assert_eq!(block.end_eip(), 0x0FFE);

    // Decoded on its own, the straddling instruction records its tail bytes.
    m.cpu.regs.eip = 0x0FFE;
    let block = m.decode();
    assert_eq!(block.instructions[0].src, Operand::Imm(0x1234));
    let tail = block.tail.unwrap();
    assert_eq!((tail.first, tail.last), (0x1000, 0x1000));
}

#[test]
fn mov_to_cs_is_invalid() {
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0x8E, 0xC8]);
    assert_eq!(m.decode().instructions[0].op, Op::Raise(CpuException::ud()));
}

#[test]
fn operand_size_prefix_toggles_from_32_bit_default() {
    // mov eax, imm32 ; o16 mov ax, imm16 ; hlt
    let code = [0xB8, 0x78, 0x56, 0x34, 0x12, 0x66, 0xB8, 0x34, 0x12, 0xF4];
    let mut m = Machine::protected(CpuConfig::default(), &code);
    let block = m.decode();
    assert!(block.code32);
    assert_eq!(block.instructions[0].size, OpSize::Dword);
    assert_eq!(block.instructions[1].size, OpSize::Word);
    assert_eq!(block.instructions[1].src, Operand::Imm(0x1234));
}

#[test]
fn decoding_is_deterministic() {
    let code = [
        0x66, 0x8B, 0x44, 0x24, 0x08, 0x03, 0x04, 0x8D, 0x10, 0x00, 0x00, 0x00, 0xF3, 0xA5, 0x75,
        0xF0,
    ];
    let mut m = Machine::protected(CpuConfig::default(), &code);
    let a = m.decode();
    let b = m.decode();
    assert_eq!(a.instructions, b.instructions);
    assert_eq!(a.end_eip(), b.end_eip());
    assert_eq!(a.instructions.len(), 4);
}
