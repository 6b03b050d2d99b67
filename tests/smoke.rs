mod common;

use common::*;
use pretty_assertions::assert_eq;

use i386_rs::board::PortWrite;
use i386_rs::regs::{EBX, ECX, EDI, ESP};
use i386_rs::CpuConfig;

#[test]
fn real_mode_program_runs_to_halt() {
    let code = [
        0xB8, 0x34, 0x12, // mov ax, 0x1234
        0xBA, 0x80, 0x00, // mov dx, 0x80
        0xEF, // out dx, ax
        0xB9, 0x04, 0x00, // mov cx, 4
        0xBF, 0x00, 0x06, // mov di, 0x600
        0xB0, 0xAA, // mov al, 0xaa
        0xF3, 0xAA, // rep stosb
        0xE4, 0x60, // in al, 0x60
        0xE6, 0x61, // out 0x61, al
        0x50, // push ax
        0x5B, // pop bx
        0xF4, // hlt
    ];
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &code);
    m.cpu.regs.gpr[ESP] = 0x7000;
    m.board.set_port(0x60, 0x5A);

    m.run(16).unwrap();
    assert_eq!(
        m.board.writes,
        vec![
            PortWrite {
                port: 0x80,
                size: 2,
                value: 0x1234
            },
            PortWrite {
                port: 0x61,
                size: 1,
                value: 0x5A
            },
        ]
    );
    let filled: Vec<u8> = (0x600..0x605).map(|a| m.r8(a)).collect();
    assert_eq!(filled, vec![0xAA, 0xAA, 0xAA, 0xAA, 0x00]);
    assert_eq!(m.cpu.regs.gpr[ECX] & 0xFFFF, 0);
    assert_eq!(m.cpu.regs.gpr[EDI] & 0xFFFF, 0x604);
    assert_eq!(m.cpu.regs.gpr[EBX] & 0xFFFF, 0x125A);
    assert_eq!(m.esp(), 0x7000);
    assert!(m.cpu.cycles >= 12);
}

#[test]
fn ring3_port_access_without_permission_faults() {
    // out 0x80, al with IOPL 0 and no I/O bitmap inside the TSS limit
    let mut m = Machine::protected(CpuConfig::default(), &[0xE6, 0x80]);
    m.set_idt(13, CODE0, 0x5000, 0x8E);
    m.load(0x5000, &[0xF4]);
    m.enter_ring3(0x4000, STACK3);

    m.run(4).unwrap();
    assert!(m.board.writes.is_empty());
    assert_eq!(m.cpu.regs.eip, 0x5001);
    assert_eq!(m.r32(STACK0 - 20), 0x4000);
}

#[test]
fn reset_vector_reaches_bios_image() {
    // The top of the first megabyte is visible at FFFFFFF0 after reset.
    let mut m = Machine::new(CpuConfig::default());
    m.load(0xFFFF0, &[0xF4]);
    m.step().unwrap();
    assert!(m.cpu.halted);
    assert_eq!(m.cpu.regs.eip, 0xFFF1);
}
