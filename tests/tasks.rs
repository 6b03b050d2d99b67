mod common;

use common::*;
use pretty_assertions::assert_eq;

use i386_rs::descriptor::segment_descriptor;
use i386_rs::regs::{Flags, EAX, EBX};
use i386_rs::CpuConfig;

const NEXT_TSS: u32 = 0x3100;
const NEXT_SEL: u16 = 0x38;

/// A second 386 TSS in GDT slot 7 that starts at `eip` with flat ring 0
/// segments and its own stack.
fn add_task(m: &mut Machine, eip: u32) {
    m.set_gdt(7, segment_descriptor(NEXT_TSS, 0x67, 0x89, 0));
    m.w32(NEXT_TSS + 0x20, eip);
    m.w32(NEXT_TSS + 0x24, 0x0000_0002);
    m.w32(NEXT_TSS + 0x34, 0x2222);
    m.w32(NEXT_TSS + 0x38, 0x7000);
    let segs = [DATA0, CODE0, DATA0, DATA0, DATA0, DATA0];
    for (i, s) in segs.iter().enumerate() {
        m.w32(NEXT_TSS + 0x48 + 4 * i as u32, *s as u32);
    }
}

#[test]
fn call_to_tss_nests_and_iret_returns() {
    // call far 0038:0 ; hlt            task 2 at 6000: iret
    let mut m = Machine::protected(
        CpuConfig::default(),
        &[0x9A, 0x00, 0x00, 0x00, 0x00, 0x38, 0x00, 0xF4],
    );
    add_task(&mut m, 0x6000);
    m.load(0x6000, &[0xCF]);
    // The running task is busy.
    m.set_gdt(5, segment_descriptor(TSS, 0x67, 0x8B, 0));
    m.cpu.regs.gpr[EBX] = 0x1234;

    m.step().unwrap();
    assert_eq!(m.cpu.regs.tr.selector, NEXT_SEL);
    assert_eq!(m.cpu.regs.eip, 0x6000);
    assert!(m.cpu.regs.eflags.contains(Flags::NT));
    assert_eq!(m.r16(NEXT_TSS), TSS_SEL);
    assert_eq!(m.r8(GDT + 7 * 8 + 5), 0x8B);
    assert_eq!(m.r8(GDT + 5 * 8 + 5), 0x8B);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.tr.selector, TSS_SEL);
    assert_eq!(m.cpu.regs.eip, 0x4007);
    assert_eq!(m.cpu.regs.gpr[EBX], 0x1234);
    assert_eq!(m.esp(), STACK0);
    assert!(!m.cpu.regs.eflags.contains(Flags::NT));
    // IRET frees the task it leaves.
    assert_eq!(m.r8(GDT + 7 * 8 + 5), 0x89);
    // Task 2's registers were written back on the way out.
    assert_eq!(m.r32(NEXT_TSS + 0x20), 0x6001);

    m.step().unwrap();
    assert!(m.cpu.halted);
}

#[test]
fn jump_to_busy_tss_faults() {
    let mut m = Machine::protected(
        CpuConfig::default(),
        &[0xEA, 0x00, 0x00, 0x00, 0x00, 0x38, 0x00],
    );
    add_task(&mut m, 0x6000);
    m.set_gdt(7, segment_descriptor(NEXT_TSS, 0x67, 0x8B, 0));
    m.set_idt(13, CODE0, 0x5000, 0x8E);
    m.load(0x5000, &[0xF4]);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.tr.selector, TSS_SEL);
    assert_eq!(m.cpu.regs.eip, 0x5000);
    let esp = m.esp();
    assert_eq!(m.r32(esp), NEXT_SEL as u32);
}

#[test]
fn task_gate_in_idt_switches_on_interrupt() {
    // int 0x30 through a task gate; the handler task halts.
    let mut m = Machine::protected(CpuConfig::default(), &[0xCD, 0x30]);
    add_task(&mut m, 0x6000);
    m.load(0x6000, &[0xF4]);
    m.set_gdt(5, segment_descriptor(TSS, 0x67, 0x8B, 0));
    // Task gate: selector in bits 16..31, access 0x85.
    m.w32(IDT + 0x30 * 8, (NEXT_SEL as u32) << 16);
    m.w32(IDT + 0x30 * 8 + 4, 0x85 << 8);
    m.cpu.regs.gpr[EAX] = 0x77;

    m.step().unwrap();
    assert_eq!(m.cpu.regs.tr.selector, NEXT_SEL);
    assert!(m.cpu.regs.eflags.contains(Flags::NT));
    assert_eq!(m.cpu.regs.gpr[EBX], 0x2222);
    assert_eq!(m.r32(TSS + 0x28), 0x77);
    assert_eq!(m.r32(TSS + 0x20), 0x4002);

    m.step().unwrap();
    assert!(m.cpu.halted);
}
