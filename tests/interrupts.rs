mod common;

use common::*;
use pretty_assertions::assert_eq;

use i386_rs::regs::{Flags, SegReg, EAX, ESP};
use i386_rs::{CpuConfig, Trap};

#[test]
fn external_interrupt_wakes_halted_cpu() {
    // sti ; hlt          IVT[8] -> 0000:0600: hlt
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0xFB, 0xF4]);
    m.w32(0x08 * 4, 0x0000_0600);
    m.load(0x0600, &[0xF4]);
    m.cpu.regs.gpr[ESP] = 0x7000;

    // STI ends its block; HLT runs in the next one.
    m.step().unwrap();
    assert!(!m.cpu.halted);
    m.step().unwrap();
    assert!(m.cpu.halted);
    m.step().unwrap();
    assert!(m.cpu.halted);
    assert_eq!(m.cpu.regs.eip, 0x7C02);

    m.board.raise_irq(0x08);
    m.step().unwrap();
    assert!(m.cpu.halted);
    assert_eq!(m.cpu.regs.eip, 0x0601);
    assert_eq!(m.r16(0x6FFA), 0x7C02);
    assert!(!m.cpu.regs.eflags.contains(Flags::IF));
}

#[test]
fn masked_interrupt_stays_pending() {
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0x90, 0xF4]);
    m.board.raise_irq(0x08);
    m.run(4).unwrap();
    assert_eq!(m.cpu.regs.eip, 0x7C02);
    assert!(i386_rs::io::InterruptSource::is_pending(&m.board));
}

#[test]
fn divide_error_points_at_the_faulting_instruction() {
    // xor cx,cx ; div cx          IVT[0] -> 0000:0600: hlt
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0x31, 0xC9, 0xF7, 0xF1]);
    m.w32(0, 0x0000_0600);
    m.load(0x0600, &[0xF4]);
    m.cpu.regs.gpr[ESP] = 0x7000;

    m.run(4).unwrap();
    assert_eq!(m.cpu.regs.eip, 0x0601);
    assert_eq!(m.r16(0x6FFA), 0x7C02);
}

#[test]
fn fault_while_delivering_contributory_fault_becomes_double_fault() {
    // mov ds, ax with a selector past the GDT limit; #GP's gate is absent.
    let mut m = Machine::protected(CpuConfig::default(), &[0x8E, 0xD8]);
    m.cpu.regs.gpr[EAX] = 0x80;
    m.set_idt(13, CODE0, 0x5000, 0x0E);
    m.set_idt(8, CODE0, 0x5200, 0x8E);
    m.load(0x5200, &[0xF4]);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5200);
    let esp = m.esp();
    assert_eq!(esp, STACK0 - 16);
    assert_eq!(m.r32(esp), 0);
    assert_eq!(m.r32(esp + 4), 0x4000);
    // DS is untouched by the failed load.
    assert_eq!(m.cpu.regs.seg(SegReg::Ds).selector(), DATA0);
}

#[test]
fn page_fault_then_general_protection_is_double_fault() {
    use i386_rs::exception::{should_double_fault, Vector};
    assert!(should_double_fault(Vector::PageFault, Vector::GeneralProtection));
    assert!(should_double_fault(Vector::PageFault, Vector::PageFault));
    assert!(!should_double_fault(Vector::GeneralProtection, Vector::PageFault));
    assert!(!should_double_fault(Vector::DivideError, Vector::InvalidOpcode));
}

#[test]
fn triple_fault_shuts_down_when_configured() {
    let cfg = CpuConfig {
        reset_on_triple_fault: false,
        ..CpuConfig::default()
    };
    let mut m = Machine::protected(cfg, &[0x8E, 0xD8]);
    m.cpu.regs.gpr[EAX] = 0x80;
    m.cpu.regs.idtr.limit = 0;

    assert!(matches!(m.step(), Err(Trap::Shutdown)));
}

#[test]
fn triple_fault_resets_by_default() {
    let mut m = Machine::protected(CpuConfig::default(), &[0x8E, 0xD8]);
    m.cpu.regs.gpr[EAX] = 0x80;
    m.cpu.regs.idtr.limit = 0;

    m.step().unwrap();
    assert!(m.cpu.regs.is_in_real_mode());
    assert_eq!(m.cs(), 0xF000);
    assert_eq!(m.cpu.regs.seg(SegReg::Cs).base(), 0xFFFF_0000);
    assert_eq!(m.cpu.regs.eip, 0xFFF0);
}

#[test]
fn trap_gate_keeps_interrupts_enabled() {
    let mut m = Machine::protected(CpuConfig::default(), &[0xCD, 0x40]);
    m.set_idt(0x40, CODE0, 0x5000, 0x8F);
    m.load(0x5000, &[0xF4]);
    m.cpu.regs.eflags.insert(Flags::IF);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5000);
    assert!(m.cpu.regs.eflags.contains(Flags::IF));
    assert_eq!(m.esp(), STACK0 - 12);
}

#[test]
fn int_n_through_absent_gate_reports_the_int() {
    // int 0x41 ; the gate is not present, #NP lands at 5100
    let mut m = Machine::protected(CpuConfig::default(), &[0x90, 0xCD, 0x41]);
    m.set_idt(0x41, CODE0, 0x5000, 0x0E);
    m.set_idt(11, CODE0, 0x5100, 0x8E);
    m.load(0x5100, &[0xF4]);

    m.run(4).unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5101);
    let esp = m.esp();
    assert_eq!(esp, STACK0 - 16);
    assert_eq!(m.r32(esp), 0x41 * 8 + 2);
    assert_eq!(m.r32(esp + 4), 0x4001);
}

#[test]
fn int3_through_ring0_gate_from_ring3_reports_the_int3() {
    let mut m = Machine::protected(CpuConfig::default(), &[0xCC]);
    m.set_idt(3, CODE0, 0x5000, 0x8E);
    m.set_idt(13, CODE0, 0x5100, 0x8E);
    m.load(0x5100, &[0xF4]);
    m.enter_ring3(0x4000, STACK3);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5100);
    let esp = m.esp();
    assert_eq!(esp, STACK0 - 24);
    assert_eq!(m.r32(esp), 3 * 8 + 2);
    assert_eq!(m.r32(esp + 4), 0x4000);
    assert_eq!(m.r32(esp + 16), STACK3);
}
