mod common;

use common::*;
use pretty_assertions::assert_eq;

use i386_rs::descriptor::{gate_descriptor, segment_descriptor};
use i386_rs::regs::{Cr0, Flags, SegReg, EAX, ESP};
use i386_rs::CpuConfig;

#[test]
fn real_mode_near_call_and_ret() {
    // F000:FFF0  call FFF8 ; hlt ; 4x nop ; FFF8: ret
    let code = [0xE8, 0x05, 0x00, 0xF4, 0x90, 0x90, 0x90, 0x90, 0xC3];
    let mut m = Machine::real(CpuConfig::default(), 0xF000, 0xFFF0, &code);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0xFFF8);
    assert_eq!(m.esp(), 0xFFFE);
    assert_eq!(m.r16(0xFFFE), 0xFFF3);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0xFFF3);
    assert_eq!(m.esp(), 0);

    m.step().unwrap();
    assert!(m.cpu.halted);
}

#[test]
fn real_mode_far_call_and_retf() {
    // 0000:7C00  call 0800:0010 ; hlt      8010: retf
    let mut m = Machine::real(
        CpuConfig::default(),
        0,
        0x7C00,
        &[0x9A, 0x10, 0x00, 0x00, 0x08, 0xF4],
    );
    m.load(0x8010, &[0xCB]);
    m.cpu.regs.gpr[ESP] = 0x7000;

    m.step().unwrap();
    assert_eq!((m.cs(), m.cpu.regs.eip), (0x0800, 0x0010));
    assert_eq!(m.r16(0x6FFE), 0x0000);
    assert_eq!(m.r16(0x6FFC), 0x7C05);

    m.step().unwrap();
    assert_eq!((m.cs(), m.cpu.regs.eip), (0x0000, 0x7C05));
    assert_eq!(m.esp(), 0x7000);
}

#[test]
fn far_call_privilege_fault_happens_before_any_push() {
    // call far 001B:00001000 from ring 0 (RPL 3 > CPL for a direct call)
    let mut m = Machine::protected(
        CpuConfig::default(),
        &[0x9A, 0x00, 0x10, 0x00, 0x00, 0x1B, 0x00],
    );
    m.set_idt(13, CODE0, 0x5000, 0x8E);
    m.load(0x5000, &[0xF4]);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5000);
    // Only the exception frame is on the stack.
    assert_eq!(m.esp(), STACK0 - 16);
    let esp = m.esp();
    assert_eq!(m.r32(esp), 0x18);
    assert_eq!(m.r32(esp + 4), 0x4000);
    assert_eq!(m.r32(esp + 8), CODE0 as u32);
}

#[test]
fn call_gate_switches_stack_and_copies_parameters() {
    // ring 3: push 12345678 ; call far 0033:0     ring 0 at 5000: retf 4
    let code = [
        0x68, 0x78, 0x56, 0x34, 0x12, 0x9A, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00, 0xEB, 0xFE,
    ];
    let mut m = Machine::protected(CpuConfig::default(), &code);
    m.set_gdt(6, gate_descriptor(CODE0, 0x5000, 0xEC, 1));
    m.load(0x5000, &[0xCA, 0x04, 0x00]);
    m.enter_ring3(0x4000, STACK3);

    m.step().unwrap();
    assert_eq!(m.cs(), CODE0);
    assert_eq!(m.cpu.regs.cpl(), 0);
    assert_eq!(m.cpu.regs.eip, 0x5000);
    assert_eq!(m.cpu.regs.seg(SegReg::Ss).selector(), DATA0);
    assert_eq!(m.esp(), STACK0 - 20);
    let frame: Vec<u32> = (0..5).map(|i| m.r32(STACK0 - 20 + 4 * i)).collect();
    assert_eq!(
        frame,
        vec![0x400C, CODE3 as u32, 0x1234_5678, STACK3 - 4, DATA3 as u32]
    );

    m.step().unwrap();
    assert_eq!(m.cs(), CODE3);
    assert_eq!(m.cpu.regs.eip, 0x400C);
    assert_eq!(m.cpu.regs.seg(SegReg::Ss).selector(), DATA3);
    assert_eq!(m.esp(), STACK3);
    // FS/GS still held ring 0 data and are dropped on the way out.
    assert!(!m.cpu.regs.seg(SegReg::Fs).is_usable());
    assert!(!m.cpu.regs.seg(SegReg::Gs).is_usable());
    assert!(m.cpu.regs.seg(SegReg::Ds).is_usable());
}

#[test]
fn bad_inner_stack_in_tss_escalates_to_shutdown() {
    let code = [0x9A, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00];
    let mut m = Machine::protected(CpuConfig::default(), &code);
    m.set_gdt(6, gate_descriptor(CODE0, 0x5000, 0xEC, 0));
    // SS0 names the ring 3 data segment: #TS(selector).
    m.w32(TSS + 8, DATA3 as u32);
    m.enter_ring3(0x4000, STACK3);
    m.set_idt(10, CODE0, 0x5100, 0x8E);
    m.load(0x5100, &[0xF4]);

    // #TS delivery needs a ring 0 stack too, and SS0 is bad: #TS again,
    // which escalates to #DF and then to a triple fault.
    m.cpu.cfg.reset_on_triple_fault = false;
    let err = m.step().unwrap_err();
    assert!(matches!(err, i386_rs::Trap::Shutdown));
}

#[test]
fn real_mode_int_and_iret_restore_flags() {
    let mut m = Machine::real(CpuConfig::default(), 0, 0x7C00, &[0xCD, 0x21, 0xF4]);
    m.w32(0x21 * 4, 0x0000_0500);
    m.load(0x0500, &[0xCF]);
    m.cpu.regs.eflags.insert(Flags::IF | Flags::CF);
    m.cpu.regs.gpr[ESP] = 0x7000;

    m.step().unwrap();
    assert_eq!((m.cs(), m.cpu.regs.eip), (0, 0x0500));
    assert!(!m.cpu.regs.eflags.contains(Flags::IF));
    assert_eq!(m.esp(), 0x6FFA);
    assert_eq!(m.r16(0x6FFA), 0x7C02);

    m.cpu.regs.eflags.remove(Flags::CF);
    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x7C02);
    assert!(m.cpu.regs.eflags.contains(Flags::IF | Flags::CF));
    assert_eq!(m.esp(), 0x7000);
}

#[test]
fn software_interrupt_from_ring3_and_iret_back() {
    let mut m = Machine::protected(CpuConfig::default(), &[0xCD, 0x80, 0xEB, 0xFE]);
    m.set_idt(0x80, CODE0, 0x5000, 0xEE);
    m.load(0x5000, &[0xCF]);
    m.enter_ring3(0x4000, STACK3);
    m.cpu.regs.eflags.insert(Flags::IF);

    m.step().unwrap();
    assert_eq!(m.cs(), CODE0);
    assert_eq!(m.cpu.regs.eip, 0x5000);
    assert!(!m.cpu.regs.eflags.contains(Flags::IF));
    assert_eq!(m.esp(), STACK0 - 20);
    let esp = m.esp();
    assert_eq!(m.r32(esp), 0x4002);
    assert_eq!(m.r32(esp + 4), CODE3 as u32);
    assert_eq!(m.r32(esp + 12), STACK3);
    assert_eq!(m.r32(esp + 16), DATA3 as u32);

    m.step().unwrap();
    assert_eq!(m.cs(), CODE3);
    assert_eq!(m.cpu.regs.eip, 0x4002);
    assert_eq!(m.esp(), STACK3);
    assert!(m.cpu.regs.eflags.contains(Flags::IF));
}

#[test]
fn gate_dpl_blocks_int_n_from_ring3() {
    let mut m = Machine::protected(CpuConfig::default(), &[0xCD, 0x81]);
    m.set_idt(0x81, CODE0, 0x5000, 0x8E);
    m.set_idt(13, CODE0, 0x5100, 0x8E);
    m.load(0x5100, &[0xF4]);
    m.enter_ring3(0x4000, STACK3);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5100);
    let esp = m.esp();
    assert_eq!(esp, STACK0 - 24);
    assert_eq!(m.r32(esp), 0x81 * 8 + 2);
    assert_eq!(m.r32(esp + 4), 0x4000);
}

#[test]
fn jmp_to_tss_switches_task() {
    let mut m = Machine::protected(
        CpuConfig::default(),
        &[0xEA, 0x00, 0x00, 0x00, 0x00, 0x38, 0x00],
    );
    let next = 0x3100;
    m.set_gdt(7, segment_descriptor(next, 0x67, 0x89, 0));
    m.w32(next + 0x20, 0x6000);
    m.w32(next + 0x24, 0x0000_0002);
    m.w32(next + 0x28, 0x1111);
    m.w32(next + 0x38, 0x7000);
    let segs = [DATA0, CODE0, DATA0, DATA0, DATA0, DATA0];
    for (i, s) in segs.iter().enumerate() {
        m.w32(next + 0x48 + 4 * i as u32, *s as u32);
    }
    m.cpu.regs.gpr[EAX] = 0xAAAA;

    m.step().unwrap();
    assert_eq!(m.cpu.regs.tr.selector, 0x38);
    assert_eq!(m.cpu.regs.eip, 0x6000);
    assert_eq!(m.cpu.regs.gpr[EAX], 0x1111);
    assert_eq!(m.esp(), 0x7000);
    assert!(m.cpu.regs.cr0.contains(Cr0::TS));
    // Outgoing state saved, busy bits moved.
    assert_eq!(m.r32(TSS + 0x20), 0x4007);
    assert_eq!(m.r32(TSS + 0x28), 0xAAAA);
    assert_eq!(m.r8(GDT + 7 * 8 + 5), 0x8B);
    assert_eq!(m.r8(GDT + 5 * 8 + 5), 0x89);
}

#[test]
fn near_ret_beyond_cs_limit_faults_without_popping() {
    // Byte-granular code segment ending at 0x4FFF; the return address is past it.
    let mut m = Machine::protected(CpuConfig::default(), &[0xC3]);
    m.set_gdt(6, segment_descriptor(0, 0x4FFF, 0x9A, 0x4));
    m.load_seg(SegReg::Cs, 0x30, 6);
    m.set_idt(13, 0x30, 0x4800, 0x8E);
    m.load(0x4800, &[0xF4]);
    m.cpu.regs.gpr[ESP] = STACK0 - 4;
    m.w32(STACK0 - 4, 0x6000);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x4800);
    // The frame sits directly below the untouched return address.
    assert_eq!(m.esp(), STACK0 - 4 - 16);
    assert_eq!(m.r32(STACK0 - 4), 0x6000);
}

#[test]
fn faulting_far_call_restores_esp() {
    // ring 3: call far 001B:5000 with only room for the CS push on an
    // expand-down stack whose lowest valid offset is 0x1000
    let mut m = Machine::protected(
        CpuConfig::default(),
        &[0x9A, 0x00, 0x50, 0x00, 0x00, 0x1B, 0x00],
    );
    m.set_gdt(6, segment_descriptor(0, 0x0FFF, 0xF6, 0x4));
    m.set_idt(12, CODE0, 0x5100, 0x8E);
    m.load(0x5100, &[0xF4]);
    m.enter_ring3(0x4000, 0x1006);
    m.load_seg(SegReg::Ss, 0x33, 6);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5100);
    // #SS(0) frame on the ring 0 stack records the untouched ring 3 stack.
    assert_eq!(m.r32(STACK0 - 4), 0x33);
    assert_eq!(m.r32(STACK0 - 8), 0x1006);
    assert_eq!(m.r32(STACK0 - 16), CODE3 as u32);
    assert_eq!(m.r32(STACK0 - 20), 0x4000);
    assert_eq!(m.r32(STACK0 - 24), 0);
}

#[test]
fn iret_to_ring3_with_bad_stack_selector_rolls_back() {
    // iret from ring 0 with a frame naming ring 3 code but the ring 0 data
    // selector for SS
    let mut m = Machine::protected(CpuConfig::default(), &[0xCF]);
    m.set_idt(13, CODE0, 0x5000, 0x8E);
    m.load(0x5000, &[0xF4]);
    let frame = [0x6000, CODE3 as u32, 0x0000_0002, 0x7000, DATA0 as u32];
    for (i, v) in frame.iter().enumerate() {
        m.w32(STACK0 - 20 + 4 * i as u32, *v);
    }
    m.cpu.regs.gpr[ESP] = STACK0 - 20;
    m.cpu.regs.eflags.insert(Flags::IF);

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5000);
    assert_eq!(m.cs(), CODE0);
    let esp = m.esp();
    assert_eq!(esp, STACK0 - 20 - 16);
    assert_eq!(m.r32(esp), DATA0 as u32);
    assert_eq!(m.r32(esp + 4), 0x4000);
    assert_eq!(m.r32(esp + 8), CODE0 as u32);
    // The flags from the frame were never committed.
    assert_ne!(m.r32(esp + 12) & Flags::IF.bits(), 0);
    assert_eq!(m.r32(STACK0 - 20), 0x6000);
}

#[test]
fn retf_to_ring3_with_null_stack_selector_rolls_back() {
    let mut m = Machine::protected(CpuConfig::default(), &[0xCB]);
    m.set_idt(13, CODE0, 0x5000, 0x8E);
    m.load(0x5000, &[0xF4]);
    let frame = [0x6000, CODE3 as u32, 0x7000, 0];
    for (i, v) in frame.iter().enumerate() {
        m.w32(STACK0 - 16 + 4 * i as u32, *v);
    }
    m.cpu.regs.gpr[ESP] = STACK0 - 16;

    m.step().unwrap();
    assert_eq!(m.cpu.regs.eip, 0x5000);
    assert_eq!(m.cs(), CODE0);
    assert_eq!(m.cpu.regs.seg(SegReg::Ss).selector(), DATA0);
    let esp = m.esp();
    assert_eq!(esp, STACK0 - 16 - 16);
    assert_eq!(m.r32(esp), 0);
    assert_eq!(m.r32(esp + 4), 0x4000);
}
