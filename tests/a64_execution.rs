//! End-to-end execution of A64 guest code.

mod common;

use armjit::{JitError, MemoryError, MemoryManagerExt, Pstate};
use common::a64::*;
use common::{Asm, Machine, CODE_BASE, DATA_BASE};

#[test]
fn test_loop_and_call() {
    let machine = Machine::a64();
    let mut asm = Asm::new(CODE_BASE);
    asm.emit(movz(0, 0, 0)).emit(movz(1, 10, 0));
    let head = asm.pc();
    asm.emit(add(0, 0, 1))
        .emit(subs_imm(1, 1, 1))
        .emit_at(|pc| b_cond(pc, head, NE))
        .emit_at(|pc| bl(pc, 0x1100))
        .emit(brk(0));
    machine.load(&asm);
    machine.load_words(0x1100, &[add_imm(0, 0, 100), ret()]);

    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(0), 155);
    assert_eq!(ctx.x(1), 0);
    assert_eq!(ctx.x(30), CODE_BASE + 24);
    // Execution resumes after the breakpoint once the context runs again.
    assert_eq!(ctx.pc(), CODE_BASE + 28);
    assert_eq!(machine.recorder.breakpoints.lock().as_slice(), &[(CODE_BASE + 24, 0)]);
}

#[test]
fn test_arithmetic_and_division_edge_cases() {
    let machine = Machine::a64();
    machine.load_words(
        CODE_BASE,
        &[
            movz(1, 100, 0),
            movz(2, 7, 0),
            udiv(3, 1, 2),
            movz(4, 0, 0),
            udiv(5, 1, 4),
            movn(6, 0),
            sdiv(7, 1, 6),
            mul(8, 1, 2),
            madd(9, 1, 2, 3),
            movz(10, 0x8000, 48),
            sdiv(11, 10, 6),
            clz(12, 2),
            lsl_imm(13, 2, 60),
            lsr_imm(14, 13, 62),
            lslv(15, 2, 2),
            brk(0),
        ],
    );
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(3), 14);
    assert_eq!(ctx.x(5), 0, "division by zero yields zero");
    assert_eq!(ctx.x(6), u64::MAX);
    assert_eq!(ctx.x(7) as i64, -100);
    assert_eq!(ctx.x(8), 700);
    assert_eq!(ctx.x(9), 714);
    assert_eq!(ctx.x(11), 0x8000_0000_0000_0000, "MIN / -1 wraps");
    assert_eq!(ctx.x(12), 61);
    assert_eq!(ctx.x(13), 0x7000_0000_0000_0000);
    assert_eq!(ctx.x(14), 1);
    assert_eq!(ctx.x(15), 7 << 7);
}

#[test]
fn test_logical_and_conditional_select() {
    let machine = Machine::a64();
    machine.load_words(
        CODE_BASE,
        &[
            movz(1, 0xf0f0, 0),
            movz(2, 0x0ff0, 0),
            and(3, 1, 2),
            orr(4, 1, 2),
            eor(5, 1, 2),
            cmp(1, 2),
            cset(6, HI),
            cset(7, LO),
            csel(8, 1, 2, GT),
            csel(9, 1, 2, LE),
            mov(10, 1),
            brk(0),
        ],
    );
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(3), 0x00f0);
    assert_eq!(ctx.x(4), 0xfff0);
    assert_eq!(ctx.x(5), 0xff00);
    assert_eq!(ctx.x(6), 1);
    assert_eq!(ctx.x(7), 0);
    assert_eq!(ctx.x(8), 0xf0f0);
    assert_eq!(ctx.x(9), 0x0ff0);
    assert_eq!(ctx.x(10), 0xf0f0);
}

#[test]
fn test_adds_subs_flags() {
    let machine = Machine::a64();
    // w1 = 0x7fffffff; adds w2, w1, #1 overflows into the sign bit.
    machine.load_words(
        CODE_BASE,
        &[
            movz_w(1, 0xffff, 0),
            movk_w(1, 0x7fff, 16),
            adds_imm_w(2, 1, 1),
            mrs_nzcv(3),
            brk(0),
        ],
    );
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(2), 0x8000_0000);
    assert_eq!(ctx.x(3), (Pstate::N | Pstate::V).bits() as u64);
    assert_eq!(ctx.pstate(), Pstate::N | Pstate::V);

    // -1 + 1 carries out and is zero; 5 - 5 is zero without borrow.
    machine.load_words(
        0x1400,
        &[
            movn(0, 0),
            adds_imm(1, 0, 1),
            mrs_nzcv(2),
            movz(3, 5, 0),
            subs_imm(4, 3, 5),
            mrs_nzcv(5),
            subs_imm(6, 4, 1),
            brk(0),
        ],
    );
    let ctx = machine.run(0x1400);
    assert_eq!(ctx.x(1), 0);
    assert_eq!(ctx.x(2), (Pstate::Z | Pstate::C).bits() as u64);
    assert_eq!(ctx.x(5), (Pstate::Z | Pstate::C).bits() as u64);
    assert_eq!(ctx.x(6), u64::MAX);
    assert_eq!(ctx.pstate(), Pstate::N);
}

#[test]
fn test_compare_and_branch() {
    let machine = Machine::a64();
    let mut asm = Asm::new(CODE_BASE);
    asm.emit(movz(0, 3, 0)).emit(movz(1, 0, 0));
    let head = asm.pc();
    asm.emit(add_imm(1, 1, 2))
        .emit(sub_imm(0, 0, 1))
        .emit_at(|pc| cbnz(0, pc, head))
        .emit_at(|pc| cbz(0, pc, pc + 8))
        .emit(movz(1, 0xdead, 0))
        .emit(brk(1));
    machine.load(&asm);
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(1), 6);
    assert_eq!(machine.recorder.breakpoints.lock()[0].1, 1);
}

#[test]
fn test_load_store_round_trip() {
    let machine = Machine::a64();
    machine.load_words(
        CODE_BASE,
        &[
            movz(1, DATA_BASE as u16, 0),
            movz(2, 0x1234, 0),
            movk(2, 0xabcd, 32),
            str(2, 1, 8),
            ldr(3, 1, 8),
            strb(2, 1, 0),
            ldrb(4, 1, 0),
            str_w(2, 1, 4),
            ldr_w(5, 1, 4),
            stp(2, 4, 1, 16),
            ldp(6, 7, 1, 16),
            str_pre(2, SP, -16),
            ldr_post(8, SP, 16),
            brk(0),
        ],
    );
    let mut ctx = machine.context();
    let sp = ctx.sp();
    machine.execute(&mut ctx, CODE_BASE).unwrap();

    let value = 0xabcd_0000_1234;
    assert_eq!(ctx.x(3), value);
    assert_eq!(ctx.x(4), 0x34);
    assert_eq!(ctx.x(5), 0x1234);
    assert_eq!((ctx.x(6), ctx.x(7)), (value, 0x34));
    assert_eq!(ctx.x(8), value);
    assert_eq!(ctx.sp(), sp);
    assert_eq!(machine.memory.read_guest::<u64>(DATA_BASE + 8).unwrap(), value);
    assert_eq!(machine.memory.read_guest::<u64>(sp - 16).unwrap(), value);
}

#[test]
fn test_indirect_branch_through_register() {
    let machine = Machine::a64();
    machine.load_words(
        CODE_BASE,
        &[movz(9, 0x1200, 0), blr(9), add_imm(0, 0, 1), brk(0)],
    );
    machine.load_words(0x1200, &[movz(0, 41, 0), ret()]);
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(0), 42);
    assert!(machine.cpu.translator().lookup_host(0x1200).is_some());
    assert!(machine.cpu.translator().lookup_host(CODE_BASE + 8).is_some());
}

#[test]
fn test_system_registers_and_supervisor_call() {
    let machine = Machine::a64();
    machine.load_words(
        CODE_BASE,
        &[
            movz(1, 0x7777, 0),
            msr_tpidr(1),
            mrs_tpidr(2),
            svc(0x42),
            nop(),
            brk(0),
        ],
    );
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(2), 0x7777);
    assert_eq!(ctx.tpidr_el0(), 0x7777);
    assert_eq!(machine.recorder.svcs.lock().as_slice(), &[(CODE_BASE + 12, 0x42)]);
}

#[test]
fn test_undefined_instruction_reaches_callback() {
    let machine = Machine::a64();
    machine.load_words(CODE_BASE, &[movz(0, 1, 0), 0x0000_0000]);
    let ctx = machine.run(CODE_BASE);
    assert_eq!(ctx.x(0), 1);
    assert_eq!(machine.recorder.undefined.lock().as_slice(), &[(CODE_BASE + 4, 0)]);
}

#[test]
fn test_memory_fault_is_returned() {
    let machine = Machine::a64();
    machine.load_words(CODE_BASE, &[movz(1, 0x4000, 16), ldr(0, 1, 0), brk(0)]);
    let mut ctx = machine.context();
    match machine.execute(&mut ctx, CODE_BASE) {
        Err(JitError::MemoryFault(MemoryError::Unmapped { address, size })) => {
            assert_eq!(address, 0x4000_0000);
            assert_eq!(size, 8);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!ctx.is_running());
    assert!(machine.recorder.breakpoints.lock().is_empty());
}

#[test]
fn test_untiered_translation_matches_tiered() {
    let program = [
        movz(0, 6, 0),
        movz(1, 7, 0),
        mul(2, 0, 1),
        add_imm(2, 2, 0),
        sub(3, 2, 0),
        brk(0),
    ];
    for tiered in [true, false] {
        let machine = Machine::new(Machine::config(armjit::ExecutionMode::Aarch64).with_tiered(tiered));
        machine.load_words(CODE_BASE, &program);
        let ctx = machine.run(CODE_BASE);
        assert_eq!((ctx.x(2), ctx.x(3)), (42, 36), "tiered: {tiered}");
    }
}
