//! Shared helpers for the integration tests: instruction encoders for both guest instruction
//! sets, a tiny assembler with branch fix-up by address, and a machine harness.

#![allow(dead_code)]

use armjit::{
    CpuContext, ExceptionCallbacks, ExecutionContext, ExecutionMode, FlatMemory, InstantCounter,
    JitConfig, JitResult, MemoryManager,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const CODE_BASE: u64 = 0x1000;
pub const CODE_SIZE: usize = 0x4000;
pub const DATA_BASE: u64 = 0x8000;
pub const DATA_SIZE: usize = 0x1000;
pub const STACK_TOP: u64 = 0x20000;
pub const STACK_SIZE: usize = 0x8000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A64 encoders. Registers are plain numbers; 31 is SP or XZR depending on the instruction.
pub mod a64 {
    pub const EQ: u32 = 0;
    pub const NE: u32 = 1;
    pub const HS: u32 = 2;
    pub const LO: u32 = 3;
    pub const MI: u32 = 4;
    pub const HI: u32 = 8;
    pub const LS: u32 = 9;
    pub const GE: u32 = 10;
    pub const LT: u32 = 11;
    pub const GT: u32 = 12;
    pub const LE: u32 = 13;

    pub const XZR: u32 = 31;
    pub const SP: u32 = 31;
    pub const LR: u32 = 30;

    pub fn movz(rd: u32, imm: u16, shift: u32) -> u32 {
        0xD280_0000 | (shift / 16) << 21 | (imm as u32) << 5 | rd
    }

    pub fn movk(rd: u32, imm: u16, shift: u32) -> u32 {
        0xF280_0000 | (shift / 16) << 21 | (imm as u32) << 5 | rd
    }

    pub fn movn(rd: u32, imm: u16) -> u32 {
        0x9280_0000 | (imm as u32) << 5 | rd
    }

    pub fn movz_w(rd: u32, imm: u16, shift: u32) -> u32 {
        0x5280_0000 | (shift / 16) << 21 | (imm as u32) << 5 | rd
    }

    pub fn movk_w(rd: u32, imm: u16, shift: u32) -> u32 {
        0x7280_0000 | (shift / 16) << 21 | (imm as u32) << 5 | rd
    }

    pub fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0x9100_0000 | imm << 10 | rn << 5 | rd
    }

    pub fn adds_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xB100_0000 | imm << 10 | rn << 5 | rd
    }

    pub fn adds_imm_w(rd: u32, rn: u32, imm: u32) -> u32 {
        0x3100_0000 | imm << 10 | rn << 5 | rd
    }

    pub fn sub_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xD100_0000 | imm << 10 | rn << 5 | rd
    }

    pub fn subs_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xF100_0000 | imm << 10 | rn << 5 | rd
    }

    pub fn cmp_imm(rn: u32, imm: u32) -> u32 {
        subs_imm(XZR, rn, imm)
    }

    pub fn add(rd: u32, rn: u32, rm: u32) -> u32 {
        0x8B00_0000 | rm << 16 | rn << 5 | rd
    }

    pub fn sub(rd: u32, rn: u32, rm: u32) -> u32 {
        0xCB00_0000 | rm << 16 | rn << 5 | rd
    }

    pub fn subs(rd: u32, rn: u32, rm: u32) -> u32 {
        0xEB00_0000 | rm << 16 | rn << 5 | rd
    }

    pub fn cmp(rn: u32, rm: u32) -> u32 {
        subs(XZR, rn, rm)
    }

    pub fn and(rd: u32, rn: u32, rm: u32) -> u32 {
        0x8A00_0000 | rm << 16 | rn << 5 | rd
    }

    pub fn orr(rd: u32, rn: u32, rm: u32) -> u32 {
        0xAA00_0000 | rm << 16 | rn << 5 | rd
    }

    pub fn eor(rd: u32, rn: u32, rm: u32) -> u32 {
        0xCA00_0000 | rm << 16 | rn << 5 | rd
    }

    pub fn mov(rd: u32, rm: u32) -> u32 {
        orr(rd, XZR, rm)
    }

    /// `lsl rd, rn, #shift` (UBFM alias).
    pub fn lsl_imm(rd: u32, rn: u32, shift: u32) -> u32 {
        let immr = (64 - shift) % 64;
        let imms = 63 - shift;
        0xD340_0000 | immr << 16 | imms << 10 | rn << 5 | rd
    }

    /// `lsr rd, rn, #shift` (UBFM alias).
    pub fn lsr_imm(rd: u32, rn: u32, shift: u32) -> u32 {
        0xD340_FC00 | shift << 16 | rn << 5 | rd
    }

    pub fn lslv(rd: u32, rn: u32, rm: u32) -> u32 {
        0x9AC0_2000 | rm << 16 | rn << 5 | rd
    }

    pub fn mul(rd: u32, rn: u32, rm: u32) -> u32 {
        0x9B00_7C00 | rm << 16 | rn << 5 | rd
    }

    pub fn madd(rd: u32, rn: u32, rm: u32, ra: u32) -> u32 {
        0x9B00_0000 | rm << 16 | ra << 10 | rn << 5 | rd
    }

    pub fn udiv(rd: u32, rn: u32, rm: u32) -> u32 {
        0x9AC0_0800 | rm << 16 | rn << 5 | rd
    }

    pub fn sdiv(rd: u32, rn: u32, rm: u32) -> u32 {
        0x9AC0_0C00 | rm << 16 | rn << 5 | rd
    }

    pub fn clz(rd: u32, rn: u32) -> u32 {
        0xDAC0_1000 | rn << 5 | rd
    }

    pub fn csel(rd: u32, rn: u32, rm: u32, cond: u32) -> u32 {
        0x9A80_0000 | rm << 16 | cond << 12 | rn << 5 | rd
    }

    pub fn cset(rd: u32, cond: u32) -> u32 {
        0x9A9F_07E0 | (cond ^ 1) << 12 | rd
    }

    pub fn ldr(rt: u32, rn: u32, offset: u32) -> u32 {
        0xF940_0000 | (offset / 8) << 10 | rn << 5 | rt
    }

    pub fn str(rt: u32, rn: u32, offset: u32) -> u32 {
        0xF900_0000 | (offset / 8) << 10 | rn << 5 | rt
    }

    pub fn ldr_w(rt: u32, rn: u32, offset: u32) -> u32 {
        0xB940_0000 | (offset / 4) << 10 | rn << 5 | rt
    }

    pub fn str_w(rt: u32, rn: u32, offset: u32) -> u32 {
        0xB900_0000 | (offset / 4) << 10 | rn << 5 | rt
    }

    pub fn ldrb(rt: u32, rn: u32, offset: u32) -> u32 {
        0x3940_0000 | offset << 10 | rn << 5 | rt
    }

    pub fn strb(rt: u32, rn: u32, offset: u32) -> u32 {
        0x3900_0000 | offset << 10 | rn << 5 | rt
    }

    /// `str xt, [xn, #offset]!`
    pub fn str_pre(rt: u32, rn: u32, offset: i32) -> u32 {
        0xF800_0C00 | ((offset as u32) & 0x1ff) << 12 | rn << 5 | rt
    }

    /// `ldr xt, [xn], #offset`
    pub fn ldr_post(rt: u32, rn: u32, offset: i32) -> u32 {
        0xF840_0400 | ((offset as u32) & 0x1ff) << 12 | rn << 5 | rt
    }

    pub fn stp(rt: u32, rt2: u32, rn: u32, offset: i32) -> u32 {
        0xA900_0000 | (((offset / 8) as u32) & 0x7f) << 15 | rt2 << 10 | rn << 5 | rt
    }

    pub fn ldp(rt: u32, rt2: u32, rn: u32, offset: i32) -> u32 {
        0xA940_0000 | (((offset / 8) as u32) & 0x7f) << 15 | rt2 << 10 | rn << 5 | rt
    }

    pub fn br(rn: u32) -> u32 {
        0xD61F_0000 | rn << 5
    }

    pub fn blr(rn: u32) -> u32 {
        0xD63F_0000 | rn << 5
    }

    pub fn ret() -> u32 {
        0xD65F_03C0
    }

    pub fn svc(imm: u16) -> u32 {
        0xD400_0001 | (imm as u32) << 5
    }

    pub fn brk(imm: u16) -> u32 {
        0xD420_0000 | (imm as u32) << 5
    }

    pub fn nop() -> u32 {
        0xD503_201F
    }

    pub fn mrs_nzcv(rt: u32) -> u32 {
        0xD53B_4200 | rt
    }

    pub fn mrs_tpidr(rt: u32) -> u32 {
        0xD53B_D040 | rt
    }

    pub fn msr_tpidr(rt: u32) -> u32 {
        0xD51B_D040 | rt
    }

    pub fn ic_ivau(rt: u32) -> u32 {
        0xD50B_7520 | rt
    }

    pub fn b(from: u64, to: u64) -> u32 {
        0x1400_0000 | ((to.wrapping_sub(from) as i64 / 4) as u32 & 0x03ff_ffff)
    }

    pub fn bl(from: u64, to: u64) -> u32 {
        0x9400_0000 | ((to.wrapping_sub(from) as i64 / 4) as u32 & 0x03ff_ffff)
    }

    pub fn b_cond(from: u64, to: u64, cond: u32) -> u32 {
        0x5400_0000 | ((to.wrapping_sub(from) as i64 / 4) as u32 & 0x7ffff) << 5 | cond
    }

    pub fn cbz(rt: u32, from: u64, to: u64) -> u32 {
        0xB400_0000 | ((to.wrapping_sub(from) as i64 / 4) as u32 & 0x7ffff) << 5 | rt
    }

    pub fn cbnz(rt: u32, from: u64, to: u64) -> u32 {
        0xB500_0000 | ((to.wrapping_sub(from) as i64 / 4) as u32 & 0x7ffff) << 5 | rt
    }
}

/// A32 encoders. `cond` is the 4-bit condition field; [`a32::AL`] for unconditional.
pub mod a32 {
    pub const EQ: u32 = 0x0;
    pub const NE: u32 = 0x1;
    pub const CS: u32 = 0x2;
    pub const CC: u32 = 0x3;
    pub const MI: u32 = 0x4;
    pub const GE: u32 = 0xA;
    pub const LT: u32 = 0xB;
    pub const GT: u32 = 0xC;
    pub const LE: u32 = 0xD;
    pub const AL: u32 = 0xE;

    pub const SP: u32 = 13;
    pub const LR: u32 = 14;
    pub const PC: u32 = 15;

    const AND: u32 = 0x0;
    const SUB: u32 = 0x2;
    const ADD: u32 = 0x4;
    const CMP: u32 = 0xA;
    const ORR: u32 = 0xC;
    const MOV: u32 = 0xD;
    const MVN: u32 = 0xF;

    /// Replace the condition field of `instr`.
    pub fn cond(cond: u32, instr: u32) -> u32 {
        (instr & 0x0fff_ffff) | cond << 28
    }

    fn dp_imm(op: u32, s: bool, rn: u32, rd: u32, imm8: u32) -> u32 {
        AL << 28 | 1 << 25 | op << 21 | (s as u32) << 20 | rn << 16 | rd << 12 | imm8
    }

    fn dp_reg(op: u32, s: bool, rn: u32, rd: u32, rm: u32) -> u32 {
        AL << 28 | op << 21 | (s as u32) << 20 | rn << 16 | rd << 12 | rm
    }

    pub fn mov_imm(rd: u32, imm8: u32) -> u32 {
        dp_imm(MOV, false, 0, rd, imm8)
    }

    pub fn mvn_imm(rd: u32, imm8: u32) -> u32 {
        dp_imm(MVN, false, 0, rd, imm8)
    }

    pub fn mov(rd: u32, rm: u32) -> u32 {
        dp_reg(MOV, false, 0, rd, rm)
    }

    pub fn add_imm(rd: u32, rn: u32, imm8: u32) -> u32 {
        dp_imm(ADD, false, rn, rd, imm8)
    }

    pub fn adds_imm(rd: u32, rn: u32, imm8: u32) -> u32 {
        dp_imm(ADD, true, rn, rd, imm8)
    }

    pub fn sub_imm(rd: u32, rn: u32, imm8: u32) -> u32 {
        dp_imm(SUB, false, rn, rd, imm8)
    }

    pub fn subs_imm(rd: u32, rn: u32, imm8: u32) -> u32 {
        dp_imm(SUB, true, rn, rd, imm8)
    }

    pub fn cmp_imm(rn: u32, imm8: u32) -> u32 {
        dp_imm(CMP, true, rn, 0, imm8)
    }

    pub fn add(rd: u32, rn: u32, rm: u32) -> u32 {
        dp_reg(ADD, false, rn, rd, rm)
    }

    pub fn and(rd: u32, rn: u32, rm: u32) -> u32 {
        dp_reg(AND, false, rn, rd, rm)
    }

    pub fn orr(rd: u32, rn: u32, rm: u32) -> u32 {
        dp_reg(ORR, false, rn, rd, rm)
    }

    /// `movw rd, #imm16`
    pub fn movw(rd: u32, imm16: u32) -> u32 {
        AL << 28 | 0x0300_0000 | (imm16 >> 12) << 16 | rd << 12 | (imm16 & 0xfff)
    }

    /// `movt rd, #imm16`
    pub fn movt(rd: u32, imm16: u32) -> u32 {
        AL << 28 | 0x0340_0000 | (imm16 >> 12) << 16 | rd << 12 | (imm16 & 0xfff)
    }

    pub fn mul(rd: u32, rm: u32, rs: u32) -> u32 {
        AL << 28 | 0x0000_0090 | rd << 16 | rs << 8 | rm
    }

    pub fn ldr(rt: u32, rn: u32, offset: u32) -> u32 {
        AL << 28 | 0x0590_0000 | rn << 16 | rt << 12 | offset
    }

    pub fn str(rt: u32, rn: u32, offset: u32) -> u32 {
        AL << 28 | 0x0580_0000 | rn << 16 | rt << 12 | offset
    }

    pub fn ldrb(rt: u32, rn: u32, offset: u32) -> u32 {
        AL << 28 | 0x05D0_0000 | rn << 16 | rt << 12 | offset
    }

    pub fn strb(rt: u32, rn: u32, offset: u32) -> u32 {
        AL << 28 | 0x05C0_0000 | rn << 16 | rt << 12 | offset
    }

    /// `stmdb sp!, {regs}`
    pub fn push(regs: u32) -> u32 {
        AL << 28 | 0x092D_0000 | regs
    }

    /// `ldmia sp!, {regs}`
    pub fn pop(regs: u32) -> u32 {
        AL << 28 | 0x08BD_0000 | regs
    }

    pub fn b(cond: u32, from: u64, to: u64) -> u32 {
        let offset = (to.wrapping_sub(from + 8) as i64 / 4) as u32 & 0x00ff_ffff;
        cond << 28 | 0x0A00_0000 | offset
    }

    pub fn bl(from: u64, to: u64) -> u32 {
        let offset = (to.wrapping_sub(from + 8) as i64 / 4) as u32 & 0x00ff_ffff;
        AL << 28 | 0x0B00_0000 | offset
    }

    pub fn bx(rm: u32) -> u32 {
        AL << 28 | 0x012F_FF10 | rm
    }

    pub fn svc(imm24: u32) -> u32 {
        AL << 28 | 0x0F00_0000 | imm24
    }

    pub fn bkpt(imm16: u32) -> u32 {
        0xE120_0070 | (imm16 >> 4) << 8 | (imm16 & 0xf)
    }
}

/// Sequential instruction writer that knows the address of every word it emits.
pub struct Asm {
    base: u64,
    words: Vec<u32>,
}

impl Asm {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            words: Vec::new(),
        }
    }

    /// Address of the next instruction.
    pub fn pc(&self) -> u64 {
        self.base + 4 * self.words.len() as u64
    }

    pub fn emit(&mut self, word: u32) -> &mut Self {
        self.words.push(word);
        self
    }

    /// Emit an instruction whose encoding depends on its own address.
    pub fn emit_at(&mut self, f: impl FnOnce(u64) -> u32) -> &mut Self {
        let pc = self.pc();
        self.emit(f(pc))
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

/// Records every exception callback.
#[derive(Default)]
pub struct Recorder {
    pub svcs: Mutex<Vec<(u64, u32)>>,
    pub breakpoints: Mutex<Vec<(u64, u32)>>,
    pub undefined: Mutex<Vec<(u64, u32)>>,
    pub interrupts: AtomicU32,
    /// Stop the context on the n-th interrupt; 0 never stops.
    pub stop_after_interrupts: AtomicU32,
}

impl ExceptionCallbacks for Recorder {
    fn supervisor_call(&self, _ctx: &mut ExecutionContext, pc: u64, imm: u32) {
        self.svcs.lock().push((pc, imm));
    }

    fn breakpoint(&self, ctx: &mut ExecutionContext, pc: u64, imm: u32) {
        self.breakpoints.lock().push((pc, imm));
        ctx.stop();
    }

    fn undefined(&self, ctx: &mut ExecutionContext, pc: u64, opcode: u32) {
        self.undefined.lock().push((pc, opcode));
        ctx.stop();
    }

    fn interrupt(&self, ctx: &mut ExecutionContext) {
        let n = self.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.stop_after_interrupts.load(Ordering::SeqCst) {
            ctx.stop();
        }
    }
}

/// Guest memory, a CPU and a recording callback set.
pub struct Machine {
    pub memory: Arc<FlatMemory>,
    pub cpu: CpuContext,
    pub recorder: Arc<Recorder>,
}

impl Machine {
    pub fn new(config: JitConfig) -> Self {
        init_logging();
        let memory = Arc::new(FlatMemory::new());
        memory.map(CODE_BASE, CODE_SIZE, true);
        memory.map(DATA_BASE, DATA_SIZE, true);
        memory.map(STACK_TOP - STACK_SIZE as u64, STACK_SIZE, true);
        let cpu = CpuContext::new(memory.clone(), config).expect("cpu");
        Self {
            memory,
            cpu,
            recorder: Arc::new(Recorder::default()),
        }
    }

    /// Default test configuration: foreground re-translation, 1 MiB arena.
    pub fn config(mode: ExecutionMode) -> JitConfig {
        JitConfig::new(mode)
            .with_arena_size(1 << 20)
            .with_background_rejit(false)
    }

    pub fn a64() -> Self {
        Self::new(Self::config(ExecutionMode::Aarch64))
    }

    pub fn a32() -> Self {
        Self::new(Self::config(ExecutionMode::Aarch32Arm))
    }

    pub fn load(&self, asm: &Asm) {
        self.load_words(asm.base(), asm.words());
    }

    pub fn load_words(&self, address: u64, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.memory.write(address, &bytes).expect("load");
    }

    pub fn context(&self) -> ExecutionContext {
        let mut ctx = self
            .cpu
            .create_context(Arc::new(InstantCounter::default()), self.recorder.clone());
        ctx.set_sp(STACK_TOP);
        ctx
    }

    pub fn execute(&self, ctx: &mut ExecutionContext, address: u64) -> JitResult<()> {
        self.cpu.execute(ctx, address)
    }

    /// Run from `address` in a fresh context and return it.
    pub fn run(&self, address: u64) -> ExecutionContext {
        let mut ctx = self.context();
        self.execute(&mut ctx, address).expect("execute");
        ctx
    }
}
