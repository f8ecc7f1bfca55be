//! x86_64 context switching implementation
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register set for a voluntary switch.
///
/// Field order is load-bearing: the assembly below addresses these slots
/// by byte offset.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh fiber context.
///
/// When first switched to, execution begins in the trampoline, which
/// calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to writable `Context` memory and `stack_top` must be
/// the high end of a live stack allocation.
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // 16-byte alignment at the trampoline's `call` keeps the SysV AMD64
    // invariant (rsp % 16 == 8 at function entry) for the entry shim.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64; // entry shim
    ctx.r13 = entry_arg as u64; // shim argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry shim with its argument.
///
/// The shim terminates the fiber and switches away; it never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Perform a voluntary context switch.
///
/// Saves callee-saved registers to `save` and loads from `load`. Returns
/// (to the caller) when some later switch loads `save` again.
///
/// # Safety
///
/// Both pointers must reference live `Context` memory; `load` must hold
/// either a freshly initialized context or one previously filled by this
/// function.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the loaded RIP
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
