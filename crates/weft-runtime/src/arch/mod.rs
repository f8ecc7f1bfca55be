//! Architecture-specific context switching
//!
//! Each architecture module provides a `#[repr(C)]` [`Context`] holding
//! the callee-saved register set, `init_context` to point a fresh context
//! at the fiber trampoline, and a naked `switch_context(save, load)` that
//! performs the voluntary switch. Offsets in the assembly match the
//! `Context` field layout; keep them in sync.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
