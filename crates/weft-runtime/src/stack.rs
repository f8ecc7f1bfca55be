//! Fiber stack allocation
//!
//! Each fiber owns one mmap'd region: a PROT_NONE guard page at the low
//! end, then the usable stack above it. Stacks grow down, so an overflow
//! runs into the guard page and faults instead of corrupting the heap.

use std::ptr::NonNull;

use weft_core::{WeftError, WeftResult};

const PAGE_SIZE: usize = 4096;

/// An owned, guard-paged fiber stack.
pub struct Stack {
    base: NonNull<u8>,
    /// Mapped length including the guard page.
    total: usize,
    /// Usable length above the guard page.
    size: usize,
}

// The mapping is private to the owning fiber; nothing aliases it until
// the fiber runs, and then only one thread at a time touches it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Allocate a stack with `size` usable bytes (rounded up to a page).
    pub fn alloc(size: usize) -> WeftResult<Stack> {
        let size = round_up(size, PAGE_SIZE);
        let total = size + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(WeftError::last_os_error("mmap"));
        }

        // Guard page at the low end remains mapped but inaccessible.
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = WeftError::last_os_error("mprotect");
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Stack {
            base: NonNull::new(base as *mut u8).expect("mmap returned null"),
            total,
            size,
        })
    }

    /// Usable stack size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The high end of the usable range; initial stack pointer for a
    /// fresh fiber.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.total) };
        if ret != 0 {
            tracing::error!(
                "munmap({:p}, {}) failed: {}",
                self.base.as_ptr(),
                self.total,
                std::io::Error::last_os_error()
            );
        }
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_write() {
        let stack = Stack::alloc(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);

        // The top of the usable range is writable.
        unsafe {
            let p = stack.top().sub(8) as *mut u64;
            p.write(0xDEAD_BEEF);
            assert_eq!(p.read(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_size_rounds_to_page() {
        let stack = Stack::alloc(1000).unwrap();
        assert_eq!(stack.size(), 4096);
    }
}
