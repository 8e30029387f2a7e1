//! Register and stack snapshots of stopped threads.
//!
//! A thread spills its callee-saved registers and records its stack pointer
//! into a preallocated [`ContextSlot`] before it reports itself stopped.
//! The slot is all atomics so it can be written from a signal handler and
//! read by the initiator without locks.

use std::sync::atomic::{AtomicUsize, Ordering};

use sys_thread::NativeThreadId;

use crate::atomic::{load_acquire, store_release};

/// Number of register words captured per thread.
pub const CONTEXT_WORDS: usize = 12;

/// Snapshot of a thread's callee-saved registers and stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedContext {
    /// Spilled callee-saved registers; unused words are zero.
    pub registers: [usize; CONTEXT_WORDS],
    /// Stack pointer at the time of capture.
    pub sp: usize,
}

impl SavedContext {
    /// An empty snapshot.
    pub const EMPTY: Self = Self {
        registers: [0; CONTEXT_WORDS],
        sp: 0,
    };

    /// Returns `true` if nothing was captured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.sp == 0
    }
}

impl Default for SavedContext {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Spill the callee-saved registers and capture the stack pointer.
///
/// Async-signal-safe. Not inlined, so the returned stack pointer lies below
/// every frame of the caller.
#[inline(never)]
#[must_use]
pub fn capture_context() -> SavedContext {
    let mut registers = [0usize; CONTEXT_WORDS];

    // Miri does not support inline assembly.
    // Each output is a fixed register. Reserved registers (rbx, rbp, x19,
    // x29) are copied into scratch registers that are not read afterwards.
    // SAFETY: the asm only copies registers into locals.
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov rax, rbx",
            "mov rcx, rbp",
            out("rax") registers[0],
            out("rcx") registers[1],
            out("r12") registers[2],
            out("r13") registers[3],
            out("r14") registers[4],
            out("r15") registers[5],
            options(nomem, nostack, preserves_flags),
        );
    }

    // SAFETY: as above.
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov x9, x19",
            "mov x10, x29",
            out("x9") registers[0],
            out("x20") registers[1],
            out("x21") registers[2],
            out("x22") registers[3],
            out("x23") registers[4],
            out("x24") registers[5],
            out("x25") registers[6],
            out("x26") registers[7],
            out("x27") registers[8],
            out("x28") registers[9],
            out("x10") registers[10],
            options(nomem, nostack, preserves_flags),
        );
    }

    std::hint::black_box(&registers);
    SavedContext {
        registers,
        sp: sys_thread::approx_sp(),
    }
}

/// Lock-free storage for one [`SavedContext`].
///
/// Written only by the owning thread while no initiator reads it; the
/// suspend state published afterwards orders the words for the reader.
#[derive(Debug)]
pub struct ContextSlot {
    registers: [AtomicUsize; CONTEXT_WORDS],
    sp: AtomicUsize,
}

impl ContextSlot {
    /// An empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registers: [const { AtomicUsize::new(0) }; CONTEXT_WORDS],
            sp: AtomicUsize::new(0),
        }
    }

    /// Store `context`. Async-signal-safe.
    pub fn store(&self, context: &SavedContext) {
        for (word, value) in self.registers.iter().zip(context.registers) {
            word.store(value, Ordering::Relaxed);
        }
        store_release(&self.sp, context.sp);
    }

    /// Read the stored context.
    #[must_use]
    pub fn load(&self) -> SavedContext {
        let sp = load_acquire(&self.sp);
        let mut registers = [0usize; CONTEXT_WORDS];
        for (value, word) in registers.iter_mut().zip(&self.registers) {
            *value = word.load(Ordering::Relaxed);
        }
        SavedContext { registers, sp }
    }

    /// Captured stack pointer, or 0 once cleared.
    #[must_use]
    pub fn sp(&self) -> usize {
        load_acquire(&self.sp)
    }

    /// Forget the stored context.
    pub fn clear(&self) {
        store_release(&self.sp, 0);
    }
}

impl Default for ContextSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Roots of one stopped thread, handed to [`crate::Tracer::mark_roots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRoots {
    /// The thread the roots belong to.
    pub id: NativeThreadId,
    /// Hot end of the stack: the stack pointer captured at suspension.
    pub stack_start: usize,
    /// Cold end of the stack, recorded at registration.
    pub stack_end: usize,
    /// Spilled registers.
    pub context: SavedContext,
}

impl ThreadRoots {
    /// Number of stack bytes to scan.
    #[must_use]
    pub const fn stack_len(&self) -> usize {
        self.stack_end.saturating_sub(self.stack_start)
    }

    /// Returns `true` if `addr` lies within the live part of the stack.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.stack_start && addr <= self.stack_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_records_a_stack_pointer() {
        let here = sys_thread::approx_sp();
        let context = capture_context();
        assert!(!context.is_empty());
        if let Some(bounds) = sys_thread::current_stack_bounds() {
            assert!(bounds.contains(context.sp));
            assert!(context.sp <= here);
        }
    }

    #[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), not(miri)))]
    unsafe extern "C" fn capture_into(out: *mut std::ffi::c_void) {
        // SAFETY: the caller passes a pointer to a live `SavedContext`.
        unsafe { out.cast::<SavedContext>().write(capture_context()) };
    }

    #[cfg(all(target_arch = "x86_64", not(miri)))]
    #[test]
    fn capture_reads_callee_saved_registers() {
        let mut context = SavedContext::EMPTY;
        // SAFETY: calls a C-ABI function; r12 to r15 are preserved by it.
        unsafe {
            std::arch::asm!(
                "call {f}",
                f = sym capture_into,
                in("rdi") std::ptr::addr_of_mut!(context),
                in("r12") 0x1212_usize,
                in("r13") 0x1313_usize,
                in("r14") 0x1414_usize,
                in("r15") 0x1515_usize,
                clobber_abi("C"),
            );
        }
        assert!(!context.is_empty());
        assert_eq!(context.registers[2..6], [0x1212, 0x1313, 0x1414, 0x1515]);
    }

    #[cfg(all(target_arch = "aarch64", not(miri)))]
    #[test]
    fn capture_reads_callee_saved_registers() {
        let mut context = SavedContext::EMPTY;
        // SAFETY: calls a C-ABI function; x20 to x23 are preserved by it.
        unsafe {
            std::arch::asm!(
                "bl {f}",
                f = sym capture_into,
                in("x0") std::ptr::addr_of_mut!(context),
                in("x20") 0x2020_usize,
                in("x21") 0x2121_usize,
                in("x22") 0x2222_usize,
                in("x23") 0x2323_usize,
                clobber_abi("C"),
            );
        }
        assert!(!context.is_empty());
        assert_eq!(context.registers[1..5], [0x2020, 0x2121, 0x2222, 0x2323]);
    }

    #[test]
    fn slot_round_trip_and_clear() {
        let slot = ContextSlot::new();
        assert!(slot.load().is_empty());
        let context = capture_context();
        slot.store(&context);
        assert_eq!(slot.load(), context);
        slot.clear();
        assert_eq!(slot.sp(), 0);
    }

    #[test]
    fn roots_cover_captured_sp() {
        let context = capture_context();
        let roots = ThreadRoots {
            id: sys_thread::current_thread_id(),
            stack_start: context.sp,
            stack_end: context.sp + 4096,
            context,
        };
        assert!(roots.contains(context.sp));
        assert_eq!(roots.stack_len(), 4096);
    }
}
