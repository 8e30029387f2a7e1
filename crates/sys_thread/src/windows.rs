use windows_sys::Win32::System::Threading::{GetCurrentThreadId, GetCurrentThreadStackLimits};

use crate::StackBounds;

pub fn current_thread_id() -> u64 {
    // SAFETY: GetCurrentThreadId has no preconditions.
    u64::from(unsafe { GetCurrentThreadId() })
}

#[cfg(not(miri))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    let mut low: usize = 0;
    let mut high: usize = 0;
    // SAFETY: both out-pointers refer to live locals.
    unsafe {
        GetCurrentThreadStackLimits(&raw mut low, &raw mut high);
    }
    if low == 0 || high <= low {
        return None;
    }
    Some(StackBounds {
        start: low,
        end: high,
    })
}

#[cfg(miri)]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}
