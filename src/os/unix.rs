use crate::ThreadId;

/// Returns the kernel id of the calling thread.
///
/// Goes through libc's generic `syscall` trampoline rather than the `gettid` wrapper, which
/// older C libraries do not provide.
#[inline]
pub fn gettid() -> ThreadId {
    unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
}
