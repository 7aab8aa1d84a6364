use crate::ThreadId;
use syscalls::Sysno;

/// Returns the kernel id of the calling thread.
///
/// Issued as an inline `gettid` system call, no libc code is involved.
#[inline]
pub fn gettid() -> ThreadId {
    // gettid cannot fail.
    unsafe { syscalls::raw_syscall!(Sysno::gettid) as ThreadId }
}
