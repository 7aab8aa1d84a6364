//! The primitives the loader is allowed to call
//!
//! Code that has just been placed inside a foreign process cannot rely on its own imports being
//! bound yet, so the loader never calls libc by name. Every OS primitive it needs is reached
//! through a [`LibcApi`] supplied by the injector at start-up.

use crate::RawFd;
use bitflags::bitflags;
use core::ffi::{CStr, c_char, c_int, c_void};
use libc::{msghdr, pthread_attr_t, pthread_t, size_t, ssize_t};

/// The start routine of the worker thread.
pub type ThreadRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags passed to `dlopen`.
    pub struct DlopenFlags: c_int {
        /// Resolve undefined symbols as code that references them is executed.
        const RTLD_LAZY = libc::RTLD_LAZY;

        /// Resolve all undefined symbols before `dlopen` returns.
        const RTLD_NOW = libc::RTLD_NOW;

        /// Make the module's symbols available to subsequently loaded modules.
        const RTLD_GLOBAL = libc::RTLD_GLOBAL;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Flags passed to `send` and `recvmsg`.
    pub struct MsgFlags: c_int {
        /// Report a broken peer as `EPIPE` instead of raising `SIGPIPE`.
        const MSG_NOSIGNAL = libc::MSG_NOSIGNAL;
    }
}

/// The capability table the loader runs on.
///
/// Every method mirrors the libc function of the same name and reports failure the same way
/// the C function does: a single sentinel value, never a panic.
///
/// # Safety
/// All methods are unsafe because they operate on raw descriptors, raw module handles and raw
/// pointers owned by a process the loader does not control. Implementors must forward to
/// primitives with the exact libc semantics, the loader's ownership bookkeeping depends on it.
pub trait LibcApi {
    /// Spawns a thread running `routine(arg)` and stores its handle in `thread`.
    ///
    /// Returns `0` on success.
    unsafe fn pthread_create(
        &self,
        thread: *mut pthread_t,
        routine: ThreadRoutine,
        arg: *mut c_void,
    ) -> c_int;

    /// Receives one message, including ancillary data, from `fd`.
    ///
    /// Returns the number of payload bytes received, `0` when the peer has hung up, `-1` on error.
    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut msghdr, flags: MsgFlags) -> isize;

    /// Opens the module at `path`. Returns null on failure.
    unsafe fn dlopen(&self, path: &CStr, flags: DlopenFlags) -> *mut c_void;

    /// Looks up `symbol` inside `handle`. Returns null when the symbol is absent.
    unsafe fn dlsym(&self, handle: *mut c_void, symbol: &CStr) -> *mut c_void;

    /// Drops one reference to the module. Returns `0` on success.
    unsafe fn dlclose(&self, handle: *mut c_void) -> c_int;

    /// Writes `buf` to the connected socket `fd`.
    ///
    /// Returns the number of bytes sent or `-1`.
    unsafe fn send(&self, fd: RawFd, buf: &[u8], flags: MsgFlags) -> isize;

    /// Closes `fd`. Returns `0` on success.
    unsafe fn close(&self, fd: RawFd) -> c_int;

    /// Marks `thread` as detached. Returns `0` on success.
    unsafe fn pthread_detach(&self, thread: pthread_t) -> c_int;
}

/// A table of libc entry points laid out so an injector can copy it into a target process.
///
/// [`LibcTable::new`] fills it from the libc of the *current* process. An injector resolves the
/// same functions inside the target instead and writes their addresses into the fields.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LibcTable {
    pub pthread_create: unsafe extern "C" fn(
        *mut pthread_t,
        *const pthread_attr_t,
        extern "C" fn(*mut c_void) -> *mut c_void,
        *mut c_void,
    ) -> c_int,
    pub recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t,
    pub dlopen: unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void,
    pub dlsym: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void,
    pub dlclose: unsafe extern "C" fn(*mut c_void) -> c_int,
    pub send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    pub close: unsafe extern "C" fn(c_int) -> c_int,
    pub pthread_detach: unsafe extern "C" fn(pthread_t) -> c_int,
}

impl LibcTable {
    /// Fills the table from the libc linked into the current process.
    pub fn new() -> Self {
        Self {
            pthread_create: libc::pthread_create,
            recvmsg: libc::recvmsg,
            dlopen: libc::dlopen,
            dlsym: libc::dlsym,
            dlclose: libc::dlclose,
            send: libc::send,
            close: libc::close,
            pthread_detach: libc::pthread_detach,
        }
    }
}

impl Default for LibcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LibcApi for LibcTable {
    unsafe fn pthread_create(
        &self,
        thread: *mut pthread_t,
        routine: ThreadRoutine,
        arg: *mut c_void,
    ) -> c_int {
        unsafe { (self.pthread_create)(thread, core::ptr::null(), routine, arg) }
    }

    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut msghdr, flags: MsgFlags) -> isize {
        unsafe { (self.recvmsg)(fd, msg, flags.bits()) as isize }
    }

    unsafe fn dlopen(&self, path: &CStr, flags: DlopenFlags) -> *mut c_void {
        unsafe { (self.dlopen)(path.as_ptr(), flags.bits()) }
    }

    unsafe fn dlsym(&self, handle: *mut c_void, symbol: &CStr) -> *mut c_void {
        unsafe { (self.dlsym)(handle, symbol.as_ptr()) }
    }

    unsafe fn dlclose(&self, handle: *mut c_void) -> c_int {
        unsafe { (self.dlclose)(handle) }
    }

    unsafe fn send(&self, fd: RawFd, buf: &[u8], flags: MsgFlags) -> isize {
        unsafe { (self.send)(fd, buf.as_ptr().cast(), buf.len(), flags.bits()) as isize }
    }

    unsafe fn close(&self, fd: RawFd) -> c_int {
        unsafe { (self.close)(fd) }
    }

    unsafe fn pthread_detach(&self, thread: pthread_t) -> c_int {
        unsafe { (self.pthread_detach)(thread) }
    }
}
