//! # agent_loader
//! The in-process half of a code injection. Once an injector has placed this loader inside a
//! target process, it receives the agent module over a private control socket, loads it,
//! hands control to its entrypoint and reports the outcome back to the injector.
//! ## Usage
//! The injector fills a [`LibcTable`] (or any other [`LibcApi`]) with the primitives the loader
//! may call, builds a [`LoaderContext`] and calls [`load`], which runs the whole protocol on a
//! fresh worker thread. Code that already owns a suitable thread can call [`run`] directly.
//! ## Protocol
//! 1. the controller sends the agent's code descriptor, then the agent's own control descriptor,
//!    each as `SCM_RIGHTS` ancillary data on a one-byte message;
//! 2. the loader opens the module through `/proc/self/fd/<n>`, resolves the entrypoint and calls it
//!    with the parameter string, a mutable [`UnloadPolicy`] and a mutable [`InjectorState`];
//! 3. the loader unloads, detaches and closes according to the policy, then sends a single
//!    [`ByeMessage`] to the controller.
#![no_std]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("unsupport os");

mod api;
pub mod channel;
mod error;
mod loader;
pub mod os;
mod policy;

pub use api::{DlopenFlags, LibcApi, LibcTable, MsgFlags, ThreadRoutine};
pub use channel::{BYE_MESSAGE_SIZE, ByeMessage};
pub use error::Error;
pub use loader::{AgentPath, LoaderContext, Outcome, Stage, load, run};
pub use os::gettid;
pub use policy::{AgentEntrypoint, InjectorState, UnloadPolicy};

/// A raw file descriptor, as used on the wire and across the entrypoint boundary.
pub type RawFd = core::ffi::c_int;

/// The OS-level identifier of a thread.
pub type ThreadId = libc::pid_t;

/// Marks a descriptor slot that holds nothing, or that the agent has claimed.
pub const NO_FD: RawFd = -1;

pub type Result<T> = core::result::Result<T, Error>;

#[inline]
pub(crate) fn fd_from_raw(raw: RawFd) -> Option<RawFd> {
    (raw >= 0).then_some(raw)
}

#[inline]
pub(crate) fn fd_into_raw(fd: Option<RawFd>) -> RawFd {
    fd.unwrap_or(NO_FD)
}
