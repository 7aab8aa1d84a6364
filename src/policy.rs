use crate::{RawFd, fd_from_raw, fd_into_raw};
use core::ffi::{c_char, c_int};

/// What happens to the agent module and the worker thread once the entrypoint has returned.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnloadPolicy {
    /// Unload the module and detach the worker thread.
    #[default]
    Immediate = 0,
    /// Keep the module mapped, detach the worker thread.
    Resident = 1,
    /// Keep the module mapped and leave the worker thread joinable. The controller finds the
    /// thread through the id carried by the bye message.
    Deferred = 2,
}

impl UnloadPolicy {
    /// Interprets the raw value an entrypoint wrote.
    #[inline]
    pub const fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            0 => Some(UnloadPolicy::Immediate),
            1 => Some(UnloadPolicy::Resident),
            2 => Some(UnloadPolicy::Deferred),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_raw(self) -> c_int {
        self as c_int
    }

    /// Whether the module is unloaded during cleanup.
    #[inline]
    pub const fn unloads_module(self) -> bool {
        matches!(self, UnloadPolicy::Immediate)
    }

    /// Whether the worker thread is detached during cleanup.
    #[inline]
    pub const fn detaches_thread(self) -> bool {
        !matches!(self, UnloadPolicy::Deferred)
    }
}

/// The loader's working copies of the two channel descriptors, lent to the entrypoint.
///
/// The entrypoint may overwrite either field. Writing [`NO_FD`](crate::NO_FD) claims the
/// descriptor: the agent now owns it and the loader will neither close it nor, for the
/// controller descriptor, send the bye message over it. Whatever the fields hold once the
/// entrypoint returns is what the loader cleans up.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InjectorState {
    pub controller_fd: c_int,
    pub agent_fd: c_int,
}

impl InjectorState {
    #[inline]
    pub fn new(controller_fd: Option<RawFd>, agent_fd: Option<RawFd>) -> Self {
        Self {
            controller_fd: fd_into_raw(controller_fd),
            agent_fd: fd_into_raw(agent_fd),
        }
    }

    /// The controller descriptor, unless it is absent or claimed.
    #[inline]
    pub fn controller(&self) -> Option<RawFd> {
        fd_from_raw(self.controller_fd)
    }

    /// The agent control descriptor, unless it is absent or claimed.
    #[inline]
    pub fn agent(&self) -> Option<RawFd> {
        fd_from_raw(self.agent_fd)
    }
}

/// The signature of the function the loader looks up in the agent module.
///
/// The policy is passed as a raw `c_int` because it is written by foreign code; see
/// [`UnloadPolicy::from_raw`].
pub type AgentEntrypoint = unsafe extern "C" fn(
    parameters: *const c_char,
    unload_policy: *mut c_int,
    injector_state: *mut InjectorState,
);
