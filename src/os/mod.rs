//! Raw thread identity
//!
//! The loader asks the kernel for its thread id directly. A freshly created thread inside a
//! foreign process cannot assume the libc thread accessors are usable yet.
cfg_if::cfg_if! {
    if #[cfg(feature = "use-syscall")]{
        pub(crate) mod linux_syscall;
        pub use linux_syscall::*;
    }else {
        pub(crate) mod unix;
        pub use unix::*;
    }
}
