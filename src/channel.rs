//! The control channel between the loader and its controller
//!
//! Two kinds of traffic cross it:
//! * descriptor messages, controller to loader: a single placeholder byte carrying one descriptor
//!   as `SCM_RIGHTS` ancillary data;
//! * one [`ByeMessage`], loader to controller, written in a single `send` once the loader has
//!   finished. It is fixed-size and has no length prefix.
use crate::{
    LibcApi, MsgFlags, RawFd, Result, ThreadId, UnloadPolicy,
    error::{receive_error, send_error},
};
use core::{
    ffi::{c_int, c_void},
    mem::{offset_of, size_of},
};
use libc::{SCM_RIGHTS, SOL_SOCKET, cmsghdr, iovec, msghdr};

const fn cmsg_align(len: usize) -> usize {
    (len + size_of::<usize>() - 1) & !(size_of::<usize>() - 1)
}

/// `CMSG_SPACE(sizeof(int))`
const CONTROL_SPACE: usize = cmsg_align(size_of::<cmsghdr>()) + cmsg_align(size_of::<c_int>());

/// Room for exactly one descriptor, aligned for `cmsghdr`.
#[repr(C)]
union ControlMessage {
    #[allow(dead_code)]
    header: cmsghdr,
    storage: [u8; CONTROL_SPACE],
}

/// Receives one descriptor sent by the peer of `sockfd`.
///
/// On success the caller owns the returned descriptor. Nothing is kept between calls, so this
/// must be called once per expected descriptor.
pub fn receive_fd<L: LibcApi + ?Sized>(api: &L, sockfd: RawFd) -> Result<RawFd> {
    let mut placeholder = 0u8;
    let mut io = iovec {
        iov_base: (&raw mut placeholder).cast::<c_void>(),
        iov_len: size_of::<u8>(),
    };
    let mut control = ControlMessage {
        storage: [0; CONTROL_SPACE],
    };
    // msghdr carries private padding on some targets, so start from zero.
    let mut msg: msghdr = unsafe { core::mem::zeroed() };
    msg.msg_iov = &raw mut io;
    msg.msg_iovlen = 1;
    msg.msg_control = (&raw mut control).cast::<c_void>();
    msg.msg_controllen = size_of::<ControlMessage>() as _;

    let res = unsafe { api.recvmsg(sockfd, &raw mut msg, MsgFlags::empty()) };
    if res == -1 {
        return Err(receive_error("recvmsg failed"));
    }
    if res == 0 {
        return Err(receive_error("peer closed the control channel"));
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&raw const msg) };
    if cmsg.is_null() {
        return Err(receive_error("message carried no descriptor"));
    }
    unsafe {
        if (*cmsg).cmsg_level != SOL_SOCKET || (*cmsg).cmsg_type != SCM_RIGHTS {
            return Err(receive_error("message carried no descriptor"));
        }
        Ok(core::ptr::read_unaligned(
            libc::CMSG_DATA(cmsg).cast::<c_int>(),
        ))
    }
}

/// Sends `fd` to the peer of `sockfd`, the way a controller feeds the loader.
///
/// This runs in the controller, an ordinary process, so it calls libc directly. The caller keeps
/// its own copy of `fd`.
pub fn send_fd(sockfd: RawFd, fd: RawFd) -> Result<()> {
    let mut placeholder = 0u8;
    let mut io = iovec {
        iov_base: (&raw mut placeholder).cast::<c_void>(),
        iov_len: size_of::<u8>(),
    };
    let mut control = ControlMessage {
        storage: [0; CONTROL_SPACE],
    };
    let mut msg: msghdr = unsafe { core::mem::zeroed() };
    msg.msg_iov = &raw mut io;
    msg.msg_iovlen = 1;
    msg.msg_control = (&raw mut control).cast::<c_void>();
    msg.msg_controllen = size_of::<ControlMessage>() as _;

    let res = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        if cmsg.is_null() {
            return Err(send_error("control buffer too small"));
        }
        (*cmsg).cmsg_level = SOL_SOCKET;
        (*cmsg).cmsg_type = SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<c_int>() as _) as _;
        core::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<c_int>(), fd);
        libc::sendmsg(sockfd, &raw const msg, MsgFlags::MSG_NOSIGNAL.bits())
    };
    if res != size_of::<u8>() as isize {
        return Err(send_error("sendmsg failed"));
    }
    Ok(())
}

/// The last thing the loader says to its controller.
///
/// Laid out as the C struct `{ int unload_policy; pid_t thread_id; }` in native byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByeMessage {
    pub unload_policy: c_int,
    pub thread_id: ThreadId,
}

/// Size of an encoded [`ByeMessage`].
pub const BYE_MESSAGE_SIZE: usize = size_of::<ByeMessage>();

const POLICY_OFFSET: usize = offset_of!(ByeMessage, unload_policy);
const THREAD_ID_OFFSET: usize = offset_of!(ByeMessage, thread_id);

impl ByeMessage {
    #[inline]
    pub fn new(policy: UnloadPolicy, thread_id: ThreadId) -> Self {
        Self {
            unload_policy: policy.as_raw(),
            thread_id,
        }
    }

    /// The policy carried by the message, if it is one the loader knows.
    #[inline]
    pub fn policy(&self) -> Option<UnloadPolicy> {
        UnloadPolicy::from_raw(self.unload_policy)
    }

    /// Encodes the message exactly as it travels on the wire.
    pub fn encode(&self) -> [u8; BYE_MESSAGE_SIZE] {
        let mut buf = [0u8; BYE_MESSAGE_SIZE];
        buf[POLICY_OFFSET..POLICY_OFFSET + size_of::<c_int>()]
            .copy_from_slice(&self.unload_policy.to_ne_bytes());
        buf[THREAD_ID_OFFSET..THREAD_ID_OFFSET + size_of::<ThreadId>()]
            .copy_from_slice(&self.thread_id.to_ne_bytes());
        buf
    }

    /// Decodes a message read by the controller. Returns `None` unless `bytes` holds exactly one
    /// message.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BYE_MESSAGE_SIZE {
            return None;
        }
        let mut policy = [0u8; size_of::<c_int>()];
        policy.copy_from_slice(&bytes[POLICY_OFFSET..POLICY_OFFSET + size_of::<c_int>()]);
        let mut thread_id = [0u8; size_of::<ThreadId>()];
        thread_id
            .copy_from_slice(&bytes[THREAD_ID_OFFSET..THREAD_ID_OFFSET + size_of::<ThreadId>()]);
        Some(Self {
            unload_policy: c_int::from_ne_bytes(policy),
            thread_id: ThreadId::from_ne_bytes(thread_id),
        })
    }
}

/// Sends `bye` over `fd` as a single write. A vanished controller surfaces as an error, never as
/// `SIGPIPE`.
pub fn send_bye<L: LibcApi + ?Sized>(api: &L, fd: RawFd, bye: &ByeMessage) -> Result<()> {
    let buf = bye.encode();
    let res = unsafe { api.send(fd, &buf, MsgFlags::MSG_NOSIGNAL) };
    if res == -1 {
        return Err(send_error("send failed"));
    }
    if res as usize != BYE_MESSAGE_SIZE {
        return Err(send_error("short send"));
    }
    Ok(())
}
