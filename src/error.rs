use core::fmt::Display;

/// Error types used throughout the `agent_loader` library.
///
/// Apart from [`Error::Thread`], none of these ever reach the caller of
/// [`load`](crate::load): the loader converges every failure onto its cleanup stage and the
/// controller only learns the outcome from the bye message.
#[derive(Debug)]
pub enum Error {
    /// The worker thread could not be created.
    Thread {
        /// A descriptive message about the thread error.
        msg: &'static str,
    },

    /// A descriptor could not be received from the control channel.
    ///
    /// This covers the peer hanging up, a failed `recvmsg` and a message that carried no
    /// `SCM_RIGHTS` payload.
    Receive {
        /// A descriptive message about the receive error.
        msg: &'static str,
    },

    /// The agent module could not be opened.
    Open {
        /// A descriptive message about the open error.
        msg: &'static str,
    },

    /// The agent entrypoint is not exported by the opened module.
    Symbol {
        /// A descriptive message about the symbol error.
        msg: &'static str,
    },

    /// A message could not be sent over the control channel.
    Send {
        /// A descriptive message about the send error.
        msg: &'static str,
    },

    /// A descriptor or module handle could not be released.
    Close {
        /// A descriptive message about the close error.
        msg: &'static str,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Thread { msg } => write!(f, "Thread error: {msg}"),
            Error::Receive { msg } => write!(f, "Receive error: {msg}"),
            Error::Open { msg } => write!(f, "Module open error: {msg}"),
            Error::Symbol { msg } => write!(f, "Symbol resolution error: {msg}"),
            Error::Send { msg } => write!(f, "Send error: {msg}"),
            Error::Close { msg } => write!(f, "Close error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn thread_error(msg: &'static str) -> Error {
    Error::Thread { msg }
}

#[cold]
#[inline(never)]
pub(crate) fn receive_error(msg: &'static str) -> Error {
    Error::Receive { msg }
}

#[cold]
#[inline(never)]
pub(crate) fn open_error(msg: &'static str) -> Error {
    Error::Open { msg }
}

#[cold]
#[inline(never)]
pub(crate) fn symbol_error(msg: &'static str) -> Error {
    Error::Symbol { msg }
}

#[cold]
#[inline(never)]
pub(crate) fn send_error(msg: &'static str) -> Error {
    Error::Send { msg }
}

#[cold]
#[inline(never)]
pub(crate) fn close_error(msg: &'static str) -> Error {
    Error::Close { msg }
}
