#![allow(dead_code)]

use agent_loader::{
    ByeMessage, DlopenFlags, InjectorState, LibcApi, LibcTable, MsgFlags, NO_FD, RawFd,
    ThreadRoutine, channel::send_fd,
};
use libc::{msghdr, pthread_t};
use std::{
    collections::HashMap,
    ffi::{CStr, CString, c_char, c_int, c_void},
    fs::File,
    io::{Read, Write},
    os::{
        fd::{AsRawFd, IntoRawFd},
        unix::net::UnixStream,
    },
    cell::Cell,
    net::Shutdown,
    ptr,
    sync::{Mutex, MutexGuard},
};

pub const AGENT_PATH: &CStr = c"/opt/agent/libagent.so";
pub const ENTRYPOINT: &CStr = c"agent_main";
/// A made-up handle for callers of `run` that stay on their own thread.
pub const WORKER: pthread_t = 0x7777;

const MODULE_HANDLE: usize = 0x5a5a_0000;
/// Labels given to received descriptors, by receive order.
const RECEIVED: [&str; 2] = ["module", "agent"];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the fake dynamic linker treats the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeModule {
    /// Opens and exports the entrypoint.
    Loads,
    /// Opens but does not export the entrypoint.
    MissingEntrypoint,
    /// Never opens.
    Broken,
}

#[derive(Default)]
struct Ledger {
    /// Descriptors the loader is responsible for, by label.
    open: HashMap<RawFd, &'static str>,
    closes: HashMap<&'static str, usize>,
    /// Closes of descriptors nobody handed to the loader, or that were already closed.
    stray_closes: Vec<RawFd>,
    recv_calls: usize,
    dlopen_calls: Vec<(CString, DlopenFlags)>,
    dlclose_calls: Vec<usize>,
    detached: Vec<pthread_t>,
    sent: Vec<(RawFd, Vec<u8>, MsgFlags)>,
}

/// A capability table that forwards socket work to the real libc, fakes the dynamic linker, and
/// writes down everything the loader asks for.
pub struct Recorder {
    real: LibcTable,
    module: FakeModule,
    /// Whether thread calls reach the real libc.
    real_threads: bool,
    ledger: Mutex<Ledger>,
}

impl Recorder {
    pub fn new(module: FakeModule) -> Self {
        Self {
            real: LibcTable::new(),
            module,
            real_threads: false,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// A recorder whose `pthread_create`/`pthread_detach` really create and detach threads.
    pub fn with_real_threads(module: FakeModule) -> Self {
        Self {
            real_threads: true,
            ..Self::new(module)
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }

    /// Hands `fd` to the loader under `label`.
    pub fn track(&self, fd: RawFd, label: &'static str) {
        self.ledger().open.insert(fd, label);
    }

    pub fn closes(&self, label: &str) -> usize {
        self.ledger().closes.get(label).copied().unwrap_or(0)
    }

    /// Descriptors handed to the loader that it has not closed, sorted by label.
    pub fn still_open(&self) -> Vec<(&'static str, RawFd)> {
        let mut open: Vec<_> = self
            .ledger()
            .open
            .iter()
            .map(|(fd, label)| (*label, *fd))
            .collect();
        open.sort();
        open
    }

    /// Closes whatever the agent claimed, the way the agent eventually would.
    pub fn release_claimed(&self) {
        for (_, fd) in self.still_open() {
            unsafe { self.close(fd) };
        }
    }

    pub fn stray_closes(&self) -> Vec<RawFd> {
        self.ledger().stray_closes.clone()
    }

    pub fn recv_calls(&self) -> usize {
        self.ledger().recv_calls
    }

    pub fn dlopen_calls(&self) -> Vec<(CString, DlopenFlags)> {
        self.ledger().dlopen_calls.clone()
    }

    pub fn dlclose_calls(&self) -> Vec<usize> {
        self.ledger().dlclose_calls.clone()
    }

    pub fn detached(&self) -> Vec<pthread_t> {
        self.ledger().detached.clone()
    }

    pub fn sent(&self) -> Vec<(RawFd, Vec<u8>, MsgFlags)> {
        self.ledger().sent.clone()
    }

    pub fn module_handle() -> usize {
        MODULE_HANDLE
    }

    fn opens_from(&self, ledger: &Ledger, path: &CStr) -> bool {
        if path == AGENT_PATH {
            return true;
        }
        path.to_str()
            .ok()
            .and_then(|path| path.strip_prefix("/proc/self/fd/"))
            .and_then(|fd| fd.parse::<RawFd>().ok())
            .is_some_and(|fd| ledger.open.get(&fd) == Some(&"module"))
    }
}

impl LibcApi for Recorder {
    unsafe fn pthread_create(
        &self,
        thread: *mut pthread_t,
        routine: ThreadRoutine,
        arg: *mut c_void,
    ) -> c_int {
        assert!(self.real_threads, "no threads without real_threads");
        unsafe { self.real.pthread_create(thread, routine, arg) }
    }

    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut msghdr, flags: MsgFlags) -> isize {
        let res = unsafe { self.real.recvmsg(fd, msg, flags) };
        let mut ledger = self.ledger();
        let label = RECEIVED.get(ledger.recv_calls).copied().unwrap_or("extra");
        ledger.recv_calls += 1;
        if res > 0 {
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(msg);
                if !cmsg.is_null() && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let received = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<c_int>());
                    ledger.open.insert(received, label);
                }
            }
        }
        res
    }

    unsafe fn dlopen(&self, path: &CStr, flags: DlopenFlags) -> *mut c_void {
        let mut ledger = self.ledger();
        ledger.dlopen_calls.push((path.to_owned(), flags));
        if self.module != FakeModule::Broken && self.opens_from(&ledger, path) {
            MODULE_HANDLE as *mut c_void
        } else {
            ptr::null_mut()
        }
    }

    unsafe fn dlsym(&self, handle: *mut c_void, symbol: &CStr) -> *mut c_void {
        if handle as usize == MODULE_HANDLE
            && symbol == ENTRYPOINT
            && self.module == FakeModule::Loads
        {
            test_agent_main as *const () as *mut c_void
        } else {
            ptr::null_mut()
        }
    }

    unsafe fn dlclose(&self, handle: *mut c_void) -> c_int {
        self.ledger().dlclose_calls.push(handle as usize);
        0
    }

    unsafe fn send(&self, fd: RawFd, buf: &[u8], flags: MsgFlags) -> isize {
        self.ledger().sent.push((fd, buf.to_vec(), flags));
        unsafe { self.real.send(fd, buf, flags) }
    }

    unsafe fn close(&self, fd: RawFd) -> c_int {
        {
            let mut ledger = self.ledger();
            match ledger.open.remove(&fd) {
                Some(label) => *ledger.closes.entry(label).or_default() += 1,
                None => ledger.stray_closes.push(fd),
            }
        }
        unsafe { self.real.close(fd) }
    }

    unsafe fn pthread_detach(&self, thread: pthread_t) -> c_int {
        self.ledger().detached.push(thread);
        if self.real_threads {
            unsafe { self.real.pthread_detach(thread) }
        } else {
            0
        }
    }
}

thread_local! {
    /// What the entrypoint was handed on this thread, before it changed anything.
    static SEEN_STATE: Cell<Option<InjectorState>> = const { Cell::new(None) };
}

/// The injector state the last entrypoint call on this thread received.
pub fn seen_state() -> Option<InjectorState> {
    SEEN_STATE.get()
}

/// The agent linked into the test binary. Its behaviour comes from the parameter string:
/// `policy=<immediate|resident|deferred|raw number>` and `claim=<controller|agent>[,...]`.
pub unsafe extern "C" fn test_agent_main(
    parameters: *const c_char,
    unload_policy: *mut c_int,
    injector_state: *mut InjectorState,
) {
    let parameters = unsafe { CStr::from_ptr(parameters) }.to_str().unwrap();
    let state = unsafe { &mut *injector_state };
    SEEN_STATE.set(Some(*state));
    for option in parameters.split_whitespace() {
        match option.split_once('=') {
            Some(("policy", "immediate")) => unsafe { *unload_policy = 0 },
            Some(("policy", "resident")) => unsafe { *unload_policy = 1 },
            Some(("policy", "deferred")) => unsafe { *unload_policy = 2 },
            Some(("policy", raw)) => unsafe { *unload_policy = raw.parse().unwrap() },
            Some(("claim", claims)) => {
                for claim in claims.split(',') {
                    match claim {
                        "controller" => state.controller_fd = NO_FD,
                        "agent" => state.agent_fd = NO_FD,
                        other => panic!("unknown claim {other}"),
                    }
                }
            }
            _ => panic!("unknown option {option}"),
        }
    }
}

/// The controller's side of a control channel, plus the two ends the loader gets.
pub struct Channel {
    pub controller: UnixStream,
    /// The loader's copy of the controller end.
    pub peer: RawFd,
    /// The loader's end.
    pub local: RawFd,
}

impl Channel {
    /// Opens a channel and hands both loader-side descriptors to `recorder`.
    pub fn new(recorder: &Recorder) -> Self {
        let (controller, local) = UnixStream::pair().unwrap();
        let peer = unsafe { libc::dup(controller.as_raw_fd()) };
        assert_ne!(peer, -1);
        let local = local.into_raw_fd();
        recorder.track(peer, "peer");
        recorder.track(local, "local");
        Self {
            controller,
            peer,
            local,
        }
    }

    /// Sends the agent's code descriptor and control descriptor. Returns the controller's end of
    /// the agent control socket.
    pub fn send_agent(&self) -> UnixStream {
        let code = File::open("/dev/null").unwrap();
        let (agent_controller, agent_local) = UnixStream::pair().unwrap();
        send_fd(self.controller.as_raw_fd(), code.as_raw_fd()).unwrap();
        send_fd(self.controller.as_raw_fd(), agent_local.as_raw_fd()).unwrap();
        agent_controller
    }

    /// Sends the code descriptor only, then stops writing, so the second receive sees a hang-up.
    pub fn send_module_and_hang_up(&self) {
        let code = File::open("/dev/null").unwrap();
        send_fd(self.controller.as_raw_fd(), code.as_raw_fd()).unwrap();
        self.controller.shutdown(Shutdown::Write).unwrap();
    }

    /// Sends plain bytes where descriptors were expected.
    pub fn send_garbage(&mut self) {
        self.controller.write_all(&[0xaa, 0xbb]).unwrap();
    }

    /// Reads until the loader side has hung up and decodes what arrived.
    pub fn read_bye(&mut self) -> Option<ByeMessage> {
        let mut bytes = Vec::new();
        self.controller.read_to_end(&mut bytes).unwrap();
        ByeMessage::decode(&bytes)
    }
}

pub fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

pub fn parameters(text: &str) -> CString {
    CString::new(text).unwrap()
}
