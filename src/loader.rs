use crate::{
    DlopenFlags, LibcApi, NO_FD, RawFd, Result, UnloadPolicy,
    channel::{ByeMessage, receive_fd, send_bye},
    error::{close_error, open_error, symbol_error, thread_error},
    fd_from_raw, os,
    policy::{AgentEntrypoint, InjectorState},
};
use core::{
    cell::UnsafeCell,
    ffi::{CStr, c_int, c_void},
    fmt::{self, Write},
    ptr::{self, NonNull},
};
use libc::pthread_t;

/// Everything one injection needs, as handed over by the injector.
///
/// The context is never modified by the loader except for the worker handle, which is written
/// by `pthread_create` when [`load`] spawns the worker.
pub struct LoaderContext<'a, L: ?Sized> {
    libc: &'a L,
    /// `[peer end, local end]`
    ctrlfds: [RawFd; 2],
    agent_path: &'a CStr,
    agent_entrypoint: &'a CStr,
    agent_parameters: &'a CStr,
    /// Written by `pthread_create` in [`load`].
    worker: UnsafeCell<pthread_t>,
    /// The calling thread, for [`run`].
    caller: Option<pthread_t>,
}

// The worker slot is only written by pthread_create before the worker reads it.
unsafe impl<L: ?Sized + Sync> Sync for LoaderContext<'_, L> {}

impl<'a, L: ?Sized> LoaderContext<'a, L> {
    /// Creates a context that loads the agent from `agent_path` and has no control channel.
    ///
    /// `agent_parameters` is passed to the entrypoint verbatim.
    pub fn new(
        libc: &'a L,
        agent_path: &'a CStr,
        agent_entrypoint: &'a CStr,
        agent_parameters: &'a CStr,
    ) -> Self {
        Self {
            libc,
            ctrlfds: [NO_FD, NO_FD],
            agent_path,
            agent_entrypoint,
            agent_parameters,
            worker: UnsafeCell::new(0),
            caller: None,
        }
    }

    /// Attaches the control channel.
    ///
    /// `peer` is this process's copy of the controller's end, which the loader closes right away;
    /// pass [`NO_FD`] if there is none. `local` is the loader's end. When `local` is present the
    /// agent is received over the channel and `agent_path` is ignored.
    pub fn with_control_channel(mut self, peer: RawFd, local: RawFd) -> Self {
        self.ctrlfds = [peer, local];
        self
    }

    /// Sets the handle of the thread [`run`] executes on, for callers that do not go through
    /// [`load`]. Without it `run` never detaches.
    pub fn with_worker(mut self, worker: pthread_t) -> Self {
        self.caller = Some(worker);
        self
    }

    /// The handle of the worker thread spawned by [`load`].
    #[inline]
    pub fn worker(&self) -> pthread_t {
        unsafe { *self.worker.get() }
    }

    #[inline]
    pub fn agent_path(&self) -> &CStr {
        self.agent_path
    }

    #[inline]
    pub fn agent_entrypoint(&self) -> &CStr {
        self.agent_entrypoint
    }

    #[inline]
    pub fn agent_parameters(&self) -> &CStr {
        self.agent_parameters
    }
}

const AGENT_PATH_CAPACITY: usize = 32;

/// A process-local path naming an open descriptor, `/proc/self/fd/<n>`.
///
/// Lets the module be mapped without it ever having a real path on disk. Built on the stack, the
/// loader has no allocator to rely on.
pub struct AgentPath {
    buf: [u8; AGENT_PATH_CAPACITY],
    len: usize,
}

impl AgentPath {
    /// Builds the path for `fd`. An absent descriptor yields `/proc/self/fd/-1`, which no module
    /// can be opened from.
    pub fn from_fd(fd: Option<RawFd>) -> Self {
        let mut path = Self {
            buf: [0; AGENT_PATH_CAPACITY],
            len: 0,
        };
        // "/proc/self/fd/" plus any c_int fits with room for the nul.
        let _ = write!(path, "/proc/self/fd/{}", fd.unwrap_or(NO_FD));
        path
    }

    pub fn as_cstr(&self) -> &CStr {
        // buf is zero-filled, write_str keeps the last byte free and never copies a nul.
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.buf[..=self.len]) }
    }
}

impl Write for AgentPath {
    /// Appends `s`, or nothing at all if it would not fit or holds a nul.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end >= AGENT_PATH_CAPACITY || s.as_bytes().contains(&0) {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

impl fmt::Debug for AgentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AgentPath").field(&self.as_cstr()).finish()
    }
}

/// Where the agent module is opened from.
enum AgentLocator<'a> {
    Path(&'a CStr),
    Descriptor(AgentPath),
}

impl AgentLocator<'_> {
    fn as_cstr(&self) -> &CStr {
        match self {
            AgentLocator::Path(path) => path,
            AgentLocator::Descriptor(path) => path.as_cstr(),
        }
    }
}

/// The stages of one injection, in the order they are reached.
///
/// Every failure from [`Stage::ModuleOpened`] on jumps straight to [`Stage::Cleanup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    ResourceAcquired,
    ModuleOpened,
    EntrypointResolved,
    EntrypointInvoked,
    Cleanup,
    Done,
}

/// What a finished run did. The controller sees none of this beyond the bye message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// The policy cleanup acted on.
    pub policy: UnloadPolicy,
    /// The last stage reached before cleanup.
    pub reached: Stage,
    /// Whether the bye message went out in full.
    pub bye_sent: bool,
}

/// The working state of one injection. Each descriptor slot is emptied by the step that consumes
/// it, so nothing can be released twice.
struct Injection<'c, L: ?Sized> {
    libc: &'c L,
    stage: Stage,
    /// Raw storage lent to the entrypoint.
    policy: c_int,
    module: Option<NonNull<c_void>>,
    ctrlfd: Option<RawFd>,
    agent_codefd: Option<RawFd>,
    agent_ctrlfd: Option<RawFd>,
}

impl<'c, L: LibcApi + ?Sized> Injection<'c, L> {
    fn new(libc: &'c L) -> Self {
        Self {
            libc,
            stage: Stage::Start,
            policy: UnloadPolicy::Immediate.as_raw(),
            module: None,
            ctrlfd: None,
            agent_codefd: None,
            agent_ctrlfd: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        #[cfg(feature = "log")]
        log::trace!("[agent_loader] {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Start -> ResourceAcquired. Failures here only leave descriptor slots empty, the open that
    /// follows is what fails.
    fn acquire<'a>(&mut self, ctx: &LoaderContext<'a, L>) -> AgentLocator<'a> {
        if let Some(peer) = fd_from_raw(ctx.ctrlfds[0]) {
            self.release_fd(peer);
        }

        let locator = match fd_from_raw(ctx.ctrlfds[1]) {
            Some(ctrlfd) => {
                self.ctrlfd = Some(ctrlfd);
                self.agent_codefd = self.receive(ctrlfd);
                self.agent_ctrlfd = self.receive(ctrlfd);
                AgentLocator::Descriptor(AgentPath::from_fd(self.agent_codefd))
            }
            None => AgentLocator::Path(ctx.agent_path),
        };
        self.enter(Stage::ResourceAcquired);
        locator
    }

    fn receive(&self, ctrlfd: RawFd) -> Option<RawFd> {
        match receive_fd(self.libc, ctrlfd) {
            Ok(fd) => Some(fd),
            Err(_err) => {
                #[cfg(feature = "log")]
                log::debug!("[agent_loader] no descriptor from fd {ctrlfd}: {_err}");
                None
            }
        }
    }

    /// ResourceAcquired -> EntrypointInvoked.
    fn invoke(&mut self, ctx: &LoaderContext<'_, L>, locator: &AgentLocator<'_>) -> Result<()> {
        let path = locator.as_cstr();
        let handle = unsafe {
            self.libc
                .dlopen(path, DlopenFlags::RTLD_GLOBAL | DlopenFlags::RTLD_LAZY)
        };
        if let Some(codefd) = self.agent_codefd.take() {
            self.release_fd(codefd);
        }
        let handle = NonNull::new(handle).ok_or_else(|| open_error("dlopen returned null"))?;
        self.module = Some(handle);
        self.enter(Stage::ModuleOpened);

        let symbol = unsafe { self.libc.dlsym(handle.as_ptr(), ctx.agent_entrypoint) };
        if symbol.is_null() {
            return Err(symbol_error("entrypoint is not exported"));
        }
        let entrypoint = unsafe { core::mem::transmute::<*mut c_void, AgentEntrypoint>(symbol) };
        self.enter(Stage::EntrypointResolved);

        let mut state = InjectorState::new(self.ctrlfd, self.agent_ctrlfd);
        #[cfg(feature = "log")]
        log::debug!(
            "[agent_loader] calling {:?} in {:?} with {:?}",
            ctx.agent_entrypoint,
            path,
            state
        );
        unsafe {
            entrypoint(
                ctx.agent_parameters.as_ptr(),
                &raw mut self.policy,
                &raw mut state,
            )
        };
        self.ctrlfd = state.controller();
        self.agent_ctrlfd = state.agent();
        self.enter(Stage::EntrypointInvoked);
        Ok(())
    }

    fn resolve_policy(&self) -> UnloadPolicy {
        match UnloadPolicy::from_raw(self.policy) {
            Some(policy) => policy,
            None => {
                #[cfg(feature = "log")]
                log::warn!(
                    "[agent_loader] unknown unload policy {}, keeping the module resident",
                    self.policy
                );
                UnloadPolicy::Resident
            }
        }
    }

    /// Cleanup -> Done. Every step runs regardless of how the others went.
    fn finish(mut self, worker: Option<pthread_t>) -> Outcome {
        let reached = self.stage;
        self.enter(Stage::Cleanup);
        let policy = self.resolve_policy();

        if policy.unloads_module() {
            if let Some(module) = self.module.take() {
                if unsafe { self.libc.dlclose(module.as_ptr()) } != 0 {
                    self.report(close_error("dlclose failed"));
                }
            }
        }

        if policy.detaches_thread() {
            match worker {
                Some(worker) => {
                    if unsafe { self.libc.pthread_detach(worker) } != 0 {
                        self.report(thread_error("pthread_detach failed"));
                    }
                }
                None => self.report(thread_error("no worker handle to detach")),
            }
        }

        if let Some(agent_ctrlfd) = self.agent_ctrlfd.take() {
            self.release_fd(agent_ctrlfd);
        }

        let mut bye_sent = false;
        if let Some(ctrlfd) = self.ctrlfd.take() {
            // The controller hears the raw value, even one cleanup did not recognise.
            let bye = ByeMessage {
                unload_policy: self.policy,
                thread_id: os::gettid(),
            };
            match send_bye(self.libc, ctrlfd, &bye) {
                Ok(()) => bye_sent = true,
                Err(err) => self.report(err),
            }
            self.release_fd(ctrlfd);
        }

        self.enter(Stage::Done);
        Outcome {
            policy,
            reached,
            bye_sent,
        }
    }

    fn release_fd(&self, fd: RawFd) {
        if unsafe { self.libc.close(fd) } != 0 {
            self.report(close_error("close failed"));
        }
    }

    /// Nobody is left to hear about cleanup failures but the log.
    #[inline]
    fn report(&self, _err: crate::Error) {
        #[cfg(feature = "log")]
        log::warn!("[agent_loader] ignored during cleanup: {_err}");
    }
}

/// Runs one injection on the calling thread: receive the agent, open it, call its entrypoint,
/// then clean up according to the policy it chose and say goodbye to the controller.
///
/// Never fails. Whatever goes wrong is skipped over to cleanup, and the controller learns the
/// outcome only from the bye message, or from its absence.
///
/// The thread is detached unless the agent asks for [`UnloadPolicy::Deferred`]. That needs the
/// handle given by [`LoaderContext::with_worker`]; without one the thread is left joinable.
///
/// # Safety
/// The module `ctx` names, or the one received over its control channel, must export the
/// entrypoint with the [`AgentEntrypoint`] signature, and loading it must be sound in this
/// process. The handle given by [`LoaderContext::with_worker`], if any, must name the calling
/// thread.
///
/// ```compile_fail
/// use agent_loader::{LibcTable, LoaderContext, run};
///
/// let table = LibcTable::new();
/// run(&LoaderContext::new(&table, c"libc.so.6", c"abort", c""));
/// ```
pub unsafe fn run<L: LibcApi + ?Sized>(ctx: &LoaderContext<'_, L>) -> Outcome {
    unsafe { drive(ctx, ctx.caller) }
}

unsafe fn drive<L: LibcApi + ?Sized>(
    ctx: &LoaderContext<'_, L>,
    worker: Option<pthread_t>,
) -> Outcome {
    let mut injection = Injection::new(ctx.libc);
    let locator = injection.acquire(ctx);
    if let Err(_err) = injection.invoke(ctx, &locator) {
        #[cfg(feature = "log")]
        log::debug!(
            "[agent_loader] skipping to cleanup from {:?}: {_err}",
            injection.stage
        );
    }
    injection.finish(worker)
}

/// Spawns the worker thread through the capability table and runs the injection on it.
///
/// # Safety
/// `ctx` and everything it borrows must stay valid until the worker has finished, which, for
/// a detached worker, nobody observes except through the bye message. The module must satisfy
/// the same contract as for [`run`].
pub unsafe fn load<L: LibcApi + Sync + 'static>(ctx: &LoaderContext<'_, L>) -> Result<()> {
    let arg = ptr::from_ref(ctx).cast_mut().cast::<c_void>();
    let res = unsafe { ctx.libc.pthread_create(ctx.worker.get(), worker_main::<L>, arg) };
    if res != 0 {
        return Err(thread_error("pthread_create failed"));
    }
    Ok(())
}

extern "C" fn worker_main<L: LibcApi + 'static>(user_data: *mut c_void) -> *mut c_void {
    let ctx = unsafe { &*user_data.cast_const().cast::<LoaderContext<'_, L>>() };
    // glibc stores the handle through pthread_create's out pointer before the thread starts.
    unsafe { drive(ctx, Some(ctx.worker())) };
    ptr::null_mut()
}
