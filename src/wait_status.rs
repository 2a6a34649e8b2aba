use crate::kernel_metadata::{ptrace_event_name, signal_name};
use libc::{
    SIGKILL, SIGSTOP, SIGTRAP, WCOREDUMP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED,
    WSTOPSIG, WTERMSIG,
};
use std::{
    fmt,
    fmt::{Display, Formatter},
    num::NonZeroU8,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Tracee exited normally.
    Exit,
    /// Tracee exited due to a fatal signal.
    FatalSignal,
    /// Tracee is in a signal-delivery-stop.
    SignalStop,
    /// Tracee is in a syscall-entry or syscall-exit stop (PTRACE_SYSCALL
    /// with PTRACE_O_TRACESYSGOOD).
    SyscallStop,
    /// Tracee is in a PTRACE_EVENT stop.
    PtraceEvent,
}

/// A raw waitpid() status plus the questions we need answered about it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.maybe_stop_sig().is_sig() {
            return WaitType::SignalStop;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.maybe_ptrace_event().is_ptrace_event() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        let termsig = WTERMSIG(self.status);
        // Subtle. Makes sure Option<> is what we mean.
        if WIFSIGNALED(self.status) && termsig > 0 {
            Some(termsig)
        } else {
            None
        }
    }

    /// Did the fatal signal leave a core dump behind?
    pub fn core_dumped(&self) -> bool {
        WIFSIGNALED(self.status) && WCOREDUMP(self.status)
    }

    /// Stop signal if wait_type() == SignalStop, otherwise none. A zero
    /// signal (rare but possible) is converted to SIGSTOP.
    pub fn maybe_stop_sig(&self) -> MaybeStopSignal {
        // (status >> 16) & 0xff != 0 means this is really a ptrace event.
        if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff != 0) {
            return MaybeStopSignal::new_none();
        }

        let mut sig: i32 = WSTOPSIG(self.status);

        if sig == (SIGTRAP | 0x80) {
            // A syscall-entry or syscall-exit stop under PTRACE_O_TRACESYSGOOD.
            return MaybeStopSignal::new_none();
        }

        sig &= !0x80;
        if sig != 0 {
            MaybeStopSignal::new_sig(sig)
        } else {
            MaybeStopSignal::new_sig(SIGSTOP)
        }
    }

    pub fn is_syscall(&self) -> bool {
        // Eliminate some obvious impossibilities.
        if self.maybe_ptrace_event().is_ptrace_event() || !WIFSTOPPED(self.status) {
            return false;
        }

        // We're using PTRACE_O_TRACESYSGOOD.
        WSTOPSIG(self.status) == (SIGTRAP | 0x80)
    }

    /// Ptrace event if wait_type() == PtraceEvent, none otherwise.
    pub fn maybe_ptrace_event(&self) -> MaybePtraceEvent {
        if !WIFSTOPPED(self.status) {
            return MaybePtraceEvent::new_none();
        }
        MaybePtraceEvent::new_event(((self.status >> 16) & 0xff) as u32)
    }

    /// Return a WaitStatus for a normal process exit.
    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    /// Return a WaitStatus for a fatal signal, optionally with a core dump.
    pub fn for_fatal_sig(sig: i32, core_dumped: bool) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus {
            status: sig | if core_dumped { 0x80 } else { 0 },
        }
    }

    /// Return a WaitStatus for a stop signal.
    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    /// Return a WaitStatus for a syscall-entry/exit stop under TRACESYSGOOD.
    pub fn for_syscall() -> WaitStatus {
        WaitStatus {
            status: (((SIGTRAP | 0x80) as i32) << 8) | 0x7f,
        }
    }

    pub fn for_ptrace_event(ptrace_event: i32) -> WaitStatus {
        debug_assert!(ptrace_event >= 1 && ptrace_event < 0x100);
        WaitStatus {
            status: (ptrace_event << 16) | ((SIGTRAP as i32) << 8) | 0x7f,
        }
    }

    /// Exit code for the tracer to mirror: the tracee's own exit status, or
    /// 128+signal if it was killed.
    pub fn mirrored_exit_code(&self) -> Option<i32> {
        if let Some(sig) = self.fatal_sig() {
            return Some(128 + sig);
        }
        self.exit_code()
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(
                f,
                " (STOP-{})",
                signal_name(self.maybe_stop_sig().unwrap_sig())
            ),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => write!(
                f,
                " ({})",
                ptrace_event_name(self.maybe_ptrace_event().unwrap_event() as i32)
            ),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct MaybePtraceEvent(Option<NonZeroU8>);

impl MaybePtraceEvent {
    pub fn unwrap_event(&self) -> u32 {
        match self.0 {
            None => panic!("Cannot unwrap"),
            Some(non_zero) => non_zero.get() as u32,
        }
    }

    pub fn is_ptrace_event(&self) -> bool {
        self.0.is_some()
    }

    pub fn new_none() -> MaybePtraceEvent {
        MaybePtraceEvent(None)
    }

    /// val == 0 or val > 0xff gives `MaybePtraceEvent(None)`.
    pub fn new_event(val: u32) -> MaybePtraceEvent {
        if val == 0 || val > 0xff {
            MaybePtraceEvent(None)
        } else {
            MaybePtraceEvent(NonZeroU8::new(val as u8))
        }
    }
}

impl PartialEq<i32> for MaybePtraceEvent {
    fn eq(&self, other: &i32) -> bool {
        self.0.map_or(false, |op| op.get() as i32 == *other)
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct MaybeStopSignal(Option<NonZeroU8>);

impl MaybeStopSignal {
    pub fn unwrap_sig(&self) -> i32 {
        match self.0 {
            None => panic!("Cannot unwrap"),
            Some(non_zero) => non_zero.get() as i32,
        }
    }

    /// Avoid using this method; it conflates "no signal" with signal 0,
    /// which is exactly what resume requests want.
    pub fn get_raw_repr(&self) -> i32 {
        match self.0 {
            None => 0,
            Some(non_zero) => non_zero.get() as i32,
        }
    }

    pub fn is_sig(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_not_sig(&self) -> bool {
        self.0.is_none()
    }

    pub fn new_none() -> MaybeStopSignal {
        MaybeStopSignal(None)
    }

    /// sig < 1 or sig >= 0x80 gives `MaybeStopSignal(None)`.
    pub fn new_sig(sig: i32) -> MaybeStopSignal {
        if sig < 1 || sig >= 0x80 {
            MaybeStopSignal(None)
        } else {
            MaybeStopSignal(NonZeroU8::new(sig as u8))
        }
    }
}

impl PartialEq<i32> for MaybeStopSignal {
    fn eq(&self, other: &i32) -> bool {
        self.0.map_or(false, |op| op.get() as i32 == *other)
    }
}

/// The fallback exit code when the whole tree was torn down before any exit
/// status was observed.
pub fn killed_by_sigkill_code() -> i32 {
    128 + SIGKILL
}
