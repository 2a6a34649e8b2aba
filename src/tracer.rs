//! Spawns the target under ptrace and runs the wait loop that drives the
//! tracing context. One tracer thread supervises the whole tree; tracees
//! are resumed with PTRACE_CONT when the seccomp filter narrows the stops
//! for us, and with PTRACE_SYSCALL otherwise.

use crate::kernel_metadata::errno_name;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::ptrace;
use crate::registers::Registers;
use crate::seccomp_bpf::write_tracking_filter;
use crate::trace_context::TraceContext;
use crate::util::kernel_at_least;
use crate::wait_status::{killed_by_sigkill_code, WaitStatus, WaitType};
use crate::wtrace_options::Options;
use libc::pid_t;
use nix::errno::{errno, Errno};
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::{execvp, fork, ForkResult};
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Written once, after fork, before the forwarding handlers go live.
static TRACEE_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = TRACEE_PID.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

/// Seccomp filters need kernel 3.5 for SECCOMP_RET_TRACE.
fn can_use_seccomp() -> bool {
    kernel_at_least("3.5")
}

/// Before 4.8 the seccomp stop fired ahead of the syscall-entry stop;
/// since 4.8 it replaces it.
fn seccomp_stop_is_syscall_entry() -> bool {
    kernel_at_least("4.8")
}

struct Tracer {
    ctx: TraceContext,
    follow_forks: bool,
    wait_daemons: bool,
    filtered: bool,
    modern_seccomp: bool,
    root: pid_t,
    /// Root's exit code when we keep draining daemons after it left.
    root_code: Option<i32>,
    known: HashSet<pid_t>,
    /// Tids stopped between syscall entry and exit.
    pending_exit: HashSet<pid_t>,
    /// Raw wait statuses of tids we saw before their creation event.
    parked: HashMap<pid_t, i32>,
    /// New tracees whose auto-attach SIGSTOP has not arrived yet.
    awaiting_initial_stop: HashSet<pid_t>,
}

impl Tracer {
    fn resume(&self, pid: pid_t, sig: i32) {
        // Errors mean the tracee died mid-stop; its exit status will come
        // through waitpid.
        let result = if self.pending_exit.contains(&pid) || !self.filtered {
            ptrace::restart_syscall(pid, sig)
        } else {
            ptrace::continue_tracee(pid, sig)
        };
        if result.is_err() {
            log!(LogDebug, "tid {} vanished while being resumed", pid);
        }
    }

    /// Handle one wait status. `Some(code)` ends the trace.
    fn handle_status(&mut self, pid: pid_t, status: WaitStatus) -> Option<i32> {
        match status.wait_type() {
            WaitType::Exit | WaitType::FatalSignal => {
                if let Some(sig) = status.fatal_sig() {
                    if status.core_dumped() {
                        self.ctx.register_core_dump(pid, sig);
                    }
                }
                let code = match status.mirrored_exit_code() {
                    Some(code) => code,
                    None => 0,
                };
                self.handle_gone(pid, code)
            }
            WaitType::SyscallStop => {
                self.handle_syscall(pid);
                None
            }
            WaitType::PtraceEvent => {
                self.handle_ptrace_event(pid, status);
                None
            }
            WaitType::SignalStop => {
                let sig = status.maybe_stop_sig().get_raw_repr();
                if self.awaiting_initial_stop.remove(&pid) && sig == libc::SIGSTOP {
                    // The auto-attach stop of a fresh tracee, not a real
                    // SIGSTOP directed at it.
                    self.resume(pid, 0);
                } else {
                    self.resume(pid, sig);
                }
                None
            }
        }
    }

    fn handle_gone(&mut self, pid: pid_t, code: i32) -> Option<i32> {
        if self.known.remove(&pid) {
            self.ctx.vanish_process(pid);
        }
        self.pending_exit.remove(&pid);
        self.awaiting_initial_stop.remove(&pid);
        if pid != self.root {
            return None;
        }
        if self.follow_forks && self.wait_daemons {
            self.root_code = Some(code);
            None
        } else {
            Some(code)
        }
    }

    fn handle_syscall(&mut self, pid: pid_t) {
        let mut regs = match ptrace::get_regs(pid) {
            Ok(regs) => regs,
            Err(_) => return,
        };
        if self.pending_exit.remove(&pid) {
            self.ctx.syscall_exit(pid, &regs);
            self.resume(pid, 0);
            return;
        }
        self.syscall_entry(pid, &mut regs, true);
    }

    /// Common entry handling for syscall-entry stops and (on modern
    /// kernels) seccomp stops, which take their place.
    fn syscall_entry(&mut self, pid: pid_t, regs: &mut Registers, check_sanity: bool) {
        if check_sanity && regs.syscall_result_signed() != -(libc::ENOSYS as i64) {
            log!(
                LogDebug,
                "tid {} entry stop for syscall {} carries result {}",
                pid,
                regs.syscallno(),
                regs.syscall_result_signed()
            );
        }
        self.ctx.syscall_enter(pid, regs);
        if regs.preserve_arg1() && ptrace::set_regs(pid, regs).is_err() {
            return;
        }
        self.pending_exit.insert(pid);
        self.resume(pid, 0);
    }

    fn handle_ptrace_event(&mut self, pid: pid_t, status: WaitStatus) {
        let event = status.maybe_ptrace_event();
        if event == libc::PTRACE_EVENT_CLONE
            || event == libc::PTRACE_EVENT_FORK
            || event == libc::PTRACE_EVENT_VFORK
        {
            self.handle_new_task(pid, event == libc::PTRACE_EVENT_CLONE);
        } else if event == libc::PTRACE_EVENT_EXEC {
            let former_tid = match ptrace::get_event_msg(pid) {
                Ok(msg) => msg as pid_t,
                Err(_) => return,
            };
            self.ctx.register_exec(pid, former_tid);
            if former_tid != pid {
                self.known.remove(&former_tid);
                self.pending_exit.remove(&former_tid);
            }
            self.resume(pid, 0);
        } else if event == libc::PTRACE_EVENT_EXIT {
            // Bookkeeping happens at the real exit status; this stop only
            // guarantees we observe disappearing threads.
            self.resume(pid, 0);
        } else if event == libc::PTRACE_EVENT_SECCOMP {
            self.handle_seccomp(pid);
        } else {
            fatal!("unrecognized ptrace event in status {} for tid {}", status, pid);
        }
    }

    fn handle_new_task(&mut self, pid: pid_t, could_be_thread: bool) {
        let new_tid = match ptrace::get_event_msg(pid) {
            Ok(msg) => msg as pid_t,
            Err(_) => return,
        };
        // CLONE_THREAD decides table sharing. The clone syscall has not
        // completed in the parent, so its first argument is still in the
        // convention register.
        let is_thread = could_be_thread
            && match ptrace::get_regs(pid) {
                Ok(regs) => regs.arg1_raw() & libc::CLONE_THREAD as u64 != 0,
                Err(_) => false,
            };
        if is_thread {
            self.ctx.register_thread(pid, new_tid);
        } else {
            self.ctx.register_process(pid, new_tid);
        }
        self.known.insert(new_tid);
        self.resume(pid, 0);

        match self.parked.remove(&new_tid) {
            Some(raw) => {
                let parked = WaitStatus::new(raw);
                if parked.wait_type() == WaitType::SignalStop {
                    self.resume(new_tid, 0);
                } else {
                    self.handle_status(new_tid, parked);
                }
            }
            None => {
                self.awaiting_initial_stop.insert(new_tid);
            }
        }
    }

    fn handle_seccomp(&mut self, pid: pid_t) {
        if !self.modern_seccomp {
            // The syscall-entry stop is still coming; this stop is only a
            // resume point.
            if ptrace::restart_syscall(pid, 0).is_err() {
                log!(LogDebug, "tid {} vanished at seccomp stop", pid);
            }
            return;
        }
        let mut regs = match ptrace::get_regs(pid) {
            Ok(regs) => regs,
            Err(_) => return,
        };
        self.syscall_entry(pid, &mut regs, false);
    }

    fn wait_loop(&mut self) -> i32 {
        loop {
            let mut raw: i32 = 0;
            unsafe { Errno::clear() };
            let pid = unsafe { libc::waitpid(-1, &mut raw, libc::__WALL) };
            if pid < 0 {
                match errno() {
                    libc::EINTR => continue,
                    libc::ECHILD => {
                        // Every tracee is gone. Without wait-daemons this
                        // only happens when the root was SIGKILLed before
                        // we saw its status.
                        let code = match self.root_code {
                            Some(code) => code,
                            None => killed_by_sigkill_code(),
                        };
                        return code;
                    }
                    err => fatal!("waitpid failed: {}", errno_name(err)),
                }
            }
            let status = WaitStatus::new(raw);
            if !self.known.contains(&pid) {
                // A new task can be scheduled and stop before its parent's
                // creation event reaches us. Park the status; the creation
                // event will replay it.
                log!(LogDebug, "parking status {} of unknown tid {}", status, pid);
                self.parked.insert(pid, raw);
                continue;
            }
            if let Some(code) = self.handle_status(pid, status) {
                return code;
            }
        }
    }
}

fn exec_tracee(options: &Options, restore_mask: &SigSet, filtered: bool) -> ! {
    if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(restore_mask), None) {
        eprintln!("cannot restore the signal mask: {}", e);
        std::process::exit(2);
    }
    if filtered {
        write_tracking_filter().install();
    }
    ptrace::trace_me();
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
    let args: Vec<CString> = options
        .command
        .iter()
        .filter_map(|arg| CString::new(arg.as_bytes()).ok())
        .collect();
    if args.len() != options.command.len() {
        eprintln!("command arguments must not contain NUL bytes");
        std::process::exit(2);
    }
    if let Err(err) = execvp(&args[0], &args) {
        eprintln!("cannot exec {:?}: {}", options.command[0], err);
    }
    std::process::exit(2);
}

fn install_forwarding_handlers(signals: &[i32]) {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in signals {
        let signal = match Signal::try_from(*sig) {
            Ok(signal) => signal,
            Err(_) => continue,
        };
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            log!(LogWarn, "cannot forward {}: {}", signal, e);
        }
    }
}

fn ptrace_options(options: &Options, filtered: bool) -> isize {
    let mut opts = libc::PTRACE_O_TRACESYSGOOD | libc::PTRACE_O_TRACEEXEC | libc::PTRACE_O_TRACEEXIT;
    if options.follow_forks {
        opts |= libc::PTRACE_O_TRACECLONE | libc::PTRACE_O_TRACEFORK | libc::PTRACE_O_TRACEVFORK;
    }
    if options.jail_forks {
        opts |= libc::PTRACE_O_EXITKILL;
    }
    if filtered {
        opts |= libc::PTRACE_O_TRACESECCOMP;
    }
    opts as isize
}

/// Run the target to completion under trace. Returns the process exit
/// code to mirror: the root tracee's own, or 128+signal.
pub fn trace_program(options: &Options) -> i32 {
    let filtered = options.use_seccomp && can_use_seccomp();
    if options.use_seccomp && !filtered {
        log!(LogWarn, "kernel too old for seccomp filtering, tracing every syscall");
    }

    // Hold back every signal until the forwarding handlers know the pid.
    let mut old_mask = SigSet::empty();
    if let Err(e) = sigprocmask(
        SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        Some(&mut old_mask),
    ) {
        fatal!("cannot block signals: {}", e);
    }

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_tracee(options, &old_mask, filtered),
        Ok(ForkResult::Parent { child }) => child.as_raw(),
        Err(e) => fatal!("cannot fork: {}", e),
    };

    // First stop is the self-raised SIGTRAP.
    let mut raw: i32 = 0;
    let waited = unsafe { libc::waitpid(child, &mut raw, libc::__WALL) };
    let status = WaitStatus::new(raw);
    if waited != child || status.maybe_stop_sig().is_not_sig() {
        fatal!("tracee did not reach its initial stop: {}", status);
    }
    if ptrace::set_options(child, ptrace_options(options, filtered)).is_err() {
        log!(LogWarn, "tracee died before tracing began");
    }

    TRACEE_PID.store(child, Ordering::SeqCst);
    install_forwarding_handlers(&options.forwarded_signals);
    if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None) {
        fatal!("cannot restore the signal mask: {}", e);
    }

    let mut tracer = Tracer {
        ctx: TraceContext::new(options.clone()),
        follow_forks: options.follow_forks,
        wait_daemons: options.wait_daemons,
        filtered,
        modern_seccomp: seccomp_stop_is_syscall_entry(),
        root: child,
        root_code: None,
        known: HashSet::new(),
        pending_exit: HashSet::new(),
        parked: HashMap::new(),
        awaiting_initial_stop: HashSet::new(),
    };
    tracer.ctx.register_tracee(child);
    tracer.known.insert(child);
    tracer.resume(child, 0);

    let code = tracer.wait_loop();
    tracer.ctx.post_process(code)
}
