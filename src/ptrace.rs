//! Thin wrappers over the ptrace requests the tracer issues. Tracees can
//! die at any moment, so every request that targets a live tracee reports
//! ESRCH as a soft `TraceeVanished` error instead of aborting; any other
//! errno is a tracer bug and is fatal.

use crate::kernel_metadata::{errno_name, ptrace_req_name};
use crate::log::LogLevel::LogDebug;
use crate::registers::Registers;
use libc::pid_t;
use nix::errno::{errno, Errno};
use std::ptr;

/// The tracee disappeared out from under a ptrace request (ESRCH).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceeVanished;

pub type PtraceResult<T> = Result<T, TraceeVanished>;

fn ptrace_checked(
    request: libc::c_uint,
    pid: pid_t,
    addr: *mut libc::c_void,
    data: *mut libc::c_void,
) -> PtraceResult<libc::c_long> {
    unsafe { Errno::clear() };
    let ret = unsafe { libc::ptrace(request as _, pid, addr, data) };
    if ret == -1 && errno() != 0 {
        if errno() == libc::ESRCH {
            log!(
                LogDebug,
                "{} failed for tid {}: tracee vanished",
                ptrace_req_name(request),
                pid
            );
            return Err(TraceeVanished);
        }
        fatal!(
            "{} failed for tid {} with unexpected errno {}",
            ptrace_req_name(request),
            pid,
            errno_name(errno())
        );
    }
    Ok(ret)
}

/// Called in the forked child, before exec. Failures here cannot be
/// reported through the tracer's logging so they go to stderr and the
/// child exits with a distinctive code.
pub fn trace_me() {
    unsafe { Errno::clear() };
    let ret = unsafe { libc::ptrace(libc::PTRACE_TRACEME as _, 0, 0, 0) };
    if ret == -1 && errno() != 0 {
        eprintln!("PTRACE_TRACEME failed: {}", errno_name(errno()));
        std::process::exit(2);
    }
}

pub fn set_options(pid: pid_t, options: isize) -> PtraceResult<()> {
    ptrace_checked(
        libc::PTRACE_SETOPTIONS,
        pid,
        ptr::null_mut(),
        options as *mut libc::c_void,
    )
    .map(|_| ())
}

/// Resume the tracee, stopping at the next syscall boundary. `sig`, if
/// nonzero, is delivered to the tracee on resume.
pub fn restart_syscall(pid: pid_t, sig: i32) -> PtraceResult<()> {
    ptrace_checked(
        libc::PTRACE_SYSCALL,
        pid,
        ptr::null_mut(),
        sig as *mut libc::c_void,
    )
    .map(|_| ())
}

/// Resume the tracee without syscall stops; it runs until the next
/// seccomp event, ptrace event, signal or exit.
pub fn continue_tracee(pid: pid_t, sig: i32) -> PtraceResult<()> {
    ptrace_checked(
        libc::PTRACE_CONT,
        pid,
        ptr::null_mut(),
        sig as *mut libc::c_void,
    )
    .map(|_| ())
}

pub fn get_event_msg(pid: pid_t) -> PtraceResult<usize> {
    let mut msg: usize = 0;
    ptrace_checked(
        libc::PTRACE_GETEVENTMSG,
        pid,
        ptr::null_mut(),
        &mut msg as *mut usize as *mut libc::c_void,
    )?;
    Ok(msg)
}

#[cfg(target_arch = "x86_64")]
pub fn get_regs(pid: pid_t) -> PtraceResult<Registers> {
    let mut regs = Registers::default();
    ptrace_checked(
        libc::PTRACE_GETREGS,
        pid,
        ptr::null_mut(),
        regs.raw_mut() as *mut libc::user_regs_struct as *mut libc::c_void,
    )?;
    Ok(regs)
}

#[cfg(target_arch = "x86_64")]
pub fn set_regs(pid: pid_t, regs: &Registers) -> PtraceResult<()> {
    let mut copy = *regs;
    ptrace_checked(
        libc::PTRACE_SETREGS,
        pid,
        ptr::null_mut(),
        copy.raw_mut() as *mut libc::user_regs_struct as *mut libc::c_void,
    )
    .map(|_| ())
}

#[cfg(target_arch = "aarch64")]
pub fn get_regs(pid: pid_t) -> PtraceResult<Registers> {
    use crate::kernel_supplement::NT_PRSTATUS;
    let mut regs = Registers::default();
    let mut iov = libc::iovec {
        iov_base: regs.raw_mut() as *mut libc::user_regs_struct as *mut libc::c_void,
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    ptrace_checked(
        libc::PTRACE_GETREGSET,
        pid,
        NT_PRSTATUS as *mut libc::c_void,
        &mut iov as *mut libc::iovec as *mut libc::c_void,
    )?;
    Ok(regs)
}

#[cfg(target_arch = "aarch64")]
pub fn set_regs(pid: pid_t, regs: &Registers) -> PtraceResult<()> {
    use crate::kernel_supplement::NT_PRSTATUS;
    let mut copy = *regs;
    let mut iov = libc::iovec {
        iov_base: copy.raw_mut() as *mut libc::user_regs_struct as *mut libc::c_void,
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    ptrace_checked(
        libc::PTRACE_SETREGSET,
        pid,
        NT_PRSTATUS as *mut libc::c_void,
        &mut iov as *mut libc::iovec as *mut libc::c_void,
    )
    .map(|_| ())
}
