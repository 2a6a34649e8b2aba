pub fn signal_name(sig: i32) -> String {
    /* strsignal() would be nice to use here, but it provides TMI. */
    if 32 <= sig && sig <= 64 {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        /* Special-case this so we don't need to format!() in this common case. */
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: i32) -> String {
    match event {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        /* Special-case this because we often pass ptrace_event_name(event) to
         * diagnostics when event is 0. */
        0 => "PTRACE_EVENT(0)".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn ptrace_req_name(request: libc::c_uint) -> String {
    match request {
        libc::PTRACE_TRACEME => "PTRACE_TRACEME".into(),
        libc::PTRACE_CONT => "PTRACE_CONT".into(),
        libc::PTRACE_SYSCALL => "PTRACE_SYSCALL".into(),
        libc::PTRACE_SETOPTIONS => "PTRACE_SETOPTIONS".into(),
        libc::PTRACE_GETEVENTMSG => "PTRACE_GETEVENTMSG".into(),
        #[cfg(target_arch = "x86_64")]
        libc::PTRACE_GETREGS => "PTRACE_GETREGS".into(),
        #[cfg(target_arch = "x86_64")]
        libc::PTRACE_SETREGS => "PTRACE_SETREGS".into(),
        libc::PTRACE_GETREGSET => "PTRACE_GETREGSET".into(),
        libc::PTRACE_SETREGSET => "PTRACE_SETREGSET".into(),
        _ => format!("PTRACE_REQUEST({})", request),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::ENOTDIR => "ENOTDIR".into(),
        libc::EISDIR => "EISDIR".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENFILE => "ENFILE".into(),
        libc::EMFILE => "EMFILE".into(),
        libc::EFBIG => "EFBIG".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::ESPIPE => "ESPIPE".into(),
        libc::EROFS => "EROFS".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::ENAMETOOLONG => "ENAMETOOLONG".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ELOOP => "ELOOP".into(),
        _ => format!("errno({})", err),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(34), "SIGRT34");
        assert_eq!(ptrace_event_name(libc::PTRACE_EVENT_CLONE), "PTRACE_EVENT_CLONE");
        assert_eq!(errno_name(libc::ESRCH), "ESRCH");
    }
}
