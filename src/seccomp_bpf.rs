//! Builds the classic-BPF program installed as a seccomp filter in the
//! tracee. The filter is default-allow: only the syscalls whose effects the
//! tracer interprets return `SECCOMP_RET_TRACE`, so the tracee runs at full
//! speed through everything else.
//!
//! Conventions the program maintains: the accumulator holds the syscall
//! number on entry to every matching block, and every block that loads an
//! argument word reloads the syscall number on its fall-through path.

use crate::kernel_supplement::{
    seccomp_data, BPF_ABS, BPF_JEQ, BPF_JMP, BPF_JSET, BPF_K, BPF_LD, BPF_RET, BPF_W,
    SECCOMP_RET_ALLOW, SECCOMP_RET_TRACE,
};
use libc::{sock_filter, sock_fprog, SECCOMP_MODE_FILTER};
use memoffset::offset_of;

#[derive(Clone, Default)]
pub struct SeccompFilter {
    pub filters: Vec<sock_filter>,
}

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        k,
        jt: 0,
        jf: 0,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, k, jt, jf }
}

impl SeccompFilter {
    pub fn new() -> SeccompFilter {
        Default::default()
    }

    fn load_syscallno(&mut self) {
        self.filters.push(bpf_stmt(
            BPF_LD | BPF_W | BPF_ABS,
            offset_of!(seccomp_data, nr) as u32,
        ));
    }

    fn load_arg(&mut self, index: usize) {
        let off = offset_of!(seccomp_data, args) + index * std::mem::size_of::<u64>();
        self.filters.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, off as u32));
    }

    /// Trace every invocation of `syscallno`.
    fn trace_syscall(&mut self, syscallno: i64) {
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, syscallno as u32, 0, 1));
        self.filters
            .push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE));
    }

    /// Trace `syscallno` only when the flags argument at `flags_arg` has
    /// O_WRONLY or O_RDWR set, i.e. when the open can produce writes.
    fn trace_open_variant(&mut self, syscallno: i64, flags_arg: usize) {
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, syscallno as u32, 0, 5));
        self.load_arg(flags_arg);
        self.filters.push(bpf_jump(
            BPF_JMP | BPF_JSET | BPF_K,
            libc::O_WRONLY as u32,
            1,
            0,
        ));
        self.filters.push(bpf_jump(
            BPF_JMP | BPF_JSET | BPF_K,
            libc::O_RDWR as u32,
            0,
            1,
        ));
        self.filters
            .push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE));
        self.load_syscallno();
    }

    /// Trace fcntl only for the commands in `cmds`. Exact comparison: some
    /// interesting commands (F_DUPFD) are zero, so bit-test matching would
    /// never see them.
    fn trace_fcntl_cmds(&mut self, cmds: &[i32]) {
        assert!(!cmds.is_empty());
        let n = cmds.len();
        self.filters.push(bpf_jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            libc::SYS_fcntl as u32,
            0,
            (n + 3) as u8,
        ));
        self.load_arg(1);
        for (i, cmd) in cmds.iter().enumerate() {
            if i + 1 < n {
                self.filters.push(bpf_jump(
                    BPF_JMP | BPF_JEQ | BPF_K,
                    *cmd as u32,
                    (n - 1 - i) as u8,
                    0,
                ));
            } else {
                self.filters
                    .push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, *cmd as u32, 0, 1));
            }
        }
        self.filters
            .push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE));
        self.load_syscallno();
    }

    fn allow_all(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    }

    /// Install in the calling (tracee) process. Must run before exec.
    /// Errors cannot reach the tracer's log so they go to stderr and the
    /// child exits with a distinctive code.
    pub fn install(&self) {
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            eprintln!("prctl(PR_SET_NO_NEW_PRIVS) failed");
            std::process::exit(2);
        }
        let prog = sock_fprog {
            len: self.filters.len() as libc::c_ushort,
            filter: self.filters.as_ptr() as *mut sock_filter,
        };
        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER as libc::c_ulong,
                &prog as *const sock_fprog,
            )
        };
        if ret != 0 {
            eprintln!("prctl(PR_SET_SECCOMP) failed");
            std::process::exit(2);
        }
    }
}

/// The filter that traces exactly the syscalls whose effects the tracer
/// accounts: writes, fd lifetime and duplication, size and offset changes,
/// and opens that could lead to writes.
pub fn write_tracking_filter() -> SeccompFilter {
    let mut f = SeccompFilter::new();
    f.load_syscallno();

    f.trace_syscall(libc::SYS_write);
    f.trace_syscall(libc::SYS_writev);
    f.trace_syscall(libc::SYS_pwrite64);
    f.trace_syscall(libc::SYS_pwritev);
    f.trace_syscall(libc::SYS_pwritev2);
    f.trace_syscall(libc::SYS_close);
    #[cfg(target_arch = "x86_64")]
    f.trace_syscall(libc::SYS_creat);
    f.trace_syscall(libc::SYS_dup);
    #[cfg(target_arch = "x86_64")]
    f.trace_syscall(libc::SYS_dup2);
    f.trace_syscall(libc::SYS_dup3);
    f.trace_syscall(libc::SYS_fallocate);
    f.trace_syscall(libc::SYS_ftruncate);
    f.trace_syscall(libc::SYS_lseek);

    #[cfg(target_arch = "x86_64")]
    f.trace_open_variant(libc::SYS_open, 1);
    f.trace_open_variant(libc::SYS_openat, 2);

    f.trace_fcntl_cmds(&[
        libc::F_DUPFD,
        libc::F_DUPFD_CLOEXEC,
        libc::F_SETFL,
        libc::F_SETFD,
    ]);

    f.allow_all();
    f
}
