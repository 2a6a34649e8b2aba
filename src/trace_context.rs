//! The tracing context: per-pid process bookkeeping plus the interpreter
//! that applies syscall effects to the fd tables. The event loop hands it
//! register snapshots at syscall exits and lifecycle notifications for
//! clone/fork/exec/exit; everything it learns funnels into `FileStorage`
//! and comes out as the final report.

use crate::core_dump::locate_core_dump;
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::registers::Registers;
use crate::report::print_report;
use crate::storage::FileStorage;
use crate::task_state::{
    FileState, FileStateSharedPtr, OutputFile, ProcInfo, ProcInfoSharedPtr, ProcState,
    ProcStateSharedPtr,
};
use crate::util::{command_line, command_name, file_length, is_regular_file_fd, my_highest_fd};
use crate::wtrace_options::Options;
use libc::pid_t;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::rc::Rc;

pub struct TraceContext {
    options: Options,
    /// Every traced tid, threads included, mapped to its process state.
    proc_map: HashMap<pid_t, ProcStateSharedPtr>,
    /// One tid per process; tearing it down flushes the fd table.
    group_leaders: HashSet<pid_t>,
    storage: FileStorage,
}

fn proc_fd_path(pid: pid_t, fd: i32) -> String {
    format!("/proc/{}/fd/{}", pid, fd)
}

impl TraceContext {
    pub fn new(options: Options) -> TraceContext {
        let storage = FileStorage::new(options.report_size, options.store_empty);
        TraceContext {
            options,
            proc_map: HashMap::new(),
            group_leaders: HashSet::new(),
            storage,
        }
    }

    fn cmdline_limit(&self) -> Option<usize> {
        if self.options.cmdline_size < 0 {
            None
        } else {
            Some(self.options.cmdline_size as usize)
        }
    }

    fn new_proc_state(&self, pid: pid_t, ppid: pid_t) -> ProcStateSharedPtr {
        let info = ProcInfo::new(
            pid,
            ppid,
            command_name(pid),
            command_line(pid, self.cmdline_limit()),
        );
        Rc::new(RefCell::new(ProcState::new(info)))
    }

    fn get_proc_state(&self, pid: pid_t) -> Option<ProcStateSharedPtr> {
        let found = self.proc_map.get(&pid).cloned();
        debug_assert!(found.is_some(), "pid {} is not registered", pid);
        found
    }

    /// The root tracee. Its fd table starts out as a copy of ours since it
    /// inherited our descriptors across fork.
    pub fn register_tracee(&mut self, pid: pid_t) {
        debug_assert!(!self.proc_map.contains_key(&pid));
        let proc = self.new_proc_state(pid, 0);
        self.fill_fds(pid, &proc);
        self.proc_map.insert(pid, Rc::clone(&proc));
        self.group_leaders.insert(pid);
    }

    /// Seed the table with the regular files we have open ourselves: those
    /// are the descriptors the tracee inherited. Open flags come from
    /// F_GETFL; close-on-exec is an fd flag and is folded in from F_GETFD.
    fn fill_fds(&self, pid: pid_t, proc: &ProcStateSharedPtr) {
        let highest = match my_highest_fd() {
            Some(fd) => fd,
            None => return,
        };
        for fd in (0..=highest).rev() {
            let fd_flags = match fcntl(fd, FcntlArg::F_GETFD) {
                Ok(bits) => FdFlag::from_bits_truncate(bits),
                Err(_) => continue,
            };
            if !is_regular_file_fd(fd) {
                continue;
            }
            let mut flags = match fcntl(fd, FcntlArg::F_GETFL) {
                Ok(bits) => OFlag::from_bits_truncate(bits),
                Err(_) => continue,
            };
            if fd_flags.contains(FdFlag::FD_CLOEXEC) {
                flags |= OFlag::O_CLOEXEC;
            }
            let filename = match fs::read_link(proc_fd_path(pid, fd)) {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            proc.borrow_mut()
                .set(fd, Rc::new(RefCell::new(FileState::new(filename, flags))));
        }
    }

    /// A fork or vfork. The child starts with its own table, but each slot
    /// refers to the same open file description as the parent's, so the
    /// accounting state is shared, not copied.
    pub fn register_process(&mut self, parent: pid_t, child: pid_t) {
        debug_assert!(!self.proc_map.contains_key(&child));
        let pproc = match self.get_proc_state(parent) {
            Some(p) => p,
            None => return,
        };
        let newproc = self.new_proc_state(child, parent);
        {
            let pproc = pproc.borrow();
            let mut child_state = newproc.borrow_mut();
            for (fd, slot) in pproc.fds.iter().enumerate() {
                if let Some(file) = slot {
                    child_state.set(fd as i32, Rc::clone(file));
                }
            }
        }
        self.proc_map.insert(child, newproc);
        self.group_leaders.insert(child);
    }

    /// A new thread. Threads share the whole fd table.
    pub fn register_thread(&mut self, parent: pid_t, thread: pid_t) {
        debug_assert!(!self.proc_map.contains_key(&thread));
        if let Some(proc) = self.get_proc_state(parent) {
            self.proc_map.insert(thread, proc);
        }
    }

    /// An exec. Close-on-exec descriptors are gone, so they finalize now
    /// (unless another process still shares them). The rest survive the
    /// exec with their open file descriptions intact, so their accounting
    /// state carries over and nothing is reported for them at exec time.
    ///
    /// When a non-leader thread execs, its old tid (`former_tid`) vanishes
    /// without a flush; the kernel folds the thread into the leader's pid.
    pub fn register_exec(&mut self, pid: pid_t, former_tid: pid_t) {
        if former_tid != pid && self.proc_map.contains_key(&former_tid) {
            debug_assert!(!self.group_leaders.contains(&former_tid));
            self.proc_map.remove(&former_tid);
        }
        let oldproc = match self.get_proc_state(pid) {
            Some(p) => p,
            None => return,
        };
        let ppid = oldproc.borrow().proc_info.ppid;
        let newproc = self.new_proc_state(pid, ppid);
        {
            let oldproc = oldproc.borrow();
            let mut new_state = newproc.borrow_mut();
            for (fd, slot) in oldproc.fds.iter().enumerate() {
                if let Some(file) = slot {
                    if !file.borrow().is_cloexec_set() {
                        new_state.set(fd as i32, Rc::clone(file));
                    }
                }
            }
        }
        // Flushes the old table: only descriptors exec actually closed
        // (close-on-exec, last reference) produce entries.
        self.vanish_process(pid);
        self.proc_map.insert(pid, newproc);
        self.group_leaders.insert(pid);
    }

    pub fn register_core_dump(&mut self, pid: pid_t, term_sig: i32) {
        if !self.options.search_core_dumps {
            return;
        }
        let pinfo = match self.proc_map.get(&pid) {
            Some(proc) => Rc::clone(&proc.borrow().proc_info),
            None => return,
        };
        if let Some(filename) = locate_core_dump(pid, &pinfo.comm, term_sig) {
            log!(LogInfo, "found core dump {} for pid {}", filename, pid);
            let size = file_length(&filename);
            self.storage.add(OutputFile::new(filename, size, pinfo));
        }
    }

    /// A tid is gone. Group leaders flush their table; other threads just
    /// drop their reference.
    pub fn vanish_process(&mut self, pid: pid_t) {
        if self.group_leaders.remove(&pid) {
            if let Some(proc) = self.proc_map.get(&pid) {
                let proc = Rc::clone(proc);
                let pinfo = Rc::clone(&proc.borrow().proc_info);
                let nfds = proc.borrow().fds.len();
                for fd in 0..nfds as i32 {
                    if let Some(file) = proc.borrow_mut().take(fd) {
                        self.tear_down_fd(file, &pinfo);
                    }
                }
            }
        }
        let removed = self.proc_map.remove(&pid);
        debug_assert!(removed.is_some(), "pid {} vanished twice", pid);
    }

    /// Finalize only on the last reference: dup'd fds, threads and forked
    /// children may still be writing through this state.
    fn tear_down_fd(&mut self, file: FileStateSharedPtr, pinfo: &ProcInfoSharedPtr) {
        if Rc::strong_count(&file) == 1 {
            let file = file.borrow();
            self.storage.add(OutputFile::new(
                file.filename().to_owned(),
                file.output_size(),
                Rc::clone(pinfo),
            ));
        }
    }

    /// Syscall-entry hook. All accounting happens at exit; kept as the
    /// symmetric half of the interface.
    pub fn syscall_enter(&mut self, _pid: pid_t, _regs: &Registers) {}

    /// Apply the effect of a completed syscall to the caller's fd table.
    /// Failed syscalls are ignored, except close, which invalidates the fd
    /// even when it reports an error.
    pub fn syscall_exit(&mut self, pid: pid_t, regs: &Registers) {
        let ret = regs.syscall_result_signed();
        match regs.syscallno() {
            libc::SYS_write | libc::SYS_writev => {
                if ret > 0 {
                    self.op_write(pid, regs.arg1() as i32, ret as u64);
                }
            }
            libc::SYS_pwrite64 | libc::SYS_pwritev | libc::SYS_pwritev2 => {
                if ret > 0 {
                    self.op_pwrite(pid, regs.arg1() as i32, ret as u64, regs.arg4());
                }
            }
            #[cfg(target_arch = "x86_64")]
            libc::SYS_creat => {
                if ret >= 0 {
                    self.op_open_write_file(
                        pid,
                        ret as i32,
                        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                    );
                }
            }
            #[cfg(target_arch = "x86_64")]
            libc::SYS_open => {
                if ret >= 0 {
                    self.op_open_file(pid, ret as i32, OFlag::from_bits_truncate(regs.arg2() as i32));
                }
            }
            libc::SYS_openat => {
                if ret >= 0 {
                    self.op_open_file(pid, ret as i32, OFlag::from_bits_truncate(regs.arg3() as i32));
                }
            }
            libc::SYS_close => {
                self.op_close(pid, regs.arg1() as i32);
            }
            libc::SYS_fcntl => {
                if ret >= 0 {
                    self.op_fcntl(pid, regs, ret);
                }
            }
            libc::SYS_dup => {
                if ret >= 0 {
                    self.op_dup(pid, regs.arg1() as i32, ret as i32);
                }
            }
            #[cfg(target_arch = "x86_64")]
            libc::SYS_dup2 => {
                if ret >= 0 {
                    self.op_dup(pid, regs.arg1() as i32, regs.arg2() as i32);
                }
            }
            libc::SYS_dup3 => {
                if ret >= 0 {
                    self.op_dup3(
                        pid,
                        regs.arg1() as i32,
                        regs.arg2() as i32,
                        OFlag::from_bits_truncate(regs.arg3() as i32),
                    );
                }
            }
            libc::SYS_fallocate => {
                if ret >= 0 {
                    // offset + len
                    self.op_resize(pid, regs.arg1() as i32, regs.arg3() + regs.arg4());
                }
            }
            libc::SYS_ftruncate => {
                if ret >= 0 {
                    self.op_resize(pid, regs.arg1() as i32, regs.arg2());
                }
            }
            libc::SYS_lseek => {
                if ret >= 0 {
                    self.op_seek(pid, regs.arg1() as i32, ret as u64);
                }
            }
            _ => {}
        }
    }

    fn op_fcntl(&mut self, pid: pid_t, regs: &Registers, ret: i64) {
        let fd = regs.arg1() as i32;
        match regs.arg2() as i32 {
            libc::F_DUPFD => {
                self.op_dup(pid, fd, ret as i32);
            }
            libc::F_DUPFD_CLOEXEC => {
                self.op_dup3(pid, fd, ret as i32, OFlag::O_CLOEXEC);
            }
            libc::F_SETFL => {
                self.op_set_flags(pid, fd, OFlag::from_bits_truncate(regs.arg3() as i32));
            }
            libc::F_SETFD => {
                let cloexec = FdFlag::from_bits_truncate(regs.arg3() as i32)
                    .contains(FdFlag::FD_CLOEXEC);
                self.op_set_cloexec(pid, fd, cloexec);
            }
            _ => {}
        }
    }

    fn with_file<F: FnOnce(&mut FileState)>(&mut self, pid: pid_t, fd: i32, f: F) {
        if let Some(proc) = self.get_proc_state(pid) {
            let file = proc.borrow().get(fd);
            if let Some(file) = file {
                f(&mut file.borrow_mut());
            }
        }
    }

    fn op_write(&mut self, pid: pid_t, fd: i32, amount: u64) {
        self.with_file(pid, fd, |file| file.enroll(amount));
    }

    fn op_pwrite(&mut self, pid: pid_t, fd: i32, amount: u64, offset: u64) {
        self.with_file(pid, fd, |file| file.enroll_at(offset, amount));
    }

    fn op_open_file(&mut self, pid: pid_t, fd: i32, flags: OFlag) {
        if flags.intersects(OFlag::O_WRONLY | OFlag::O_RDWR) {
            self.op_open_write_file(pid, fd, flags);
        }
    }

    /// The fd's target name comes from the tracee's /proc entry; the
    /// tracee is stopped at syscall-exit so the link is stable.
    fn op_open_write_file(&mut self, pid: pid_t, fd: i32, flags: OFlag) {
        let proc = match self.get_proc_state(pid) {
            Some(p) => p,
            None => return,
        };
        let filename = match fs::read_link(proc_fd_path(pid, fd)) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                log!(LogDebug, "cannot resolve fd {} of pid {}: {}", fd, pid, e);
                return;
            }
        };
        proc.borrow_mut()
            .set(fd, Rc::new(RefCell::new(FileState::new(filename, flags))));
    }

    fn op_close(&mut self, pid: pid_t, fd: i32) {
        if let Some(proc) = self.get_proc_state(pid) {
            let taken = proc.borrow_mut().take(fd);
            if let Some(file) = taken {
                let pinfo = Rc::clone(&proc.borrow().proc_info);
                self.tear_down_fd(file, &pinfo);
            }
        }
    }

    /// dup/dup2 semantics: the previous occupant of newfd is closed, then
    /// newfd aliases oldfd's state. Duplicating an fd onto itself, or an
    /// untracked source, changes nothing.
    fn op_dup(&mut self, pid: pid_t, oldfd: i32, newfd: i32) -> bool {
        if oldfd == newfd {
            return false;
        }
        self.op_close(pid, newfd);
        let proc = match self.get_proc_state(pid) {
            Some(p) => p,
            None => return false,
        };
        let src = proc.borrow().get(oldfd);
        match src {
            Some(file) => {
                proc.borrow_mut().set(newfd, file);
                true
            }
            None => false,
        }
    }

    fn op_dup3(&mut self, pid: pid_t, oldfd: i32, newfd: i32, flags: OFlag) {
        if self.op_dup(pid, oldfd, newfd) {
            self.with_file(pid, newfd, |file| {
                file.set_cloexec(flags.contains(OFlag::O_CLOEXEC))
            });
        }
    }

    fn op_resize(&mut self, pid: pid_t, fd: i32, size: u64) {
        self.with_file(pid, fd, |file| file.resize(size));
    }

    fn op_seek(&mut self, pid: pid_t, fd: i32, pos: u64) {
        self.with_file(pid, fd, |file| file.seek(pos));
    }

    fn op_set_flags(&mut self, pid: pid_t, fd: i32, flags: OFlag) {
        self.with_file(pid, fd, |file| file.set_flags(flags));
    }

    fn op_set_cloexec(&mut self, pid: pid_t, fd: i32, cloexec: bool) {
        self.with_file(pid, fd, |file| file.set_cloexec(cloexec));
    }

    /// End of trace: drain every process still on the books, then render
    /// the report. Hands back the exit code unchanged.
    pub fn post_process(&mut self, exit_code: i32) -> i32 {
        while let Some(pid) = self.proc_map.keys().next().copied() {
            self.vanish_process(pid);
        }
        if self.options.report_size != 0 {
            print_report(&self.storage, &self.options);
        }
        exit_code
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_state::OutputFilePtr;

    // The ops resolve filenames through /proc/<pid>/fd, so the tests run
    // them against our own pid with real scratch files.
    fn own_pid() -> pid_t {
        std::process::id() as pid_t
    }

    fn test_context() -> TraceContext {
        let options = Options {
            report_size: -1,
            store_empty: false,
            ..Default::default()
        };
        TraceContext::new(options)
    }

    fn register_synthetic(ctx: &mut TraceContext, pid: pid_t, ppid: pid_t) {
        let info = ProcInfo::new(pid, ppid, "test".into(), "test prog".into());
        ctx.proc_map
            .insert(pid, Rc::new(RefCell::new(ProcState::new(info))));
        ctx.group_leaders.insert(pid);
    }

    fn tracked_file(ctx: &mut TraceContext, pid: pid_t, fd: i32, name: &str) {
        let state = FileState::with_baseline(name.into(), OFlag::O_WRONLY, 0);
        ctx.get_proc_state(pid)
            .unwrap()
            .borrow_mut()
            .set(fd, Rc::new(RefCell::new(state)));
    }

    fn results(ctx: &TraceContext) -> Vec<OutputFilePtr> {
        ctx.storage.largest_files()
    }

    fn scratch_file(tag: &str) -> (std::fs::File, String) {
        let path = std::env::temp_dir().join(format!(
            "wtrace-ctx-{}-{}",
            tag,
            std::process::id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (file, path.to_str().unwrap().to_owned())
    }

    fn exit_regs(nr: i64, ret: i64, args: &[u64]) -> Registers {
        let mut regs = Registers::default();
        regs.set_syscallno(nr);
        regs.set_syscall_result(ret);
        if let Some(v) = args.get(0) {
            regs.set_arg1(*v);
        }
        if let Some(v) = args.get(1) {
            regs.set_arg2(*v);
        }
        if let Some(v) = args.get(2) {
            regs.set_arg3(*v);
        }
        if let Some(v) = args.get(3) {
            regs.set_arg4(*v);
        }
        regs
    }

    #[test]
    fn open_write_close_produces_one_entry() {
        use std::os::unix::io::AsRawFd;
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);

        let (file, path) = scratch_file("owc");
        let fd = file.as_raw_fd() as u64;
        ctx.syscall_exit(
            pid,
            &exit_regs(libc::SYS_openat, fd as i64, &[0, 0, libc::O_WRONLY as u64]),
        );
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 100, &[fd]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_close, 0, &[fd]));

        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, 100);
        assert_eq!(out[0].filename, path);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn read_only_open_is_not_tracked() {
        use std::os::unix::io::AsRawFd;
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);

        let (file, path) = scratch_file("ro");
        let fd = file.as_raw_fd() as u64;
        ctx.syscall_exit(
            pid,
            &exit_regs(libc::SYS_openat, fd as i64, &[0, 0, libc::O_RDONLY as u64]),
        );
        assert!(ctx.get_proc_state(pid).unwrap().borrow().get(fd as i32).is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn writes_to_untracked_fds_are_ignored() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 4096, &[1]));
        ctx.vanish_process(pid);
        assert!(results(&ctx).is_empty());
    }

    #[test]
    fn pwrite_and_truncate_raise_the_mark() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 5, "/tmp/pw");

        ctx.syscall_exit(pid, &exit_regs(libc::SYS_pwrite64, 24, &[5, 0, 0, 1000]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_ftruncate, 0, &[5, 10]));
        ctx.vanish_process(pid);

        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, 1024);
    }

    #[test]
    fn fallocate_extends_by_offset_plus_len() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 5, "/tmp/fa");
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_fallocate, 0, &[5, 0, 4096, 4096]));
        ctx.vanish_process(pid);
        assert_eq!(results(&ctx)[0].size, 8192);
    }

    #[test]
    fn seek_then_write_overlaps_do_not_double_count() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 5, "/tmp/sk");
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 100, &[5]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_lseek, 0, &[5, 0]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 30, &[5]));
        ctx.vanish_process(pid);
        assert_eq!(results(&ctx)[0].size, 100);
    }

    #[test]
    fn fork_shares_state_and_finalizes_once() {
        let mut ctx = test_context();
        let parent = own_pid();
        register_synthetic(&mut ctx, parent, 1);
        tracked_file(&mut ctx, parent, 3, "/tmp/shared");

        let child = parent + 1;
        {
            let pproc = ctx.get_proc_state(parent).unwrap();
            let info = ProcInfo::new(child, parent, "test".into(), "test child".into());
            let newproc = Rc::new(RefCell::new(ProcState::new(info)));
            for (fd, slot) in pproc.borrow().fds.iter().enumerate() {
                if let Some(file) = slot {
                    newproc.borrow_mut().set(fd as i32, Rc::clone(file));
                }
            }
            ctx.proc_map.insert(child, newproc);
            ctx.group_leaders.insert(child);
        }

        ctx.syscall_exit(parent, &exit_regs(libc::SYS_write, 60, &[3]));
        ctx.syscall_exit(child, &exit_regs(libc::SYS_write, 40, &[3]));

        // Parent closes first: the child still holds a reference.
        ctx.syscall_exit(parent, &exit_regs(libc::SYS_close, 0, &[3]));
        assert!(results(&ctx).is_empty());

        ctx.syscall_exit(child, &exit_regs(libc::SYS_close, 0, &[3]));
        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, 100);
        assert_eq!(out[0].proc_info.pid, child);
    }

    #[test]
    fn threads_share_the_fd_table() {
        let mut ctx = test_context();
        let leader = own_pid();
        register_synthetic(&mut ctx, leader, 1);
        tracked_file(&mut ctx, leader, 3, "/tmp/threaded");
        let tid = leader + 1;
        ctx.register_thread(leader, tid);

        ctx.syscall_exit(tid, &exit_regs(libc::SYS_write, 70, &[3]));

        // A thread exiting does not flush the table.
        ctx.vanish_process(tid);
        assert!(results(&ctx).is_empty());

        ctx.vanish_process(leader);
        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, 70);
    }

    #[test]
    fn dup_onto_self_is_a_no_op() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 3, "/tmp/dupself");
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 10, &[3]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_dup3, 3, &[3, 3, 0]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 10, &[3]));
        ctx.vanish_process(pid);
        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, 20);
    }

    #[test]
    fn dup_closes_the_previous_occupant() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 3, "/tmp/dupsrc");
        tracked_file(&mut ctx, pid, 4, "/tmp/dupvictim");
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 33, &[4]));

        // dup3(3, 4, 0): the occupant of 4 finalizes, then 4 aliases 3.
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_dup3, 4, &[3, 4, 0]));
        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].filename, "/tmp/dupvictim");
        assert_eq!(out[0].size, 33);

        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 25, &[4]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 25, &[3]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_close, 0, &[3]));
        assert_eq!(results(&ctx).len(), 1);
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_close, 0, &[4]));
        let out = results(&ctx);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|f| f.filename == "/tmp/dupsrc" && f.size == 50));
    }

    #[test]
    fn dup_of_untracked_source_changes_nothing() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_dup3, 9, &[8, 9, 0]));
        assert!(ctx.get_proc_state(pid).unwrap().borrow().get(9).is_none());
    }

    #[test]
    fn fcntl_dupfd_aliases_and_cloexec_variant_marks() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 3, "/tmp/fcntl");
        ctx.syscall_exit(
            pid,
            &exit_regs(libc::SYS_fcntl, 10, &[3, libc::F_DUPFD_CLOEXEC as u64]),
        );
        let proc = ctx.get_proc_state(pid).unwrap();
        let aliased = proc.borrow().get(10).unwrap();
        assert!(aliased.borrow().is_cloexec_set());
        assert!(Rc::ptr_eq(&aliased, &proc.borrow().get(3).unwrap()));
    }

    #[test]
    fn exec_drops_cloexec_and_keeps_the_rest_accounting() {
        let mut ctx = test_context();
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 3, "/tmp/survives");
        tracked_file(&mut ctx, pid, 4, "/tmp/cloexec");
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 80, &[3]));
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 15, &[4]));
        ctx.op_set_cloexec(pid, 4, true);

        ctx.register_exec(pid, pid);

        // The close-on-exec descriptor finalized at exec.
        let out = results(&ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].filename, "/tmp/cloexec");
        assert_eq!(out[0].size, 15);

        // The survivor carried its accounting across the exec.
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 20, &[3]));
        ctx.vanish_process(pid);
        let out = results(&ctx);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|f| f.filename == "/tmp/survives" && f.size == 100));
    }

    #[test]
    fn exec_by_non_leader_vanishes_the_former_tid() {
        let mut ctx = test_context();
        let leader = own_pid();
        register_synthetic(&mut ctx, leader, 1);
        tracked_file(&mut ctx, leader, 3, "/tmp/nl");
        let tid = leader + 1;
        ctx.register_thread(leader, tid);
        ctx.syscall_exit(tid, &exit_regs(libc::SYS_write, 5, &[3]));

        ctx.register_exec(leader, tid);
        assert!(!ctx.proc_map.contains_key(&tid));
        assert!(ctx.proc_map.contains_key(&leader));
        // No flush happened for the former tid.
        assert!(results(&ctx).is_empty());
    }

    #[test]
    fn post_process_drains_and_keeps_the_exit_code() {
        let mut ctx = TraceContext::new(Options {
            report_size: 0,
            ..Default::default()
        });
        let pid = own_pid();
        register_synthetic(&mut ctx, pid, 1);
        tracked_file(&mut ctx, pid, 3, "/tmp/drain");
        ctx.syscall_exit(pid, &exit_regs(libc::SYS_write, 9, &[3]));
        assert_eq!(ctx.post_process(42), 42);
        assert!(ctx.proc_map.is_empty());
    }
}
