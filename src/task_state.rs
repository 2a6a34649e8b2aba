//! Per-task bookkeeping: which process a tid belongs to, which file each
//! fd refers to, and how far into each file the task has written.
//!
//! `FileState` is shared: threads share the whole fd table, and fds
//! duplicated with dup or inherited across fork refer to the same open
//! file description, so they point at the same `FileState`. A file's
//! written range is finalized when the last reference to its state goes
//! away.

use crate::util::file_length;
use libc::pid_t;
use nix::fcntl::OFlag;
use std::cell::RefCell;
use std::cmp::max;
use std::rc::Rc;

pub type ProcInfoSharedPtr = Rc<ProcInfo>;
pub type FileStateSharedPtr = Rc<RefCell<FileState>>;
pub type ProcStateSharedPtr = Rc<RefCell<ProcState>>;
pub type OutputFilePtr = Rc<OutputFile>;

/// Identity of a traced process. Immutable once captured; threads of the
/// same process share one instance.
pub struct ProcInfo {
    pub pid: pid_t,
    pub ppid: pid_t,
    pub comm: String,
    pub cmdline: String,
}

impl ProcInfo {
    pub fn new(pid: pid_t, ppid: pid_t, comm: String, cmdline: String) -> ProcInfoSharedPtr {
        Rc::new(ProcInfo {
            pid,
            ppid,
            comm,
            cmdline,
        })
    }
}

/// Write-tracking state for one open file description.
pub struct FileState {
    filename: String,
    flags: OFlag,
    /// Where the next positional write would land, as far as we know.
    curr_pos: u64,
    /// High-water mark of positions written through this description.
    max_pos: u64,
    /// File size at the time this description was opened. Bytes below the
    /// baseline were not written by the tracee and are never reported.
    init_size: u64,
}

impl FileState {
    /// Capture state for a file the tracee just opened (or that it already
    /// had open when tracing started). Stats the file for the baseline;
    /// O_TRUNC has already emptied the file by the time we look.
    pub fn new(filename: String, flags: OFlag) -> FileState {
        let init_size = file_length(&filename);
        let curr_pos = if flags.contains(OFlag::O_APPEND) {
            init_size
        } else {
            0
        };
        FileState {
            filename,
            flags,
            curr_pos,
            max_pos: curr_pos,
            init_size,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// A write of `amount` bytes at the current position.
    pub fn enroll(&mut self, amount: u64) {
        self.curr_pos += amount;
        self.max_pos = max(self.max_pos, self.curr_pos);
    }

    /// A positional write (pwrite family): extends the high-water mark
    /// without moving the file offset.
    pub fn enroll_at(&mut self, pos: u64, amount: u64) {
        self.max_pos = max(self.max_pos, pos + amount);
    }

    /// lseek result: the file offset moved.
    pub fn seek(&mut self, pos: u64) {
        self.curr_pos = pos;
    }

    /// ftruncate/fallocate grew (or shrank) the file to `size`. Written
    /// bytes are never un-counted, so only growth registers.
    pub fn resize(&mut self, size: u64) {
        self.max_pos = max(self.max_pos, size);
    }

    /// Bytes this description caused to be written beyond what the file
    /// already contained.
    pub fn output_size(&self) -> u64 {
        self.max_pos.saturating_sub(self.init_size)
    }

    pub fn is_append_set(&self) -> bool {
        self.flags.contains(OFlag::O_APPEND)
    }

    pub fn is_cloexec_set(&self) -> bool {
        self.flags.contains(OFlag::O_CLOEXEC)
    }

    /// F_SETFL replaces the file status flags. Access mode and creation
    /// flags are ignored by the kernel on F_SETFL, but keeping the whole
    /// word is harmless: only O_APPEND matters to the accounting and that
    /// one the kernel does honor.
    pub fn set_flags(&mut self, flags: OFlag) {
        let cloexec = self.flags & OFlag::O_CLOEXEC;
        self.flags = flags | cloexec;
        if self.flags.contains(OFlag::O_APPEND) {
            self.curr_pos = max(self.curr_pos, self.init_size);
        }
    }

    /// F_SETFD: close-on-exec is an fd flag, tracked here folded into the
    /// open flags since it decides survival across exec.
    pub fn set_cloexec(&mut self, cloexec: bool) {
        if cloexec {
            self.flags |= OFlag::O_CLOEXEC;
        } else {
            self.flags &= !OFlag::O_CLOEXEC;
        }
    }

    #[cfg(test)]
    pub fn with_baseline(filename: String, flags: OFlag, init_size: u64) -> FileState {
        let curr_pos = if flags.contains(OFlag::O_APPEND) {
            init_size
        } else {
            0
        };
        FileState {
            filename,
            flags,
            curr_pos,
            max_pos: curr_pos,
            init_size,
        }
    }
}

/// The fd table and identity of one process, shared by all its threads.
pub struct ProcState {
    pub fds: Vec<Option<FileStateSharedPtr>>,
    pub proc_info: ProcInfoSharedPtr,
}

impl ProcState {
    pub fn new(proc_info: ProcInfoSharedPtr) -> ProcState {
        ProcState {
            fds: Vec::new(),
            proc_info,
        }
    }

    pub fn get(&self, fd: i32) -> Option<FileStateSharedPtr> {
        if fd < 0 {
            return None;
        }
        self.fds.get(fd as usize).cloned().flatten()
    }

    pub fn set(&mut self, fd: i32, state: FileStateSharedPtr) {
        debug_assert!(fd >= 0);
        let fd = fd as usize;
        if fd >= self.fds.len() {
            self.fds.resize(fd + 1, None);
        }
        self.fds[fd] = Some(state);
    }

    /// Remove the slot's occupant, if any, and hand it back.
    pub fn take(&mut self, fd: i32) -> Option<FileStateSharedPtr> {
        if fd < 0 {
            return None;
        }
        self.fds.get_mut(fd as usize).and_then(Option::take)
    }
}

/// A finalized accounting entry: a file the traced tree wrote to, with the
/// number of bytes one description caused to be written.
pub struct OutputFile {
    pub filename: String,
    pub size: u64,
    pub proc_info: ProcInfoSharedPtr,
}

impl OutputFile {
    pub fn new(filename: String, size: u64, proc_info: ProcInfoSharedPtr) -> OutputFilePtr {
        Rc::new(OutputFile {
            filename,
            size,
            proc_info,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh(flags: OFlag, baseline: u64) -> FileState {
        FileState::with_baseline("/tmp/out".into(), flags, baseline)
    }

    #[test]
    fn sequential_writes_accumulate() {
        let mut f = fresh(OFlag::O_WRONLY, 0);
        f.enroll(60);
        f.enroll(40);
        assert_eq!(f.output_size(), 100);
    }

    #[test]
    fn rewriting_old_bytes_adds_nothing() {
        let mut f = fresh(OFlag::O_WRONLY, 0);
        f.enroll(100);
        f.seek(0);
        f.enroll(30);
        assert_eq!(f.output_size(), 100);
    }

    #[test]
    fn baseline_is_subtracted() {
        let mut f = fresh(OFlag::O_WRONLY | OFlag::O_APPEND, 500);
        f.enroll(100);
        assert_eq!(f.output_size(), 100);
    }

    #[test]
    fn writes_below_baseline_report_zero() {
        let mut f = fresh(OFlag::O_WRONLY, 500);
        f.enroll(100);
        assert_eq!(f.output_size(), 0);
    }

    #[test]
    fn positional_write_does_not_move_offset() {
        let mut f = fresh(OFlag::O_WRONLY, 0);
        f.enroll(10);
        f.enroll_at(1000, 24);
        assert_eq!(f.output_size(), 1024);
        f.enroll(5);
        // The offset was still 10, so this only reached 15.
        assert_eq!(f.output_size(), 1024);
    }

    #[test]
    fn truncate_growth_counts_shrink_does_not() {
        let mut f = fresh(OFlag::O_WRONLY, 0);
        f.enroll(100);
        f.resize(10);
        assert_eq!(f.output_size(), 100);
        f.resize(4096);
        assert_eq!(f.output_size(), 4096);
    }

    #[test]
    fn setfl_preserves_cloexec() {
        let mut f = fresh(OFlag::O_WRONLY | OFlag::O_CLOEXEC, 0);
        f.set_flags(OFlag::O_WRONLY | OFlag::O_APPEND);
        assert!(f.is_cloexec_set());
        assert!(f.is_append_set());
        f.set_cloexec(false);
        assert!(!f.is_cloexec_set());
        assert!(f.is_append_set());
    }

    #[test]
    fn append_after_setfl_moves_offset_to_baseline() {
        let mut f = fresh(OFlag::O_WRONLY, 200);
        f.set_flags(OFlag::O_WRONLY | OFlag::O_APPEND);
        f.enroll(50);
        assert_eq!(f.output_size(), 50);
    }

    #[test]
    fn fd_table_grows_and_shares() {
        let info = ProcInfo::new(100, 1, "prog".into(), "prog".into());
        let mut ps = ProcState::new(info);
        let file = Rc::new(RefCell::new(fresh(OFlag::O_WRONLY, 0)));
        ps.set(7, Rc::clone(&file));
        ps.set(3, Rc::clone(&file));
        assert_eq!(Rc::strong_count(&file), 3);
        ps.get(7).unwrap().borrow_mut().enroll(64);
        assert_eq!(ps.get(3).unwrap().borrow().output_size(), 64);
        assert!(ps.get(5).is_none());
        assert!(ps.get(-1).is_none());
        let taken = ps.take(7).unwrap();
        assert_eq!(Rc::strong_count(&taken), 2);
        assert!(ps.get(7).is_none());
    }
}
