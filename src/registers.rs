//! Named accessors over the tracee's general register set. The syscall
//! calling convention differs per architecture, so every consumer goes
//! through these instead of poking at `user_regs_struct` fields.
//!
//! On aarch64, x0 carries both the first syscall argument and, by
//! syscall-exit, the return value. The tracer therefore copies x0 into the
//! scratch register x9 at syscall-entry (`preserve_arg1`); `arg1()` reads
//! the preserved slot so it stays valid at exit and at ptrace events that
//! fire mid-syscall (clone/fork). On x86_64 the argument registers survive
//! the syscall, so `arg1()` reads rdi directly and no preservation happens.

use std::mem::MaybeUninit;

#[derive(Copy, Clone)]
pub struct Registers {
    regs: libc::user_regs_struct,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            regs: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }
}

impl Registers {
    pub fn raw_mut(&mut self) -> &mut libc::user_regs_struct {
        &mut self.regs
    }
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    pub fn syscallno(&self) -> i64 {
        self.regs.orig_rax as i64
    }

    pub fn syscall_result(&self) -> u64 {
        self.regs.rax
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.regs.rax as i64
    }

    pub fn arg1(&self) -> u64 {
        self.regs.rdi
    }

    /// First argument straight from the convention register. Valid at any
    /// stop where the syscall has not completed yet (ptrace event stops).
    pub fn arg1_raw(&self) -> u64 {
        self.regs.rdi
    }

    pub fn arg2(&self) -> u64 {
        self.regs.rsi
    }

    pub fn arg3(&self) -> u64 {
        self.regs.rdx
    }

    pub fn arg4(&self) -> u64 {
        self.regs.r10
    }

    /// Whether the register set was modified and must be written back to
    /// the tracee before resuming. A no-op on this architecture.
    pub fn preserve_arg1(&mut self) -> bool {
        false
    }

    pub fn set_syscallno(&mut self, syscallno: i64) {
        self.regs.orig_rax = syscallno as u64;
    }

    pub fn set_syscall_result(&mut self, result: i64) {
        self.regs.rax = result as u64;
    }

    pub fn set_arg1(&mut self, val: u64) {
        self.regs.rdi = val;
    }

    pub fn set_arg2(&mut self, val: u64) {
        self.regs.rsi = val;
    }

    pub fn set_arg3(&mut self, val: u64) {
        self.regs.rdx = val;
    }

    pub fn set_arg4(&mut self, val: u64) {
        self.regs.r10 = val;
    }
}

#[cfg(target_arch = "aarch64")]
impl Registers {
    pub fn syscallno(&self) -> i64 {
        self.regs.regs[8] as i64
    }

    pub fn syscall_result(&self) -> u64 {
        self.regs.regs[0]
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.regs.regs[0] as i64
    }

    /// Reads the slot preserved by `preserve_arg1`, not x0: by the time the
    /// effects interpreter runs, x0 already holds the return value.
    pub fn arg1(&self) -> u64 {
        self.regs.regs[9]
    }

    /// First argument straight from x0. Valid at any stop where the
    /// syscall has not completed yet (ptrace event stops), which is the
    /// only place x0 still holds the argument rather than the result.
    pub fn arg1_raw(&self) -> u64 {
        self.regs.regs[0]
    }

    pub fn arg2(&self) -> u64 {
        self.regs.regs[1]
    }

    pub fn arg3(&self) -> u64 {
        self.regs.regs[2]
    }

    pub fn arg4(&self) -> u64 {
        self.regs.regs[3]
    }

    /// Copy x0 into the scratch register x9 so the first argument survives
    /// until syscall-exit. Returns true: the tracee's registers must be
    /// replaced before resuming.
    pub fn preserve_arg1(&mut self) -> bool {
        self.regs.regs[9] = self.regs.regs[0];
        true
    }

    pub fn set_syscallno(&mut self, syscallno: i64) {
        self.regs.regs[8] = syscallno as u64;
    }

    pub fn set_syscall_result(&mut self, result: i64) {
        self.regs.regs[0] = result as u64;
    }

    pub fn set_arg1(&mut self, val: u64) {
        self.regs.regs[9] = val;
    }

    pub fn set_arg2(&mut self, val: u64) {
        self.regs.regs[1] = val;
    }

    pub fn set_arg3(&mut self, val: u64) {
        self.regs.regs[2] = val;
    }

    pub fn set_arg4(&mut self, val: u64) {
        self.regs.regs[3] = val;
    }
}
