//! Kernel constants and structs the libc crate does not export.

#![allow(non_camel_case_types)]

// Classic BPF opcode classes and fields, from linux/bpf_common.h.
pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

// From linux/seccomp.h.
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;

/// The data the kernel hands to a seccomp filter program.
#[repr(C)]
pub struct seccomp_data {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// Regset selector for PTRACE_GETREGSET/SETREGSET, from elf.h.
#[cfg(target_arch = "aarch64")]
pub const NT_PRSTATUS: libc::c_uint = 1;
