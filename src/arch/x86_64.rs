//! Register enumeration and control-bit constants for the x86-64 guest architecture exposed by
//! the emulator adapter.
//!
//! The set of registers is intentionally flat (one [`Register`] variant per architectural
//! register) rather than split across GPR/segment/MSR accessor traits, because the adapter
//! contract only ever gets or sets a single register at a time (see [`crate::adapter`]).

/// A register of the guest x86-64 architecture that the emulator adapter can read or write.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

/// Protected Mode Enable.
pub const CR0_PE: u64 = 1 << 0;
/// Monitor Co-Processor.
pub const CR0_MP: u64 = 1 << 1;
/// Emulation.
pub const CR0_EM: u64 = 1 << 2;
/// Task Switched.
pub const CR0_TS: u64 = 1 << 3;
/// Extension Type.
pub const CR0_ET: u64 = 1 << 4;
/// Numeric Error.
pub const CR0_NE: u64 = 1 << 5;
/// Write Protect.
pub const CR0_WP: u64 = 1 << 16;
/// Alignment Mask.
pub const CR0_AM: u64 = 1 << 18;
/// Not write-through.
pub const CR0_NW: u64 = 1 << 29;
/// Cache Disable.
pub const CR0_CD: u64 = 1 << 30;
/// Paging.
pub const CR0_PG: u64 = 1 << 31;

/// Virtual 8086 Mode Extension.
pub const CR4_VME: u64 = 1 << 0;
/// Protected Mode Virtual Interrupts.
pub const CR4_PVI: u64 = 1 << 1;
/// Page Size Extension.
pub const CR4_PSE: u64 = 1 << 4;
/// Physical Address Extension.
pub const CR4_PAE: u64 = 1 << 5;
/// Page Global Enable.
pub const CR4_PGE: u64 = 1 << 7;

/// The real-mode/protected-mode addressing mode of a CPU, derived from `CR0.PE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuMode {
    /// `CR0.PE` is clear.
    Real,
    /// `CR0.PE` is set.
    Protected,
}

/// The protection level a CPU is currently executing at, derived from `CS`'s RPL bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuProt {
    Kernel,
    User,
}

/// The kind of an instruction sample delivered through the instruction callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstType {
    Regular,
    Branch,
    IoIn,
    IoOut,
}

/// The kind of a memory access sample delivered through the memory callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemAccess {
    Read,
    Write,
}

/// The kind of access an I/O callback reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoAccess {
    In,
    Out,
}

/// Whether a register callback reports a read or a write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegAccess {
    Read,
    Write,
}
