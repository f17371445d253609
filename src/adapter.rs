//! The [`EmulatorAdapter`] trait is the uniform handle to the external emulator: one adapter
//! instance exists per guest CPU, and sibling adapters share a [`RamDescriptor`].

use crate::arch::x86_64::{IoAccess, InstType, MemAccess, RegAccess, Register};
use crate::error::Error;
use std::sync::Arc;

/// Three contiguous byte regions backing a Domain's guest-physical RAM: low memory, the region
/// below 4 GiB, and the region above 4 GiB. Exactly one descriptor exists per Domain; all CPUs in
/// that Domain share it.
#[derive(Clone)]
pub struct RamDescriptor {
    pub(crate) low_mem: Arc<spin::Mutex<Vec<u8>>>,
    pub(crate) below_4g: Arc<spin::Mutex<Vec<u8>>>,
    pub(crate) above_4g: Arc<spin::Mutex<Vec<u8>>>,
}

impl RamDescriptor {
    /// Allocates a fresh, zeroed descriptor sized for `ram_mb` mebibytes of guest RAM.
    ///
    /// Mirrors the original layout: a small low-memory region for real-mode boot code, the bulk of
    /// RAM below 4 GiB, and whatever remains above it.
    pub fn new(ram_mb: u32) -> Self {
        let total = ram_mb as usize * 1024 * 1024;
        let low_mem_sz = 0x20000; // 128 KiB of low memory, enough for the real-mode boot sector.
        let below_4g_sz = total.saturating_sub(low_mem_sz);

        RamDescriptor {
            low_mem: Arc::new(spin::Mutex::new(vec![0u8; low_mem_sz])),
            below_4g: Arc::new(spin::Mutex::new(vec![0u8; below_4g_sz])),
            above_4g: Arc::new(spin::Mutex::new(Vec::new())),
        }
    }

    pub fn low_mem_len(&self) -> usize {
        self.low_mem.lock().len()
    }

    pub fn below_4g_len(&self) -> usize {
        self.below_4g.lock().len()
    }

    pub fn above_4g_len(&self) -> usize {
        self.above_4g.lock().len()
    }
}

/// The outcome of requesting injection of an interrupt vector into a CPU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptOutcome {
    /// The requested vector was accepted.
    Accepted,
    /// The emulator refused the interrupt outright.
    Refused,
    /// The emulator preempted the request with a higher-priority vector that the caller must
    /// re-queue.
    Preempted(u8),
}

/// A single typed event produced by the guest CPU during a `run` quantum, in guest execution
/// order. This is the Rust-side translation of the emulator's raw C callbacks (instruction,
/// memory, I/O, register, interrupt, atomic, magic) into an ordered, owned batch that the Domain
/// fans out to its listeners after the quantum completes.
#[derive(Clone, Debug)]
pub enum CpuEvent {
    Instruction {
        vaddr: u64,
        paddr: u64,
        len: u8,
        bytes: [u8; 15],
        kind: InstType,
    },
    Memory {
        vaddr: u64,
        paddr: u64,
        size: u8,
        access: MemAccess,
    },
    Io {
        port: u16,
        size: u8,
        access: IoAccess,
        data: u32,
    },
    Interrupt {
        vec: u8,
    },
    Atomic,
    Magic {
        rax: u64,
    },
    Reg {
        reg: Register,
        size: u8,
        access: RegAccess,
    },
}

/// Uniform handle to the dynamically loaded emulator, one per guest CPU.
///
/// Implementors are responsible for the actual instruction execution (an explicit non-goal of
/// this crate, per the purpose and scope); this crate only needs to drive `run`/`interrupt` and
/// observe the resulting events.
pub trait EmulatorAdapter: Sized {
    /// Constructs the master CPU (id 0), allocating a fresh [`RamDescriptor`] of `ram_mb`
    /// mebibytes.
    fn new_master(id: u16, ram_mb: u32, library_path: &str) -> Result<(Self, RamDescriptor), Error>;

    /// Constructs a slave CPU sharing `ram` with the master.
    fn new_slave(id: u16, ram_mb: u32, library_path: &str, ram: RamDescriptor) -> Result<Self, Error>;

    /// Executes up to `n` guest instructions. Returns the number actually executed (0 if halted)
    /// and the ordered batch of events raised during the quantum.
    fn run(&mut self, n: u32) -> (u32, Vec<CpuEvent>);

    /// Requests injection of interrupt vector `vec`.
    fn interrupt(&mut self, vec: u8) -> InterruptOutcome;

    fn get_reg(&self, reg: Register) -> u64;
    fn set_reg(&mut self, reg: Register, value: u64);

    fn mem_rd(&self, paddr: u64, buf: &mut [u8]);
    fn mem_wr(&mut self, paddr: u64, buf: &[u8]);
    fn mem_rd_virt(&self, vaddr: u64, buf: &mut [u8]);
    fn mem_wr_virt(&mut self, vaddr: u64, buf: &[u8]);

    /// The RAM descriptor this CPU's adapter is bound to.
    fn ram(&self) -> &RamDescriptor;

    /// Loads a guest kernel image into this (master, freshly booted) CPU and seeds its boot
    /// registers. Only ever called for CPU 0 of a fresh (non-restored) Domain.
    fn load_kernel_image(&mut self, path: &str) -> Result<(), Error>;

    /// The fixed register enumeration saved/restored by a checkpoint, in canonical order
    /// (`QSIM_N_REGS` registers).
    fn register_order() -> &'static [Register];

    /// Serializes this CPU's registers in [`EmulatorAdapter::register_order`] order.
    fn save_registers(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for reg in Self::register_order() {
            out.write_all(&self.get_reg(*reg).to_le_bytes())?;
        }
        Ok(())
    }

    /// Restores this CPU's registers, previously written by [`EmulatorAdapter::save_registers`].
    fn restore_registers(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        for reg in Self::register_order() {
            let mut buf = [0u8; 8];
            input.read_exact(&mut buf)?;
            self.set_reg(*reg, u64::from_le_bytes(buf));
        }
        Ok(())
    }
}
