//! [`QemuCpu`] is the real [`EmulatorAdapter`] implementation: it dynamically loads
//! `./libqemu.so` (or whatever path the Domain was configured with) via [`libloading`] and
//! forwards every adapter operation to the symbols it resolves there.
//!
//! The emulator's callback signatures are plain `extern "C" fn` pointers with no context
//! parameter, so the trampolines installed with the library buffer events into a thread-local
//! scratch buffer for the duration of a `run` call, on the assumption that `run` blocks the
//! calling thread until the quantum completes and all of its callbacks have fired on that same
//! thread.

use crate::adapter::{CpuEvent, EmulatorAdapter, InterruptOutcome, RamDescriptor};
use crate::arch::x86_64::{IoAccess, InstType, MemAccess, RegAccess, Register};
use crate::error::Error;
use libloading::{Library, Symbol};
use std::cell::RefCell;
use std::io::Read;

thread_local! {
    static EVENT_BUF: RefCell<Vec<CpuEvent>> = RefCell::new(Vec::new());
}

fn push_event(event: CpuEvent) {
    EVENT_BUF.with(|buf| buf.borrow_mut().push(event));
}

/// Raw instruction callback installed with the emulator library.
extern "C" fn raw_inst_cb(_cpu_id: i32, vaddr: u64, paddr: u64, len: u8, bytes: *const u8, kind: i32) {
    let mut buf = [0u8; 15];
    let n = (len as usize).min(15);
    if !bytes.is_null() && n > 0 {
        unsafe { std::ptr::copy_nonoverlapping(bytes, buf.as_mut_ptr(), n) };
    }
    let kind = match kind {
        1 => InstType::Branch,
        2 => InstType::IoIn,
        3 => InstType::IoOut,
        _ => InstType::Regular,
    };
    push_event(CpuEvent::Instruction { vaddr, paddr, len, bytes: buf, kind });
}

extern "C" fn raw_mem_cb(_cpu_id: i32, vaddr: u64, paddr: u64, size: u8, kind: i32) {
    let access = if kind == 1 { MemAccess::Write } else { MemAccess::Read };
    push_event(CpuEvent::Memory { vaddr, paddr, size, access });
}

extern "C" fn raw_io_cb(_cpu_id: i32, port: u64, size: u8, kind: i32, data: u32) {
    let access = if kind == 1 { IoAccess::Out } else { IoAccess::In };
    push_event(CpuEvent::Io { port: port as u16, size, access, data });
}

extern "C" fn raw_int_cb(_cpu_id: i32, vec: u8) -> i32 {
    push_event(CpuEvent::Interrupt { vec });
    0
}

extern "C" fn raw_atomic_cb(_cpu_id: i32) -> i32 {
    push_event(CpuEvent::Atomic);
    0
}

extern "C" fn raw_magic_cb(_cpu_id: i32, rax: u64) -> i32 {
    push_event(CpuEvent::Magic { rax });
    0
}

extern "C" fn raw_reg_cb(_cpu_id: i32, reg: i32, size: u8, kind: i32) {
    let Some(reg) = reg_from_index(reg) else { return };
    let access = if kind == 1 { RegAccess::Write } else { RegAccess::Read };
    push_event(CpuEvent::Reg { reg, size, access });
}

/// The canonical register ordering used by `get_reg`/`set_reg` and by the checkpoint format
/// (`QSIM_N_REGS` registers, in this order).
const REG_ORDER: [Register; 28] = [
    Register::Rax,
    Register::Rbx,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
    Register::Rsp,
    Register::Rbp,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::Rip,
    Register::Rflags,
    Register::Cs,
    Register::Ds,
    Register::Es,
    Register::Fs,
    Register::Gs,
    Register::Ss,
    Register::Cr0,
    Register::Cr2,
    Register::Cr3,
    Register::Cr4,
];

/// Number of registers saved/restored per CPU by the checkpoint format (`QSIM_N_REGS`).
pub const QSIM_N_REGS: usize = REG_ORDER.len();

fn reg_index(reg: Register) -> i32 {
    REG_ORDER.iter().position(|r| *r == reg).unwrap() as i32
}

fn reg_from_index(idx: i32) -> Option<Register> {
    REG_ORDER.get(idx as usize).copied()
}

type QemuInitFn = unsafe extern "C" fn(*const std::ffi::c_void, *const std::ffi::c_char, i32);
type RunFn = unsafe extern "C" fn(i32, u32) -> u32;
type InterruptFn = unsafe extern "C" fn(i32, u8) -> i32;
type GetRegFn = unsafe extern "C" fn(i32, i32) -> u64;
type SetRegFn = unsafe extern "C" fn(i32, i32, u64);
type MemRdFn = unsafe extern "C" fn(i32, u64, *mut u8, usize);
type MemWrFn = unsafe extern "C" fn(i32, u64, *const u8, usize);
type SetInstCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32, u64, u64, u8, *const u8, i32));
type SetMemCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32, u64, u64, u8, i32));
type SetIoCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32, u64, u8, i32, u32));
type SetIntCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32, u8) -> i32);
type SetAtomicCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32) -> i32);
type SetMagicCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32, u64) -> i32);
type SetRegCbFn = unsafe extern "C" fn(i32, extern "C" fn(i32, i32, u8, i32));

/// The set of resolved symbols pulled from the emulator dynamic library, mirroring
/// `load_and_grab_pointers` in the original: one fixed symbol name per capability.
struct Symbols {
    _lib: Library,
    qemu_init: QemuInitFn,
    run: RunFn,
    interrupt: InterruptFn,
    get_reg: GetRegFn,
    set_reg: SetRegFn,
    mem_rd: MemRdFn,
    mem_wr: MemWrFn,
    mem_rd_virt: MemRdFn,
    mem_wr_virt: MemWrFn,
    set_inst_cb: SetInstCbFn,
    set_mem_cb: SetMemCbFn,
    set_io_cb: SetIoCbFn,
    set_int_cb: SetIntCbFn,
    set_atomic_cb: SetAtomicCbFn,
    set_magic_cb: SetMagicCbFn,
    set_reg_cb: SetRegCbFn,
}

macro_rules! sym {
    ($lib:expr, $name:literal) => {{
        let s: Symbol<_> = unsafe {
            $lib.get($name.as_bytes())
        }
        .map_err(|_| Error::MissingSymbol($name))?;
        *s
    }};
}

impl Symbols {
    fn load(library_path: &str) -> Result<Self, Error> {
        let lib = unsafe { Library::new(library_path) }.map_err(|source| Error::LibraryLoad {
            path: library_path.to_string(),
            source,
        })?;

        let qemu_init = sym!(lib, "qemu_init");
        let run = sym!(lib, "run");
        let interrupt = sym!(lib, "interrupt");
        let get_reg = sym!(lib, "get_reg");
        let set_reg = sym!(lib, "set_reg");
        let mem_rd = sym!(lib, "mem_rd");
        let mem_wr = sym!(lib, "mem_wr");
        let mem_rd_virt = sym!(lib, "mem_rd_virt");
        let mem_wr_virt = sym!(lib, "mem_wr_virt");
        let set_inst_cb = sym!(lib, "set_inst_cb");
        let set_mem_cb = sym!(lib, "set_mem_cb");
        let set_io_cb = sym!(lib, "set_io_cb");
        let set_int_cb = sym!(lib, "set_int_cb");
        let set_atomic_cb = sym!(lib, "set_atomic_cb");
        let set_magic_cb = sym!(lib, "set_magic_cb");
        let set_reg_cb = sym!(lib, "set_reg_cb");

        Ok(Symbols {
            _lib: lib,
            qemu_init,
            run,
            interrupt,
            get_reg,
            set_reg,
            mem_rd,
            mem_wr,
            mem_rd_virt,
            mem_wr_virt,
            set_inst_cb,
            set_mem_cb,
            set_io_cb,
            set_int_cb,
            set_atomic_cb,
            set_magic_cb,
            set_reg_cb,
        })
    }
}

/// A guest CPU backed by the dynamically loaded emulator library.
pub struct QemuCpu {
    id: u16,
    ram_size_mb: u32,
    ram: RamDescriptor,
    symbols: Symbols,
    /// The preferred load address recorded from the kernel header. Not used by this crate, kept
    /// for parity with the original loader.
    pref_address: u64,
}

impl QemuCpu {
    fn init(id: u16, ram_mb: u32, library_path: &str, ram: Option<RamDescriptor>) -> Result<Self, Error> {
        let symbols = Symbols::load(library_path)?;
        let ram = ram.unwrap_or_else(|| RamDescriptor::new(ram_mb));

        let size_str = format!("{ram_mb}M\0");
        unsafe {
            (symbols.qemu_init)(
                std::ptr::null(),
                size_str.as_ptr() as *const std::ffi::c_char,
                id as i32,
            );
        }

        let mut cpu = QemuCpu { id, ram_size_mb: ram_mb, ram, symbols, pref_address: 0 };

        if id == 0 {
            cpu.set_reg(Register::Rip, 0x0000);
            cpu.set_reg(Register::Cs, 0x1000);
            cpu.set_reg(Register::Ds, 0x1000 - 0x20);
            cpu.set_reg(Register::Rsp, 0x1000);
            cpu.set_reg(Register::Ss, 0x200);
        } else {
            cpu.set_reg(Register::Cs, 0x0000);
            cpu.set_reg(Register::Ds, 0x0000);
            cpu.set_reg(Register::Rip, 0x0000);
        }

        unsafe {
            (cpu.symbols.set_inst_cb)(id as i32, raw_inst_cb);
            (cpu.symbols.set_mem_cb)(id as i32, raw_mem_cb);
            (cpu.symbols.set_io_cb)(id as i32, raw_io_cb);
            (cpu.symbols.set_int_cb)(id as i32, raw_int_cb);
            (cpu.symbols.set_atomic_cb)(id as i32, raw_atomic_cb);
            (cpu.symbols.set_magic_cb)(id as i32, raw_magic_cb);
            (cpu.symbols.set_reg_cb)(id as i32, raw_reg_cb);
        }

        Ok(cpu)
    }

    /// Loads a Linux `bzImage` into this (master, freshly booted) CPU's RAM and seeds its boot
    /// registers. Byte offsets and copy lengths are as specified for the bzImage header: see
    /// `EXTERNAL INTERFACES` in this crate's design documentation.
    pub fn load_linux(&mut self, bzimage_path: &str) -> Result<(), Error> {
        let mut file = std::fs::File::open(bzimage_path).map_err(|source| Error::KernelLoad {
            path: bzimage_path.to_string(),
            source,
        })?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).map_err(|source| Error::KernelLoad {
            path: bzimage_path.to_string(),
            source,
        })?;

        let read_io_err = |source: std::io::Error| Error::KernelLoad {
            path: bzimage_path.to_string(),
            source,
        };
        if contents.len() < 0x260 {
            return Err(read_io_err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "kernel image too small to contain a bzImage header",
            )));
        }

        let setup_sects = contents[0x1f1] as usize;
        let syssize_16 = u32::from_le_bytes(contents[0x1f4..0x1f8].try_into().unwrap()) as usize;
        let pref_address = u64::from_le_bytes(contents[0x258..0x260].try_into().unwrap());
        self.pref_address = pref_address;

        let setup_len = setup_sects * 512 + 512;
        let syssize_len = syssize_16 * 16;
        let syssize_off = setup_len;

        {
            let mut low = self.ram.low_mem.lock();
            let dst_off = 0x10000 - 0x200;
            let n = setup_len.min(contents.len());
            low[dst_off..dst_off + n].copy_from_slice(&contents[0..n]);
        }
        {
            let mut below = self.ram.below_4g.lock();
            let n = syssize_len.min(contents.len().saturating_sub(syssize_off));
            below[0..n].copy_from_slice(&contents[syssize_off..syssize_off + n]);
        }

        self.set_reg(Register::Rip, 0x0000);
        self.set_reg(Register::Cs, 0x1000);
        self.set_reg(Register::Ds, 0x1000 - 0x20);
        self.set_reg(Register::Rsp, 0x1000);
        self.set_reg(Register::Ss, 0x200);

        Ok(())
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn ram_size_mb(&self) -> u32 {
        self.ram_size_mb
    }
}

impl EmulatorAdapter for QemuCpu {
    fn new_master(id: u16, ram_mb: u32, library_path: &str) -> Result<(Self, RamDescriptor), Error> {
        let cpu = Self::init(id, ram_mb, library_path, None)?;
        let ram = cpu.ram.clone();
        Ok((cpu, ram))
    }

    fn new_slave(id: u16, ram_mb: u32, library_path: &str, ram: RamDescriptor) -> Result<Self, Error> {
        Self::init(id, ram_mb, library_path, Some(ram))
    }

    fn run(&mut self, n: u32) -> (u32, Vec<CpuEvent>) {
        EVENT_BUF.with(|buf| buf.borrow_mut().clear());
        let executed = unsafe { (self.symbols.run)(self.id as i32, n) };
        let events = EVENT_BUF.with(|buf| std::mem::take(&mut *buf.borrow_mut()));
        (executed, events)
    }

    fn interrupt(&mut self, vec: u8) -> InterruptOutcome {
        let rv = unsafe { (self.symbols.interrupt)(self.id as i32, vec) };
        if rv == vec as i32 {
            InterruptOutcome::Accepted
        } else if rv == -1 {
            InterruptOutcome::Refused
        } else {
            InterruptOutcome::Preempted(rv as u8)
        }
    }

    fn get_reg(&self, reg: Register) -> u64 {
        unsafe { (self.symbols.get_reg)(self.id as i32, reg_index(reg)) }
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        unsafe { (self.symbols.set_reg)(self.id as i32, reg_index(reg), value) }
    }

    fn mem_rd(&self, paddr: u64, buf: &mut [u8]) {
        unsafe { (self.symbols.mem_rd)(self.id as i32, paddr, buf.as_mut_ptr(), buf.len()) }
    }

    fn mem_wr(&mut self, paddr: u64, buf: &[u8]) {
        unsafe { (self.symbols.mem_wr)(self.id as i32, paddr, buf.as_ptr(), buf.len()) }
    }

    fn mem_rd_virt(&self, vaddr: u64, buf: &mut [u8]) {
        unsafe { (self.symbols.mem_rd_virt)(self.id as i32, vaddr, buf.as_mut_ptr(), buf.len()) }
    }

    fn mem_wr_virt(&mut self, vaddr: u64, buf: &[u8]) {
        unsafe { (self.symbols.mem_wr_virt)(self.id as i32, vaddr, buf.as_ptr(), buf.len()) }
    }

    fn ram(&self) -> &RamDescriptor {
        &self.ram
    }

    fn load_kernel_image(&mut self, path: &str) -> Result<(), Error> {
        self.load_linux(path)
    }

    fn register_order() -> &'static [Register] {
        &REG_ORDER
    }
}
