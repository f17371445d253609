//! The multi-CPU supervisor: owns the CPU set, the pending-IPI queues, per-CPU state, console
//! sinks, callback registries, and the magic-instruction protocol.
//!
//! Modeled as an explicit owned value rather than the original's process-wide static state (see
//! the REDESIGN FLAGS this crate implements): a process-wide flag only enforces "at most one
//! Domain exists", surfaced as a constructor error rather than a process abort, so the invariant
//! stays testable.

use crate::adapter::{CpuEvent, EmulatorAdapter, InterruptOutcome};
use crate::arch::x86_64::{CpuMode, CpuProt, IoAccess, InstType, MemAccess, RegAccess, Register, CR0_PE};
use crate::config::DomainConfig;
use crate::error::Error;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static DOMAIN_EXISTS: AtomicBool = AtomicBool::new(false);

type InstListener = Box<dyn FnMut(u16, u64, u64, u8, &[u8], InstType) + Send>;
type MemListener = Box<dyn FnMut(u16, u64, u64, u8, MemAccess) + Send>;
type IoListener = Box<dyn FnMut(u16, u16, u8, IoAccess, u32) + Send>;
type IntListener = Box<dyn FnMut(u16, u8) -> bool + Send>;
type AtomicListener = Box<dyn FnMut(u16) -> bool + Send>;
type MagicListener = Box<dyn FnMut(u16, u64) -> bool + Send>;
type RegListener = Box<dyn FnMut(u16, Register, u8, RegAccess) + Send>;
type MarkerListener = Box<dyn FnMut(u16) + Send>;

#[derive(Default)]
struct Listeners {
    inst: Vec<Option<InstListener>>,
    mem: Vec<Option<MemListener>>,
    io: Vec<Option<IoListener>>,
    int: Vec<Option<IntListener>>,
    atomic: Vec<Option<AtomicListener>>,
    magic: Vec<Option<MagicListener>>,
    reg: Vec<Option<RegListener>>,
    start: Vec<Option<MarkerListener>>,
    end: Vec<Option<MarkerListener>>,
}

/// Which per-kind listener slot a [`ListenerHandle`] refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ListenerKind {
    Inst,
    Mem,
    Io,
    Int,
    Atomic,
    Magic,
    Reg,
    Start,
    End,
}

/// A token returned by `set_*_cb`, used to unregister a specific listener later (e.g. when an
/// [`crate::queue::EventQueue`] is dropped).
#[derive(Clone, Copy, Debug)]
pub struct ListenerHandle {
    kind: ListenerKind,
    index: usize,
}

struct DomainInner<A: EmulatorAdapter> {
    n: u16,
    ram_size_mb: u32,
    cpus: Vec<Mutex<A>>,
    running: RwLock<Vec<bool>>,
    idle: RwLock<Vec<bool>>,
    tids: RwLock<Vec<u16>>,
    pending_ipis: Mutex<Vec<VecDeque<u8>>>,
    consoles: Mutex<Vec<Box<dyn Write + Send>>>,
    console_buf: Mutex<String>,
    waiting_for_eip: Mutex<Option<u16>>,
    listeners: Mutex<Listeners>,
    app_start_hook: Mutex<Option<MarkerListener>>,
    app_end_hook: Mutex<Option<MarkerListener>>,
    default_hlt_timer: bool,
}

impl<A: EmulatorAdapter> Drop for DomainInner<A> {
    fn drop(&mut self) {
        DOMAIN_EXISTS.store(false, Ordering::Release);
    }
}

/// The multi-CPU supervisor. Cheaply `Clone`-able (an `Arc` handle); every clone refers to the
/// same underlying CPUs and state, the way an [`crate::queue::EventQueue`] needs to reach back
/// into the Domain that owns its CPU.
pub struct Domain<A: EmulatorAdapter> {
    inner: Arc<DomainInner<A>>,
}

impl<A: EmulatorAdapter> Clone for Domain<A> {
    fn clone(&self) -> Self {
        Domain { inner: self.inner.clone() }
    }
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte)
}

impl<A: EmulatorAdapter> Domain<A> {
    /// Boots a fresh Domain: constructs the master CPU, loads the guest kernel into it, then
    /// constructs `n_cpus - 1` slaves sharing its RAM.
    pub fn new(config: DomainConfig) -> Result<Self, Error> {
        if DOMAIN_EXISTS.swap(true, Ordering::AcqRel) {
            return Err(Error::DomainAlreadyExists);
        }

        match Self::build_fresh(&config) {
            Ok(inner) => {
                tracing::debug!(n_cpus = config.n_cpus(), ram_mb = config.ram_size_mb(), "domain booted");
                Ok(Domain { inner: Arc::new(inner) })
            }
            Err(e) => {
                DOMAIN_EXISTS.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn build_fresh(config: &DomainConfig) -> Result<DomainInner<A>, Error> {
        let n = config.n_cpus;

        let (mut master, ram) = A::new_master(0, config.ram_size_mb, &config.library_path)?;
        master.load_kernel_image(&config.kernel_path)?;

        let mut cpus = vec![Mutex::new(master)];
        let mut running = vec![true];
        let mut idle = vec![true];
        let mut tids = vec![0u16];
        let mut pending_ipis = vec![VecDeque::new()];

        for id in 1..n {
            let slave = A::new_slave(id, config.ram_size_mb, &config.library_path, ram.clone())?;
            cpus.push(Mutex::new(slave));
            running.push(false);
            idle.push(true);
            tids.push(0);
            pending_ipis.push(VecDeque::new());
        }

        Ok(DomainInner {
            n,
            ram_size_mb: config.ram_size_mb,
            cpus,
            running: RwLock::new(running),
            idle: RwLock::new(idle),
            tids: RwLock::new(tids),
            pending_ipis: Mutex::new(pending_ipis),
            consoles: Mutex::new(Vec::new()),
            console_buf: Mutex::new(String::new()),
            waiting_for_eip: Mutex::new(None),
            listeners: Mutex::new(Listeners::default()),
            app_start_hook: Mutex::new(None),
            app_end_hook: Mutex::new(None),
            default_hlt_timer: config.hlt_timer,
        })
    }

    /// Restores a Domain from a checkpoint written by [`Domain::save_state`]. `config` supplies
    /// the library path and kernel path (the kernel path is unused on this path, since RAM is
    /// restored directly from the checkpoint). Injects a timer interrupt on return to kick
    /// scheduling, per the checkpoint restore contract.
    pub fn from_checkpoint(mut reader: impl Read, config: DomainConfig) -> Result<Self, Error> {
        if DOMAIN_EXISTS.swap(true, Ordering::AcqRel) {
            return Err(Error::DomainAlreadyExists);
        }

        match Self::build_from_checkpoint(&mut reader, &config) {
            Ok(inner) => {
                let domain = Domain { inner: Arc::new(inner) };
                domain.timer_interrupt();
                tracing::debug!("domain restored from checkpoint");
                Ok(domain)
            }
            Err(e) => {
                DOMAIN_EXISTS.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn build_from_checkpoint(reader: &mut impl Read, config: &DomainConfig) -> Result<DomainInner<A>, Error> {
        let mut hdr = [0u8; 4];
        reader.read_exact(&mut hdr)?;
        let n = u32::from_le_bytes(hdr) as u16;
        reader.read_exact(&mut hdr)?;
        let ram_mb = u32::from_le_bytes(hdr);

        let (mut master, ram) = A::new_master(0, ram_mb, &config.library_path)?;

        reader.read_exact(&mut ram.low_mem.lock())?;
        reader.read_exact(&mut ram.below_4g.lock())?;
        reader.read_exact(&mut ram.above_4g.lock())?;

        master.restore_registers(reader)?;

        let mut cpus = vec![Mutex::new(master)];
        let mut running = vec![true];
        let mut idle = vec![true];
        let mut tids = vec![0u16];
        let mut pending_ipis = vec![VecDeque::new()];

        for id in 1..n {
            let mut slave = A::new_slave(id, ram_mb, &config.library_path, ram.clone())?;
            slave.restore_registers(reader)?;
            cpus.push(Mutex::new(slave));
            // Pushed exactly once per slave (the original pushes `running` twice here, an
            // acknowledged bug producing an oversized vector; this implementation fixes it).
            running.push(true);
            idle.push(true);
            tids.push(0);
            pending_ipis.push(VecDeque::new());
        }

        Ok(DomainInner {
            n,
            ram_size_mb: ram_mb,
            cpus,
            running: RwLock::new(running),
            idle: RwLock::new(idle),
            tids: RwLock::new(tids),
            pending_ipis: Mutex::new(pending_ipis),
            consoles: Mutex::new(Vec::new()),
            console_buf: Mutex::new(String::new()),
            waiting_for_eip: Mutex::new(None),
            listeners: Mutex::new(Listeners::default()),
            app_start_hook: Mutex::new(None),
            app_end_hook: Mutex::new(None),
            default_hlt_timer: config.hlt_timer,
        })
    }

    /// Serializes this Domain's full state (RAM + per-CPU registers) to `writer`, in the format
    /// consumed by [`Domain::from_checkpoint`].
    pub fn save_state(&self, mut writer: impl Write) -> Result<(), Error> {
        writer.write_all(&(self.inner.n as u32).to_le_bytes())?;
        writer.write_all(&self.inner.ram_size_mb.to_le_bytes())?;

        let ram = self.inner.cpus[0].lock().ram().clone();
        writer.write_all(&ram.low_mem.lock())?;
        writer.write_all(&ram.below_4g.lock())?;
        writer.write_all(&ram.above_4g.lock())?;

        for i in 0..self.inner.n as usize {
            self.inner.cpus[i].lock().save_registers(&mut writer)?;
        }

        Ok(())
    }

    /// Number of CPUs in this Domain.
    pub fn n_cpus(&self) -> u16 {
        self.inner.n
    }

    pub fn ram_size_mb(&self) -> u32 {
        self.inner.ram_size_mb
    }

    /// Whether [`crate::queue::EventQueue`]s created against this Domain should default to
    /// intercepting HLT and raising a timer interrupt.
    pub fn default_hlt_timer(&self) -> bool {
        self.inner.default_hlt_timer
    }

    /// Steps CPU `i` by up to `n` instructions, first draining one pending IPI if present.
    pub fn run(&self, i: u16, n: u32) -> u32 {
        let idx = i as usize;

        let fv = self.inner.pending_ipis.lock()[idx].pop_front();
        if let Some(fv) = fv {
            let outcome = self.inner.cpus[idx].lock().interrupt(fv);
            match outcome {
                InterruptOutcome::Accepted | InterruptOutcome::Refused => {}
                InterruptOutcome::Preempted(rv) => {
                    if rv != 0xef && rv != 0x30 {
                        self.inner.pending_ipis.lock()[idx].push_back(rv);
                    }
                }
            }
        }

        if !self.inner.running.read()[idx] {
            return 0;
        }

        let (executed, events) = self.inner.cpus[idx].lock().run(n);

        for event in events {
            self.dispatch_event(i, event);
        }

        executed
    }

    fn dispatch_event(&self, cpu_id: u16, event: CpuEvent) {
        match event {
            CpuEvent::Instruction { vaddr, paddr, len, bytes, kind } => {
                self.inst_cb(cpu_id, vaddr, paddr, len, &bytes[..len as usize], kind);
            }
            CpuEvent::Memory { vaddr, paddr, size, access } => {
                self.mem_cb(cpu_id, vaddr, paddr, size, access);
            }
            CpuEvent::Io { port, size, access, data } => {
                self.io_cb(cpu_id, port, size, access, data);
            }
            CpuEvent::Interrupt { vec } => {
                self.int_cb(cpu_id, vec);
            }
            CpuEvent::Atomic => {
                self.atomic_cb(cpu_id);
            }
            CpuEvent::Magic { rax } => {
                self.magic_cb(cpu_id, rax);
            }
            CpuEvent::Reg { reg, size, access } => {
                self.reg_cb(cpu_id, reg, size, access);
            }
        }
    }

    /// Injects the timer interrupt. With more than one CPU and both CPU 0 and CPU 1 running, the
    /// multi-core APIC timer vector (0xEF) is delivered to every running CPU; otherwise the
    /// uniprocessor PIT tick (0x30) is delivered to CPU 0 alone.
    pub fn timer_interrupt(&self) {
        let multicore = {
            let running = self.inner.running.read();
            self.inner.n > 1 && running[0] && running.get(1).copied().unwrap_or(false)
        };

        if multicore {
            for i in 0..self.inner.n as usize {
                if self.inner.running.read()[i] {
                    self.inner.cpus[i].lock().interrupt(0xef);
                }
            }
        } else {
            self.inner.cpus[0].lock().interrupt(0x30);
        }
    }

    pub fn connect_console(&self, sink: Box<dyn Write + Send>) {
        self.inner.consoles.lock().push(sink);
    }

    pub fn get_tid(&self, i: u16) -> Option<u16> {
        if !self.inner.running.read()[i as usize] {
            return None;
        }
        Some(self.inner.tids.read()[i as usize])
    }

    pub fn get_mode(&self, i: u16) -> CpuMode {
        let cr0 = self.inner.cpus[i as usize].lock().get_reg(Register::Cr0);
        if cr0 & CR0_PE != 0 {
            CpuMode::Protected
        } else {
            CpuMode::Real
        }
    }

    pub fn get_prot(&self, i: u16) -> CpuProt {
        let cs = self.inner.cpus[i as usize].lock().get_reg(Register::Cs);
        if cs & 1 != 0 {
            CpuProt::User
        } else {
            CpuProt::Kernel
        }
    }

    pub fn is_idle(&self, i: u16) -> bool {
        self.inner.idle.read()[i as usize]
    }

    pub fn is_running(&self, i: u16) -> bool {
        self.inner.running.read()[i as usize]
    }

    pub fn set_app_start_hook(&self, hook: impl FnMut(u16) + Send + 'static) {
        *self.inner.app_start_hook.lock() = Some(Box::new(hook));
    }

    pub fn set_app_end_hook(&self, hook: impl FnMut(u16) + Send + 'static) {
        *self.inner.app_end_hook.lock() = Some(Box::new(hook));
    }

    pub fn set_inst_cb(&self, listener: impl FnMut(u16, u64, u64, u8, &[u8], InstType) + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.inst.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Inst, index: listeners.inst.len() - 1 }
    }

    pub fn set_mem_cb(&self, listener: impl FnMut(u16, u64, u64, u8, MemAccess) + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.mem.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Mem, index: listeners.mem.len() - 1 }
    }

    pub fn set_io_cb(&self, listener: impl FnMut(u16, u16, u8, IoAccess, u32) + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.io.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Io, index: listeners.io.len() - 1 }
    }

    pub fn set_int_cb(&self, listener: impl FnMut(u16, u8) -> bool + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.int.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Int, index: listeners.int.len() - 1 }
    }

    pub fn set_atomic_cb(&self, listener: impl FnMut(u16) -> bool + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.atomic.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Atomic, index: listeners.atomic.len() - 1 }
    }

    pub fn set_magic_cb(&self, listener: impl FnMut(u16, u64) -> bool + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.magic.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Magic, index: listeners.magic.len() - 1 }
    }

    pub fn set_reg_cb(&self, listener: impl FnMut(u16, Register, u8, RegAccess) + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.reg.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Reg, index: listeners.reg.len() - 1 }
    }

    pub fn set_start_cb(&self, listener: impl FnMut(u16) + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.start.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::Start, index: listeners.start.len() - 1 }
    }

    pub fn set_end_cb(&self, listener: impl FnMut(u16) + Send + 'static) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        listeners.end.push(Some(Box::new(listener)));
        ListenerHandle { kind: ListenerKind::End, index: listeners.end.len() - 1 }
    }

    /// Unregisters a previously installed listener. Used by [`crate::queue::EventQueue::drop`].
    pub fn remove_listener(&self, handle: ListenerHandle) {
        let mut listeners = self.inner.listeners.lock();
        match handle.kind {
            ListenerKind::Inst => listeners.inst[handle.index] = None,
            ListenerKind::Mem => listeners.mem[handle.index] = None,
            ListenerKind::Io => listeners.io[handle.index] = None,
            ListenerKind::Int => listeners.int[handle.index] = None,
            ListenerKind::Atomic => listeners.atomic[handle.index] = None,
            ListenerKind::Magic => listeners.magic[handle.index] = None,
            ListenerKind::Reg => listeners.reg[handle.index] = None,
            ListenerKind::Start => listeners.start[handle.index] = None,
            ListenerKind::End => listeners.end[handle.index] = None,
        }
    }

    fn inst_cb(&self, cpu_id: u16, vaddr: u64, paddr: u64, len: u8, bytes: &[u8], kind: InstType) {
        let mut listeners = self.inner.listeners.lock();
        for l in listeners.inst.iter_mut().flatten() {
            l(cpu_id, vaddr, paddr, len, bytes, kind);
        }
    }

    fn mem_cb(&self, cpu_id: u16, vaddr: u64, paddr: u64, size: u8, access: MemAccess) {
        let mut listeners = self.inner.listeners.lock();
        for l in listeners.mem.iter_mut().flatten() {
            l(cpu_id, vaddr, paddr, size, access);
        }
    }

    fn io_cb(&self, cpu_id: u16, port: u16, size: u8, access: IoAccess, data: u32) {
        let mut listeners = self.inner.listeners.lock();
        for l in listeners.io.iter_mut().flatten() {
            l(cpu_id, port, size, access, data);
        }
    }

    /// Fans `vec` out to every registered interrupt listener. Returns the logical OR of their
    /// results.
    pub fn int_cb(&self, cpu_id: u16, vec: u8) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let mut rval = false;
        for l in listeners.int.iter_mut().flatten() {
            if l(cpu_id, vec) {
                rval = true;
            }
        }
        rval
    }

    /// Fans an atomic-access notification out to every registered listener. Returns the logical
    /// OR of their results.
    pub fn atomic_cb(&self, cpu_id: u16) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let mut rval = false;
        for l in listeners.atomic.iter_mut().flatten() {
            if l(cpu_id) {
                rval = true;
            }
        }
        rval
    }

    fn reg_cb(&self, cpu_id: u16, reg: Register, size: u8, access: RegAccess) {
        let mut listeners = self.inner.listeners.lock();
        for l in listeners.reg.iter_mut().flatten() {
            l(cpu_id, reg, size, access);
        }
    }

    fn start_cb(&self, cpu_id: u16) {
        if let Some(hook) = self.inner.app_start_hook.lock().as_mut() {
            hook(cpu_id);
        }
        let mut listeners = self.inner.listeners.lock();
        for l in listeners.start.iter_mut().flatten() {
            l(cpu_id);
        }
    }

    fn end_cb(&self, cpu_id: u16) {
        if let Some(hook) = self.inner.app_end_hook.lock().as_mut() {
            hook(cpu_id);
        }
        let mut listeners = self.inner.listeners.lock();
        for l in listeners.end.iter_mut().flatten() {
            l(cpu_id);
        }
    }

    /// Runs the magic-instruction protocol for a CPUID executed with `rax` on CPU `cpu_id`. Every
    /// registered magic listener is invoked first (OR-combined into the return value); the
    /// Domain-wide bootstrap latch is then checked, and only if it is unset does `rax` fall
    /// through the pattern table. Exposed `pub` so tests and trace consumers can inject magic
    /// instructions directly, matching `EmulatorAdapter::run` producing [`CpuEvent::Magic`].
    pub fn magic_cb(&self, cpu_id: u16, rax: u64) -> bool {
        let mut rval = false;
        {
            let mut listeners = self.inner.listeners.lock();
            for l in listeners.magic.iter_mut().flatten() {
                if l(cpu_id, rax) {
                    rval = true;
                }
            }
        }

        {
            let mut waiting = self.inner.waiting_for_eip.lock();
            if let Some(j) = waiting.take() {
                self.inner.cpus[j as usize].lock().set_reg(Register::Cs, rax >> 4);
                self.inner.running.write()[j as usize] = true;
                tracing::trace!(target_cpu = j, "cpu bootstrap eip consumed");
                return rval;
            }
        }

        if (rax & 0xffff_0000) == 0xcd16_0000 {
            // "CD ignore" magic instruction.
            return rval;
        }

        if (rax & 0xffff_ff00) == 0xc501_e000 {
            let byte = (rax & 0xff) as u8;
            let mut buf = self.inner.console_buf.lock();
            if is_printable(byte) {
                buf.push(byte as char);
            }
            if byte == b'\n' {
                let line = format!("{}\n", buf);
                let mut consoles = self.inner.consoles.lock();
                for sink in consoles.iter_mut() {
                    let _ = sink.write_all(line.as_bytes());
                }
                buf.clear();
            }
        } else if rax == 0x1d1e_1d1e {
            self.inner.idle.write()[cpu_id as usize] = true;
        } else if (rax & 0xffff_0000) == 0xc75c_0000 {
            self.inner.idle.write()[cpu_id as usize] = false;
            self.inner.tids.write()[cpu_id as usize] = (rax & 0xffff) as u16;
        } else if (rax & 0xffff_0000) == 0xb007_0000 {
            *self.inner.waiting_for_eip.lock() = Some((rax & 0xffff) as u16);
        } else if (rax & 0xff00_0000) == 0x1d00_0000 {
            let target = ((rax & 0x00ff_ff00) >> 8) as u16;
            let vec = (rax & 0xff) as u8;
            let outcome = self.inner.cpus[target as usize].lock().interrupt(vec);
            if let InterruptOutcome::Preempted(v) = outcome {
                if v != 0xef && v != 0x30 {
                    self.inner.pending_ipis.lock()[target as usize].push_back(v);
                }
            }
        } else if rax == 0xc7c7_c7c7 {
            self.inner.cpus[cpu_id as usize].lock().set_reg(Register::Rax, self.inner.n as u64);
        } else if rax == 0x512e_512e {
            self.inner.cpus[cpu_id as usize].lock().set_reg(Register::Rax, self.inner.ram_size_mb as u64);
        } else if rax == 0xaaaa_aaaa {
            self.start_cb(cpu_id);
        } else if rax == 0xfa11_dead {
            self.end_cb(cpu_id);
            let mut running = self.inner.running.write();
            for r in running.iter_mut() {
                *r = false;
            }
        } else {
            let low = rax & 0xffff_fff0;
            if low != 0x0000_0000 && low != 0x8000_0000 && low != 0x4000_0000 {
                tracing::trace!(rax, "unknown magic cpuid ignored");
            }
        }

        rval
    }
}
