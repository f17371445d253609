//! A scriptable [`EmulatorAdapter`] used in place of a real dynamically loaded emulator library.
//!
//! Each fake CPU's guest state lives in a process-wide registry keyed by the `library_path`
//! string passed to [`DomainConfig`], so a test can build the [`FakeWorld`] it wants to drive,
//! register it under a unique name, and hand that name to `Domain::new` as if it were a path to a
//! shared library.

use qsim_rs::{CpuEvent, DomainConfig, EmulatorAdapter, Error, InterruptOutcome, RamDescriptor};
use qsim_rs::arch::x86_64::Register;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

#[allow(dead_code)]
pub const REG_ORDER: [Register; 4] = [Register::Rax, Register::Rip, Register::Cs, Register::Cr0];

/// `Domain::new`/`Domain::from_checkpoint` enforce a process-wide "only one Domain" invariant;
/// since `cargo test` runs a binary's `#[test]` functions concurrently, every test that
/// constructs a `Domain` must hold this lock for its duration or they will spuriously race each
/// other through that invariant.
#[allow(dead_code)]
pub fn serialize_domain_tests() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeCpuState {
    regs: HashMap<Register, u64>,
    pending_events: VecDeque<CpuEvent>,
    interrupt_script: VecDeque<InterruptOutcome>,
    interrupt_log: Vec<u8>,
}

impl FakeCpuState {
    fn new() -> Self {
        FakeCpuState {
            regs: HashMap::new(),
            pending_events: VecDeque::new(),
            interrupt_script: VecDeque::new(),
            interrupt_log: Vec::new(),
        }
    }
}

pub struct FakeWorld {
    cpus: Vec<Mutex<FakeCpuState>>,
    ram: RamDescriptor,
}

impl FakeWorld {
    pub fn new(n_cpus: u16, ram_mb: u32) -> Self {
        FakeWorld {
            cpus: (0..n_cpus).map(|_| Mutex::new(FakeCpuState::new())).collect(),
            ram: RamDescriptor::new(ram_mb),
        }
    }

    /// Queues `event` to be returned on that CPU's next `run`.
    pub fn push_event(&self, cpu: u16, event: CpuEvent) {
        self.cpus[cpu as usize].lock().unwrap().pending_events.push_back(event);
    }

    /// Scripts the next `interrupt` call's return value for `cpu`. Unscripted calls default to
    /// [`InterruptOutcome::Accepted`].
    pub fn script_interrupt(&self, cpu: u16, outcome: InterruptOutcome) {
        self.cpus[cpu as usize].lock().unwrap().interrupt_script.push_back(outcome);
    }

    /// Every vector actually delivered to `interrupt` on `cpu`, in call order.
    pub fn interrupt_log(&self, cpu: u16) -> Vec<u8> {
        self.cpus[cpu as usize].lock().unwrap().interrupt_log.clone()
    }

    pub fn get_reg(&self, cpu: u16, reg: Register) -> u64 {
        *self.cpus[cpu as usize].lock().unwrap().regs.get(&reg).unwrap_or(&0)
    }

    /// Directly sets a register, bypassing the guest entirely. Used by tests that need to drive a
    /// CPU's mode/privilege level without going through the magic-instruction protocol.
    pub fn set_reg(&self, cpu: u16, reg: Register, value: u64) {
        self.cpus[cpu as usize].lock().unwrap().regs.insert(reg, value);
    }
}

fn registry() -> &'static Mutex<HashMap<String, &'static FakeWorld>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, &'static FakeWorld>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0);

/// Registers `world` (leaked for `'static` lifetime, acceptable in test code) under a fresh
/// unique name and returns a [`DomainConfig`] pointing at it.
pub fn config_for(world: FakeWorld, n_cpus: u16, ram_mb: u32) -> DomainConfig {
    config_for_with_world(world, n_cpus, ram_mb).0
}

/// Like [`config_for`], but also hands back the leaked `&'static FakeWorld` so a test can keep
/// driving it (pushing events, scripting interrupts, poking registers) after the `Domain` is
/// constructed.
pub fn config_for_with_world(world: FakeWorld, n_cpus: u16, ram_mb: u32) -> (DomainConfig, &'static FakeWorld) {
    let handle = format!("fake-world-{}", NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
    let leaked: &'static FakeWorld = Box::leak(Box::new(world));
    registry().lock().unwrap().insert(handle.clone(), leaked);
    let config = DomainConfig::new(n_cpus, ram_mb, "unused-kernel-path").with_library_path(handle).build();
    (config, leaked)
}

pub struct FakeAdapter {
    id: u16,
    ram: RamDescriptor,
    world: &'static FakeWorld,
}

impl EmulatorAdapter for FakeAdapter {
    fn new_master(id: u16, ram_mb: u32, library_path: &str) -> Result<(Self, RamDescriptor), Error> {
        let world = *registry().lock().unwrap().get(library_path).expect("fake world registered");
        let ram = world.ram.clone();
        Ok((FakeAdapter { id, ram: ram.clone(), world }, ram))
    }

    fn new_slave(id: u16, _ram_mb: u32, library_path: &str, ram: RamDescriptor) -> Result<Self, Error> {
        let world = *registry().lock().unwrap().get(library_path).expect("fake world registered");
        Ok(FakeAdapter { id, ram, world })
    }

    fn run(&mut self, n: u32) -> (u32, Vec<CpuEvent>) {
        let mut state = self.world.cpus[self.id as usize].lock().unwrap();
        let events: Vec<CpuEvent> = state.pending_events.drain(..).collect();
        (n, events)
    }

    fn interrupt(&mut self, vec: u8) -> InterruptOutcome {
        let mut state = self.world.cpus[self.id as usize].lock().unwrap();
        state.interrupt_log.push(vec);
        state.interrupt_script.pop_front().unwrap_or(InterruptOutcome::Accepted)
    }

    fn get_reg(&self, reg: Register) -> u64 {
        let state = self.world.cpus[self.id as usize].lock().unwrap();
        *state.regs.get(&reg).unwrap_or(&0)
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        let mut state = self.world.cpus[self.id as usize].lock().unwrap();
        state.regs.insert(reg, value);
    }

    fn mem_rd(&self, paddr: u64, buf: &mut [u8]) {
        let below = self.ram.below_4g.lock();
        let start = paddr as usize;
        let n = buf.len().min(below.len().saturating_sub(start));
        buf[..n].copy_from_slice(&below[start..start + n]);
    }

    fn mem_wr(&mut self, paddr: u64, buf: &[u8]) {
        let mut below = self.ram.below_4g.lock();
        let start = paddr as usize;
        let n = buf.len().min(below.len().saturating_sub(start));
        below[start..start + n].copy_from_slice(&buf[..n]);
    }

    fn mem_rd_virt(&self, vaddr: u64, buf: &mut [u8]) {
        self.mem_rd(vaddr, buf);
    }

    fn mem_wr_virt(&mut self, vaddr: u64, buf: &[u8]) {
        self.mem_wr(vaddr, buf);
    }

    fn ram(&self) -> &RamDescriptor {
        &self.ram
    }

    fn load_kernel_image(&mut self, _path: &str) -> Result<(), Error> {
        Ok(())
    }

    fn register_order() -> &'static [Register] {
        &REG_ORDER
    }
}
