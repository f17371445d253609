//! Per-CPU filtered event queues, built on top of [`crate::domain::Domain`]'s listener registry
//! the way the original attached a `Queue` to one `(cpu, Domain)` pair and filtered the stream by
//! mode/tid before buffering it for the caller to drain.

use crate::arch::x86_64::{CpuMode, CpuProt, InstType, MemAccess};
use crate::domain::{Domain, ListenerHandle};
use crate::adapter::EmulatorAdapter;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One sampled event handed to the consumer of an [`EventQueue`].
#[derive(Clone, Debug)]
pub enum QueueItem {
    Instruction { vaddr: u64, paddr: u64, len: u8, bytes: [u8; 15], kind: InstType },
    Memory { vaddr: u64, paddr: u64, size: u8, access: MemAccess },
    Interrupt { vec: u8 },
}

#[derive(Clone, Copy, Debug)]
struct Filter {
    user: bool,
    krnl: bool,
    prot: bool,
    real: bool,
    tid: Option<u16>,
}

impl Default for Filter {
    fn default() -> Self {
        // All four mode/privilege flags on and no tid restriction is observationally identical to
        // "unfiltered": whatever the CPU's actual mode/privilege, one of the four ORed terms
        // always holds.
        Filter { user: true, krnl: true, prot: true, real: true, tid: None }
    }
}

impl Filter {
    fn accepts(&self, mode: CpuMode, prot: CpuProt, tid: Option<u16>) -> bool {
        if let Some(want) = self.tid {
            if tid != Some(want) {
                return false;
            }
        }

        (self.krnl && prot == CpuProt::Kernel)
            || (self.user && prot == CpuProt::User)
            || (self.prot && mode == CpuMode::Protected)
            || (self.real && mode == CpuMode::Real)
    }
}

/// A filtered, buffered view of one CPU's instruction/memory/interrupt stream.
///
/// Binds to one `(Domain, cpu id)` pair for its lifetime; registers three listeners on
/// construction and unregisters them on drop, the way the original's destructor cleared its
/// per-CPU callback slots.
pub struct EventQueue<A: EmulatorAdapter + Send + 'static> {
    domain: Domain<A>,
    cpu: u16,
    filter: Arc<Mutex<Filter>>,
    hlt: Arc<Mutex<bool>>,
    buf: Arc<Mutex<VecDeque<QueueItem>>>,
    inst_handle: ListenerHandle,
    mem_handle: ListenerHandle,
    int_handle: ListenerHandle,
}

impl<A: EmulatorAdapter + Send + 'static> EventQueue<A> {
    /// Attaches a new queue to `cpu` on `domain`. HLT interception defaults to the Domain's
    /// configured default (see [`crate::config::DomainConfigBuilder::with_hlt_timer`]).
    pub fn new(domain: Domain<A>, cpu: u16) -> Self {
        let filter = Arc::new(Mutex::new(Filter::default()));
        let hlt = Arc::new(Mutex::new(domain.default_hlt_timer()));
        let buf = Arc::new(Mutex::new(VecDeque::new()));

        let inst_handle = {
            let filter = filter.clone();
            let hlt = hlt.clone();
            let buf = buf.clone();
            let domain_for_hlt = domain.clone();
            domain.set_inst_cb(move |cpu_id, vaddr, paddr, len, bytes, kind| {
                if *hlt.lock() && len == 1 && bytes[0] == 0xf4 {
                    domain_for_hlt.timer_interrupt();
                }

                if cpu_id != cpu {
                    return;
                }
                let mode = domain_for_hlt.get_mode(cpu_id);
                let prot = domain_for_hlt.get_prot(cpu_id);
                let tid = domain_for_hlt.get_tid(cpu_id);
                if filter.lock().accepts(mode, prot, tid) {
                    let mut fixed = [0u8; 15];
                    fixed[..bytes.len().min(15)].copy_from_slice(&bytes[..bytes.len().min(15)]);
                    buf.lock().push_back(QueueItem::Instruction { vaddr, paddr, len, bytes: fixed, kind });
                }
            })
        };

        let mem_handle = {
            let filter = filter.clone();
            let buf = buf.clone();
            let domain = domain.clone();
            domain.set_mem_cb(move |cpu_id, vaddr, paddr, size, access| {
                if cpu_id != cpu {
                    return;
                }
                let mode = domain.get_mode(cpu_id);
                let prot = domain.get_prot(cpu_id);
                let tid = domain.get_tid(cpu_id);
                if filter.lock().accepts(mode, prot, tid) {
                    buf.lock().push_back(QueueItem::Memory { vaddr, paddr, size, access });
                }
            })
        };

        let int_handle = {
            let filter = filter.clone();
            let buf = buf.clone();
            let domain = domain.clone();
            domain.set_int_cb(move |cpu_id, vec| {
                if cpu_id != cpu {
                    return false;
                }
                let mode = domain.get_mode(cpu_id);
                let prot = domain.get_prot(cpu_id);
                let tid = domain.get_tid(cpu_id);
                if filter.lock().accepts(mode, prot, tid) {
                    buf.lock().push_back(QueueItem::Interrupt { vec });
                }
                false
            })
        };

        EventQueue { domain, cpu, filter, hlt, buf, inst_handle, mem_handle, int_handle }
    }

    /// Restricts the sampled stream to the given privilege levels, CPU modes, and (optionally) a
    /// single thread id. All four flags default to `true` (unfiltered) and `tid` defaults to
    /// unrestricted.
    pub fn set_filt(&self, user: bool, krnl: bool, prot: bool, real: bool, tid: Option<u16>) {
        *self.filter.lock() = Filter { user, krnl, prot, real, tid };
    }

    /// Enables or disables HLT interception (raising a timer interrupt whenever this CPU executes
    /// `hlt`).
    pub fn set_hlt_timer(&self, enabled: bool) {
        *self.hlt.lock() = enabled;
    }

    pub fn cpu(&self) -> u16 {
        self.cpu
    }

    /// Pops the oldest buffered item, if any.
    pub fn pop(&self) -> Option<QueueItem> {
        self.buf.lock().pop_front()
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    pub fn domain(&self) -> &Domain<A> {
        &self.domain
    }
}

impl<A: EmulatorAdapter + Send + 'static> Drop for EventQueue<A> {
    fn drop(&mut self) {
        self.domain.remove_listener(self.inst_handle);
        self.domain.remove_listener(self.mem_handle);
        self.domain.remove_listener(self.int_handle);
    }
}
