mod common;

use common::{config_for, config_for_with_world, FakeAdapter, FakeWorld};
use qsim_rs::arch::x86_64::{CpuMode, IoAccess, InstType, RegAccess, Register};
use qsim_rs::{CpuEvent, Domain, InterruptOutcome};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

#[test]
fn instruction_events_reach_a_registered_listener() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(1, 4);
    world.push_event(
        0,
        CpuEvent::Instruction { vaddr: 0x1000, paddr: 0x1000, len: 1, bytes: [0x90; 15], kind: InstType::Regular },
    );
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let _handle = domain.set_inst_cb(move |cpu, vaddr, _paddr, _len, _bytes, _kind| {
        seen2.lock().unwrap().push((cpu, vaddr));
    });

    domain.run(0, 1);
    assert_eq!(*seen.lock().unwrap(), vec![(0, 0x1000)]);
}

#[test]
fn cpu_bootstrap_latch_sets_cs_and_marks_running() {
    let _guard = common::serialize_domain_tests();

    // CPU 0 issues the "wake CPU 1 at this CS" magic instruction, then any CPU issues the paired
    // "here is the entry CS" magic instruction. CPU 1 should come up at that CS with its running
    // flag set, short-circuiting the rest of the pattern table for that second instruction.
    let world = FakeWorld::new(2, 4);
    let config = config_for(world, 2, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    assert!(!domain.is_running(1));

    domain.magic_cb(0, 0xb007_0001); // latch: CPU 1 is waiting for its entry CS
    domain.magic_cb(0, 0x0000_1234); // entry CS arrives as rax >> 4 == 0x0123

    assert!(domain.is_running(1));
    assert_eq!(domain.get_mode(1), CpuMode::Real);
}

#[test]
fn ipi_preempted_by_a_non_terminal_vector_is_requeued() {
    let _guard = common::serialize_domain_tests();

    // interrupt() first refuses the original IPI with a higher-priority vector; since that
    // vector is neither the timer vector nor 0x30, it must be requeued and retried on the next
    // run of that CPU.
    let world = FakeWorld::new(1, 4);
    world.script_interrupt(0, InterruptOutcome::Preempted(0x50));
    world.script_interrupt(0, InterruptOutcome::Accepted);
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    domain.magic_cb(0, 0x1d00_0042); // IPI: target cpu 0, vector 0x42

    domain.run(0, 1); // pops 0x42, gets Preempted(0x50) back, requeues 0x50
    domain.run(0, 1); // pops 0x50, gets Accepted back, nothing left queued
    domain.run(0, 1); // no pending IPI left: interrupt() must not be called a third time
}

#[test]
fn timer_interrupt_uses_multicore_vector_when_two_cpus_are_running() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(2, 4);
    let config = config_for(world, 2, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    // Bring CPU 1 up so both CPU 0 and CPU 1 are running.
    domain.magic_cb(0, 0xb007_0001);
    domain.magic_cb(0, 0x0000_0000);
    assert!(domain.is_running(1));

    domain.timer_interrupt();
}

#[test]
fn timer_interrupt_uses_uniprocessor_vector_with_one_cpu() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(1, 4);
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();
    domain.timer_interrupt();
}

#[test]
fn console_magic_buffers_until_newline_then_flushes_to_every_sink() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(1, 4);
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    let out = Arc::new(Mutex::new(Vec::new()));
    struct SharedSink(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    domain.connect_console(Box::new(SharedSink(out.clone())));

    for byte in b"hi\n" {
        domain.magic_cb(0, 0xc501_e000 | *byte as u64);
    }

    assert_eq!(&*out.lock().unwrap(), b"hi\n");
}

#[test]
fn app_end_magic_clears_every_running_flag() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(2, 4);
    let config = config_for(world, 2, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    domain.magic_cb(0, 0xb007_0001);
    domain.magic_cb(0, 0x0000_0000);
    assert!(domain.is_running(0));
    assert!(domain.is_running(1));

    domain.magic_cb(0, 0xfa11_dead);

    assert!(!domain.is_running(0));
    assert!(!domain.is_running(1));
    assert_eq!(domain.run(0, 1), 0, "run on a stopped cpu must be a no-op");
    assert_eq!(domain.run(1, 1), 0);
}

#[test]
fn cpu_count_and_ram_size_magic_queries_write_the_callers_rax() {
    let _guard = common::serialize_domain_tests();

    let (config, world) = config_for_with_world(FakeWorld::new(3, 16), 3, 16);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    domain.magic_cb(0, 0xc7c7_c7c7);
    assert_eq!(world.get_reg(0, Register::Rax), 3);

    domain.magic_cb(0, 0x512e_512e);
    assert_eq!(world.get_reg(0, Register::Rax), 16);
}

#[test]
fn atomic_io_and_reg_events_reach_their_listeners() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(1, 4);
    world.push_event(0, CpuEvent::Atomic);
    world.push_event(0, CpuEvent::Io { port: 0x3f8, size: 1, access: IoAccess::Out, data: b'x' as u32 });
    world.push_event(0, CpuEvent::Reg { reg: Register::Rax, size: 8, access: RegAccess::Write });
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    let atomic_seen = Arc::new(Mutex::new(0));
    let atomic_seen2 = atomic_seen.clone();
    domain.set_atomic_cb(move |_cpu| {
        *atomic_seen2.lock().unwrap() += 1;
        false
    });

    let io_seen = Arc::new(Mutex::new(Vec::new()));
    let io_seen2 = io_seen.clone();
    domain.set_io_cb(move |_cpu, port, _size, access, data| {
        io_seen2.lock().unwrap().push((port, access, data));
    });

    let reg_seen = Arc::new(Mutex::new(Vec::new()));
    let reg_seen2 = reg_seen.clone();
    domain.set_reg_cb(move |_cpu, reg, _size, access| {
        reg_seen2.lock().unwrap().push((reg, access));
    });

    domain.run(0, 1);

    assert_eq!(*atomic_seen.lock().unwrap(), 1);
    assert_eq!(*io_seen.lock().unwrap(), vec![(0x3f8, IoAccess::Out, b'x' as u32)]);
    assert_eq!(*reg_seen.lock().unwrap(), vec![(Register::Rax, RegAccess::Write)]);
}

#[test]
fn start_and_end_magic_invoke_the_app_hooks_and_listeners() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(1, 4);
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    let hook_seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen2 = hook_seen.clone();
    domain.set_app_start_hook(move |cpu| hook_seen2.lock().unwrap().push(("start-hook", cpu)));
    let hook_seen3 = hook_seen.clone();
    domain.set_app_end_hook(move |cpu| hook_seen3.lock().unwrap().push(("end-hook", cpu)));

    let listener_seen = Arc::new(Mutex::new(Vec::new()));
    let listener_seen2 = listener_seen.clone();
    domain.set_start_cb(move |cpu| listener_seen2.lock().unwrap().push(("start-cb", cpu)));
    let listener_seen3 = listener_seen.clone();
    domain.set_end_cb(move |cpu| listener_seen3.lock().unwrap().push(("end-cb", cpu)));

    domain.magic_cb(0, 0xaaaa_aaaa);
    domain.magic_cb(0, 0xfa11_dead);

    assert_eq!(*hook_seen.lock().unwrap(), vec![("start-hook", 0), ("end-hook", 0)]);
    assert_eq!(*listener_seen.lock().unwrap(), vec![("start-cb", 0), ("end-cb", 0)]);
}

#[test]
fn checkpoint_round_trips_ram_and_registers() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(2, 4);
    let config = config_for(world, 2, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    domain.magic_cb(0, 0xb007_0001);
    domain.magic_cb(0, 0x0000_1234);

    let mut buf = Vec::new();
    domain.save_state(&mut buf).unwrap();
    drop(domain);

    let world2 = FakeWorld::new(2, 4);
    let config2 = config_for(world2, 2, 4);
    let restored: Domain<FakeAdapter> = Domain::from_checkpoint(Cursor::new(buf), config2).unwrap();

    assert!(restored.is_running(1));
    assert_eq!(restored.n_cpus(), 2);
}

#[test]
fn only_one_domain_may_exist_at_a_time() {
    let _guard = common::serialize_domain_tests();

    let world = FakeWorld::new(1, 4);
    let config = config_for(world, 1, 4);
    let domain: Domain<FakeAdapter> = Domain::new(config).unwrap();

    let world2 = FakeWorld::new(1, 4);
    let config2 = config_for(world2, 1, 4);
    let second = Domain::<FakeAdapter>::new(config2);
    assert!(second.is_err());

    drop(domain);

    let world3 = FakeWorld::new(1, 4);
    let config3 = config_for(world3, 1, 4);
    let third = Domain::<FakeAdapter>::new(config3);
    assert!(third.is_ok());
}
