//! qsim-rs provides a multi-core x86 functional simulation front end atop a dynamically loaded
//! emulator library. It supervises a set of guest CPUs (the [`domain`] module), delivers a
//! filtered, buffered trace of each CPU's instruction/memory/interrupt stream (the [`queue`]
//! module), and tracks cache-line sharership across CPUs for cache-hierarchy consumers of that
//! trace (the [`directory`] module).
//!
//! This crate does not itself execute guest instructions: that is delegated to whatever shared
//! library implements [`adapter::EmulatorAdapter`] (see [`cpu::QemuCpu`] for the adapter that
//! loads `libqemu.so`-shaped libraries via `dlopen`).

pub mod adapter;
pub mod arch;
pub mod config;
pub mod cpu;
pub mod directory;
pub mod domain;
pub mod error;
pub mod queue;

pub use adapter::{CpuEvent, EmulatorAdapter, InterruptOutcome, RamDescriptor};
pub use config::{DomainConfig, DomainConfigBuilder};
pub use cpu::QemuCpu;
pub use directory::{CoherenceDirectory, DIR_BANKS};
pub use domain::{Domain, ListenerHandle};
pub use error::Error;
pub use queue::{EventQueue, QueueItem};
