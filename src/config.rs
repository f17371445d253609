//! Domain configuration, built the same way a builder layers immutable-after-build properties
//! onto a handle before constructing it.

/// Immutable configuration used to construct a [`crate::domain::Domain`].
#[derive(Clone, Debug)]
pub struct DomainConfig {
    pub(crate) n_cpus: u16,
    pub(crate) ram_size_mb: u32,
    pub(crate) kernel_path: String,
    pub(crate) library_path: String,
    pub(crate) hlt_timer: bool,
}

impl DomainConfig {
    /// Starts building a configuration for `n_cpus` CPUs sharing `ram_size_mb` MiB of RAM, booting
    /// `kernel_path`.
    pub fn new(n_cpus: u16, ram_size_mb: u32, kernel_path: impl Into<String>) -> DomainConfigBuilder {
        DomainConfigBuilder {
            n_cpus,
            ram_size_mb,
            kernel_path: kernel_path.into(),
            library_path: "./libqemu.so".to_string(),
            hlt_timer: false,
        }
    }

    pub fn n_cpus(&self) -> u16 {
        self.n_cpus
    }

    pub fn ram_size_mb(&self) -> u32 {
        self.ram_size_mb
    }
}

/// Builder for [`DomainConfig`].
pub struct DomainConfigBuilder {
    n_cpus: u16,
    ram_size_mb: u32,
    kernel_path: String,
    library_path: String,
    hlt_timer: bool,
}

impl DomainConfigBuilder {
    /// Overrides the path to the emulator dynamic library (default `./libqemu.so`).
    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = path.into();
        self
    }

    /// Every [`crate::queue::EventQueue`] created under this Domain defaults to intercepting HLT
    /// and raising a timer interrupt, unless overridden per queue.
    pub fn with_hlt_timer(mut self, enabled: bool) -> Self {
        self.hlt_timer = enabled;
        self
    }

    pub fn build(self) -> DomainConfig {
        DomainConfig {
            n_cpus: self.n_cpus,
            ram_size_mb: self.ram_size_mb,
            kernel_path: self.kernel_path,
            library_path: self.library_path,
            hlt_timer: self.hlt_timer,
        }
    }
}
