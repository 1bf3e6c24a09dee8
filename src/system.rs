//! The system façade
//!
//! Owns every subsystem and wires them into the dependency DAG: timing
//! and IO at the leaves, memory above them, then the kernel, then the
//! services. The run loop executes the current thread (or idles virtual
//! time forward), services host-posted requests, dispatches queued IPC
//! messages and reschedules.

use crate::EpocVersion;
use crate::config::{CONFIG_FILE, CoreConfig};
use crate::cpu::{CpuCore, IdleCpu, JitType};
use crate::error::{KernelError, KernelResult};
use crate::io::{Drive, DriveMedia, Io, IoAttrib};
use crate::kernel::{Handle, Kernel};
use crate::loader::{ImageLoader, ImageTable, PackageInstaller};
use crate::memory::{Memory, MemoryMap};
use crate::services::window::{GraphicsDriver, StubGraphicsDriver, WindowServer};
use crate::services::ServiceRegistry;
use crate::timing::Timing;
use std::path::Path;

/// Continue running.
pub const LOOP_CONTINUE: i32 = 1;
/// The last process exited or an exit was requested.
pub const LOOP_EXIT: i32 = 0;

/// The emulator.
pub struct System {
    config: CoreConfig,
    version: EpocVersion,
    jit_type: JitType,

    timing: Timing,
    mem: Memory,
    io: Io,
    kernel: Kernel,
    cpu: Box<dyn CpuCore>,
    services: ServiceRegistry,

    loader: Box<dyn ImageLoader>,
    installer: Option<Box<dyn PackageInstaller>>,
    graphics: Option<Box<dyn GraphicsDriver>>,

    /// Library names handed to the HLE library manager before any image
    /// runs.
    force_loaded: Vec<String>,

    exit: bool,
    reschedule_pending: bool,
    startup_inited: bool,
}

impl System {
    pub fn new() -> Self {
        let version = EpocVersion::default();
        Self {
            config: CoreConfig::default(),
            version,
            jit_type: JitType::default(),
            timing: Timing::new(),
            mem: Memory::new(Self::memory_map(version)),
            io: Io::new(),
            kernel: Kernel::new(version),
            cpu: Box::new(IdleCpu::new()),
            services: ServiceRegistry::new(),
            loader: Box::new(ImageTable::new()),
            installer: None,
            graphics: None,
            force_loaded: Vec::new(),
            exit: false,
            reschedule_pending: false,
            startup_inited: false,
        }
    }

    fn memory_map(version: EpocVersion) -> MemoryMap {
        if version.is_eka1() {
            MemoryMap::eka1()
        } else {
            MemoryMap::eka2()
        }
    }

    // ------------------------------------------------------------------
    // Pre-init wiring

    pub fn set_symbian_version_use(&mut self, version: EpocVersion) {
        self.version = version;
        self.kernel.set_epoc_version(version);
        self.io.set_epoc_version(version);
    }

    pub fn get_symbian_version_use(&self) -> EpocVersion {
        self.version
    }

    pub fn set_jit_type(&mut self, jit_type: JitType) {
        self.jit_type = jit_type;
    }

    pub fn jit_type(&self) -> JitType {
        self.jit_type
    }

    pub fn set_cpu(&mut self, cpu: Box<dyn CpuCore>) {
        self.cpu = cpu;
    }

    pub fn set_image_loader(&mut self, loader: Box<dyn ImageLoader>) {
        self.loader = loader;
    }

    pub fn set_package_installer(&mut self, installer: Box<dyn PackageInstaller>) {
        self.installer = Some(installer);
    }

    pub fn set_graphics_driver(&mut self, driver: Box<dyn GraphicsDriver>) {
        self.graphics = Some(driver);
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Bring every subsystem up: load config, size the address space for
    /// the selected EPOC version, register the built-in servers.
    pub fn init(&mut self) {
        self.exit = false;
        self.config = CoreConfig::load(Path::new(CONFIG_FILE));

        self.mem = Memory::new(Self::memory_map(self.version));
        self.kernel.init(&mut self.timing);

        let driver = self
            .graphics
            .take()
            .unwrap_or_else(|| Box::new(StubGraphicsDriver));
        let window_server = WindowServer::new(driver);
        if let Err(err) = self
            .services
            .register(&mut self.kernel, Box::new(window_server))
        {
            log::warn!("window server registration failed: {}", err);
        }
    }

    /// Load an image and run it. On the first load, startup apps from the
    /// config are spawned first and force-load libraries are recorded for
    /// the library manager.
    pub fn load(&mut self, image_id: u32) -> KernelResult<Handle> {
        self.force_loaded = self.config.force_load.clone();
        for lib in &self.force_loaded {
            log::info!("force loading {}", lib);
        }

        if !self.startup_inited {
            for app in self.config.startup.clone() {
                match self.loader.load_by_path(&app) {
                    Some(image) => {
                        let handle =
                            self.kernel.spawn_new_process(&mut self.mem, &image, "")?;
                        self.kernel.run_process(handle)?;
                    }
                    None => log::warn!("startup app {} not found", app),
                }
            }
            self.startup_inited = true;
        }

        let image = self
            .loader
            .load_by_id(image_id)
            .ok_or(KernelError::NotFound)?;
        let handle = self.kernel.spawn_new_process(&mut self.mem, &image, "")?;
        self.kernel.run_process(handle)?;
        Ok(handle)
    }

    /// One iteration of the run loop. Returns [`LOOP_EXIT`] when the
    /// guest is done.
    pub fn loop_once(&mut self) -> i32 {
        if self.exit {
            return LOOP_EXIT;
        }

        if self.kernel.current_thread().is_none() {
            // Nothing runnable: jump virtual time to the next deadline.
            self.timing.idle();
            self.prepare_reschedule();
        } else {
            self.timing.add_ticks(self.cpu.last_slice_us());
            self.cpu.run();
        }

        for event in self.timing.advance() {
            self.kernel.on_timed_event(&mut self.mem, event);
        }

        if self.kernel.should_terminate() {
            self.exit = true;
            return LOOP_EXIT;
        }

        self.kernel.processing_requests(&mut self.mem);
        self.services
            .dispatch_pending(&mut self.kernel, &mut self.mem);
        self.kernel.reschedule(self.cpu.as_mut(), self.timing.ticks());
        self.reschedule_pending = false;

        LOOP_CONTINUE
    }

    /// Ask the CPU to come back at the next safe point so the scheduler
    /// can run.
    pub fn prepare_reschedule(&mut self) {
        self.cpu.prepare_rescheduling();
        self.reschedule_pending = true;
    }

    /// True between a reschedule request and the next scheduler pass.
    pub fn reschedule_pending(&self) -> bool {
        self.reschedule_pending
    }

    pub fn request_exit(&mut self) {
        self.cpu.stop();
        self.exit = true;
    }

    pub fn should_exit(&self) -> bool {
        self.exit
    }

    /// Tear down and rebuild the subsystems, keeping configuration.
    pub fn shutdown(&mut self) {
        self.timing = Timing::new();
        self.kernel = Kernel::new(self.version);
        self.mem = Memory::new(Self::memory_map(self.version));
        self.services = ServiceRegistry::new();
        self.force_loaded.clear();
        self.startup_inited = false;
        self.exit = false;
    }

    pub fn reset(&mut self) {
        self.exit = false;
        self.force_loaded.clear();
    }

    // ------------------------------------------------------------------
    // Drives and packages

    pub fn mount(&mut self, drive: Drive, media: DriveMedia, path: &str, attrib: IoAttrib) {
        self.io
            .mount_physical_path(drive, media, attrib, path.into());
    }

    pub fn install_package(&mut self, path: &str, drive: Drive) -> bool {
        match &mut self.installer {
            Some(installer) => installer.install_package(path, drive),
            None => {
                log::warn!("no package manager attached, cannot install {}", path);
                false
            }
        }
    }

    pub fn install_rpkg(&mut self, path: &str) -> bool {
        match &mut self.installer {
            Some(installer) => installer.install_rpkg(path),
            None => {
                log::warn!("no package manager attached, cannot install {}", path);
                false
            }
        }
    }

    /// Map a ROM image file into the guest ROM window.
    pub fn load_rom(&mut self, path: &str) -> bool {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("cannot read ROM {}: {}", path, err);
                return false;
            }
        };

        match self.mem.map_rom(data) {
            Ok(_) => true,
            Err(err) => {
                log::warn!("cannot map ROM {}: {}", path, err);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors

    pub fn get_bool_config(&self, name: &str) -> bool {
        self.config.get_bool(name)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn timing_mut(&mut self) -> &mut Timing {
        &mut self.timing
    }

    pub fn io(&self) -> &Io {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }

    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    /// Split borrow for operations that need the kernel plus its
    /// dependencies at once.
    pub fn kernel_and_deps(&mut self) -> (&mut Kernel, &mut Memory, &mut Timing) {
        (&mut self.kernel, &mut self.mem, &mut self.timing)
    }

    pub fn force_loaded_libraries(&self) -> &[String] {
        &self.force_loaded
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}
