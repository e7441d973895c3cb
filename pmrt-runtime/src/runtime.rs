//! Runtime context
//!
//! [`Runtime`] owns every component and wires them together in dependency
//! order: locked heap, processor state (with the FPU switch), interrupt
//! stack pool, interrupt controller, exception bridge, scheduler. Dropping
//! it tears them down in reverse, which restores every vector the runtime
//! displaced.

use alloc::sync::Arc;
use core::alloc::Layout;

use log::{debug, info};
use pmrt_api::{Error, Host, Result};
use pmrt_memory::LockedHeap;

use crate::arch;
use crate::config::{INTERRUPT_RESERVE_SIZES, RuntimeConfig};
use crate::cpu::Cpu;
use crate::exception::{CpuException, ExceptionBridge, catch_faults};
use crate::interrupt::{InterruptController, InterruptStack};
use crate::thread::Scheduler;

/// Vector of "device not available"
pub const DEVICE_NOT_AVAILABLE: u8 = 0x07;

pub struct Runtime {
    // Dropped in declaration order, dependents first. The scheduler must go
    // before anything its threads may still be using.
    scheduler: Arc<Scheduler>,
    bridge: Arc<ExceptionBridge>,
    controller: InterruptController,
    stack: Arc<InterruptStack>,
    cpu: Arc<Cpu>,
    heap: Arc<LockedHeap>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Brings the runtime up on the calling thread, which becomes the main
    /// thread.
    pub fn new(host: Arc<dyn Host>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        arch::init();

        let heap = Arc::new(LockedHeap::new(host.clone()));
        for size in INTERRUPT_RESERVE_SIZES {
            let layout = Layout::from_size_align(size, size).map_err(|_| Error::InvalidArgument("reserve layout"))?;
            heap.reserve(layout, config.interrupt_heap_reserve)?;
        }
        let cpu = Arc::new(Cpu::new(host, heap.clone(), config.lazy_fpu, config.debug)?);
        let stack = Arc::new(InterruptStack::new(
            heap.clone(),
            config.interrupt_stack_size,
            config.interrupt_frame_size,
            config.interrupt_low_water,
        )?);
        cpu.attach_interrupt_stack(stack.clone());
        let controller = InterruptController::new(cpu.clone(), stack.clone());

        let bridge = ExceptionBridge::new(cpu.clone(), stack.clone(), config.code_range.clone());
        bridge.install_reraise(&config.reraise_vectors)?;
        if cpu.fpu().is_lazy() {
            let fpu_cpu = cpu.clone();
            bridge.add(DEVICE_NOT_AVAILABLE, move |_| fpu_cpu.fpu().handle_unavailable())?;
        }

        let scheduler = Scheduler::new(cpu.clone(), config.default_stack_size)?;
        info!(
            target: "pmrt",
            "runtime started: {} re-raised vectors, {} FPU switching",
            config.reraise_vectors.len(),
            if cpu.fpu().is_lazy() { "lazy" } else { "eager" }
        );
        Ok(Self { scheduler, bridge, controller, stack, cpu, heap, config })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host(&self) -> &dyn Host {
        self.cpu.host()
    }

    pub fn heap(&self) -> &Arc<LockedHeap> {
        &self.heap
    }

    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    pub fn interrupt_stack(&self) -> &Arc<InterruptStack> {
        &self.stack
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.controller
    }

    pub fn exceptions(&self) -> &Arc<ExceptionBridge> {
        &self.bridge
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Runs `f`, returning a fault it raises as `Err`; see
    /// [`catch_faults`](crate::exception::catch_faults).
    pub fn catch_faults<F, R>(&self, f: F) -> core::result::Result<R, CpuException>
    where
        F: FnOnce() -> R,
    {
        catch_faults(&self.cpu, f)
    }

    /// Tops up locked memory and grows the interrupt stack pool as
    /// requested from interrupt context. [`Scheduler::yield_now`] does this
    /// on every call.
    pub fn maintain(&self) -> Result<()> {
        self.cpu.maintain()
    }

    pub fn set_debug(&self, enabled: bool) {
        self.cpu.set_debug(enabled);
    }

    pub fn debug_enabled(&self) -> bool {
        self.cpu.debug_enabled()
    }

    pub fn breakpoint(&self) {
        crate::debug::breakpoint(&self.cpu);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let stats = self.heap.stats();
        debug!(
            target: "pmrt",
            "runtime stopping: {} bytes locked, high water {}",
            stats.in_use,
            stats.high_water
        );
    }
}
