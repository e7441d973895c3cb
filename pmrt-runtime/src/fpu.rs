//! Lazy FPU context switching
//!
//! The live numeric registers belong to exactly one context at a time: a
//! thread, an interrupt level, or nobody. Instead of saving and restoring
//! them around every switch, [`FpuSwitch`] sets CR0.TS whenever the context
//! that is about to run does not own them. The first numeric instruction
//! then raises "device not available" (#NM), and only at that point is the
//! old owner's state saved and the new one loaded.
//!
//! Level 0 is the running thread, levels 1.. are nested interrupt and
//! exception dispatches. An interrupt level starts without a buffer and is
//! given a private one, initialised from the default state, the first time
//! it touches the FPU.
//!
//! When the host does not let us write CR0 the switch degrades to eager
//! mode: state is saved on every enter and switch and restored on leave.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use log::{debug, error, warn};
use pmrt_api::{Cr0, FpuState, Host, Result};
use pmrt_memory::{IrqSave, LockedBox, LockedHeap};
use spin::{Mutex, MutexGuard};

/// Deepest interrupt nesting the switch can track
pub const MAX_LEVELS: usize = 32;

type Buffer = NonNull<FpuState>;

struct Levels {
    /// Buffer of the running thread (level 0)
    thread: Option<Buffer>,
    /// Private buffers of interrupt levels, index = level
    private: [Option<LockedBox<FpuState>>; MAX_LEVELS],
    /// Current level
    depth: usize,
    /// Context whose state is in the live registers
    owner: Option<Buffer>,
    last_restored: Option<Buffer>,
    spare: Vec<LockedBox<FpuState>>,
}

// Buffers are owned by threads or by `private`/`spare`; all access happens
// under the switch's lock with interrupts disabled.
unsafe impl Send for Levels {}

impl Levels {
    fn buffer(&self, level: usize) -> Option<Buffer> {
        if level == 0 {
            self.thread
        } else {
            self.private[level].as_ref().map(LockedBox::as_non_null)
        }
    }
}

pub struct FpuSwitch {
    host: Arc<dyn Host>,
    heap: Arc<LockedHeap>,
    lazy: bool,
    default: LockedBox<FpuState>,
    levels: Mutex<Levels>,
}

impl FpuSwitch {
    pub fn new(host: Arc<dyn Host>, heap: Arc<LockedHeap>, lazy: bool) -> Result<Self> {
        let lazy = lazy && host.control_register_access();
        if !lazy {
            warn!(target: "pmrt::fpu", "control registers unavailable, switching FPU state eagerly");
        }

        // Capture the reset state without disturbing the caller's registers.
        let mut saved = LockedBox::new(&heap, FpuState::new())?;
        let mut default = LockedBox::new(&heap, FpuState::new())?;
        host.fpu_save(&mut saved);
        host.fpu_init();
        host.fpu_save(&mut default);
        host.fpu_restore(&saved);

        let mut spare = Vec::with_capacity(MAX_LEVELS);
        spare.push(saved);
        Ok(Self {
            host,
            heap,
            lazy,
            default,
            levels: Mutex::new(Levels {
                thread: None,
                private: core::array::from_fn(|_| None),
                depth: 0,
                owner: None,
                last_restored: None,
                spare,
            }),
        })
    }

    /// Takes the level lock with interrupts disabled, so that a dispatch
    /// never spins on a lock held by the code it interrupted. Bind as
    /// `(_irq, levels)` so that the guard drops first.
    fn lock(&self) -> (IrqSave<'_>, MutexGuard<'_, Levels>) {
        let irq = IrqSave::new(&*self.host);
        (irq, self.levels.lock())
    }

    /// Whether switching happens on first use (CR0.TS) rather than eagerly
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// The reset state new contexts start from
    pub fn default_state(&self) -> &FpuState {
        &self.default
    }

    /// Allocates a buffer holding the default state
    pub fn new_buffer(&self) -> Result<LockedBox<FpuState>> {
        LockedBox::new(&self.heap, (*self.default).clone())
    }

    fn set_task_switched(&self, set: bool) {
        let result = self.host.read_cr0().and_then(|cr0| {
            let next = if set { cr0 | Cr0::TASK_SWITCHED } else { cr0 - Cr0::TASK_SWITCHED };
            if next != cr0 { self.host.write_cr0(next) } else { Ok(()) }
        });
        if let Err(err) = result {
            error!(target: "pmrt::fpu", "updating CR0.TS: {}", err);
        }
    }

    fn take_private(&self, levels: &mut Levels) -> Option<LockedBox<FpuState>> {
        let mut buffer = match levels.spare.pop() {
            Some(buffer) => buffer,
            None => match LockedBox::new(&self.heap, FpuState::new()) {
                Ok(buffer) => buffer,
                Err(err) => {
                    error!(target: "pmrt::fpu", "no memory for interrupt FPU state: {}", err);
                    return None;
                }
            },
        };
        buffer.bytes = self.default.bytes;
        Some(buffer)
    }

    /// Makes `buffer` the thread context whose state is live right now
    pub fn attach_main(&self, buffer: Buffer) {
        let (_irq, mut levels) = self.lock();
        levels.thread = Some(buffer);
        levels.owner = Some(buffer);
    }

    /// Called on entry to every interrupt or exception dispatch
    pub fn enter(&self) {
        let (_irq, mut levels) = self.lock();
        if levels.depth + 1 >= MAX_LEVELS {
            error!(target: "pmrt::fpu", "interrupt nesting exceeds {} levels", MAX_LEVELS);
            panic!("FPU level stack overflow");
        }
        if self.lazy {
            levels.depth += 1;
            self.set_task_switched(true);
            return;
        }

        if let Some(current) = levels.buffer(levels.depth) {
            self.host.fpu_save(unsafe { &mut *current.as_ptr() });
        }
        levels.depth += 1;
        let depth = levels.depth;
        levels.private[depth] = self.take_private(&mut levels);
        if let Some(buffer) = levels.buffer(depth) {
            self.host.fpu_restore(unsafe { buffer.as_ref() });
            levels.owner = Some(buffer);
            levels.last_restored = Some(buffer);
        }
    }

    /// Called on exit from every interrupt or exception dispatch
    pub fn leave(&self) {
        let (_irq, mut levels) = self.lock();
        if levels.depth == 0 {
            error!(target: "pmrt::fpu", "leave without matching enter");
            return;
        }
        let depth = levels.depth;
        let private = levels.private[depth].take();
        levels.depth -= 1;
        if let Some(buffer) = private {
            let ptr = LockedBox::as_non_null(&buffer);
            if levels.owner == Some(ptr) {
                levels.owner = None;
            }
            if levels.last_restored == Some(ptr) {
                levels.last_restored = None;
            }
            levels.spare.push(buffer);
        }

        let resumed = levels.buffer(levels.depth);
        if self.lazy {
            let owns = resumed.is_some() && resumed == levels.owner;
            self.set_task_switched(!owns);
        } else if let Some(buffer) = resumed {
            self.host.fpu_restore(unsafe { buffer.as_ref() });
            levels.owner = Some(buffer);
            levels.last_restored = Some(buffer);
        }
    }

    /// Called by the scheduler, with interrupts masked, before switching to
    /// the thread owning `buffer`.
    pub fn switch_thread(&self, buffer: Buffer) {
        let (_irq, mut levels) = self.lock();
        if self.lazy {
            levels.thread = Some(buffer);
            self.set_task_switched(levels.owner != Some(buffer));
            return;
        }
        if let Some(current) = levels.thread {
            if current != buffer {
                self.host.fpu_save(unsafe { &mut *current.as_ptr() });
            }
        }
        if levels.owner != Some(buffer) {
            self.host.fpu_restore(unsafe { buffer.as_ref() });
            levels.last_restored = Some(buffer);
        }
        levels.thread = Some(buffer);
        levels.owner = Some(buffer);
    }

    /// Handles "device not available" raised by the context one level below
    /// the current exception level. Returns `false` if lazy switching is
    /// off, in which case the fault is not ours.
    pub fn handle_unavailable(&self) -> bool {
        if !self.lazy {
            return false;
        }
        let (_irq, mut levels) = self.lock();
        let level = levels.depth.saturating_sub(1);
        if level > 0 && levels.private[level].is_none() {
            levels.private[level] = self.take_private(&mut levels);
        }
        let Some(target) = levels.buffer(level) else {
            error!(target: "pmrt::fpu", "no FPU state for level {}", level);
            return false;
        };

        self.set_task_switched(false);
        if levels.owner != Some(target) {
            if let Some(owner) = levels.owner {
                self.host.fpu_save(unsafe { &mut *owner.as_ptr() });
            }
            self.host.fpu_restore(unsafe { target.as_ref() });
            levels.owner = Some(target);
            levels.last_restored = Some(target);
            debug!(target: "pmrt::fpu", "FPU state switched to level {}", level);
        }
        true
    }

    /// Forgets `buffer` before its owner frees it
    pub fn release(&self, buffer: Buffer) {
        let (_irq, mut levels) = self.lock();
        if levels.owner == Some(buffer) {
            levels.owner = None;
        }
        if levels.thread == Some(buffer) {
            levels.thread = None;
        }
        if levels.last_restored == Some(buffer) {
            levels.last_restored = None;
        }
    }

    /// Copy of the buffer most recently loaded into the live registers
    pub fn last_context(&self) -> Option<FpuState> {
        let (_irq, levels) = self.lock();
        levels.last_restored.map(|buffer| unsafe { buffer.as_ref() }.clone())
    }

    /// Current contents of the live registers
    pub fn live_state(&self) -> FpuState {
        let mut state = FpuState::new();
        if self.lazy {
            let ts = self.host.read_cr0().map(|cr0| cr0.contains(Cr0::TASK_SWITCHED)).unwrap_or(false);
            if ts {
                self.set_task_switched(false);
            }
            self.host.fpu_save(&mut state);
            if ts {
                self.set_task_switched(true);
            }
        } else {
            self.host.fpu_save(&mut state);
        }
        state
    }

    /// Current interrupt level as tracked by the switch
    pub fn depth(&self) -> usize {
        let (_irq, levels) = self.lock();
        levels.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrt_api::sim::SimulatedHost;

    fn switch(lazy: bool) -> (Arc<SimulatedHost>, FpuSwitch, LockedBox<FpuState>) {
        let host = Arc::new(SimulatedHost::new());
        let heap = Arc::new(LockedHeap::new(host.clone()));
        let fpu = FpuSwitch::new(host.clone(), heap, lazy).unwrap();
        let main = fpu.new_buffer().unwrap();
        fpu.attach_main(LockedBox::as_non_null(&main));
        (host, fpu, main)
    }

    #[test]
    fn test_construction_preserves_live_registers() {
        let host = Arc::new(SimulatedHost::new());
        host.set_fpu_register(40, 0x5a);
        let heap = Arc::new(LockedHeap::new(host.clone()));
        let fpu = FpuSwitch::new(host.clone(), heap, true).unwrap();
        assert_eq!(host.fpu_register(40), 0x5a);
        assert_eq!(fpu.default_state().control_word(), 0x037f);
    }

    #[test]
    fn test_enter_sets_and_leave_clears_task_switched() {
        let (host, fpu, _main) = switch(true);
        fpu.enter();
        assert!(host.task_switched());
        fpu.leave();
        assert!(!host.task_switched());
        assert_eq!(fpu.depth(), 0);
    }

    #[test]
    fn test_interrupt_use_gets_private_state() {
        let (host, fpu, main) = switch(true);
        host.set_fpu_register(40, 0x11);
        fpu.enter(); // irq
        fpu.enter(); // #NM
        assert!(fpu.handle_unavailable());
        fpu.leave();
        assert!(!host.task_switched());
        assert_eq!(host.fpu_register(40), 0);
        host.set_fpu_register(40, 0x22);
        fpu.leave();
        // Main no longer owns the registers; its state was saved.
        assert!(host.task_switched());
        assert_eq!(main.bytes[40], 0x11);
    }

    #[test]
    fn test_eager_mode_without_control_registers() {
        let host = Arc::new(SimulatedHost::new());
        host.set_control_register_access(false);
        let heap = Arc::new(LockedHeap::new(host.clone()));
        let fpu = FpuSwitch::new(host.clone(), heap, true).unwrap();
        assert!(!fpu.is_lazy());
        let main = fpu.new_buffer().unwrap();
        fpu.attach_main(LockedBox::as_non_null(&main));
        host.set_fpu_register(40, 0x33);
        fpu.enter();
        assert_eq!(host.fpu_register(40), 0);
        host.set_fpu_register(40, 0x44);
        fpu.leave();
        assert_eq!(host.fpu_register(40), 0x33);
        assert!(!fpu.handle_unavailable());
    }
}
