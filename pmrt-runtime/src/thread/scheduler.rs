//! Round-robin scheduler
//!
//! Threads form a ring in start order. A yield picks the next started,
//! unsuspended, unfinished thread after the current one, saves the
//! outgoing thread's mask nesting, recovery point and FPU ownership, and
//! switches stacks. Finished threads are unlinked lazily by the next
//! switch, which always runs on some other thread's stack.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, error, info, warn};
use pmrt_api::{Error, Result};
use pmrt_memory::{LockedArc, LockedFnOnce};
use spin::Mutex;

use super::tcb::ThreadControl;
use super::{MAIN_THREAD_ID, ThreadAborted, ThreadBuilder, ThreadError, ThreadExit, ThreadId, ThreadState};
use crate::arch;
use crate::chain::HandlerChain;
use crate::config::MIN_STACK_SIZE;
use crate::cpu::Cpu;
use crate::debug;

type ThreadRef = LockedArc<ThreadControl>;

/// Handle to a thread; keeps its control block and stack alive
#[derive(Clone)]
pub struct Thread {
    tcb: ThreadRef,
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.tcb.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.tcb.name()
    }

    pub fn state(&self) -> ThreadState {
        self.tcb.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ThreadState::Finished
    }

    pub fn is_suspended(&self) -> bool {
        self.tcb.is_suspended()
    }

    pub fn is_aborted(&self) -> bool {
        self.tcb.is_aborted()
    }

    /// Outcome, once finished
    pub fn exit(&self) -> Option<ThreadExit> {
        self.tcb.exit()
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        LockedArc::ptr_eq(&self.tcb, &other.tcb)
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

struct Threads {
    /// Started threads in round-robin order, main included
    ring: HandlerChain<ThreadRef>,
    current: ThreadRef,
    main: ThreadRef,
}

impl Threads {
    /// Next runnable thread after the current one, wrapping around; the
    /// current thread itself comes last.
    fn pick_next(&self) -> Option<ThreadRef> {
        let current = self.current.id();
        let mut after_current = false;
        let mut wrapped = None;
        for thread in self.ring.iter() {
            if thread.id() == current {
                after_current = true;
                continue;
            }
            if !thread.is_runnable() {
                continue;
            }
            if after_current {
                return Some(thread.clone());
            }
            if wrapped.is_none() {
                wrapped = Some(thread.clone());
            }
        }
        wrapped.or_else(|| self.current.is_runnable().then(|| self.current.clone()))
    }

    fn prune(&mut self) {
        let current = self.current.id();
        while let Some(finished) =
            self.ring.remove_where(|t| t.id() != current && t.state() == ThreadState::Finished)
        {
            debug!(target: "pmrt::thread", "thread {} unlinked", finished.id());
        }
    }

    fn live(&self) -> usize {
        self.ring.iter().filter(|t| t.state() != ThreadState::Finished).count()
    }
}

/// Cooperative scheduler
pub struct Scheduler {
    cpu: Arc<Cpu>,
    default_stack_size: usize,
    threads: ManuallyDrop<Mutex<Threads>>,
    next_id: AtomicUsize,
    /// Set once shutdown has begun; no new threads start after that
    terminating: AtomicBool,
}

impl Scheduler {
    /// Creates the scheduler, adopting the calling thread as the main thread
    pub fn new(cpu: Arc<Cpu>, default_stack_size: usize) -> Result<Arc<Self>> {
        if default_stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument("default stack size below minimum"));
        }
        let heap = cpu.heap().clone();
        let main = LockedArc::new(&heap, ThreadControl::main(cpu.clone())?)?;
        let mut ring = HandlerChain::new();
        ring.push_back(&heap, main.clone())?;

        cpu.masked(|| cpu.fpu().attach_main(main.fpu_buffer()));
        cpu.set_current_thread_raw(MAIN_THREAD_ID.as_raw());
        Ok(Arc::new(Self {
            cpu,
            default_stack_size,
            threads: ManuallyDrop::new(Mutex::new(Threads { ring, current: main.clone(), main })),
            next_id: AtomicUsize::new(MAIN_THREAD_ID.as_raw() + 1),
            terminating: AtomicBool::new(false),
        }))
    }

    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    pub fn default_stack_size(&self) -> usize {
        self.default_stack_size
    }

    pub fn builder(&self) -> ThreadBuilder {
        ThreadBuilder::new()
    }

    // ========================================================================
    // Thread lifecycle
    // ========================================================================

    /// Creates a thread with the default stack size. It does not run until
    /// [`start`](Self::start) is called.
    pub fn create<F>(&self, f: F) -> Result<Thread>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError> + Send + 'static,
    {
        self.create_with(None, None, f)
    }

    pub(crate) fn create_with<F>(&self, stack_size: Option<usize>, name: Option<String>, f: F) -> Result<Thread>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError> + Send + 'static,
    {
        let stack_size = stack_size.unwrap_or(self.default_stack_size);
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument("thread stack size below minimum"));
        }
        let id = ThreadId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tcb = ThreadControl::new(id, name, self.cpu.clone(), NonNull::from(self), stack_size, f)?;
        let tcb = LockedArc::new(self.cpu.heap(), tcb)?;
        debug!(target: "pmrt::thread", "thread {} created with {} byte stack", id, stack_size);
        Ok(Thread { tcb })
    }

    /// Adds a created thread to the round-robin ring
    pub fn start(&self, thread: &Thread) -> Result<()> {
        let tcb = &thread.tcb;
        if self.is_terminating() {
            return Err(Error::InvalidState("scheduler is shutting down"));
        }
        let _mask = self.cpu.mask();
        if tcb.is_started() {
            return Err(Error::InvalidState("thread already started"));
        }
        let (_, intena) = self.cpu.mask_state();
        tcb.prepare(thread_entry, LockedArc::as_ptr(tcb) as usize, (1, intena));
        self.threads.lock().ring.push_back(self.cpu.heap(), tcb.clone())?;
        tcb.mark_started();
        debug!(target: "pmrt::thread", "thread {} started", tcb.id());
        Ok(())
    }

    /// Creates and starts a thread
    pub fn spawn<F>(&self, f: F) -> Result<Thread>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError> + Send + 'static,
    {
        let thread = self.create(f)?;
        self.start(&thread)?;
        Ok(thread)
    }

    /// Asks a thread to end; it sees `ThreadAborted` at its next yield.
    /// Safe to call from interrupt context.
    pub fn abort(&self, thread: &Thread) -> Result<()> {
        if thread.tcb.is_main() {
            return Err(Error::InvalidState("main thread cannot be aborted"));
        }
        thread.tcb.set_aborted();
        // It has to run again to unwind.
        thread.tcb.set_suspended(false);
        debug!(target: "pmrt::thread", "thread {} aborted", thread.id());
        Ok(())
    }

    /// Takes a thread out of round-robin scheduling
    pub fn suspend(&self, thread: &Thread) {
        thread.tcb.set_suspended(true);
    }

    pub fn resume(&self, thread: &Thread) {
        thread.tcb.set_suspended(false);
    }

    /// Yields until `thread` has finished and returns how it ended
    pub fn join(&self, thread: &Thread) -> core::result::Result<ThreadExit, ThreadError> {
        if self.cpu.in_interrupt() {
            return Err(Error::InvalidState("join from interrupt context").into());
        }
        if thread.id() == self.current_id() {
            return Err(Error::InvalidState("thread cannot join itself").into());
        }
        if !thread.tcb.is_started() {
            return Err(Error::InvalidState("thread not started").into());
        }
        while !thread.is_finished() {
            self.yield_now()?;
        }
        Ok(thread.exit().unwrap_or(ThreadExit::Completed))
    }

    /// Handle of the running thread
    pub fn current(&self) -> Thread {
        let tcb = self.cpu.masked(|| self.threads.lock().current.clone());
        Thread { tcb }
    }

    pub fn current_id(&self) -> ThreadId {
        ThreadId::from_raw(self.cpu.current_thread_raw())
    }

    pub fn is_main_thread(&self) -> bool {
        self.current_id() == MAIN_THREAD_ID
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Started threads that have not finished, main included
    pub fn thread_count(&self) -> usize {
        self.cpu.masked(|| self.threads.lock().live())
    }

    // ========================================================================
    // Switching
    // ========================================================================

    /// Lets the next ready thread run.
    ///
    /// Returns `Err(ThreadAborted)` once the calling thread has been
    /// aborted. Must not be called from interrupt context.
    pub fn yield_now(&self) -> core::result::Result<(), ThreadAborted> {
        let cpu = &*self.cpu;
        runtime_assert!(cpu, !cpu.in_interrupt(), "yield from interrupt context");
        if cpu.in_interrupt() {
            return Ok(());
        }
        let current = self.cpu.masked(|| self.threads.lock().current.clone());
        if !current.canary_intact() {
            debug::fatal(cpu, format_args!("stack overflow in thread {}", current.id()));
        }
        if current.is_aborted() {
            return Err(ThreadAborted);
        }
        if let Err(err) = cpu.maintain() {
            error!(target: "pmrt::thread", "deferred maintenance failed: {}", err);
        }

        self.switch_away(false);

        self.drain_deferred(&current);
        if current.is_aborted() { Err(ThreadAborted) } else { Ok(()) }
    }

    fn switch_away(&self, finishing: bool) {
        let cpu = &*self.cpu;
        let mask = cpu.mask();
        let (save, target) = {
            let mut threads = self.threads.lock();
            threads.prune();
            let from = threads.current.clone();
            let next = match threads.pick_next() {
                Some(next) => next,
                None if finishing => threads.main.clone(),
                None => return,
            };
            if LockedArc::ptr_eq(&next, &from) {
                return;
            }

            from.save_switch_state(cpu.mask_state(), cpu.recovery());
            let (mask_state, recovery) = next.switch_state();
            cpu.set_mask_state(mask_state);
            cpu.set_recovery(recovery);
            cpu.set_current_thread_raw(next.id().as_raw());
            cpu.fpu().switch_thread(next.fpu_buffer());
            if next.state() == ThreadState::Starting {
                next.set_state(ThreadState::Running);
            }
            threads.current = next.clone();
            (from.saved_sp_slot(), next.saved_sp())
        };
        unsafe { arch::switch_context(save, target) };
        drop(mask);
    }

    fn drain_deferred(&self, tcb: &ThreadControl) {
        loop {
            let call = {
                let mask = self.cpu.mask();
                tcb.pop_deferred(&mask)
            };
            match call {
                Some(call) => call.call(),
                None => break,
            }
        }
    }

    fn finish(&self, tcb: &ThreadControl, exit: ThreadExit) -> ! {
        tcb.set_state(ThreadState::Finishing);
        self.drain_deferred(tcb);
        loop {
            let call = {
                let mask = self.cpu.mask();
                tcb.pop_at_exit(&mask)
            };
            match call {
                Some(call) => call.call(),
                None => break,
            }
        }
        match &exit {
            ThreadExit::Completed => debug!(target: "pmrt::thread", "thread {} completed", tcb.id()),
            ThreadExit::Aborted => info!(target: "pmrt::thread", "thread {} ended by abort", tcb.id()),
            ThreadExit::Failed(err) => warn!(target: "pmrt::thread", "thread {} failed: {}", tcb.id(), err),
        }
        tcb.set_exit(exit);
        tcb.set_state(ThreadState::Finished);
        self.switch_away(true);
        debug::fatal(&self.cpu, format_args!("finished thread {} resumed", tcb.id()))
    }

    // ========================================================================
    // Deferred calls
    // ========================================================================

    /// Runs `f` on the main thread: immediately when called from it outside
    /// interrupt context, otherwise the next time the main thread resumes.
    pub fn invoke_main<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.cpu.in_interrupt() && self.is_main_thread() {
            f();
            return Ok(());
        }
        let call = LockedFnOnce::new(self.cpu.heap(), f)?;
        let mask = self.cpu.mask();
        let main = self.threads.lock().main.clone();
        main.push_deferred(&mask, call)
    }

    /// Runs `f` in thread context as soon as possible: immediately outside
    /// interrupt context, otherwise when the next thread to be scheduled
    /// resumes (the interrupted thread if no other is ready).
    pub fn invoke_next<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.cpu.in_interrupt() {
            f();
            return Ok(());
        }
        let call = LockedFnOnce::new(self.cpu.heap(), f)?;
        let mask = self.cpu.mask();
        let target = {
            let threads = self.threads.lock();
            threads.pick_next().unwrap_or_else(|| threads.current.clone())
        };
        target.push_deferred(&mask, call)
    }

    /// Queues `f` to run when the calling thread finishes; handlers run
    /// last-registered first.
    pub fn at_exit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cpu.in_interrupt() {
            return Err(Error::InvalidState("at_exit from interrupt context"));
        }
        let call = LockedFnOnce::new(self.cpu.heap(), f)?;
        let mask = self.cpu.mask();
        let current = self.threads.lock().current.clone();
        current.push_at_exit(&mask, call)
    }
}

/// First code a new thread runs, on its own stack with the switching
/// thread's mask still held.
extern "C" fn thread_entry(arg: usize) -> ! {
    let tcb = unsafe { &*(arg as *const ThreadControl) };
    let scheduler = tcb.scheduler();
    scheduler.cpu.pop_off();
    scheduler.drain_deferred(tcb);
    let result = tcb.run_entry();
    scheduler.finish(tcb, ThreadExit::from(result))
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let cpu = self.cpu.clone();
        if cpu.in_interrupt() || !self.is_main_thread() {
            // Tearing down the ring would free the stack we are running on.
            error!(target: "pmrt::thread", "scheduler dropped off the main thread; threads leaked");
            return;
        }

        self.terminating.store(true, Ordering::Release);
        cpu.masked(|| {
            for thread in self.threads.lock().ring.iter().filter(|t| !t.is_main()) {
                thread.set_aborted();
                thread.set_suspended(false);
            }
        });
        while cpu.masked(|| self.threads.lock().live()) > 1 {
            if self.yield_now().is_err() {
                break;
            }
        }

        let main = cpu.masked(|| self.threads.lock().main.clone());
        loop {
            let call = {
                let mask = cpu.mask();
                main.pop_at_exit(&mask)
            };
            match call {
                Some(call) => call.call(),
                None => break,
            }
        }
        drop(main);

        info!(target: "pmrt::thread", "scheduler stopped");
        cpu.masked(|| unsafe { ManuallyDrop::drop(&mut self.threads) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use pmrt_api::sim::SimulatedHost;
    use pmrt_memory::LockedHeap;

    fn scheduler() -> Arc<Scheduler> {
        let host = Arc::new(SimulatedHost::new());
        let heap = Arc::new(LockedHeap::new(host.clone()));
        let cpu = Arc::new(Cpu::new(host, heap, true, true).unwrap());
        Scheduler::new(cpu, 16 * 1024).unwrap()
    }

    #[test]
    fn test_main_thread_is_current() {
        let scheduler = scheduler();
        assert!(scheduler.is_main_thread());
        assert_eq!(scheduler.current().id(), MAIN_THREAD_ID);
        assert_eq!(scheduler.current().state(), ThreadState::Running);
        assert_eq!(scheduler.thread_count(), 1);
        assert_eq!(scheduler.yield_now(), Ok(()));
    }

    #[test]
    fn test_lifecycle_errors() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.builder().stack_size(64).create(&scheduler, |_| Ok(())),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(scheduler.abort(&scheduler.current()), Err(Error::InvalidState(_))));

        let thread = scheduler.create(|_| Ok(())).unwrap();
        assert_eq!(thread.state(), ThreadState::Starting);
        assert!(scheduler.join(&thread).is_err());
        scheduler.start(&thread).unwrap();
        assert!(matches!(scheduler.start(&thread), Err(Error::InvalidState(_))));
        assert_eq!(scheduler.join(&thread), Ok(ThreadExit::Completed));
    }

    #[test]
    fn test_ids_are_monotonic() {
        let scheduler = scheduler();
        let ids: Vec<_> = (0..3).map(|_| scheduler.create(|_| Ok(())).unwrap().id().as_raw()).collect();
        assert_eq!(ids, [2, 3, 4]);
    }

    #[test]
    fn test_switch_preserves_mask_nesting() {
        let scheduler = scheduler();
        let cpu = scheduler.cpu().clone();
        let worker = scheduler
            .spawn(move |s| {
                assert_eq!(s.cpu().mask_depth(), 0);
                let _mask = s.cpu().mask();
                s.yield_now()?;
                assert_eq!(s.cpu().mask_depth(), 1);
                Ok(())
            })
            .unwrap();
        scheduler.yield_now().unwrap();
        assert_eq!(cpu.mask_depth(), 0);
        assert!(cpu.host().interrupts_enabled());
        scheduler.join(&worker).unwrap();
        assert!(cpu.host().interrupts_enabled());
    }
}
