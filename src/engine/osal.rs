//! Operating-system abstraction used by the session engine: a reentrant lock,
//! manual-reset events with a multiplexed wait, threads with a priority hint,
//! guard-checked buffer memory and a monotonic millisecond clock.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::core::{OmxError, OmxResult};

/// Timeout value meaning "block until signaled".
pub const INFINITE_WAIT: u32 = u32::MAX;

fn poisoned<T>(_: PoisonError<T>) -> OmxError {
    OmxError::Undefined("synchronization primitive poisoned".to_string())
}

fn lock_state<T>(mutex: &Mutex<T>) -> OmxResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(poisoned)
}

fn deadline_after(timeout_ms: u32) -> Option<Instant> {
    if timeout_ms == INFINITE_WAIT {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
    }
}

// ============================================================================
// Reentrant mutex
// ============================================================================

/// Recursive lock over `parking_lot::ReentrantMutex`: the owning thread may
/// lock again without deadlocking, and the lock is released when every guard
/// it took has been dropped.
///
/// Only shared access to `T` is handed out; wrap mutable state in a `RefCell`.
pub struct ReentrantMutex<T> {
    inner: parking_lot::ReentrantMutex<T>,
    destroyed: AtomicBool,
}

pub type ReentrantMutexGuard<'a, T> = parking_lot::ReentrantMutexGuard<'a, T>;

impl<T> ReentrantMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            inner: parking_lot::ReentrantMutex::new(data),
            destroyed: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> OmxResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(OmxError::BadParameter("mutex destroyed".to_string()));
        }
        Ok(())
    }

    /// Block until the calling thread owns the lock.
    pub fn lock(&self) -> OmxResult<ReentrantMutexGuard<'_, T>> {
        self.check_live()?;
        Ok(self.inner.lock())
    }

    /// Take the lock only if it is free or already ours.
    pub fn try_lock(&self) -> OmxResult<ReentrantMutexGuard<'_, T>> {
        self.check_live()?;
        self.inner
            .try_lock()
            .ok_or_else(|| OmxError::NotReady("mutex held by another thread".to_string()))
    }

    /// Mark the lock unusable. Fails while another thread holds it.
    pub fn destroy(&self) -> OmxResult<()> {
        let guard = self.try_lock()?;
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(OmxError::BadParameter("mutex already destroyed".to_string()));
        }
        drop(guard);
        Ok(())
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Default)]
struct Notifier {
    fired: Mutex<bool>,
    wake: Condvar,
}

impl Notifier {
    fn fire(&self) {
        if let Ok(mut fired) = self.fired.lock() {
            *fired = true;
            self.wake.notify_all();
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    destroyed: bool,
    waiters: Vec<Arc<Notifier>>,
}

/// Binary manual-reset event.
///
/// `signal` is idempotent, `wait` does not consume the signal and `reset`
/// drains it. Waiters register a notifier with every event they wait on, so a
/// signal that lands between a `reset` and the following wait is never lost.
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<EventState>,
}

/// Outcome of [`wait_multiple`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitResult {
    /// Per event, whether it was signaled when the waiter woke.
    pub signaled: Vec<bool>,
    pub timed_out: bool,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> OmxResult<()> {
        let mut state = self.live_state()?;
        state.signaled = true;
        for waiter in &state.waiters {
            waiter.fire();
        }
        Ok(())
    }

    pub fn reset(&self) -> OmxResult<()> {
        self.live_state()?.signaled = false;
        Ok(())
    }

    pub fn is_signaled(&self) -> OmxResult<bool> {
        Ok(self.live_state()?.signaled)
    }

    /// Wait up to `timeout_ms` (or forever with [`INFINITE_WAIT`]).
    /// Returns `true` if the event is signaled, `false` on timeout.
    pub fn wait(&self, timeout_ms: u32) -> OmxResult<bool> {
        let result = wait_multiple(&[self], timeout_ms)?;
        Ok(!result.timed_out)
    }

    /// Make the event unusable and wake anyone still waiting on it.
    pub fn destroy(&self) -> OmxResult<()> {
        let mut state = self.live_state()?;
        state.destroyed = true;
        for waiter in state.waiters.drain(..) {
            waiter.fire();
        }
        Ok(())
    }

    fn live_state(&self) -> OmxResult<MutexGuard<'_, EventState>> {
        let state = lock_state(&self.state)?;
        if state.destroyed {
            return Err(OmxError::BadParameter("event destroyed".to_string()));
        }
        Ok(state)
    }

    fn unregister(&self, notifier: &Arc<Notifier>) {
        if let Ok(mut state) = self.state.lock() {
            state.waiters.retain(|w| !Arc::ptr_eq(w, notifier));
        }
    }
}

/// Block until at least one of `events` is signaled or `timeout_ms` elapses.
pub fn wait_multiple(events: &[&Event], timeout_ms: u32) -> OmxResult<WaitResult> {
    if events.is_empty() {
        return Err(OmxError::BadParameter("no events to wait on".to_string()));
    }

    let notifier = Arc::new(Notifier::default());
    for (registered, event) in events.iter().enumerate() {
        let mut state = match event.live_state() {
            Ok(state) => state,
            Err(err) => {
                for earlier in &events[..registered] {
                    earlier.unregister(&notifier);
                }
                return Err(err);
            }
        };
        state.waiters.push(Arc::clone(&notifier));
        if state.signaled {
            notifier.fire();
        }
    }

    let result = wait_registered(events, &notifier, deadline_after(timeout_ms));
    for event in events {
        event.unregister(&notifier);
    }
    result
}

fn wait_registered(
    events: &[&Event],
    notifier: &Notifier,
    deadline: Option<Instant>,
) -> OmxResult<WaitResult> {
    loop {
        {
            let mut fired = lock_state(&notifier.fired)?;
            while !*fired {
                match deadline {
                    None => fired = notifier.wake.wait(fired).map_err(poisoned)?,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        fired = notifier
                            .wake
                            .wait_timeout(fired, deadline - now)
                            .map_err(poisoned)?
                            .0;
                    }
                }
            }
            *fired = false;
        }

        let mut signaled = Vec::with_capacity(events.len());
        for event in events {
            let state = lock_state(&event.state)?;
            if state.destroyed {
                return Err(OmxError::BadParameter("event destroyed while waiting".to_string()));
            }
            signaled.push(state.signaled);
        }

        if signaled.iter().any(|s| *s) {
            return Ok(WaitResult {
                signaled,
                timed_out: false,
            });
        }
        // Reset raced the wakeup; keep waiting unless the deadline has passed.
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(WaitResult {
                signaled,
                timed_out: true,
            });
        }
    }
}

// ============================================================================
// Threads
// ============================================================================

/// Scheduling hint expressed as a nice value; 0 leaves the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadPriority(pub i32);

/// Joinable OS thread created through the abstraction layer.
#[derive(Debug)]
pub struct OsalThread<T> {
    name: String,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> OsalThread<T> {
    /// Spawn `entry` on a new named thread.
    ///
    /// The asynchronous I/O signal is blocked on the new thread before `entry`
    /// runs so it is always delivered to a thread that expects it.
    pub fn spawn<F>(name: &str, priority: ThreadPriority, entry: F) -> OmxResult<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                block_async_io_signal();
                apply_priority(priority);
                entry()
            })
            .map_err(|e| {
                OmxError::InsufficientResources(format!("cannot spawn thread {}: {}", name, e))
            })?;

        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and return its result.
    pub fn join(self) -> OmxResult<T> {
        self.handle
            .join()
            .map_err(|_| OmxError::Undefined(format!("thread {} panicked", self.name)))
    }
}

#[cfg(target_os = "linux")]
fn block_async_io_signal() {
    // SAFETY: the set is initialised by sigemptyset before use and only the
    // calling thread's mask is changed.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGIO);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(target_os = "linux"))]
fn block_async_io_signal() {}

#[cfg(target_os = "linux")]
fn apply_priority(priority: ThreadPriority) {
    if priority.0 == 0 {
        return;
    }
    // SAFETY: plain syscalls on the calling thread's id.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, priority.0)
    };
    if rc != 0 {
        tracing::debug!(nice = priority.0, "thread priority hint not applied");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(_priority: ThreadPriority) {}

// ============================================================================
// Clock
// ============================================================================

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a monotonic clock whose origin is the first call.
pub fn get_time_ms() -> u64 {
    let origin = CLOCK_ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}

pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

// ============================================================================
// Guarded memory
// ============================================================================

const GUARD_WORD: [u8; 4] = 0xACDC_ACDCu32.to_le_bytes();

/// Zeroed allocation followed by a guard word checked when it is released.
#[derive(Debug)]
pub struct GuardedMemory {
    bytes: Vec<u8>,
    len: usize,
    // Not Sync: the owner of the header is the only one touching the bytes.
    _owned: PhantomData<Cell<()>>,
}

impl GuardedMemory {
    pub fn allocate(len: usize) -> OmxResult<Self> {
        if len == 0 {
            return Err(OmxError::BadParameter("zero-length allocation".to_string()));
        }
        let total = len
            .checked_add(GUARD_WORD.len())
            .ok_or_else(|| OmxError::InsufficientResources(format!("allocation of {} bytes", len)))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|_| OmxError::InsufficientResources(format!("allocation of {} bytes", len)))?;
        bytes.resize(len, 0);
        bytes.extend_from_slice(&GUARD_WORD);
        Ok(Self {
            bytes,
            len,
            _owned: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    /// The whole allocation including the guard word. Writing past `len()`
    /// corrupts the guard and is reported by [`GuardedMemory::release`].
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn guard_intact(&self) -> bool {
        self.bytes[self.len..] == GUARD_WORD
    }

    /// Verify the guard and free the allocation.
    pub fn release(self, buffer_id: u32) -> OmxResult<()> {
        if !self.guard_intact() {
            return Err(OmxError::GuardCorrupted {
                buffer_id,
                alloc_len: self.len,
            });
        }
        Ok(())
    }
}
