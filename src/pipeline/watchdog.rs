//! Stall detection for the capture stream.
//!
//! The watchdog is armed when the stream starts and rearmed by every accepted frame. If the
//! deadline passes without a rearm it fires once, and the capture session stops the stream
//! with a timeout fault. An explicit stop disarms it first, so a stopped stream is never
//! stopped again by a late timer.
//!
//! Time comes from a [`Clock`]; tests drive the state machine with a [`ManualClock`]. The
//! timer thread sleeps until the deadline but never longer than the poll interval, so it also
//! notices time jumps of a manual clock.

use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

/// Elapsed time allowed without a frame before the stream is aborted.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);
/// Longest the timer thread sleeps before re-reading the clock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Armed { deadline: Instant },
    Fired,
}

enum Command {
    Wake,
    Shutdown,
}

type FireFn = Arc<dyn Fn() + Send + Sync>;

pub struct Watchdog {
    timeout: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<WatchdogState>>,
    on_fire: OnceLock<FireFn>,
    tx: Sender<Command>,
    rx: Mutex<Option<Receiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Create a disarmed watchdog. No thread runs until [`spawn`](Self::spawn).
    pub fn new(timeout: Duration, poll_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = channel::bounded(4);
        Self {
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            clock,
            state: Arc::new(Mutex::new(WatchdogState::Idle)),
            on_fire: OnceLock::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> WatchdogState {
        *self.state.lock()
    }

    /// Start the timer thread. `on_fire` runs on that thread, without any watchdog lock held.
    pub fn spawn(&self, on_fire: impl Fn() + Send + Sync + 'static) -> io::Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let on_fire: FireFn = Arc::new(on_fire);
        let _ = self.on_fire.set(Arc::clone(&on_fire));

        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let timeout = self.timeout;
        let poll_interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name("camstream-watchdog".into())
            .spawn(move || loop {
                let wait = match *state.lock() {
                    WatchdogState::Armed { deadline } => {
                        Some(deadline.saturating_duration_since(clock.now()).min(poll_interval))
                    }
                    _ => None,
                };

                let command = match wait {
                    Some(wait) => rx.recv_timeout(wait),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match command {
                    Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
                }

                if fire_if_due(&state, clock.now()) {
                    report_fired(timeout);
                    on_fire();
                }
            })?;

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Start watching: the deadline is now + timeout.
    pub fn arm(&self) {
        let deadline = self.clock.now() + self.timeout;
        *self.state.lock() = WatchdogState::Armed { deadline };
        let _ = self.tx.try_send(Command::Wake);
        debug!("Watchdog armed ({} ms)", self.timeout.as_millis());
    }

    /// Push the deadline out after a frame. Ignored unless armed.
    pub fn rearm(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            WatchdogState::Armed { .. } => {
                *state = WatchdogState::Armed {
                    deadline: self.clock.now() + self.timeout,
                };
                true
            }
            _ => false,
        }
    }

    pub fn disarm(&self) {
        let mut state = self.state.lock();
        if matches!(*state, WatchdogState::Armed { .. }) {
            *state = WatchdogState::Idle;
            debug!("Watchdog disarmed");
        }
    }

    /// Evaluate the deadline now, on the calling thread. Returns true if this call fired.
    pub fn check(&self) -> bool {
        if !fire_if_due(&self.state, self.clock.now()) {
            return false;
        }
        report_fired(self.timeout);
        if let Some(on_fire) = self.on_fire.get() {
            on_fire();
        }
        true
    }

    /// Stop the timer thread and wait for it, unless called from that thread.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // the loop exits once the sender is dropped
            let _ = self.tx.try_send(Command::Shutdown);
            return;
        }
        let _ = self.tx.send(Command::Shutdown);
        if handle.join().is_err() {
            error!("Watchdog thread panicked");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fire_if_due(state: &Mutex<WatchdogState>, now: Instant) -> bool {
    let mut state = state.lock();
    match *state {
        WatchdogState::Armed { deadline } if now >= deadline => {
            *state = WatchdogState::Fired;
            true
        }
        _ => false,
    }
}

fn report_fired(timeout: Duration) {
    error!(
        "No frames received for {} ms, aborting stream",
        timeout.as_millis()
    );
    metrics::counter!("camstream_watchdog_fired_total").increment(1);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn watchdog(clock: &Arc<ManualClock>) -> (Watchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let watchdog = Watchdog::new(DEFAULT_TIMEOUT, DEFAULT_POLL_INTERVAL, clock.clone());
        let counter = Arc::clone(&fired);
        watchdog
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        (watchdog, fired)
    }

    fn wait_for(fired: &AtomicUsize, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if fired.load(Ordering::SeqCst) == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn idle_watchdog_never_fires() {
        let clock = ManualClock::new();
        let (watchdog, fired) = watchdog(&clock);
        clock.advance(Duration::from_secs(60));
        assert!(!watchdog.check());
        assert_eq!(watchdog.state(), WatchdogState::Idle);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fires_once_after_timeout() {
        let clock = ManualClock::new();
        let (watchdog, fired) = watchdog(&clock);
        watchdog.arm();

        clock.advance(Duration::from_millis(3999));
        assert!(!watchdog.check());

        clock.advance(Duration::from_millis(2));
        assert!(wait_for(&fired, 1));
        assert_eq!(watchdog.state(), WatchdogState::Fired);
        assert!(!watchdog.check());
        assert!(!watchdog.rearm());
    }

    #[test]
    fn rearming_keeps_it_quiet() {
        let clock = ManualClock::new();
        let (watchdog, fired) = watchdog(&clock);
        watchdog.arm();

        for _ in 0..50 {
            clock.advance(Duration::from_millis(1000));
            assert!(watchdog.rearm());
            assert!(!watchdog.check());
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(matches!(watchdog.state(), WatchdogState::Armed { .. }));
    }

    #[test]
    fn disarm_prevents_firing() {
        let clock = ManualClock::new();
        let (watchdog, fired) = watchdog(&clock);
        watchdog.arm();
        watchdog.disarm();

        clock.advance(Duration::from_secs(10));
        assert!(!watchdog.check());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn real_clock_fires_on_its_own() {
        let fired = Arc::new(AtomicUsize::new(0));
        let watchdog = Watchdog::new(
            Duration::from_millis(30),
            DEFAULT_POLL_INTERVAL,
            Arc::new(SystemClock),
        );
        let counter = Arc::clone(&fired);
        watchdog
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        watchdog.arm();
        assert!(wait_for(&fired, 1));
    }

    #[test]
    fn shutdown_joins_thread() {
        let clock = ManualClock::new();
        let (watchdog, _fired) = watchdog(&clock);
        watchdog.arm();
        watchdog.shutdown();
        assert!(watchdog.worker.lock().is_none());
    }
}
