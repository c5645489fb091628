//! The interception loop: divert, attribute, shape, re-inject.
//!
//! One worker thread owns the divert handle. For every packet it resolves the
//! owning process and, when that process is in the throttle set, holds the
//! packet until its token bucket can pay for it. Everything else goes straight
//! back to the kernel untouched.

use crate::backends::divert::{DivertBackend, DivertHandle, OUTBOUND_IPV4_FILTER};
use crate::backends::process::ProcessUtils;
use crate::packet;
use crate::resolver::ProcessResolver;
use crate::shaper::{Clock, SystemClock, TokenBucketShaper};
use crate::status::{Severity, StatusSink};
use crate::throttle_set::ThrottleSet;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a receive may block before the stop flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `stop` waits for the worker to let go of the handle
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Packet counters since the interceptor was created
#[derive(Debug, Default)]
pub struct InterceptorStats {
    pub dequeued: AtomicU64,
    pub forwarded: AtomicU64,
    pub delayed: AtomicU64,
    pub unresolved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dequeued: u64,
    pub forwarded: u64,
    pub delayed: u64,
    pub unresolved: u64,
}

impl InterceptorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dequeued: self.dequeued.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Everything the worker reads per packet
struct LoopContext {
    throttle_set: ThrottleSet,
    rate: Arc<AtomicU64>,
    stats: Arc<InterceptorStats>,
}

pub struct Interceptor {
    backend: Box<dyn DivertBackend>,
    process_utils: Arc<dyn ProcessUtils>,
    throttle_set: ThrottleSet,
    rate: Arc<AtomicU64>,
    cache_ttl: Duration,
    status: Arc<dyn StatusSink>,
    stats: Arc<InterceptorStats>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl Interceptor {
    pub fn new(
        backend: Box<dyn DivertBackend>,
        process_utils: Arc<dyn ProcessUtils>,
        throttle_set: ThrottleSet,
        rate: Arc<AtomicU64>,
        cache_ttl: Duration,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            backend,
            process_utils,
            throttle_set,
            rate,
            cache_ttl,
            status,
            stats: Arc::new(InterceptorStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// False once the worker has exited, including after a capture error
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_with_clock(SystemClock)
    }

    /// Open the divert handle and spawn the worker. A no-op when already running.
    pub fn start_with_clock<C: Clock + 'static>(&mut self, clock: C) -> Result<()> {
        if self.is_running() && !self.is_stopping() {
            return Ok(());
        }
        // A worker that died on a capture error, or one still forwarding its last
        // shaped packet after `stop`. Its handle must be gone before a new open.
        self.reap();

        let handle = self
            .backend
            .open(OUTBOUND_IPV4_FILTER)
            .with_context(|| format!("Failed to start {} capture", self.backend.name()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let ctx = LoopContext {
            throttle_set: self.throttle_set.clone(),
            rate: self.rate.clone(),
            stats: self.stats.clone(),
        };
        let resolver = ProcessResolver::new(self.process_utils.clone(), self.cache_ttl);
        let shaper = TokenBucketShaper::with_clock(clock);
        let running = self.running.clone();
        let status = self.status.clone();
        let worker_stop = stop.clone();

        self.running.store(true, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name("pidshaper-divert".to_string())
            .spawn(move || {
                let mut handle = handle;
                let mut resolver = resolver;
                let mut shaper = shaper;
                let result = run_loop(
                    handle.as_mut(),
                    &ctx,
                    &mut resolver,
                    &mut shaper,
                    &worker_stop,
                );
                running.store(false, Ordering::SeqCst);
                // Release the kernel side before anyone waiting on `done` resumes
                drop(handle);

                if let Err(e) = result {
                    log::error!("Packet capture failed: {:#}", e);
                    status.notify(&format!("Capture stopped: {:#}", e), Severity::Error);
                }
                let _ = done_tx.send(());
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e).context("Failed to spawn capture thread");
            }
        };

        self.worker = Some(Worker { stop, done, thread });
        log::info!("Packet interception started ({})", self.backend.name());
        Ok(())
    }

    /// Ask the worker to exit and wait for it, at most one second. Returns
    /// whether the worker finished within that time.
    ///
    /// A worker still sleeping off a shaped packet is kept, and `is_running`
    /// stays true until it has forwarded that packet and closed its handle.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        worker.stop.store(true, Ordering::SeqCst);

        match worker.done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    log::error!("Capture thread panicked");
                }
                self.running.store(false, Ordering::SeqCst);
                log::info!("Packet interception stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Capture thread still shaping after {:?}, it stops after the current packet",
                    STOP_TIMEOUT
                );
                self.worker = Some(worker);
                false
            }
        }
    }

    fn is_stopping(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.stop.load(Ordering::SeqCst))
    }

    /// Join the previous worker, blocking until it has released its handle
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Process packets until `stop` is set or the handle fails.
///
/// Per-packet problems (unparseable headers, unknown owner) forward the packet
/// immediately. Only an error from the handle itself ends the loop.
fn run_loop<C: Clock>(
    handle: &mut dyn DivertHandle,
    ctx: &LoopContext,
    resolver: &mut ProcessResolver,
    shaper: &mut TokenBucketShaper<C>,
    stop: &AtomicBool,
) -> Result<()> {
    while !stop.load(Ordering::SeqCst) {
        let Some(packet) = handle.recv(POLL_INTERVAL)? else {
            continue;
        };
        ctx.stats.dequeued.fetch_add(1, Ordering::Relaxed);

        if !stop.load(Ordering::SeqCst) {
            let owner = packet::parse_tuple(&packet.data).and_then(|tuple| resolver.resolve(&tuple));
            match owner {
                Some(pid) if ctx.throttle_set.contains(pid) => {
                    let rate = ctx.rate.load(Ordering::Relaxed);
                    if !shaper.admit(pid, packet.len(), rate).is_zero() {
                        ctx.stats.delayed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Some(_) => {}
                None => {
                    ctx.stats.unresolved.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        handle.send(packet)?;
        ctx.stats.forwarded.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::divert::DivertedPacket;
    use crate::backends::process::ConnectionMap;
    use crate::backends::BackendPriority;
    use crate::packet::tests::ipv4_packet;
    use crate::process::Protocol;
    use crate::resolver::tests::{FakeProcessUtils, conn};
    use crate::shaper::tests::ManualClock;
    use crate::status::tests::CollectingSink;
    use std::collections::{HashSet, VecDeque};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Shared script for the fake handle
    #[derive(Default)]
    struct Wire {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
        fail_when_empty: AtomicBool,
        closed: AtomicBool,
        open_handles: AtomicUsize,
        peak_open_handles: AtomicUsize,
    }

    struct FakeHandle(Arc<Wire>);

    impl DivertHandle for FakeHandle {
        fn recv(&mut self, timeout: Duration) -> Result<Option<DivertedPacket>> {
            let next = self.0.inbound.lock().unwrap().pop_front();
            match next {
                Some(data) => Ok(Some(DivertedPacket::detached(data))),
                None if self.0.fail_when_empty.load(Ordering::SeqCst) => {
                    anyhow::bail!("driver unloaded")
                }
                None => {
                    std::thread::sleep(timeout.min(Duration::from_millis(2)));
                    Ok(None)
                }
            }
        }

        fn send(&mut self, packet: DivertedPacket) -> Result<()> {
            self.0.sent.lock().unwrap().push(packet.data);
            Ok(())
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.0.open_handles.fetch_sub(1, Ordering::SeqCst);
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeBackend(Arc<Wire>);

    impl DivertBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn open(&self, filter: &str) -> Result<Box<dyn DivertHandle>> {
            assert_eq!(filter, OUTBOUND_IPV4_FILTER);
            self.0.closed.store(false, Ordering::SeqCst);
            let open = self.0.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak_open_handles.fetch_max(open, Ordering::SeqCst);
            Ok(Box::new(FakeHandle(self.0.clone())))
        }
    }

    const APP_PORT: u16 = 50000;
    const APP_PID: i32 = 100;

    fn app_packet(payload_len: usize) -> Vec<u8> {
        ipv4_packet(
            Protocol::Tcp,
            Ipv4Addr::new(192, 168, 1, 10),
            APP_PORT,
            Ipv4Addr::new(1, 1, 1, 1),
            443,
            payload_len,
        )
    }

    fn setup(rate: u64) -> (Interceptor, Arc<Wire>, ThrottleSet, Arc<CollectingSink>) {
        let wire = Arc::new(Wire::default());
        let utils = Arc::new(FakeProcessUtils::default());
        let mut map = ConnectionMap::default();
        map.tcp_connections.push(conn(APP_PORT, Some(("1.1.1.1", 443)), 9));
        map.socket_to_pid.insert(9, (APP_PID, "app".to_string()));
        utils.set_connections(Some(map));

        let set = ThrottleSet::new();
        let sink = Arc::new(CollectingSink::default());
        let interceptor = Interceptor::new(
            Box::new(FakeBackend(wire.clone())),
            utils,
            set.clone(),
            Arc::new(AtomicU64::new(rate)),
            Duration::from_secs(60),
            sink.clone(),
        );
        (interceptor, wire, set, sink)
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_unresolved_packets_pass_unchanged() {
        let (mut interceptor, wire, _set, _sink) = setup(1024);
        let stranger = ipv4_packet(
            Protocol::Udp,
            Ipv4Addr::new(192, 168, 1, 10),
            61000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
            32,
        );
        let garbage = vec![0xde, 0xad, 0xbe, 0xef];
        wire.inbound
            .lock()
            .unwrap()
            .extend([stranger.clone(), garbage.clone()]);

        interceptor.start().unwrap();
        wait_until("forwarding", || interceptor.stats().forwarded == 2);
        assert!(interceptor.stop());

        assert_eq!(*wire.sent.lock().unwrap(), vec![stranger, garbage]);
        let stats = interceptor.stats();
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.delayed, 0);
        assert!(wire.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_throttled_process_is_shaped() {
        let (mut interceptor, wire, set, _sink) = setup(1024);
        set.add_group(&HashSet::from([APP_PID]));
        // 40 bytes of headers + 160 payload = 200 bytes each
        for _ in 0..10 {
            wire.inbound.lock().unwrap().push_back(app_packet(160));
        }

        let clock = ManualClock::new();
        interceptor.start_with_clock(clock.clone()).unwrap();
        wait_until("shaping", || interceptor.stats().forwarded == 10);
        interceptor.stop();

        let expected = (10.0 * 200.0 - 1024.0) / 1024.0;
        assert!((clock.total_slept().as_secs_f64() - expected).abs() < 1e-6);
        assert_eq!(interceptor.stats().delayed, 5);
        assert_eq!(wire.sent.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_unthrottled_process_is_not_shaped() {
        let (mut interceptor, wire, _set, _sink) = setup(1024);
        for _ in 0..10 {
            wire.inbound.lock().unwrap().push_back(app_packet(1000));
        }

        let clock = ManualClock::new();
        interceptor.start_with_clock(clock.clone()).unwrap();
        wait_until("forwarding", || interceptor.stats().forwarded == 10);
        interceptor.stop();

        assert_eq!(clock.total_slept(), Duration::ZERO);
        assert_eq!(interceptor.stats().unresolved, 0);
    }

    #[test]
    fn test_stop_forwards_everything_dequeued() {
        let (mut interceptor, wire, set, _sink) = setup(1_000_000);
        set.add_group(&HashSet::from([APP_PID]));
        for _ in 0..5000 {
            wire.inbound.lock().unwrap().push_back(app_packet(500));
        }

        interceptor.start_with_clock(ManualClock::new()).unwrap();
        wait_until("some traffic", || interceptor.stats().forwarded > 10);
        assert!(interceptor.stop());

        let stats = interceptor.stats();
        assert_eq!(stats.forwarded, stats.dequeued);
        assert_eq!(wire.sent.lock().unwrap().len() as u64, stats.forwarded);
        assert!(!interceptor.is_running());
    }

    #[test]
    fn test_handle_error_stops_loop() {
        let (mut interceptor, wire, _set, sink) = setup(1024);
        wire.inbound.lock().unwrap().push_back(app_packet(10));
        wire.fail_when_empty.store(true, Ordering::SeqCst);

        interceptor.start().unwrap();
        wait_until("worker exit", || !interceptor.is_running());
        wait_until("error status", || sink.last().is_some());

        let (message, severity) = sink.last().unwrap();
        assert_eq!(severity, Severity::Error);
        assert!(message.contains("driver unloaded"));
        assert_eq!(interceptor.stats().forwarded, 1);
        wait_until("handle release", || wire.closed.load(Ordering::SeqCst));

        // Can be started again once the cause is gone
        wire.fail_when_empty.store(false, Ordering::SeqCst);
        interceptor.start().unwrap();
        assert!(interceptor.is_running());
        assert!(interceptor.stop());
    }

    #[test]
    fn test_restart_waits_for_shaped_packet() {
        let (mut interceptor, wire, set, _sink) = setup(1024);
        set.add_group(&HashSet::from([APP_PID]));
        // 2000 bytes each: ~0.95 s wait for the first, ~1.95 s for the second
        for _ in 0..2 {
            wire.inbound.lock().unwrap().push_back(app_packet(1960));
        }

        interceptor.start().unwrap();
        wait_until("second packet", || interceptor.stats().dequeued == 2);

        // The second packet is still being shaped past the stop timeout
        assert!(!interceptor.stop());
        assert!(interceptor.is_running());
        assert!(!wire.closed.load(Ordering::SeqCst));

        interceptor.start().unwrap();
        assert_eq!(wire.peak_open_handles.load(Ordering::SeqCst), 1);
        let stats = interceptor.stats();
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.forwarded, stats.dequeued);
        assert!(interceptor.is_running());

        assert!(interceptor.stop());
        assert_eq!(wire.open_handles.load(Ordering::SeqCst), 0);
    }
}
