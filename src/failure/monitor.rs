use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::address::SimulatorAddress;
use crate::system::clock::{current_time_ms, duration_to_ms};
use crate::system::shutdown::{ShutdownReceiver, wait_for_shutdown};

use super::markers::{MarkerKind, remove_marker, scan_markers};
use super::{Failure, FailureType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub success: bool,
}

/// Handle on a supervised worker process.
pub trait ProcessHandle: Send {
    /// Non-blocking; `None` while the process is alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    fn poll_exit(&mut self) -> std::io::Result<Option<ExitOutcome>>;

    /// Starts killing the process without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be delivered.
    fn terminate(&mut self) -> std::io::Result<()>;

    fn pid(&self) -> Option<u32> {
        None
    }
}

impl ProcessHandle for tokio::process::Child {
    fn poll_exit(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        Ok(self.try_wait()?.map(|status| ExitOutcome {
            code: status.code(),
            success: status.success(),
        }))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.start_kill()
    }

    fn pid(&self) -> Option<u32> {
        self.id()
    }
}

/// Where detected failures go; on the agent this forwards to the coordinator.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn report(&self, failure: Failure);
}

pub struct SupervisedWorker {
    address: SimulatorAddress,
    directory: PathBuf,
    last_seen_ms: AtomicU64,
    ignore_failures: AtomicBool,
    termination_requested: AtomicBool,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
}

impl SupervisedWorker {
    #[must_use]
    pub const fn address(&self) -> SimulatorAddress {
        self.address
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Acquire)
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_seen_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_ignoring_failures(&self) -> bool {
        self.ignore_failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|process| process.pid())
    }

    fn terminate(&self) {
        self.termination_requested.store(true, Ordering::Release);
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(process) = process.as_mut()
            && let Err(err) = process.terminate()
        {
            warn!("Failed to terminate worker {}: {}", self.address, err);
        }
    }

    fn poll_exit(&self) -> Option<ExitOutcome> {
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        match process.as_mut().map(|process| process.poll_exit()) {
            Some(Ok(outcome)) => outcome,
            Some(Err(err)) => {
                warn!("Failed to poll worker {}: {}", self.address, err);
                None
            }
            None => None,
        }
    }
}

/// Agent-side watchdog over the workers this agent spawned.
///
/// Each [`check`](Self::check) cycle consumes marker files from every worker
/// directory and, independently, inspects process exits and (once enabled)
/// last-seen timeouts. A worker with a process failure leaves the supervised
/// set in the same cycle, so later cycles cannot report it again.
pub struct FailureMonitor {
    agent: SimulatorAddress,
    workers: DashMap<SimulatorAddress, Arc<SupervisedWorker>>,
    timeout_detection: AtomicBool,
    last_seen_timeout: Duration,
}

impl FailureMonitor {
    #[must_use]
    pub fn new(agent: SimulatorAddress, last_seen_timeout: Duration) -> Self {
        Self {
            agent,
            workers: DashMap::new(),
            timeout_detection: AtomicBool::new(false),
            last_seen_timeout,
        }
    }

    pub fn supervise(
        &self,
        address: SimulatorAddress,
        directory: PathBuf,
        process: Option<Box<dyn ProcessHandle>>,
    ) -> Arc<SupervisedWorker> {
        let worker = Arc::new(SupervisedWorker {
            address,
            directory,
            last_seen_ms: AtomicU64::new(current_time_ms()),
            ignore_failures: AtomicBool::new(false),
            termination_requested: AtomicBool::new(false),
            process: Mutex::new(process),
        });
        self.workers.insert(address, worker.clone());
        debug!("Agent {} supervising {}", self.agent, address);
        worker
    }

    #[must_use]
    pub fn worker(&self, address: &SimulatorAddress) -> Option<Arc<SupervisedWorker>> {
        self.workers.get(address).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn addresses(&self) -> Vec<SimulatorAddress> {
        let mut addresses: Vec<SimulatorAddress> =
            self.workers.iter().map(|entry| *entry.key()).collect();
        addresses.sort();
        addresses
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Records traffic from `address` (or any of its tests).
    pub fn touch(&self, address: &SimulatorAddress) {
        if let Some(worker) = self.workers.get(address) {
            worker.touch(current_time_ms());
        }
    }

    pub fn start_timeout_detection(&self) {
        if !self.timeout_detection.swap(true, Ordering::AcqRel) {
            info!("Agent {} started worker timeout detection", self.agent);
            let now_ms = current_time_ms();
            for worker in &self.workers {
                worker.touch(now_ms);
            }
        }
    }

    pub fn stop_timeout_detection(&self) {
        if self.timeout_detection.swap(false, Ordering::AcqRel) {
            info!("Agent {} stopped worker timeout detection", self.agent);
        }
    }

    #[must_use]
    pub fn is_timeout_detection_enabled(&self) -> bool {
        self.timeout_detection.load(Ordering::Acquire)
    }

    /// Returns `false` when the worker is not supervised.
    pub fn ignore_failures(&self, address: &SimulatorAddress) -> bool {
        self.workers.get(address).is_some_and(|worker| {
            worker.ignore_failures.store(true, Ordering::Release);
            true
        })
    }

    /// Kills the worker; its exit is then expected and not reported.
    pub fn request_termination(&self, address: &SimulatorAddress) -> bool {
        let Some(worker) = self.worker(address) else {
            return false;
        };
        info!("Terminating worker {}", address);
        worker.terminate();
        true
    }

    pub fn release(&self, address: &SimulatorAddress) -> Option<Arc<SupervisedWorker>> {
        self.workers.remove(address).map(|(_, worker)| worker)
    }

    /// Runs one watchdog cycle and returns the failures to report.
    #[must_use]
    pub fn check(&self, now_ms: u64) -> Vec<Failure> {
        let workers: Vec<Arc<SupervisedWorker>> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut failures = Vec::new();
        for worker in workers {
            self.check_markers(&worker, &mut failures);
            self.check_liveness(&worker, now_ms, &mut failures);
        }
        failures
    }

    /// Runs [`check`](Self::check) every `interval` until shutdown.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        sink: Arc<dyn FailureSink>,
        mut shutdown_rx: ShutdownReceiver,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = wait_for_shutdown(&mut shutdown_rx) => break,
                _ = ticker.tick() => {}
            }
            let monitor = self.clone();
            let failures = match tokio::task::spawn_blocking(move || {
                monitor.check(current_time_ms())
            })
            .await
            {
                Ok(failures) => failures,
                Err(err) => {
                    warn!("Failure monitor cycle aborted: {}", err);
                    continue;
                }
            };
            for failure in failures {
                sink.report(failure).await;
            }
        }
        debug!("Failure monitor of {} stopped", self.agent);
    }

    fn check_markers(&self, worker: &SupervisedWorker, failures: &mut Vec<Failure>) {
        let markers = match scan_markers(worker.directory()) {
            Ok(markers) => markers,
            Err(err) => {
                warn!("Failed to scan {}: {}", worker.directory().display(), err);
                return;
            }
        };
        for marker in markers {
            // Deleting first means a marker is reported by exactly one cycle.
            match remove_marker(&marker.path) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!("Failed to remove marker {}: {}", marker.path.display(), err);
                    continue;
                }
            }
            match marker.kind {
                MarkerKind::Exception(exception) => {
                    let message = match exception.phase {
                        Some(phase) => format!("{} in {}", exception.message, phase),
                        None => exception.message,
                    };
                    let mut failure =
                        Failure::new(FailureType::WorkerException, worker.address(), message);
                    failure.test_index = exception.test_index;
                    self.emit(worker, failure, failures);
                }
                MarkerKind::Oom => {
                    if self.release(&worker.address()).is_some() {
                        worker.terminate();
                        let failure = Failure::new(
                            FailureType::WorkerOom,
                            worker.address(),
                            "Worker ran out of memory",
                        );
                        self.emit(worker, failure, failures);
                    }
                }
            }
        }
    }

    fn check_liveness(&self, worker: &SupervisedWorker, now_ms: u64, failures: &mut Vec<Failure>) {
        if self.worker(&worker.address()).is_none() {
            return;
        }
        if let Some(outcome) = worker.poll_exit() {
            if self.release(&worker.address()).is_none() {
                return;
            }
            if worker.termination_requested.load(Ordering::Acquire) {
                info!("Worker {} terminated", worker.address());
                return;
            }
            let (failure_type, message) = if outcome.success {
                (
                    FailureType::WorkerNormalExit,
                    "Worker exited unexpectedly with code 0".to_owned(),
                )
            } else {
                (
                    FailureType::WorkerAbnormalExit,
                    outcome.code.map_or_else(
                        || "Worker was killed by a signal".to_owned(),
                        |code| format!("Worker exited with code {}", code),
                    ),
                )
            };
            let failure = Failure::new(failure_type, worker.address(), message);
            self.emit(worker, failure, failures);
            return;
        }

        if !self.is_timeout_detection_enabled() {
            return;
        }
        let silent_ms = now_ms.saturating_sub(worker.last_seen_ms());
        if silent_ms > duration_to_ms(self.last_seen_timeout)
            && self.release(&worker.address()).is_some()
        {
            worker.terminate();
            let failure = Failure::new(
                FailureType::WorkerTimeout,
                worker.address(),
                format!("Worker not seen for {}ms", silent_ms),
            );
            self.emit(worker, failure, failures);
        }
    }

    fn emit(&self, worker: &SupervisedWorker, failure: Failure, failures: &mut Vec<Failure>) {
        if worker.is_ignoring_failures() {
            info!("Ignoring failure of {}: {}", worker.address(), failure);
            return;
        }
        warn!("Detected failure: {}", failure);
        failures.push(failure);
    }
}
