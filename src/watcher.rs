//! Watcher supervisor: composes the loader, ring-buffer reader, and rule
//! matcher into a start/stop lifecycle, owning the background task and the
//! output channel (§4.10).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::alert::AlertEvent;
use crate::attach::{self, PerfEventFd};
use crate::elf;
use crate::error::{Error, Result};
use crate::event;
use crate::maps::{self, MapFd};
use crate::metrics::Metrics;
use crate::options::Options;
use crate::program::{self, ProgramFd};
use crate::reloc;
use crate::ringbuf::{RingBufferCloser, RingBufferReader};
use crate::rules::{Rule, RuleMatcher};

/// The runtime companion of a parsed ELF image: every kernel resource
/// opened during `start`. Field declaration order is load-bearing — Rust
/// drops struct fields top to bottom, and teardown must close perf events,
/// then programs, then maps, then unmap the ring buffer, in that order
/// (§9 "Ownership of kernel resources").
#[allow(dead_code)]
struct LoadedObject {
    perf_fds: Vec<PerfEventFd>,
    programs: BTreeMap<String, ProgramFd>,
    maps: BTreeMap<String, MapFd>,
    ring_buffer: RingBufferReader,
}

fn load_bpf_object(elf_bytes: &[u8], options: &Options) -> Result<LoadedObject> {
    let image = elf::parse(elf_bytes)?;
    image.validate()?;

    let (map_fds, ring_buffer_size) = maps::create_all(&image.maps, options.default_ring_buffer_size)?;
    let map_fd_ints: BTreeMap<String, i32> = map_fds
        .iter()
        .map(|(name, fd)| (name.clone(), fd.as_raw_fd()))
        .collect();

    let mut programs = BTreeMap::new();
    let mut perf_fds = Vec::new();

    for (section_name, instructions) in &image.programs {
        let mut instrs = instructions.clone();
        if let Some(relocations) = image.relocations.get(section_name) {
            reloc::apply(&mut instrs, relocations, &map_fd_ints)?;
        }

        let prog_fd = program::load(section_name, &instrs, &image.license)?;

        if let Some((group, name)) = attach::parse_tracepoint_section(section_name) {
            let mut attached = attach::attach_to_all_cpus(group, name, prog_fd.as_raw_fd())?;
            perf_fds.append(&mut attached);
        }

        programs.insert(section_name.clone(), prog_fd);
    }

    let events_map_fd = map_fds
        .get("execve_events")
        .ok_or_else(|| Error::MissingMap("execve_events".to_string()))?;
    let ring_buffer = RingBufferReader::new(events_map_fd.as_raw_fd(), ring_buffer_size, options.clone())?;

    Ok(LoadedObject {
        perf_fds,
        programs,
        maps: map_fds,
        ring_buffer,
    })
}

enum WatcherState {
    Idle,
    Running {
        cancelled: Arc<AtomicBool>,
        closer: RingBufferCloser,
        handle: JoinHandle<()>,
        receiver: Receiver<AlertEvent>,
    },
    Stopping,
    Stopped,
}

/// Composes the ELF loader, ring-buffer reader, and rule matcher into a
/// start/stop lifecycle (§4.10). Construction takes the rule list
/// (non-`PROCESS` rules are filtered out) and an optional pre-compiled ELF
/// byte slice; the structured log sink is the ambient `log` facade rather
/// than an explicit parameter — a caller who wants a private sink installs
/// their own `log::Log` implementation (§6 "Structured log sink").
pub struct Watcher {
    rules: Arc<RuleMatcher>,
    elf_bytes: Mutex<Option<Vec<u8>>>,
    metrics: Arc<Metrics>,
    options: Options,
    state: Mutex<WatcherState>,
}

impl Watcher {
    pub fn new(rules: Vec<Rule>, options: Options) -> Self {
        Self {
            rules: Arc::new(RuleMatcher::new(&rules)),
            elf_bytes: Mutex::new(None),
            metrics: Arc::new(Metrics::new()),
            options,
            state: Mutex::new(WatcherState::Idle),
        }
    }

    pub fn with_bpf_object(rules: Vec<Rule>, elf_bytes: Vec<u8>, options: Options) -> Self {
        let watcher = Self::new(rules, options);
        *watcher.elf_bytes.lock().unwrap() = Some(elf_bytes);
        watcher
    }

    pub fn set_bpf_object(&self, elf_bytes: Vec<u8>) {
        *self.elf_bytes.lock().unwrap() = Some(elf_bytes);
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Loads the BPF object and spawns the reader task. A no-op success if
    /// already `Running`; fails with [`Error::MissingBpfObject`] if no ELF
    /// bytes were ever supplied. Any failure leaves the watcher `Idle` with
    /// every partially opened resource already unwound (§4.10, §7).
    pub fn start(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        match &*guard {
            WatcherState::Running { .. } => return Ok(()),
            WatcherState::Idle => {}
            WatcherState::Stopping | WatcherState::Stopped => {
                return Err(Error::unsupported("watcher has already stopped"));
            }
        }

        let elf_bytes = self
            .elf_bytes
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::MissingBpfObject)?;

        let loaded = load_bpf_object(&elf_bytes, &self.options)?;

        let (sender, receiver) = crossbeam_channel::bounded(self.options.channel_capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let closer = loaded.ring_buffer.closer();

        let handle = spawn_reader_thread(loaded, self.rules.clone(), sender, cancelled.clone(), self.metrics.clone());

        *guard = WatcherState::Running {
            cancelled,
            closer,
            handle,
            receiver,
        };
        log::info!("watcher started");
        Ok(())
    }

    /// Returns the receiving end of the output channel, if running.
    pub fn events(&self) -> Option<Receiver<AlertEvent>> {
        match &*self.state.lock().unwrap() {
            WatcherState::Running { receiver, .. } => Some(receiver.clone()),
            _ => None,
        }
    }

    /// Cancels the background task, closes the ring buffer to unblock it,
    /// joins it, and drops the loaded object. Infallible and idempotent
    /// (§4.10, §7).
    pub fn stop(&self) {
        let previous = {
            let mut guard = self.state.lock().unwrap();
            match &*guard {
                // Idle has no resources to release; stop is a no-op. Stopped
                // and Stopping are already terminal/in-flight — idempotent.
                WatcherState::Idle | WatcherState::Stopped | WatcherState::Stopping => {
                    return;
                }
                WatcherState::Running { .. } => {
                    std::mem::replace(&mut *guard, WatcherState::Stopping)
                }
            }
        };

        if let WatcherState::Running {
            cancelled,
            closer,
            handle,
            ..
        } = previous
        {
            cancelled.store(true, Ordering::Release);
            closer.close();
            let _ = handle.join();
            log::info!("watcher stopped");
        }

        *self.state.lock().unwrap() = WatcherState::Stopped;
    }
}

fn spawn_reader_thread(
    loaded: LoadedObject,
    rules: Arc<RuleMatcher>,
    sender: Sender<AlertEvent>,
    cancelled: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let loaded = loaded;
        while let Some(raw) = loaded.ring_buffer.read_next(&cancelled) {
            metrics.inc_events();
            let Some(exec_event) = event::decode_exec_event(&raw) else {
                metrics.inc_dropped();
                log::warn!(len = raw.len(); "dropping ring-buffer record of unexpected size");
                continue;
            };

            let Some(rule) = rules.matched_rule(&exec_event) else {
                continue;
            };

            let alert = AlertEvent::for_process_match(rule, &exec_event);
            match sender.try_send(alert) {
                Ok(()) => {
                    metrics.inc_alerts_emitted();
                    log::info!(rule = rule.name.as_str(); "alert emitted");
                }
                Err(TrySendError::Full(_)) => {
                    metrics.inc_channel_full();
                    metrics.inc_dropped();
                    log::warn!("alert channel full, dropping event");
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        // `loaded` drops here: perf fds, then programs, then maps, then the
        // ring buffer's mmaps, in that declaration order.
    })
}
