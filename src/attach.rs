//! Tracepoint attacher: resolves the tracepoint numeric id, opens one perf
//! event per online CPU, and binds the program (§4.6).

use std::fs;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::syscall::{self, PerfEventAttr, PERF_ATTR_FLAG_DISABLED, PERF_TYPE_TRACEPOINT};

const TRACEFS_BASE: &str = "/sys/kernel/tracing/events";
const DEBUGFS_BASE: &str = "/sys/kernel/debug/tracing/events";

/// An owning perf-event file descriptor.
#[derive(Debug)]
pub struct PerfEventFd(RawFd);

impl PerfEventFd {
    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for PerfEventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Splits a `tracepoint/<group>/<name>` section name into its group and
/// name components.
pub fn parse_tracepoint_section(section_name: &str) -> Option<(&str, &str)> {
    let rest = section_name.strip_prefix("tracepoint/")?;
    let (group, name) = rest.split_once('/')?;
    Some((group, name))
}

/// Resolves the tracepoint numeric id, trying `tracefs` first and falling
/// back to `debugfs` (§9 open question, resolved in favour of tracefs).
pub fn resolve_tracepoint_id(group: &str, name: &str) -> Result<u32> {
    for base in [TRACEFS_BASE, DEBUGFS_BASE] {
        let path = format!("{base}/{group}/{name}/id");
        if let Ok(contents) = fs::read_to_string(&path) {
            return contents
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::malformed_elf(format!("non-numeric tracepoint id at {path}")));
        }
    }
    Err(Error::unsupported(format!(
        "tracepoint {group}/{name} not found under tracefs or debugfs; is the tracing filesystem mounted?"
    )))
}

/// Enumerates online CPU numbers from `/sys/devices/system/cpu/online`
/// (e.g. `"0-3,6"`).
pub fn online_cpus() -> Result<Vec<i32>> {
    let path = "/sys/devices/system/cpu/online";
    let contents =
        fs::read_to_string(path).map_err(|e| Error::io(e, path.to_string()))?;
    parse_cpu_list(contents.trim())
}

fn parse_cpu_list(spec: &str) -> Result<Vec<i32>> {
    let mut cpus = Vec::new();
    if spec.is_empty() {
        return Ok(cpus);
    }
    for part in spec.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: i32 = start
                .parse()
                .map_err(|_| Error::malformed_elf("invalid CPU range"))?;
            let end: i32 = end
                .parse()
                .map_err(|_| Error::malformed_elf("invalid CPU range"))?;
            cpus.extend(start..=end);
        } else {
            cpus.push(
                part.parse()
                    .map_err(|_| Error::malformed_elf("invalid CPU id"))?,
            );
        }
    }
    Ok(cpus)
}

/// Attaches `program_fd` to the tracepoint on every online CPU (§4.6
/// steps 2-3). On any failure, all perf fds opened so far for this call
/// are dropped (closed) before the error is returned.
pub fn attach_to_all_cpus(group: &str, name: &str, program_fd: RawFd) -> Result<Vec<PerfEventFd>> {
    let tracepoint_id = resolve_tracepoint_id(group, name)?;
    let cpus = online_cpus()?;

    let mut opened = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        match attach_one_cpu(tracepoint_id, cpu, program_fd) {
            Ok(fd) => opened.push(fd),
            Err(e) => {
                // `opened` drops here, closing every perf fd opened so far.
                return Err(e);
            }
        }
    }
    Ok(opened)
}

fn attach_one_cpu(tracepoint_id: u32, cpu: i32, program_fd: RawFd) -> Result<PerfEventFd> {
    let attr = PerfEventAttr {
        type_: PERF_TYPE_TRACEPOINT,
        size: std::mem::size_of::<PerfEventAttr>() as u32,
        config: tracepoint_id as u64,
        flags: PERF_ATTR_FLAG_DISABLED,
        ..Default::default()
    };

    let fd = syscall::perf_event_open(&attr, -1, cpu, -1, 0)?;
    let perf_fd = PerfEventFd(fd);
    syscall::ioctl_set_bpf(perf_fd.as_raw_fd(), program_fd)?;
    syscall::ioctl_enable(perf_fd.as_raw_fd())?;
    Ok(perf_fd)
}
