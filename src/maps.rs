//! Map factory: creates kernel BPF maps from parsed specs (§4.3).

use std::os::unix::io::RawFd;

use crate::elf::MapSpec;
use crate::error::{Error, Result};
use crate::syscall::{self, BPF_MAP_TYPE_RINGBUF};

/// An owning BPF map file descriptor. `close(2)` is called exactly once,
/// on drop (§9 "Ownership of kernel resources").
#[derive(Debug)]
pub struct MapFd(RawFd);

impl MapFd {
    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for MapFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn page_size() -> u32 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}

/// Creates one map per entry in `specs`, synthesising an `execve_events`
/// ring buffer (16 MiB) if none was present in the ELF image (§4.3
/// policy). Returns the created maps in a stable name-ordered sequence,
/// plus the ring-buffer data size to use for the reader.
pub fn create_all(
    specs: &std::collections::BTreeMap<String, MapSpec>,
    default_ring_buffer_size: u32,
) -> Result<(std::collections::BTreeMap<String, MapFd>, u32)> {
    let mut specs = specs.clone();
    let ring_buffer_size = match specs.get("execve_events") {
        Some(spec) if spec.max_entries != 0 => {
            validate_ring_buffer_size(spec.max_entries)?;
            spec.max_entries
        }
        _ => {
            specs.insert(
                "execve_events".to_string(),
                MapSpec {
                    map_type: BPF_MAP_TYPE_RINGBUF,
                    key_size: 0,
                    value_size: 0,
                    max_entries: default_ring_buffer_size,
                    flags: 0,
                },
            );
            default_ring_buffer_size
        }
    };

    let mut created = std::collections::BTreeMap::new();
    for (name, spec) in &specs {
        let fd = syscall::bpf_map_create(
            spec.map_type,
            spec.key_size,
            spec.value_size,
            spec.max_entries,
            spec.flags,
        )?;
        created.insert(name.clone(), MapFd(fd));
    }
    Ok((created, ring_buffer_size))
}

fn validate_ring_buffer_size(max_entries: u32) -> Result<()> {
    if !max_entries.is_power_of_two() || max_entries < page_size() {
        return Err(Error::malformed_elf(format!(
            "ring-buffer max_entries {max_entries} must be a power of two and at least one page"
        )));
    }
    Ok(())
}
