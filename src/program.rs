//! Program loader: submits patched instruction arrays to the kernel,
//! capturing the verifier log on rejection (§4.5).

use std::os::unix::io::RawFd;

use crate::elf::Instruction;
use crate::error::{Error, Result};
use crate::syscall::{self, BPF_PROG_TYPE_TRACEPOINT};

const VERIFIER_LOG_SIZE: usize = 256 * 1024;

/// An owning BPF program file descriptor.
#[derive(Debug)]
pub struct ProgramFd(RawFd);

impl ProgramFd {
    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for ProgramFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Derives the short program name the kernel accepts (≤ 15 characters,
/// trailing path component of the section name) (§4.5 step 1).
pub fn short_program_name(section_name: &str) -> String {
    let tail = section_name.rsplit('/').next().unwrap_or(section_name);
    tail.chars().take(15).collect()
}

/// Loads one tracepoint program. `instructions` have already been patched
/// by [`crate::reloc::apply`]. `license` must be a NUL-terminated byte
/// string (§4.5 step 3-4).
pub fn load(section_name: &str, instructions: &[Instruction], license: &str) -> Result<ProgramFd> {
    let mut flat = Vec::with_capacity(instructions.len() * 8);
    for instr in instructions {
        flat.extend_from_slice(&instr.to_bytes());
    }

    let mut license_bytes = license.as_bytes().to_vec();
    license_bytes.push(0);

    let mut log_buf = vec![0u8; VERIFIER_LOG_SIZE];
    let name = short_program_name(section_name);

    match syscall::bpf_prog_load(
        BPF_PROG_TYPE_TRACEPOINT,
        &flat,
        &license_bytes,
        &name,
        &mut log_buf,
    ) {
        Ok(fd) => Ok(ProgramFd(fd)),
        Err(_) => {
            let end = log_buf.iter().position(|&b| b == 0).unwrap_or(0);
            let log = String::from_utf8_lossy(&log_buf[..end]).into_owned();
            if !log.is_empty() {
                Err(Error::VerifierRejected { log })
            } else {
                Err(Error::KernelAbi {
                    errno: unsafe { *libc::__errno_location() },
                    context: format!("BPF_PROG_LOAD for {section_name}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_short_name_from_trailing_component() {
        assert_eq!(
            short_program_name("tracepoint/syscalls/sys_enter_execve"),
            "sys_enter_execv"
        );
        assert_eq!(short_program_name("tracepoint/sched/short"), "short");
    }

    #[test]
    fn short_name_is_at_most_fifteen_chars() {
        let name = short_program_name("tracepoint/syscalls/sys_enter_execveat_with_a_very_long_name");
        assert!(name.chars().count() <= 15);
    }
}
