//! Error taxonomy shared across the loader, the ring-buffer reader, and the
//! watcher supervisor.

use std::io;

/// The error type returned across every fallible boundary of this crate.
///
/// Variants map onto the three dispositions described for the watcher
/// supervisor: most are fatal-at-start (returned from `start`, unwinding any
/// partial state); `ChannelFull` is tracked purely as a metric and never
/// constructed as a returned error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no BPF object was supplied to the watcher")]
    MissingBpfObject,

    #[error("malformed ELF image: {0}")]
    MalformedElf(String),

    #[error("relocation references unknown map `{0}`")]
    MissingMap(String),

    #[error("BPF verifier rejected the program:\n{log}")]
    VerifierRejected { log: String },

    #[error("operation not permitted (missing CAP_BPF/CAP_SYS_ADMIN): {context}")]
    PermissionDenied { context: String },

    #[error("unsupported: {context}")]
    Unsupported { context: String },

    #[error("kernel ABI error ({errno}) during {context}")]
    KernelAbi { errno: i32, context: String },

    #[error("I/O error at {path}: {source}")]
    Io { source: io::Error, path: String },
}

impl Error {
    pub fn malformed_elf(context: impl Into<String>) -> Self {
        Error::MalformedElf(context.into())
    }

    pub fn unsupported(context: impl Into<String>) -> Self {
        Error::Unsupported {
            context: context.into(),
        }
    }

    pub fn io(source: io::Error, path: impl Into<String>) -> Self {
        Error::Io {
            source,
            path: path.into(),
        }
    }

    /// Classifies a raw errno from one of the three syscalls this crate
    /// issues into the taxonomy above. `context` is a short description of
    /// the operation being attempted (used only for display).
    pub fn from_errno(errno: i32, context: impl Into<String>) -> Self {
        match errno {
            libc::EPERM | libc::EACCES => Error::PermissionDenied {
                context: context.into(),
            },
            _ => Error::KernelAbi {
                errno,
                context: context.into(),
            },
        }
    }

    /// Classifies the errno from a `BPF_MAP_CREATE` call. `map_type` is the
    /// type that was requested: a ring-buffer map rejected with
    /// `ENOTSUP`/`EINVAL` means the running kernel predates ring-buffer
    /// support (pre-5.8, or missing `CONFIG_DEBUG_INFO_BTF`) rather than a
    /// generic ABI failure, so it is reported as `Unsupported` instead of
    /// falling through to `from_errno`'s `KernelAbi` default.
    pub fn from_map_create_errno(errno: i32, map_type: u32, context: impl Into<String>) -> Self {
        if map_type == crate::syscall::BPF_MAP_TYPE_RINGBUF
            && matches!(errno, libc::ENOTSUP | libc::EINVAL)
        {
            return Error::Unsupported {
                context: context.into(),
            };
        }
        Error::from_errno(errno, context)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
