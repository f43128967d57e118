pub mod alert;
pub mod attach;
pub mod elf;
pub mod error;
pub mod event;
pub mod maps;
pub mod metrics;
pub mod options;
pub mod program;
pub mod reloc;
pub mod ringbuf;
pub mod rules;
pub mod syscall;
pub mod watcher;

pub use alert::AlertEvent;
pub use error::{Error, Result};
pub use event::ExecEvent;
pub use metrics::Metrics;
pub use options::Options;
pub use rules::{Rule, RuleKind, Severity};
pub use watcher::Watcher;
