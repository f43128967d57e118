//! Demo binary: loads a BPF object from a path given on the command line,
//! watches for `execve`/`execveat` events, and prints matching alerts as
//! they arrive.

use std::env;
use std::fs;

use anyhow::{Context, Result};
use execwatch::{Options, Rule, RuleKind, Severity, Watcher};

fn main() -> Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .context("usage: execwatchd <bpf-object.o>")?;
    let elf_bytes = fs::read(&path).with_context(|| format!("reading {path}"))?;

    let rules = vec![Rule {
        name: "shell-watch".to_string(),
        kind: RuleKind::Process,
        target: "sh".to_string(),
        severity: Severity::Warn,
    }];

    let watcher = Watcher::with_bpf_object(rules, elf_bytes, Options::default());
    watcher.start().context("starting watcher")?;

    let receiver = watcher.events().context("watcher did not start")?;
    for alert in receiver.iter() {
        println!("{} [{:?}] {:?}", alert.rule_name, alert.severity, alert.detail);
    }

    watcher.stop();
    Ok(())
}
