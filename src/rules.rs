//! Rule definitions and the first-match-wins matcher (§3, §4.9).

use globset::{Glob, GlobMatcher};
use std::path::Path;

use crate::event::ExecEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    File,
    Network,
    Process,
}

/// A rule as supplied by the external collaborator. Fields other than
/// `kind`, `target`, `name`, and `severity` are opaque to this core (§6
/// "Rule input contract").
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub kind: RuleKind,
    pub target: String,
    pub severity: Severity,
}

/// Compiled glob matchers for the `PROCESS` rules, in the order supplied.
/// Non-`PROCESS` rules are filtered out at construction (§4.10).
pub struct RuleMatcher {
    rules: Vec<(Rule, Option<GlobMatcher>)>,
}

impl RuleMatcher {
    /// Compiles `target` globs for each `PROCESS` rule, preserving order.
    /// An empty `target` is a wildcard and never compiled.
    pub fn new(rules: &[Rule]) -> Self {
        let compiled = rules
            .iter()
            .filter(|r| r.kind == RuleKind::Process)
            .map(|r| {
                let matcher = if r.target.is_empty() {
                    None
                } else {
                    Glob::new(&r.target).ok().map(|g| g.compile_matcher())
                };
                (r.clone(), matcher)
            })
            .collect();
        Self { rules: compiled }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the first rule that matches `event`, per §4.9: wildcard,
    /// then basename, then full path, then `comm`.
    pub fn matched_rule<'a>(&'a self, event: &ExecEvent) -> Option<&'a Rule> {
        let basename = Path::new(&event.filename)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&event.filename);

        for (rule, matcher) in &self.rules {
            let matcher = match matcher {
                None => return Some(rule),
                Some(m) => m,
            };
            if matcher.is_match(basename)
                || matcher.is_match(&event.filename)
                || matcher.is_match(&event.comm)
            {
                return Some(rule);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(filename: &str, comm: &str) -> ExecEvent {
        ExecEvent {
            pid: 1,
            ppid: 1,
            uid: 0,
            gid: 0,
            comm: comm.to_string(),
            filename: filename.to_string(),
            argv: String::new(),
        }
    }

    #[test]
    fn simple_match_against_comm() {
        let rules = vec![Rule {
            name: "shell-watch".to_string(),
            kind: RuleKind::Process,
            target: "sh".to_string(),
            severity: Severity::Warn,
        }];
        let matcher = RuleMatcher::new(&rules);
        let matched = matcher.matched_rule(&event("/bin/sh", "sh")).unwrap();
        assert_eq!(matched.name, "shell-watch");
    }

    #[test]
    fn glob_against_basename() {
        let rules = vec![Rule {
            name: "nc".to_string(),
            kind: RuleKind::Process,
            target: "nc*".to_string(),
            severity: Severity::Critical,
        }];
        let matcher = RuleMatcher::new(&rules);
        let matched = matcher.matched_rule(&event("/usr/bin/ncat", "ncat")).unwrap();
        assert_eq!(matched.name, "nc");
    }

    #[test]
    fn no_match_returns_none() {
        let rules = vec![Rule {
            name: "foo".to_string(),
            kind: RuleKind::Process,
            target: "foobar".to_string(),
            severity: Severity::Info,
        }];
        let matcher = RuleMatcher::new(&rules);
        assert!(matcher.matched_rule(&event("/bin/bash", "bash")).is_none());
    }

    #[test]
    fn non_process_rules_are_filtered_out() {
        let rules = vec![Rule {
            name: "net".to_string(),
            kind: RuleKind::Network,
            target: "*".to_string(),
            severity: Severity::Info,
        }];
        let matcher = RuleMatcher::new(&rules);
        assert!(matcher.is_empty());
    }

    #[test]
    fn empty_target_is_wildcard() {
        let rules = vec![Rule {
            name: "any".to_string(),
            kind: RuleKind::Process,
            target: String::new(),
            severity: Severity::Info,
        }];
        let matcher = RuleMatcher::new(&rules);
        assert!(matcher.matched_rule(&event("/bin/anything", "x")).is_some());
    }

    #[test]
    fn first_match_wins() {
        let rules = vec![
            Rule {
                name: "first".to_string(),
                kind: RuleKind::Process,
                target: "sh".to_string(),
                severity: Severity::Info,
            },
            Rule {
                name: "second".to_string(),
                kind: RuleKind::Process,
                target: "sh".to_string(),
                severity: Severity::Critical,
            },
        ];
        let matcher = RuleMatcher::new(&rules);
        let matched = matcher.matched_rule(&event("/bin/sh", "sh")).unwrap();
        assert_eq!(matched.name, "first");
    }
}
