//! Spawn argv policy.
//!
//! Agent argv is vetted against a fixed allow-list plus configured extras.
//! `flag=value` forms are permitted when the flag part is allowed, and any
//! positional value (not starting with `-`) passes.

use std::collections::HashSet;

use crate::error::{DomainError, DomainResult};

/// Flag injected when permission prompts are to be skipped.
pub const SKIP_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";

/// Flags always accepted for the spawned agent.
const BASE_ALLOWED: &[&str] = &[
    "--model",
    "-m",
    "--print",
    "-p",
    "--resume",
    "-r",
    "--continue",
    "-c",
    SKIP_PERMISSIONS_FLAG,
    "--verbose",
    "--version",
];

/// Allow-list for agent argv, built once per supervisor from configuration.
#[derive(Debug, Clone)]
pub struct ArgvPolicy {
    allowed: HashSet<String>,
}

impl ArgvPolicy {
    /// Builds the policy from the base list plus configured extras.
    pub fn new(extra_flags: &[String]) -> Self {
        let allowed = BASE_ALLOWED
            .iter()
            .map(|f| f.to_string())
            .chain(extra_flags.iter().map(|f| f.trim().to_string()))
            .filter(|f| !f.is_empty())
            .collect();
        Self { allowed }
    }

    /// Validates a full argv; the first disallowed flag fails the spawn.
    pub fn validate(&self, args: &[String]) -> DomainResult<()> {
        for arg in args {
            if !arg.starts_with('-') {
                continue; // positional value
            }
            let flag = arg.split('=').next().unwrap_or(arg);
            if !self.allowed.contains(flag) {
                return Err(DomainError::DisallowedArg { arg: arg.clone() });
            }
        }
        Ok(())
    }

    /// Merges the skip-permissions switch into argv: `true` adds the flag if
    /// absent, `false` strips it if present.
    pub fn apply_skip_permissions(args: Vec<String>, enable: bool) -> Vec<String> {
        let mut args: Vec<String> = args
            .into_iter()
            .filter(|a| enable || a != SKIP_PERMISSIONS_FLAG)
            .collect();
        if enable && !args.iter().any(|a| a == SKIP_PERMISSIONS_FLAG) {
            args.push(SKIP_PERMISSIONS_FLAG.to_string());
        }
        args
    }
}

impl Default for ArgvPolicy {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn base_flags_accepted() {
        let policy = ArgvPolicy::default();
        assert!(policy
            .validate(&strs(&["--model", "opus", "-c", "--verbose"]))
            .is_ok());
    }

    #[test]
    fn flag_value_form_accepted() {
        let policy = ArgvPolicy::default();
        assert!(policy.validate(&strs(&["--model=opus"])).is_ok());
    }

    #[test]
    fn positionals_accepted() {
        let policy = ArgvPolicy::default();
        assert!(policy.validate(&strs(&["fix the tests", "please"])).is_ok());
    }

    #[test]
    fn unknown_flag_rejected() {
        let policy = ArgvPolicy::default();
        let err = policy.validate(&strs(&["--exec", "rm"])).unwrap_err();
        assert!(matches!(err, DomainError::DisallowedArg { ref arg } if arg == "--exec"));
    }

    #[test]
    fn unknown_flag_value_form_rejected() {
        let policy = ArgvPolicy::default();
        assert!(policy.validate(&strs(&["--shell=/bin/sh"])).is_err());
    }

    #[test]
    fn extras_extend_the_list() {
        let policy = ArgvPolicy::new(&strs(&["--output-format", " --settings "]));
        assert!(policy.validate(&strs(&["--output-format=json"])).is_ok());
        assert!(policy.validate(&strs(&["--settings", "x.json"])).is_ok());
        assert!(policy.validate(&strs(&["--other"])).is_err());
    }

    #[test]
    fn skip_permissions_added_once() {
        let args = ArgvPolicy::apply_skip_permissions(strs(&["--model", "opus"]), true);
        assert_eq!(args.iter().filter(|a| *a == SKIP_PERMISSIONS_FLAG).count(), 1);

        let args = ArgvPolicy::apply_skip_permissions(args, true);
        assert_eq!(args.iter().filter(|a| *a == SKIP_PERMISSIONS_FLAG).count(), 1);
    }

    #[test]
    fn skip_permissions_stripped_when_disabled() {
        let args = ArgvPolicy::apply_skip_permissions(
            strs(&[SKIP_PERMISSIONS_FLAG, "--verbose"]),
            false,
        );
        assert_eq!(args, strs(&["--verbose"]));
    }
}
