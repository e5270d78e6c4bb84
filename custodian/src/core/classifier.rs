//! Heuristic failure classification for verification and repair commands.
//!
//! Classification drives repair triage, so it is expressed as an explicit,
//! ordered rule table rather than cascading conditionals: rules are evaluated
//! top to bottom and the first match wins. Ordering is a correctness
//! requirement: integrity signatures are checked before
//! everything else so that output containing both a checksum-mismatch phrase
//! and an unrelated compile error still classifies as `security_integrity`.
//!
//! The table is deliberately a heuristic, not a parser. A missed signature
//! degrades to `unknown_failure` (repairable but uninformative). The only rule
//! set that must stay conservative is `security_integrity`: a false positive
//! there suppresses repair entirely.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::report::CommandResult;

/// Classification tag for a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Checksum/verification mismatch. Terminal: never triggers repair.
    SecurityIntegrity,
    TimeoutFailure,
    EnvCommandMissing,
    EnvMissingPath,
    EnvNetwork,
    DependencyManifestMissing,
    DependencyResolution,
    DependencyManifestInvalid,
    DependencyFetch,
    VetFailure,
    TestFailure,
    CompileFailure,
    UnknownFailure,
}

impl FailureKind {
    /// Terminal kinds must never be handed to the repair loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SecurityIntegrity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SecurityIntegrity => "security_integrity",
            Self::TimeoutFailure => "timeout_failure",
            Self::EnvCommandMissing => "env_command_missing",
            Self::EnvMissingPath => "env_missing_path",
            Self::EnvNetwork => "env_network",
            Self::DependencyManifestMissing => "dependency_manifest_missing",
            Self::DependencyResolution => "dependency_resolution",
            Self::DependencyManifestInvalid => "dependency_manifest_invalid",
            Self::DependencyFetch => "dependency_fetch",
            Self::VetFailure => "vet_failure",
            Self::TestFailure => "test_failure",
            Self::CompileFailure => "compile_failure",
            Self::UnknownFailure => "unknown_failure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the ordered classification table.
///
/// A rule matches when every non-empty constraint holds:
/// - `any`: at least one signature appears in the lowercased stdout+stderr.
/// - `all`: every signature appears in the output.
/// - `command`: at least one signature appears in the lowercased command line.
struct Rule {
    kind: FailureKind,
    any: &'static [&'static str],
    all: &'static [&'static str],
    command: &'static [&'static str],
}

impl Rule {
    fn matches(&self, text: &str, command: &str) -> bool {
        if !self.any.is_empty() && !self.any.iter().any(|sig| text.contains(sig)) {
            return false;
        }
        if !self.all.iter().all(|sig| text.contains(sig)) {
            return false;
        }
        if !self.command.is_empty() && !self.command.iter().any(|sig| command.contains(sig)) {
            return false;
        }
        true
    }
}

const NONE: &[&str] = &[];

/// Priority-ordered rule table ("strong coverage" variant).
const RULES: &[Rule] = &[
    // Tier 1: terminal integrity signatures. Keep these specific; a false
    // positive here disables repair for the whole run.
    Rule {
        kind: FailureKind::SecurityIntegrity,
        any: &[
            "checksum mismatch",
            "checksum verification failed",
            "hash mismatch",
            "security error",
            "signature verification failed",
            "integrity check failed",
            "verifying module: checksum",
        ],
        all: NONE,
        command: NONE,
    },
    // Tier 2: deadline phrases. Deliberately excludes "i/o timeout", which is
    // a network signature.
    Rule {
        kind: FailureKind::TimeoutFailure,
        any: &[
            "context deadline exceeded",
            "deadline exceeded",
            "timed out after",
            "test timed out",
            "operation timed out",
        ],
        all: NONE,
        command: NONE,
    },
    // Tier 3: environment and infrastructure.
    Rule {
        kind: FailureKind::EnvCommandMissing,
        any: &[
            "command not found",
            "executable file not found",
            "not recognized as an internal or external command",
            "no such command",
            "program not found",
        ],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::EnvMissingPath,
        any: &["no such file or directory", "cannot find the path specified"],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::EnvNetwork,
        any: &[
            "dial tcp",
            "connection refused",
            "connection reset by peer",
            "network is unreachable",
            "tls handshake timeout",
            "temporary failure in name resolution",
            "i/o timeout",
            "could not resolve host",
        ],
        all: NONE,
        command: NONE,
    },
    // Tier 4: dependency and manifest problems.
    Rule {
        kind: FailureKind::DependencyManifestMissing,
        any: &[
            "no go.mod file",
            "go.mod file not found",
            "could not find `cargo.toml`",
            "no package.json",
            "couldn't find a package.json",
        ],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::DependencyManifestInvalid,
        any: &[
            "error parsing go.mod",
            "malformed module path",
            "invalid manifest",
            "failed to parse manifest",
            "error parsing package.json",
        ],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::DependencyResolution,
        any: &[
            "missing go.sum entry",
            "cannot find module providing package",
            "failed to select a version",
            "version solving failed",
            "unable to resolve dependency",
            "eresolve",
        ],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::DependencyFetch,
        any: &[
            "go: downloading",
            "unable to access",
            "authentication required",
            "failed to fetch",
            "could not download",
        ],
        all: NONE,
        command: NONE,
    },
    // Tier 5: recognizably a lint/vet command, or vet-style output.
    Rule {
        kind: FailureKind::VetFailure,
        any: &["vet:"],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::VetFailure,
        any: NONE,
        all: NONE,
        command: &["vet", "clippy", "lint"],
    },
    // Tier 6: code-correctness failures. Panics and assertions are strong
    // signals anywhere; bare runner markers only count for test commands.
    Rule {
        kind: FailureKind::TestFailure,
        any: &["panic:", "--- fail:", "assertion failed", "assert_eq!", "assert_ne!"],
        all: NONE,
        command: NONE,
    },
    Rule {
        kind: FailureKind::TestFailure,
        any: &["failures:", "test result: failed", "tests failed", "fail:"],
        all: NONE,
        command: &["test"],
    },
    Rule {
        kind: FailureKind::TestFailure,
        any: NONE,
        all: &["expected", "got"],
        command: &["test"],
    },
    Rule {
        kind: FailureKind::CompileFailure,
        any: &[
            "undefined:",
            "cannot use",
            "too many arguments in call",
            "not enough arguments in call",
            "syntax error",
            "build failed",
            "compile",
            "mismatched types",
            "cannot find value",
            "unresolved import",
            "expected one of",
        ],
        all: NONE,
        command: NONE,
    },
];

/// Classify a failed command result. Pure, deterministic, total.
pub fn classify(result: &CommandResult) -> FailureKind {
    classify_output(&result.command, &result.stdout, &result.stderr)
}

/// Classify from raw command output. Never fails; unmatched output degrades to
/// [`FailureKind::UnknownFailure`].
pub fn classify_output(command: &str, stdout: &str, stderr: &str) -> FailureKind {
    let text = format!("{}\n{}", stdout.to_lowercase(), stderr.to_lowercase());
    let command = command.to_lowercase();

    for rule in RULES {
        if rule.matches(&text, &command) {
            return rule.kind;
        }
    }
    fallback_by_command(&command)
}

/// Command-prefix heuristics for outputs with no recognizable signature.
///
/// A package-manager subcommand still narrows to a dependency kind, a build
/// subcommand to a compile kind, a test subcommand to a test kind.
fn fallback_by_command(command: &str) -> FailureKind {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return FailureKind::UnknownFailure;
    };

    const PACKAGE_MANAGERS: &[&str] = &["go", "cargo", "npm", "pnpm", "yarn", "pip", "uv", "bundle"];
    const DEPENDENCY_SUBCOMMANDS: &[&str] =
        &["mod", "install", "fetch", "update", "add", "tidy", "vendor"];

    let rest = &tokens[1..];
    if PACKAGE_MANAGERS.contains(first) {
        if rest.iter().any(|t| DEPENDENCY_SUBCOMMANDS.contains(t)) {
            return FailureKind::DependencyResolution;
        }
        if rest.contains(&"build") {
            return FailureKind::CompileFailure;
        }
        if rest.contains(&"test") {
            return FailureKind::TestFailure;
        }
    }
    FailureKind::UnknownFailure
}
