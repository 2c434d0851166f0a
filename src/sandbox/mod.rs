use crate::errors::{DroverError, DroverResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Safety classification for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Moderate,
    Dangerous,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Moderate => "moderate",
            SafetyLevel::Dangerous => "dangerous",
        }
    }
}

impl std::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substrings that mark a command dangerous, matched case-insensitively.
/// Checked before the allowlist: denylist always wins.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf", "rm -r", "rmdir", "sudo", "su ", "> /dev", ">/dev", "chmod 777", "chmod -R", "curl",
    "wget", "nc ", "netcat", "eval", "exec", "$(", "`", "&&", "||", ";",
];

/// Commands whose first token is known read-only. Covers the common
/// read-only `git` forms (`git status`, `git log`, ...) through the bare
/// `git` token.
const SAFE_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "file", "find", "grep", "tree", "du", "df", "stat", "pwd",
    "echo", "git", "python", "node", "npm", "pip",
];

/// Classify a shell command's safety level.
///
/// Pure function: same input always yields the same `(level, reason)`.
/// Empty input classifies moderate.
pub fn classify_command(cmd: &str) -> (SafetyLevel, String) {
    let lowered = cmd.trim().to_lowercase();

    for pattern in DANGEROUS_PATTERNS {
        if lowered.contains(&pattern.to_lowercase()) {
            return (
                SafetyLevel::Dangerous,
                format!("contains dangerous pattern: {}", pattern),
            );
        }
    }

    if let Some(first) = lowered.split_whitespace().next() {
        if SAFE_COMMANDS.contains(&first) {
            return (SafetyLevel::Safe, "known safe command".to_string());
        }
    }

    (
        SafetyLevel::Moderate,
        "unknown command - requires approval".to_string(),
    )
}

/// Security guard confining file operations to a single directory tree.
///
/// Prevents path traversal (`../../../etc/passwd`), absolute paths outside
/// the root, and symlinks pointing out of the root. Containment is checked
/// by canonical path components, never by string prefix, so a root of
/// `/sb` does not admit `/sbx/...`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create a guard for `root`. The root must be an existing directory;
    /// it is canonicalized once here so every later comparison happens in
    /// canonical space.
    pub fn new(root: impl AsRef<Path>) -> DroverResult<Self> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|_| DroverError::NotADirectory(root.display().to_string()))?;
        if !canonical.is_dir() {
            return Err(DroverError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root: canonical })
    }

    /// The canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path expression to a canonical absolute path inside the
    /// root, or fail with `PathEscape`.
    ///
    /// Empty input and "." mean the root itself. Relative inputs are
    /// interpreted against the root; absolute inputs verbatim. Existing
    /// symlinks are resolved before the containment check.
    pub fn resolve(&self, input: &str) -> DroverResult<PathBuf> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "." {
            return Ok(self.root.clone());
        }

        let path = Path::new(trimmed);
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        // Normalize `.` / `..` lexically first so a not-yet-existing
        // `sub/../../../etc` cannot slip past the ancestor walk below.
        let normalized = lexical_normalize(&candidate);
        let resolved = canonicalize_lenient(&normalized);

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(DroverError::PathEscape(input.to_string()))
        }
    }

    /// Resolve and require an existing regular file.
    pub fn resolve_file(&self, input: &str) -> DroverResult<PathBuf> {
        let resolved = self.resolve(input)?;
        if !resolved.is_file() {
            return Err(DroverError::NotAFile(input.to_string()));
        }
        Ok(resolved)
    }

    /// Resolve and require an existing directory.
    pub fn resolve_dir(&self, input: &str) -> DroverResult<PathBuf> {
        let resolved = self.resolve(input)?;
        if !resolved.is_dir() {
            return Err(DroverError::NotADirectory(input.to_string()));
        }
        Ok(resolved)
    }

    /// Resolve a path for writing: the file itself may not exist yet, but
    /// its location must sit inside the root.
    pub fn resolve_for_write(&self, input: &str) -> DroverResult<PathBuf> {
        let resolved = self.resolve(input)?;
        if resolved == self.root || resolved.is_dir() {
            return Err(DroverError::NotAFile(input.to_string()));
        }
        Ok(resolved)
    }
}

/// Normalize a path lexically (without touching the filesystem).
/// Resolves `.` and `..` components so that `/sb/../etc/passwd`
/// correctly normalizes to `/etc/passwd` rather than passing through
/// as if it starts with `/sb`.
pub(crate) fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                // Pop the last normal component (but never pop past root)
                if matches!(components.last(), Some(std::path::Component::Normal(_))) {
                    components.pop();
                }
            }
            std::path::Component::CurDir => {} // skip "."
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize a path that may not exist: the deepest existing ancestor
/// is canonicalized (resolving symlinks) and the missing tail is appended
/// verbatim. Expects a lexically normalized input (no `.` / `..`).
fn canonicalize_lenient(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(p) => p,
        Err(_) => match path.parent() {
            Some(parent) if parent != path => {
                let base = canonicalize_lenient(parent);
                match path.file_name() {
                    Some(name) => base.join(name),
                    None => base,
                }
            }
            _ => path.to_path_buf(),
        },
    }
}
