use std::path::Path;
use tokio::process::Command;

/// Environment variables safe to pass through to child processes.
const ALLOWED_ENV_VARS: &[&str] = &["PATH", "USER", "LANG", "LC_ALL", "TZ", "TERM", "TMPDIR"];

/// Create a `Command` with a scrubbed environment rooted in a sandbox.
///
/// Calls `env_clear()` then copies only the allowlisted environment
/// variables from the current process, and rewrites `HOME` to the sandbox
/// root. This prevents accidental leakage of API keys, tokens, and other
/// secrets to child processes, and keeps dotfile-writing tools inside the
/// sandbox.
pub fn sandboxed_command(program: &str, sandbox_root: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    for &var in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }
    cmd.env("HOME", sandbox_root);
    cmd.current_dir(sandbox_root);
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_sandboxed_command_clears_env() {
        unsafe { std::env::set_var("SUPER_SECRET_KEY", "should-not-leak") };
        let cmd = sandboxed_command("echo", Path::new("/tmp"));
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(
            !envs
                .iter()
                .any(|(k, _)| *k == OsStr::new("SUPER_SECRET_KEY")),
            "secret env var should not be passed through"
        );
    }

    #[test]
    fn test_sandboxed_command_rewrites_home() {
        let cmd = sandboxed_command("echo", Path::new("/tmp/sb"));
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        let home = envs
            .iter()
            .find(|(k, _)| *k == OsStr::new("HOME"))
            .and_then(|(_, v)| *v);
        assert_eq!(home, Some(OsStr::new("/tmp/sb")));
    }

    #[test]
    fn test_sandboxed_command_passes_path() {
        if std::env::var("PATH").is_ok() {
            let cmd = sandboxed_command("echo", Path::new("/tmp"));
            let envs: Vec<_> = cmd.as_std().get_envs().collect();
            assert!(
                envs.iter()
                    .any(|(k, v)| *k == OsStr::new("PATH") && v.is_some()),
                "PATH should be passed through"
            );
        }
    }
}
