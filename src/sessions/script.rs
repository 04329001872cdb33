//! Shell text injected into a session for one command invocation.
//!
//! Two builders share the same pipe-and-label plumbing but differ in
//! concurrency and state semantics:
//!
//! - [`foreground`] runs the command as a brace group in the session shell
//!   itself, so `cd`, `export`, and function definitions persist for later
//!   commands. The script blocks the shell until the command, both readers,
//!   and the exit-status write have completed.
//! - [`background`] runs the command as a detached subshell, records its PID
//!   immediately, and returns control to the shell at once. A monitor
//!   subshell owns the readers and removes the pid file and pipes when they
//!   drain.
//!
//! The named pipes themselves are created by the session (see
//! [`super::session`]) before injection, so creation failures surface as
//! typed errors instead of in-band shell noise. Every embedded path goes
//! through [`crate::util::shell_quote`].

use std::path::{Path, PathBuf};

use crate::util::shell_quote;

/// The five per-command paths, all inside the owning session's temp dir.
#[derive(Debug, Clone)]
pub struct CommandFiles {
    /// Named pipe the command's stdout is redirected to.
    pub stdout_pipe: PathBuf,
    /// Named pipe the command's stderr is redirected to.
    pub stderr_pipe: PathBuf,
    /// Interleaved prefix-labeled output (see [`super::protocol`]).
    pub log: PathBuf,
    /// Background subshell PID; its removal means "already terminated".
    pub pid: PathBuf,
    /// Decimal exit status — the authoritative completion signal.
    pub exit_code: PathBuf,
}

impl CommandFiles {
    #[must_use]
    pub fn new(session_dir: &Path, command_id: &str) -> Self {
        Self {
            stdout_pipe: session_dir.join(format!("{command_id}.out")),
            stderr_pipe: session_dir.join(format!("{command_id}.err")),
            log: session_dir.join(format!("{command_id}.log")),
            pid: session_dir.join(format!("{command_id}.pid")),
            exit_code: session_dir.join(format!("{command_id}.exit")),
        }
    }

    /// Best-effort removal of all five files. Cleanup errors are ignored —
    /// the session directory is removed wholesale on destroy anyway.
    pub async fn cleanup(&self) {
        for path in [
            &self.stdout_pipe,
            &self.stderr_pipe,
            &self.log,
            &self.pid,
            &self.exit_code,
        ] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    fn quoted(&self) -> QuotedFiles {
        QuotedFiles {
            out: shell_quote(&self.stdout_pipe.to_string_lossy()),
            err: shell_quote(&self.stderr_pipe.to_string_lossy()),
            log: shell_quote(&self.log.to_string_lossy()),
            pid: shell_quote(&self.pid.to_string_lossy()),
            exit: shell_quote(&self.exit_code.to_string_lossy()),
        }
    }
}

struct QuotedFiles {
    out: String,
    err: String,
    log: String,
    pid: String,
    exit: String,
}

/// The two tagging-reader jobs. `|| [ -n "$line" ]` keeps a final
/// unterminated fragment instead of dropping it at EOF.
fn readers(q: &QuotedFiles) -> String {
    format!(
        concat!(
            "( while IFS= read -r __sb_line || [ -n \"$__sb_line\" ]; do ",
            "printf '\\001\\001\\001%s\\n' \"$__sb_line\"; done < {out} >> {log} ) &\n",
            "__sb_r1=$!\n",
            "( while IFS= read -r __sb_line || [ -n \"$__sb_line\" ]; do ",
            "printf '\\002\\002\\002%s\\n' \"$__sb_line\"; done < {err} >> {log} ) &\n",
            "__sb_r2=$!\n",
        ),
        out = q.out,
        err = q.err,
        log = q.log,
    )
}

/// Foreground (state-preserving) script.
///
/// The epilogue is routed through a `__sb_finish` function armed as an EXIT
/// trap while the command runs: a command that calls `exit` terminates the
/// session shell, but its status still lands in the exit-code file. The
/// function first points the shell's own stdout/stderr at `/dev/null` so the
/// readers see EOF on the pipes even when the trap fires with the group
/// redirections still active.
#[must_use]
pub fn foreground(command: &str, files: &CommandFiles, cwd: Option<&str>) -> String {
    let q = files.quoted();
    let mut script = readers(&q);
    script.push_str(&format!(
        concat!(
            "__sb_finish() {{\n",
            "exec >/dev/null 2>&1\n",
            // Read-write opens never block on a FIFO: if the command never
            // opened the pipes (parse error exited the shell), this still
            // releases the readers from their blocking open.
            ": <> {out}\n",
            ": <> {err}\n",
            "wait \"$__sb_r1\" \"$__sb_r2\"\n",
            "printf '%s\\n' \"$1\" > {exit}\n",
            "rm -f {out} {err}\n",
            "}}\n",
            "trap '__sb_finish \"$?\"' EXIT\n",
        ),
        exit = q.exit,
        out = q.out,
        err = q.err,
    ));

    match cwd {
        Some(dir) => {
            let qdir = shell_quote(dir);
            script.push_str(&format!(
                concat!(
                    "__sb_prev_dir=\"$PWD\"\n",
                    "if cd {dir} 2>/dev/null; then\n",
                    "{{ {command}\n",
                    "}} < /dev/null > {out} 2> {err}\n",
                    "__sb_status=$?\n",
                    "cd \"$__sb_prev_dir\" 2>/dev/null\n",
                    "else\n",
                    "printf 'cd: %s: No such file or directory\\n' {dir} > {err}\n",
                    ": > {out}\n",
                    "__sb_status=1\n",
                    "fi\n",
                ),
                dir = qdir,
                command = command,
                out = q.out,
                err = q.err,
            ));
        }
        None => {
            script.push_str(&format!(
                concat!(
                    "{{ {command}\n",
                    "}} < /dev/null > {out} 2> {err}\n",
                    "__sb_status=$?\n",
                ),
                command = command,
                out = q.out,
                err = q.err,
            ));
        }
    }

    script.push_str("trap - EXIT\n__sb_finish \"$__sb_status\"\n");
    script
}

/// Background (kill-capable, concurrent) script.
///
/// Returns control to the session shell immediately. The command subshell
/// binds fd 3 to the exit-code file up front and emits `$?` on it as its
/// last act; the pid file therefore outlives the command only until the
/// monitor sees both readers drain.
#[must_use]
pub fn background(command: &str, files: &CommandFiles, cwd: Option<&str>) -> String {
    let q = files.quoted();

    let cd_preamble = match cwd {
        Some(dir) => {
            let qdir = shell_quote(dir);
            format!(
                concat!(
                    "cd {dir} 2>/dev/null || {{ ",
                    "printf 'cd: %s: No such file or directory\\n' {dir} > {err}; ",
                    ": > {out}; exit 1; }}\n",
                ),
                dir = qdir,
                err = q.err,
                out = q.out,
            )
        }
        None => String::new(),
    };

    format!(
        concat!(
            // Monitor owns the readers: wait, then clear pid file and pipes.
            "(\n",
            "( while IFS= read -r __sb_line || [ -n \"$__sb_line\" ]; do ",
            "printf '\\001\\001\\001%s\\n' \"$__sb_line\"; done < {out} >> {log} ) &\n",
            "__sb_r1=$!\n",
            "( while IFS= read -r __sb_line || [ -n \"$__sb_line\" ]; do ",
            "printf '\\002\\002\\002%s\\n' \"$__sb_line\"; done < {err} >> {log} ) &\n",
            "__sb_r2=$!\n",
            "wait \"$__sb_r1\" \"$__sb_r2\"\n",
            "rm -f {pid} {out} {err}\n",
            ") &\n",
            // The command subshell. The exit status is emitted from an EXIT
            // trap so a command that calls `exit` still reports it; a killed
            // subshell skips the trap and leaves the exit file empty, which
            // readers interpret as "terminated without status".
            "( exec 3> {exit}\n",
            "__sb_done() {{ printf '%s\\n' \"$?\" >&3; }}\n",
            "trap __sb_done EXIT\n",
            "{cd_preamble}",
            "{{ {command}\n",
            "}} < /dev/null > {out} 2> {err}\n",
            ") &\n",
            "printf '%s\\n' \"$!\" > {pid}\n",
        ),
        out = q.out,
        err = q.err,
        log = q.log,
        pid = q.pid,
        exit = q.exit,
        cd_preamble = cd_preamble,
        command = command,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> CommandFiles {
        CommandFiles::new(Path::new("/tmp/session-t-0"), "cmd-1")
    }

    #[test]
    fn command_files_live_under_session_dir() {
        let f = files();
        for path in [&f.stdout_pipe, &f.stderr_pipe, &f.log, &f.pid, &f.exit_code] {
            assert!(path.starts_with("/tmp/session-t-0"));
        }
        assert_eq!(f.exit_code.file_name().unwrap(), "cmd-1.exit");
    }

    #[test]
    fn foreground_runs_command_as_group() {
        let script = foreground("echo hi", &files(), None);
        // Brace group, not a subshell: state mutations must persist.
        assert!(script.contains("{ echo hi\n}"));
        assert!(!script.contains("( echo hi"));
        // Exit status is written after both readers are waited on.
        let wait_pos = script.find("wait \"$__sb_r1\" \"$__sb_r2\"").unwrap();
        let exit_pos = script.find("> '/tmp/session-t-0/cmd-1.exit'").unwrap();
        assert!(wait_pos < exit_pos);
    }

    #[test]
    fn foreground_arms_exit_trap() {
        let script = foreground("exit 3", &files(), None);
        assert!(script.contains("trap '__sb_finish \"$?\"' EXIT"));
        assert!(script.contains("trap - EXIT"));
    }

    #[test]
    fn foreground_cwd_saves_and_restores() {
        let script = foreground("pwd", &files(), Some("/srv/data"));
        assert!(script.contains("__sb_prev_dir=\"$PWD\""));
        assert!(script.contains("if cd '/srv/data' 2>/dev/null; then"));
        assert!(script.contains("cd \"$__sb_prev_dir\""));
        assert!(script.contains("__sb_status=1"));
    }

    #[test]
    fn background_records_pid_and_detaches() {
        let script = background("sleep 5", &files(), None);
        assert!(script.contains("printf '%s\\n' \"$!\" > '/tmp/session-t-0/cmd-1.pid'"));
        assert!(script.contains("exec 3> '/tmp/session-t-0/cmd-1.exit'"));
        // Monitor removes the pid file once the readers drain.
        assert!(script.contains("rm -f '/tmp/session-t-0/cmd-1.pid'"));
    }

    #[test]
    fn paths_with_single_quotes_are_escaped() {
        let f = CommandFiles::new(Path::new("/tmp/it's here"), "c");
        let script = foreground("true", &f, None);
        assert!(script.contains(r"'/tmp/it'\''s here/c.exit'"));
    }

    #[test]
    fn hostile_cwd_is_quoted() {
        let script = background("true", &files(), Some("/tmp/$(reboot)"));
        assert!(script.contains("cd '/tmp/$(reboot)'"));
    }
}
