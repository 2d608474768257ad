use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

/// Builds a command for a supervised tool: stdin closed, stdout/stderr piped.
pub fn tool_command<I, S>(program: impl AsRef<OsStr>, args: I, cwd: Option<&Path>) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    configure_for_background(&mut cmd);
    cmd
}

/// Renders a command line the way it is recorded in a job log.
pub fn display_command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        return program.to_string();
    }
    format!("{program} {}", args.join(" "))
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(unix)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // Own process group, so helpers the tool forks (ffmpeg) can be killed with it.
    cmd.process_group(0);
}

#[cfg(not(any(windows, unix)))]
fn configure_for_background(_cmd: &mut Command) {}
