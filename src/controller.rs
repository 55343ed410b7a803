//! Builds a command line and runs it in a child process with disciplined
//! stdio, working-directory, and PID handling.
//!
//! Two construction modes coexist: a pre-rendered call string
//! ([`CommandLineCaller::new`]) and structured positional args plus named
//! options ([`GenericCliController`]), rendered with reproducible flag
//! encoding rules. The rendered line always goes through the platform shell,
//! so shell metacharacters are honored by contract.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::scope::{DEFAULT_PREFIX, ScopedResourceStack};

/// Callback that records the PID of a freshly spawned child process.
pub type PidPublisher = Arc<dyn Fn(u32) + Send + Sync>;

#[cfg(unix)]
const NULL_DEVICE: &str = "/dev/null";
#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";

/// The spawned command exited with a non-zero status.
#[derive(Debug, thiserror::Error)]
#[error("command `{command}` exited with {status}")]
pub struct CommandFailed {
    pub command: String,
    pub status: ExitStatus,
}

/// Runtime options for a [`CommandLineCaller`].
///
/// Capture wins over silencing for each stream; `err_to_out` overrides both
/// for stderr and merges it into whatever stdout resolves to.
#[derive(Clone, Default)]
pub struct CallerOpts {
    pub pid_publisher: Option<PidPublisher>,
    /// Run inside a freshly created temporary directory.
    pub in_tmpdir: bool,
    /// Where to create the temporary directory (OS default when `None`).
    /// Has no effect unless `in_tmpdir` is set.
    pub tmpdir_loc: Option<PathBuf>,
    /// Explicit working directory; the current directory when `None`.
    pub dir: Option<PathBuf>,
    pub capture_stdout: bool,
    pub silence_stdout: bool,
    pub err_to_out: bool,
    pub capture_stderr: bool,
    pub silence_stderr: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Sink {
    Capture,
    Null,
    Inherit,
    /// stderr only: follow stdout wherever it was routed.
    Merge,
}

/// Runs one rendered command line in a child process.
///
/// After a successful (or failed-with-status) run, `captured_stdout` and
/// `captured_stderr` hold the drained pipe contents for streams that were
/// captured, `None` otherwise.
pub struct CommandLineCaller {
    callstr: String,
    opts: CallerOpts,
    dir: PathBuf,
    pub captured_stdout: Option<Vec<u8>>,
    pub captured_stderr: Option<Vec<u8>>,
}

impl CommandLineCaller {
    pub fn new(callstr: impl Into<String>, opts: CallerOpts) -> Self {
        let dir = opts.dir.clone().unwrap_or_else(|| PathBuf::from("."));
        CommandLineCaller {
            callstr: callstr.into(),
            opts,
            dir,
            captured_stdout: None,
            captured_stderr: None,
        }
    }

    /// Construct, run, and hand back the finished caller.
    pub fn do_call(callstr: impl Into<String>, opts: CallerOpts) -> Result<Self> {
        let mut caller = CommandLineCaller::new(callstr, opts);
        caller.call()?;
        Ok(caller)
    }

    /// A reusable factory bound to `callstr` and `opts`; every invocation
    /// builds and runs a fresh caller.
    pub fn partial(
        callstr: impl Into<String>,
        opts: CallerOpts,
    ) -> impl Fn() -> Result<CommandLineCaller> + Send + Sync {
        let callstr = callstr.into();
        move || CommandLineCaller::do_call(callstr.clone(), opts.clone())
    }

    pub fn callstr(&self) -> &str {
        &self.callstr
    }

    /// Effective working directory: the explicit directory, or the temporary
    /// directory for the duration of a `in_tmpdir` run.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Join `name` against the effective working directory.
    pub fn in_workdir(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.join(name)
    }

    pub fn set_pid_publisher(&mut self, publisher: PidPublisher) {
        self.opts.pid_publisher = Some(publisher);
    }

    /// Run the command line. Temporary state lives on a scoped stack that is
    /// drained when the invocation finishes, success or not.
    pub fn call(&mut self) -> Result<()> {
        let mut stack = ScopedResourceStack::new();
        let run = self.run_scoped(&mut stack);
        match (run, stack.close()) {
            (Err(run_err), Err(cleanup_err)) => {
                warn!("cleanup after failed command also failed: {cleanup_err}");
                Err(run_err)
            }
            (Err(run_err), Ok(())) => Err(run_err),
            (Ok(()), Err(cleanup_err)) => Err(cleanup_err.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn run_scoped(&mut self, stack: &mut ScopedResourceStack) -> Result<()> {
        if self.opts.in_tmpdir {
            let tmpdir =
                stack.enter_temp_dir(self.opts.tmpdir_loc.as_deref(), DEFAULT_PREFIX, "")?;
            // The command and any in_workdir() joins target the temporary
            // directory for the rest of this scope.
            self.dir = tmpdir;
        }

        let stdout_sink = if self.opts.capture_stdout {
            Sink::Capture
        } else if self.opts.silence_stdout {
            Sink::Null
        } else {
            Sink::Inherit
        };
        let stderr_sink = if self.opts.err_to_out {
            Sink::Merge
        } else if self.opts.capture_stderr {
            Sink::Capture
        } else if self.opts.silence_stderr {
            Sink::Null
        } else {
            Sink::Inherit
        };

        // One null-device handle serves both streams; the stack closes it.
        let devnull = if stdout_sink == Sink::Null || stderr_sink == Sink::Null {
            let handle = File::create(NULL_DEVICE).context("open null device")?;
            let shared = handle.try_clone().context("duplicate null device handle")?;
            stack.push(move || {
                drop(handle);
                Ok(())
            });
            Some(shared)
        } else {
            None
        };

        let mut cmd = shell_command(&self.callstr, stderr_sink == Sink::Merge);
        if self.dir != Path::new(".") {
            cmd.current_dir(&self.dir);
        }
        cmd.stdout(stdio_for(stdout_sink, devnull.as_ref())?);
        cmd.stderr(stdio_for(stderr_sink, devnull.as_ref())?);

        #[cfg(unix)]
        if stderr_sink == Sink::Merge {
            use std::os::unix::process::CommandExt;
            // Rebind fd 2 onto fd 1 after the child's stdio is wired up, so
            // stderr follows stdout wherever it was routed (pipe, null
            // device, or the inherited terminal).
            unsafe {
                cmd.pre_exec(|| {
                    if libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn `{}`", self.callstr))?;
        let pid = child.id();
        debug!(pid, command = %self.callstr, "child process started");
        if let Some(publisher) = &self.opts.pid_publisher {
            publisher(pid);
        }

        // Drain stderr on a side thread while stdout drains here, so neither
        // pipe can fill up and stall the child.
        let stderr_reader = child.stderr.take().map(|mut stream| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf);
                buf
            })
        });
        let stdout_buf = child.stdout.take().map(|mut stream| {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            buf
        });
        let stderr_buf = stderr_reader.map(|reader| reader.join().unwrap_or_default());

        let status = child
            .wait()
            .with_context(|| format!("wait for `{}`", self.callstr))?;
        self.captured_stdout = stdout_buf;
        self.captured_stderr = stderr_buf;
        debug!(pid, %status, "child process finished");

        if !status.success() {
            return Err(CommandFailed {
                command: self.callstr.clone(),
                status,
            }
            .into());
        }
        Ok(())
    }
}

fn stdio_for(sink: Sink, devnull: Option<&File>) -> Result<Stdio> {
    Ok(match sink {
        Sink::Capture => Stdio::piped(),
        Sink::Null => {
            let handle = devnull.context("null device handle not opened")?;
            Stdio::from(handle.try_clone().context("duplicate null device handle")?)
        }
        // Merge is re-routed after spawn setup; the placeholder inherits.
        Sink::Inherit | Sink::Merge => Stdio::inherit(),
    })
}

/// Hand the rendered line to the platform shell.
fn shell_command(callstr: &str, merge_stderr: bool) -> Command {
    #[cfg(unix)]
    {
        let _ = merge_stderr; // handled with dup2 once stdio is wired up
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(callstr);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        let line = if merge_stderr {
            format!("{callstr} 2>&1")
        } else {
            callstr.to_string()
        };
        cmd.arg("/C").arg(line);
        cmd
    }
}

/// Command name and known option encodings shared by every invocation of one
/// particular tool; the "class-level" half of a structured controller.
///
/// An encoding maps a caller-facing option name to its literal command-line
/// form, separator included: `("number", "-n=")` renders `number = 5` as
/// `-n=5`. Options without an encoding fall back to `-`/`--` prefix
/// inference and the controller's separator.
#[derive(Debug, Clone, Copy)]
pub struct CommandTemplate {
    pub command: &'static str,
    pub option_encodings: &'static [(&'static str, &'static str)],
}

impl CommandTemplate {
    /// No default command, no known encodings: the command name comes from
    /// the first positional argument.
    pub const GENERIC: CommandTemplate = CommandTemplate {
        command: "",
        option_encodings: &[],
    };

    fn encoding_for(&self, name: &str) -> Option<&'static str> {
        self.option_encodings
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, encoding)| *encoding)
    }
}

/// Value of a named option.
///
/// `Switch(true)` emits the flag alone, `Switch(false)` emits nothing, and
/// `Value` is appended after the separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Switch(bool),
    Value(String),
}

impl OptionValue {
    pub fn value(v: impl ToString) -> Self {
        OptionValue::Value(v.to_string())
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Switch(b)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Value(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Value(s)
    }
}

/// Structured command builder: positional args plus named options, rendered
/// into a call string before delegating to [`CommandLineCaller`].
#[derive(Debug, Clone)]
pub struct GenericCliController {
    template: CommandTemplate,
    callargs: Vec<String>,
    callkwargs: Vec<(String, OptionValue)>,
    option_sep: String,
}

impl GenericCliController {
    pub fn new(template: CommandTemplate) -> Self {
        GenericCliController {
            template,
            callargs: Vec::new(),
            callkwargs: Vec::new(),
            option_sep: "=".to_string(),
        }
    }

    pub fn generic() -> Self {
        GenericCliController::new(CommandTemplate::GENERIC)
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.callargs.push(arg.to_string());
        self
    }

    pub fn args<A: ToString>(mut self, args: impl IntoIterator<Item = A>) -> Self {
        self.callargs.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn opt(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.callkwargs.push((name.into(), value.into()));
        self
    }

    pub fn option_sep(mut self, sep: impl Into<String>) -> Self {
        self.option_sep = sep.into();
        self
    }

    /// Render the call string: command name first, then options with a known
    /// encoding (in input order), then the remaining options (in input
    /// order), then positional arguments.
    pub fn render_call_string(&self) -> Result<String> {
        let mut positionals = self.callargs.clone();
        let command = if !self.template.command.is_empty() {
            self.template.command.to_string()
        } else if !positionals.is_empty() {
            positionals.remove(0)
        } else {
            anyhow::bail!(
                "command name must come from the template or the first positional argument"
            );
        };

        let mut pieces = vec![command];
        let mut inferred = Vec::new();
        for (name, value) in &self.callkwargs {
            match self.template.encoding_for(name) {
                Some(encoding) => {
                    // The encoding already carries its separator.
                    if let Some(piece) = format_option(encoding, "", value) {
                        pieces.push(piece);
                    }
                }
                None => inferred.push((name, value)),
            }
        }
        for (name, value) in inferred {
            if let Some(piece) = format_option(name, &self.option_sep, value) {
                pieces.push(piece);
            }
        }
        pieces.extend(positionals);
        Ok(pieces.join(" "))
    }

    /// Render and wrap into a runnable caller.
    pub fn into_caller(self, opts: CallerOpts) -> Result<CommandLineCaller> {
        let callstr = self.render_call_string()?;
        Ok(CommandLineCaller::new(callstr, opts))
    }

    /// Render, run, and hand back the finished caller.
    pub fn call(self, opts: CallerOpts) -> Result<CommandLineCaller> {
        let mut caller = self.into_caller(opts)?;
        caller.call()?;
        Ok(caller)
    }
}

/// Standard long/short prefix convention: one-character names get `-`,
/// longer names get `--`, names already starting with `-` stay as-is.
fn format_option(key: &str, sep: &str, value: &OptionValue) -> Option<String> {
    let flag = if key.starts_with('-') {
        key.to_string()
    } else if key.chars().count() == 1 {
        format!("-{key}")
    } else {
        format!("--{key}")
    };
    match value {
        OptionValue::Switch(true) => Some(flag),
        OptionValue::Switch(false) => None,
        OptionValue::Value(v) => Some(format!("{flag}{sep}{v}")),
    }
}
