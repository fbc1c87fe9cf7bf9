use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::config::{BenchConfig, Profile};
use crate::error::{BenchError, Result};
use crate::matrix::Combination;

/// Fully resolved command line for one combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Script the program template points at, when one is recognisable.
    pub script: Option<PathBuf>,
}

impl Invocation {
    /// `<program...> --data-prefix <dataset> <mode> --partitions <n> [--repeat <r>] [extra...]`
    pub fn build(
        config: &BenchConfig,
        profile: &Profile,
        combo: &Combination,
        partitions: u32,
    ) -> Self {
        let expand = |part: &str| {
            part.replace("{query}", &combo.query)
                .replace("{mode}", &combo.mode)
                .replace("{scale}", &combo.scale.to_string())
        };
        let program: Vec<String> = config.program.iter().map(|p| expand(p)).collect();
        let script = resolve_script_path(&program, &config.config_dir);
        let mut argv = resolve_command_local(&program, &config.config_dir);
        argv.push("--data-prefix".to_string());
        argv.push(config.dataset_path(combo.scale).to_string_lossy().to_string());
        argv.push(combo.mode.clone());
        argv.push("--partitions".to_string());
        argv.push(partitions.to_string());
        if let Some(repeat) = profile.repeat {
            argv.push("--repeat".to_string());
            argv.push(repeat.to_string());
        }
        argv.extend(profile.extra_args.iter().map(|a| expand(a)));
        Self {
            argv,
            cwd: config.config_dir.clone(),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            script,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_join(&self.argv))
    }
}

/// Runs the external query program, streaming its combined output into `sink`.
pub trait QueryExecutor {
    /// Blocks until the program exits and returns its exit code (`None` when
    /// killed by a signal). The code is diagnostic only.
    fn execute(&mut self, invocation: &Invocation, sink: &mut dyn Write) -> Result<Option<i32>>;
}

/// Spawns the program as a child process. No timeout, no cancellation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl QueryExecutor for ProcessExecutor {
    fn execute(&mut self, invocation: &Invocation, sink: &mut dyn Write) -> Result<Option<i32>> {
        let program = invocation.program().to_string();
        let mut cmd = Command::new(&program);
        cmd.args(&invocation.argv[1..]);
        cmd.current_dir(&invocation.cwd);
        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| BenchError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Both pipes feed one channel so chunks reach the sink in arrival order.
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_pipe_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_pipe_reader(stderr, tx.clone()));
        }
        drop(tx);

        let mut relay_error = None;
        for chunk in rx {
            if relay_error.is_some() {
                // keep draining so the child never blocks on a full pipe
                continue;
            }
            if let Err(e) = sink.write_all(&chunk).and_then(|_| sink.flush()) {
                relay_error = Some(e);
            }
        }
        for reader in readers {
            if reader.join().is_err() {
                warn!(program = %program, "output reader thread panicked; staged output may be truncated");
            }
        }
        let status = child.wait().map_err(|source| BenchError::Relay {
            program: program.clone(),
            source,
        })?;
        if let Some(source) = relay_error {
            return Err(BenchError::Relay { program, source });
        }
        Ok(status.code())
    }
}

fn spawn_pipe_reader<R>(mut pipe: R, tx: Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "reading child output failed; staged output may be truncated");
                    break;
                }
            }
        }
    })
}

/// Fan-out writer: every byte goes to the staged sink, then to the console.
///
/// Errors from the staged sink are returned. A console error is logged once and
/// the console is dropped from the fan-out, so the staged copy stays complete.
pub struct Tee<S, C> {
    staged: S,
    console: C,
    console_failed: bool,
}

impl<S: Write, C: Write> Tee<S, C> {
    pub fn new(staged: S, console: C) -> Self {
        Self {
            staged,
            console,
            console_failed: false,
        }
    }

    fn console_error(&mut self, e: io::Error) {
        warn!(error = %e, "console relay failed; output goes to the staged log only");
        self.console_failed = true;
    }
}

impl<S: Write, C: Write> Write for Tee<S, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staged.write_all(buf)?;
        if !self.console_failed {
            if let Err(e) = self.console.write_all(buf) {
                self.console_error(e);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staged.flush()?;
        if !self.console_failed {
            if let Err(e) = self.console.flush() {
                self.console_error(e);
            }
        }
        Ok(())
    }
}

fn resolve_command_local(command: &[String], base: &Path) -> Vec<String> {
    command
        .iter()
        .map(|part| {
            let p = Path::new(part);
            if p.is_relative() && command_part_looks_like_path(part) {
                normalize_path(&base.join(p)).to_string_lossy().to_string()
            } else {
                part.clone()
            }
        })
        .collect()
}

fn resolve_script_path(command: &[String], base: &Path) -> Option<PathBuf> {
    let candidate = command
        .iter()
        .take(2)
        .find(|part| command_part_looks_like_path(part))?;
    let path = Path::new(candidate);
    if path.is_absolute() {
        Some(normalize_path(path))
    } else {
        Some(normalize_path(&base.join(path)))
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn command_part_looks_like_path(part: &str) -> bool {
    if part.is_empty() || part.contains(char::is_whitespace) {
        return false;
    }
    part.starts_with("./")
        || part.starts_with("../")
        || part.starts_with('/')
        || part.contains('/')
        || part.ends_with(".py")
        || part.ends_with(".sh")
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
