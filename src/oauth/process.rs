//! Login subprocesses behind a pseudo-terminal.
//!
//! The login CLI only prints its interactive prompts when attached to a TTY,
//! so it runs under a PTY rather than plain pipes. Output is read on a
//! dedicated thread (the PTY reader is blocking) and forwarded as
//! [`ProcessEvent`]s.

use std::io::{Read, Write};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

/// Terminal size the login CLI sees.
pub const PTY_COLS: u16 = 120;
pub const PTY_ROWS: u16 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(String),
    /// Sent once, after the output stream closes.
    Exited(Option<i32>),
}

/// Control handle for a running subprocess.
pub trait ManagedProcess: Send {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn id(&self) -> Option<u32>;
}

pub struct SpawnedProcess {
    pub handle: Box<dyn ManagedProcess>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Starts login subprocesses.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<SpawnedProcess>;
}

/// Spawns processes on a native PTY.
#[derive(Debug, Clone, Copy)]
pub struct PtySpawner {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySpawner {
    fn default() -> Self {
        Self {
            cols: PTY_COLS,
            rows: PTY_ROWS,
        }
    }
}

fn pty_err(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(format!("{context}: {e}"))
}

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<SpawnedProcess> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_err("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| pty_err("failed to spawn", e))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_err("failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_err("failed to take PTY writer", e))?;
        let killer = child.clone_killer();
        let pid = child.process_id();

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    // Linux reports a closed PTY as EIO rather than EOF.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(ProcessEvent::Output(chunk)).is_err() {
                            break;
                        }
                    }
                }
            }
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            let _ = tx.send(ProcessEvent::Exited(code));
        });

        tracing::debug!(program, ?pid, "Spawned process on PTY");
        Ok(SpawnedProcess {
            handle: Box::new(PtyProcess {
                master: pair.master,
                writer,
                killer,
                pid,
            }),
            events: rx,
        })
    }
}

/// A process running on a PTY. Killed on drop.
pub struct PtyProcess {
    // Held so the PTY stays open for the lifetime of the process.
    #[allow(dead_code)]
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl ManagedProcess for PtyProcess {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.killer.kill()
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        let _ = self.killer.kill();
    }
}
