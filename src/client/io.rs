//! Background I/O tasks for a client's worker process.
//!
//! Each running client owns three threads: a writer draining the request
//! channel into the worker's stdin, a stdout reader framing newline
//! terminated records onto the response channel, and a stderr reader that
//! only logs. Cancellation is cooperative: dropping the request sender
//! stops the writer, the writer closing stdin lets both readers run to
//! EOF.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdin, ChildStdout};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{BatonError, Result};

/// Read buffer size for the worker's stdout and stderr.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Spawn the writer thread. It consumes request byte-strings, appends a
/// newline and writes them to the worker's stdin. Write errors are
/// logged, not fatal; the worker's death surfaces through stdout EOF.
pub(crate) fn spawn_writer(
    mut stdin: ChildStdin,
    requests: Receiver<Vec<u8>>,
    executable: PathBuf,
    pid: u32,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("baton-{pid}-stdin"))
        .spawn(move || {
            while let Ok(mut buf) = requests.recv() {
                buf.push(b'\n');
                if let Err(e) = stdin.write_all(&buf).and_then(|_| stdin.flush()) {
                    error!(
                        executable = %executable.display(),
                        value = %String::from_utf8_lossy(&buf),
                        error = %e,
                        "error writing to stdin"
                    );
                }
            }

            // All senders gone: close stdin to unblock the readers.
            drop(stdin);
            debug!(executable = %executable.display(), "closed stdin");
        })
        .map_err(BatonError::Spawn)
}

/// Spawn the stdout reader thread. Newline-terminated records are sent to
/// the response channel with trailing CR/LF stripped.
pub(crate) fn spawn_stdout_reader(
    stdout: ChildStdout,
    responses: Sender<Vec<u8>>,
    executable: PathBuf,
    pid: u32,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("baton-{pid}-stdout"))
        .spawn(move || {
            let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stdout);
            let mut buf = Vec::with_capacity(4096);

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => {
                        debug!(executable = %executable.display(), "reached EOF on stdout");
                        return;
                    }
                    Ok(_) => {
                        trim_line(&mut buf);
                        if responses.send(buf.clone()).is_err() {
                            // The dispatcher is gone; nothing left to do.
                            return;
                        }
                    }
                    Err(e) => {
                        error!(executable = %executable.display(), error = %e,
                            "read error on stdout");
                        return;
                    }
                }
            }
        })
        .map_err(BatonError::Spawn)
}

/// Spawn the stderr reader thread. Records are logged and never returned
/// to callers.
pub(crate) fn spawn_stderr_reader(
    stderr: ChildStderr,
    executable: PathBuf,
    pid: u32,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("baton-{pid}-stderr"))
        .spawn(move || {
            let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stderr);
            let mut buf = Vec::with_capacity(4096);

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => {
                        debug!(executable = %executable.display(), "reached EOF on stderr");
                        return;
                    }
                    Ok(_) => {
                        trim_line(&mut buf);
                        debug!(pid, stderr = %String::from_utf8_lossy(&buf), "worker stderr");
                    }
                    Err(e) => {
                        error!(executable = %executable.display(), error = %e,
                            "read error on stderr");
                        return;
                    }
                }
            }
        })
        .map_err(BatonError::Spawn)
}

fn trim_line(buf: &mut Vec<u8>) {
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
}
