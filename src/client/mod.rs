//! Supervisor for baton-do worker processes.
//!
//! A [`Client`] launches one baton-do sub-process, owns its stdio streams
//! and drives it with one request at a time over a line-delimited JSON
//! protocol. Requests and responses are strictly paired in FIFO order;
//! there is no multiplexing identifier on the wire. If accessed from more
//! than one caller, instances must be externally synchronised; the client
//! pool does this by handing each client to a single caller at a time.
//!
//! # Architecture
//!
//! ```text
//!   caller ──execute──▶ Client ──encode──▶ [stdin]  baton-do process
//!                                ◀─decode── [stdout]        │
//!                                          [stderr → log]   ▼
//!                                                          iRODS
//! ```

mod io;
mod spawn;

pub use spawn::{BATON_EXECUTABLE, find_baton};

use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Child;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::envelope::{Args, Envelope, MetaOperation, Operation};
use crate::error::{BatonError, Result};
use crate::item::{RodsItem, clean_path, sort_items};

/// Timeout for the baton-do sub-process to respond or confirm that it is
/// still running. Significant response times can be real, for example
/// responding after a put operation on 1 TiB of data.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a dropped client waits after SIGTERM before escalating to
/// SIGKILL.
const DROP_GRACE_PERIOD: Duration = Duration::from_millis(10);

/// How the worker process ended, published once by the supervisor thread.
#[derive(Debug, Clone)]
enum Terminal {
    Clean,
    Failed(String),
}

#[derive(Default)]
struct State {
    running: bool,
    pid: Option<u32>,
    start_time: Option<Instant>,
    stop_time: Option<Instant>,
    activity_time: Option<Instant>,
    request_tx: Option<Sender<Vec<u8>>>,
    terminal: Option<Terminal>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    stopped: Condvar,
}

/// A launcher for a baton-do sub-process, holding its system I/O streams
/// and channels.
pub struct Client {
    executable: PathBuf,
    response_timeout: Duration,
    shared: Arc<Shared>,
    /// Response channel from the stdout reader. Held for the duration of
    /// a dispatch, which keeps requests one-in-flight per client.
    response_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

/// Locates baton-do on the search path, creates a [`Client`] and starts
/// it with the argument strings. Returns the running client.
pub fn find_and_start<I, S>(args: I) -> Result<Arc<Client>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let baton = find_baton()?;
    let client = Arc::new(Client::new(baton)?);
    client.start(args)?;

    Ok(client)
}

impl Client {
    /// Create a non-running client for the given executable. A bare name
    /// is resolved on the process search path.
    pub fn new(path: impl AsRef<Path>) -> Result<Client> {
        let executable = spawn::resolve_executable(path.as_ref())?;

        Ok(Client {
            executable,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            shared: Arc::new(Shared::default()),
            response_rx: Mutex::new(None),
        })
    }

    /// Set the response timeout used by the dispatcher.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// The resolved path of the worker executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Run the client's worker program, creating new channels for
    /// communication with it. The arguments are passed on the worker's
    /// command line. Starting a client that is already running is an
    /// error.
    pub fn start<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut rx_slot = self
            .response_rx
            .lock()
            .expect("client response lock poisoned");
        let mut state = self.shared.state.lock().expect("client state lock poisoned");

        if state.running {
            return Err(BatonError::AlreadyRunning);
        }

        let (child, stdin, stdout, stderr) = spawn::spawn_worker(&self.executable, args)?;
        let pid = child.id();

        let (request_tx, request_rx) = mpsc::channel();
        let (response_tx, response_rx) = mpsc::channel();

        let writer = io::spawn_writer(stdin, request_rx, self.executable.clone(), pid)?;
        let stdout_reader =
            io::spawn_stdout_reader(stdout, response_tx, self.executable.clone(), pid)?;
        let stderr_reader = io::spawn_stderr_reader(stderr, self.executable.clone(), pid)?;

        let shared = Arc::clone(&self.shared);
        let executable = self.executable.clone();
        thread::Builder::new()
            .name(format!("baton-{pid}-wait"))
            .spawn(move || {
                supervise(shared, child, writer, stdout_reader, stderr_reader, executable);
            })
            .map_err(BatonError::Spawn)?;

        let now = Instant::now();
        state.running = true;
        state.pid = Some(pid);
        state.start_time = Some(now);
        state.activity_time = Some(now);
        state.stop_time = None;
        state.terminal = None;
        state.request_tx = Some(request_tx);
        *rx_slot = Some(response_rx);

        debug!(executable = %self.executable.display(), pid, "started baton-do");
        Ok(())
    }

    /// Stop the worker, if it is running, and return its terminal status.
    ///
    /// Stopping is cooperative: the writer closes the worker's stdin,
    /// the readers run to EOF and the supervisor thread reaps the
    /// process. Stop is idempotent; further calls return the already
    /// captured terminal status.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock().expect("client state lock poisoned");

        if !state.running && state.terminal.is_none() {
            // Never started.
            return Ok(());
        }

        // Dropping the sender cancels the writer, which closes stdin.
        state.request_tx = None;

        while state.terminal.is_none() {
            state = self
                .shared
                .stopped
                .wait(state)
                .expect("client state lock poisoned");
        }

        match state.terminal.clone() {
            Some(Terminal::Failed(status)) => Err(BatonError::Exited(status)),
            _ => Ok(()),
        }
    }

    /// Stop the worker, if it is running, logging any error from it.
    pub fn stop_ignore_error(&self) {
        if let Err(e) = self.stop() {
            error!(executable = %self.executable.display(), error = %e, "stopped client");
        }
    }

    /// Returns true if the worker process is running.
    pub fn is_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("client state lock poisoned")
            .running
    }

    /// The process ID of the worker if it is running, or -1 otherwise.
    pub fn pid(&self) -> i32 {
        let state = self.shared.state.lock().expect("client state lock poisoned");
        if state.running {
            state.pid.map(|p| p as i32).unwrap_or(-1)
        } else {
            -1
        }
    }

    /// The duration for which the client has been idle (time elapsed
    /// since the last request sent to the worker). If the client is no
    /// longer running, returns the idle time when it stopped.
    pub fn idle_time(&self) -> Duration {
        let state = self.shared.state.lock().expect("client state lock poisoned");

        let Some(activity) = state.activity_time else {
            return Duration::ZERO;
        };
        if state.running {
            activity.elapsed()
        } else {
            state
                .stop_time
                .map(|stop| stop.saturating_duration_since(activity))
                .unwrap_or(Duration::ZERO)
        }
    }

    /// The duration for which the client has run. If the client has been
    /// stopped, reports the duration for which it ran.
    pub fn runtime(&self) -> Duration {
        let state = self.shared.state.lock().expect("client state lock poisoned");

        let Some(start) = state.start_time else {
            return Duration::ZERO;
        };
        if state.running {
            start.elapsed()
        } else {
            state
                .stop_time
                .map(|stop| stop.saturating_duration_since(start))
                .unwrap_or(Duration::ZERO)
        }
    }

    /// Send one request to the worker and wait for its response.
    ///
    /// If the response timeout expires while the worker is still running,
    /// the wait is re-armed; legitimate operations may take arbitrarily
    /// long. Once the worker is no longer running the dispatch fails with
    /// [`BatonError::ReceiveFailed`].
    pub fn execute(
        self: &Arc<Self>,
        operation: Operation,
        args: Args,
        target: RodsItem,
    ) -> Result<Vec<RodsItem>> {
        let line = Envelope::request(operation, args, target).to_line()?;

        // Holding the receiver for the whole dispatch keeps requests
        // one-in-flight and responses paired FIFO.
        let rx_slot = self
            .response_rx
            .lock()
            .expect("client response lock poisoned");
        let rx = rx_slot.as_ref().ok_or(BatonError::NotRunning)?;

        let tx = {
            let mut state = self.shared.state.lock().expect("client state lock poisoned");
            if !state.running {
                return Err(BatonError::NotRunning);
            }
            state.activity_time = Some(Instant::now());
            state.request_tx.clone().ok_or(BatonError::NotRunning)?
        };

        debug!(request = %String::from_utf8_lossy(&line), "sending");
        tx.send(line).map_err(|_| BatonError::NotRunning)?;
        drop(tx);

        let raw = loop {
            match rx.recv_timeout(self.response_timeout) {
                Ok(line) => break line,
                Err(RecvTimeoutError::Timeout) => {
                    if !self.is_running() {
                        return Err(BatonError::ReceiveFailed);
                    }
                    debug!(executable = %self.executable.display(),
                        "receiving timed out, waiting again");
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // The stdout reader is gone; give the supervisor a
                    // moment to publish the terminal state.
                    self.await_stopped();
                    return Err(BatonError::ReceiveFailed);
                }
            }
        };

        debug!(response = %String::from_utf8_lossy(&raw), "received");
        Envelope::from_line(&raw)?.into_items(self)
    }

    fn await_stopped(&self) {
        let state = self.shared.state.lock().expect("client state lock poisoned");
        let _ = self
            .shared
            .stopped
            .wait_timeout_while(state, self.response_timeout, |s| s.terminal.is_none())
            .expect("client state lock poisoned");
    }

    fn single(
        self: &Arc<Self>,
        operation: Operation,
        args: Args,
        item: RodsItem,
    ) -> Result<RodsItem> {
        let items = self.execute(operation, args, item)?;
        items
            .into_iter()
            .next()
            .ok_or_else(|| BatonError::MalformedEnvelope {
                operation,
                reason: "empty result".to_string(),
            })
    }

    /// Set permissions on a collection or data object. By setting
    /// `args.recurse`, the operation may be made recursive.
    pub fn chmod(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<RodsItem> {
        self.single(Operation::Chmod, args, item)
    }

    /// Calculate a checksum for a data object. iRODS makes this a no-op
    /// if a checksum is already recorded, which can be overridden with
    /// `args.force`. With `args.checksum`, the new checksum is reported
    /// in the returned item.
    pub fn checksum(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<RodsItem> {
        self.single(Operation::Checksum, args, item)
    }

    /// Fetch a data object from iRODS. Fetching collections recursively
    /// is not supported.
    pub fn get(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<RodsItem> {
        self.single(Operation::Get, args, item)
    }

    /// Retrieve information about collections and/or data objects. The
    /// items returned are sorted: collections first, then by path and
    /// finally by name. The composition of the items is controlled by
    /// `args`: `acl` includes ACLs, `avu` AVUs, `contents` direct
    /// collection contents, `recurse` recurses into collections,
    /// `replicate` includes replicates, `size` sizes and `timestamp`
    /// timestamps.
    pub fn list(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        if args.recurse {
            return self.list_recurse(args, item);
        }

        self.execute(Operation::List, args, item)
    }

    /// Retrieve information about an individual collection or data
    /// object. The effects of `args` are as for [`Client::list`], except
    /// that `recurse` is not permitted. Listing an item that does not
    /// exist, or that would return more than one item, is an error.
    pub fn list_item(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<RodsItem> {
        if args.recurse {
            return Err(BatonError::InvalidArgument(
                "recurse is not permitted when listing a single item".to_string(),
            ));
        }

        let described = item.to_string();
        let mut items = self.execute(Operation::List, args, item)?;

        match items.len() {
            0 => Err(BatonError::NotFound(described)),
            1 => Ok(items.remove(0)),
            n => Err(BatonError::InvalidArgument(format!(
                "attempt to list a single item returned {n} items: {described}"
            ))),
        }
    }

    /// The iRODS checksum of an item, which must be a data object.
    pub fn list_checksum(self: &Arc<Self>, item: RodsItem) -> Result<String> {
        if !item.is_data_object() {
            return Err(BatonError::InvalidArgument(format!(
                "can only get the checksum of a data object, but was passed {item}"
            )));
        }

        let checksum_args = Args {
            checksum: true,
            ..Args::default()
        };
        let obj = self.list_item(checksum_args, item)?;

        Ok(obj.checksum.unwrap_or_default())
    }

    fn meta_mod(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<RodsItem> {
        self.single(Operation::Metamod, args, item)
    }

    /// Add the AVUs of the item to a collection or data object and return
    /// the item.
    pub fn meta_add(self: &Arc<Self>, mut args: Args, item: RodsItem) -> Result<RodsItem> {
        args.operation = Some(MetaOperation::Add);
        self.meta_mod(args, item)
    }

    /// Remove the AVUs of the item from a collection or data object and
    /// return the item.
    pub fn meta_rem(self: &Arc<Self>, mut args: Args, item: RodsItem) -> Result<RodsItem> {
        args.operation = Some(MetaOperation::Rem);
        self.meta_mod(args, item)
    }

    /// Query collections and/or data objects by metadata. At least one of
    /// `args.object` and `args.collection` must be set.
    pub fn meta_query(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        if !(args.object || args.collection) {
            return Err(BatonError::InvalidArgument(
                "metaquery arguments must specify object and/or collection targets; \
                 neither were specified"
                    .to_string(),
            ));
        }

        self.execute(Operation::Metaquery, args, item)
    }

    /// Create a new collection and return the item.
    pub fn mkdir(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<RodsItem> {
        self.single(Operation::Mkdir, args, item)
    }

    /// Put a collection or data object into iRODS and return the items.
    /// By setting `args.recurse`, a local directory may be uploaded into
    /// a collection.
    pub fn put(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        if args.recurse {
            return self.put_recurse(args, item);
        }

        self.execute(Operation::Put, args, item)
    }

    /// Remove a data object from iRODS.
    pub fn remove_object(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        self.execute(Operation::Remove, args, item)
    }

    /// Remove a collection from iRODS.
    pub fn remove_dir(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        self.execute(Operation::Rmdir, args, item)
    }

    fn list_recurse(self: &Arc<Self>, mut args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        if item.is_data_object() {
            let mut it = item;
            it.attach(self);
            return Ok(vec![it]);
        }

        let mut items = vec![item.clone()];

        args.contents = true;
        let populated = self.execute(Operation::List, args.clone(), item)?;
        if let Some(root) = populated.into_iter().next() {
            for elt in root.contents {
                if elt.is_collection() {
                    items.extend(self.list_recurse(args.clone(), elt)?);
                } else {
                    items.push(elt);
                }
            }
        }

        sort_items(&mut items);
        for it in &mut items {
            it.attach(self);
        }

        Ok(items)
    }

    fn put_recurse(self: &Arc<Self>, args: Args, item: RodsItem) -> Result<Vec<RodsItem>> {
        // A simple data object with a local file staged for it.
        if item.is_local_file() && (item.is_data_object() || item.is_collection()) {
            return self.execute(Operation::Put, args, item);
        }

        if !item.is_local_dir() {
            return Err(BatonError::InvalidArgument(format!(
                "cannot recursively put {:?} because it is not a local directory",
                item.local_path()
            )));
        }
        if !item.is_collection() {
            return Err(BatonError::InvalidArgument(format!(
                "cannot recursively put into {:?} because it is not a collection",
                item.rods_path()
            )));
        }

        let rods_root = item.rods_path().unwrap_or_default();
        let local_root = item.local_path().unwrap_or_default();

        let mut staged = Vec::new();
        walk_files(&local_root, &mut staged)?;

        let mut new_items = Vec::with_capacity(staged.len());
        for (dir, file) in staged {
            let coll = rods_join(&rods_root, &dir);

            // Create the leading collections, if they are not there.
            let mkdir_args = Args {
                recurse: true,
                ..Args::default()
            };
            self.execute(
                Operation::Mkdir,
                mkdir_args,
                RodsItem::collection(coll.to_string_lossy()),
            )?;

            let obj = RodsItem {
                directory: Some(dir.to_string_lossy().into_owned()),
                file: Some(file.clone()),
                collection: Some(coll.to_string_lossy().into_owned()),
                data_object: Some(file),
                ..RodsItem::default()
            };
            let put_item = self.single(Operation::Put, args.clone(), obj)?;
            new_items.push(put_item);
        }

        Ok(new_items)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let pid = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if !state.running {
                return;
            }
            // Close stdin so a well-behaved worker exits on its own.
            state.request_tx = None;
            state.pid
        };
        let Some(pid) = pid else {
            return;
        };
        let pid = Pid::from_raw(pid as i32);

        // Dropped while still attached to a live worker. Ask it to stop,
        // give it a moment, then force it; the supervisor thread reaps
        // whatever exits.
        let _ = signal::kill(pid, Signal::SIGTERM);
        thread::sleep(DROP_GRACE_PERIOD);

        if self.shared.state.lock().is_ok_and(|state| state.running) {
            warn!(pid = pid.as_raw(), "worker ignored SIGTERM, killing it");
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("executable", &self.executable)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Waits for the I/O threads and the worker process, then publishes the
/// terminal status and flips the running flag.
fn supervise(
    shared: Arc<Shared>,
    mut child: Child,
    writer: JoinHandle<()>,
    stdout_reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
    executable: PathBuf,
) {
    // The readers exit once the worker closes its output streams.
    let _ = stdout_reader.join();
    let _ = stderr_reader.join();

    let status = child.wait();

    // Unblock the writer if stop() has not already done so.
    {
        let mut state = shared.state.lock().expect("client state lock poisoned");
        state.request_tx = None;
    }
    let _ = writer.join();

    let terminal = match &status {
        Ok(s) if s.success() => Terminal::Clean,
        Ok(s) => Terminal::Failed(s.to_string()),
        Err(e) => Terminal::Failed(format!("wait failed: {e}")),
    };

    {
        let mut state = shared.state.lock().expect("client state lock poisoned");
        state.running = false;
        state.stop_time = Some(Instant::now());
        state.terminal = Some(terminal);
    }
    shared.stopped.notify_all();

    debug!(executable = %executable.display(), "baton-do terminated");
}

/// Collect every file under a directory, depth-first in name order, as
/// (directory, file name) pairs. Files deleted mid-walk are skipped.
fn walk_files(dir: &Path, out: &mut Vec<(PathBuf, String)>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %dir.display(), "directory was deleted");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut entries: Vec<_> = entries.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => walk_files(&path, out)?,
            Ok(_) => out.push((
                dir.to_path_buf(),
                entry.file_name().to_string_lossy().into_owned(),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "file was deleted");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Join an iRODS path to a local directory path the way the wire protocol
/// expects: the local components are appended beneath the collection
/// root.
fn rods_join(root: &Path, dir: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in dir.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    clean_path(&out)
}
