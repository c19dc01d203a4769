//! A pool of baton-do clients.
//!
//! A [`ClientPool`] lets an application obtain a running [`Client`]
//! without managing the number of worker processes itself, or handling
//! retries when a client cannot be obtained (e.g. the maximum number of
//! workers is reached, or a worker fails to spawn).
//!
//! Idle clients are kept on a LIFO stack so that warm workers are reused
//! first, and a background reaper stops idle clients that are dead, have
//! run too long, or have been idle too long. Once a pool has been closed
//! it rejects acquisition but still accepts returns; a closed pool may
//! not be reopened.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::client::{Client, find_and_start};
use crate::error::{BatonError, Result};

/// Arguments always passed to pooled workers: unbuffered stdio, and
/// errors reported in-band rather than as a nonzero exit.
const POOL_WORKER_ARGS: [&str; 2] = ["--unbuffered", "--no-error"];

/// How long an acquisition attempt sleeps while waiting for a concurrent
/// return to free a slot.
const GET_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Parameters for a [`ClientPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPoolParams {
    /// Maximum number of clients, idle and checked-out together.
    pub max_size: u8,
    /// Budget for one acquisition attempt.
    pub get_timeout: Duration,
    /// Number of acquisition attempts before giving up.
    pub get_max_retries: u8,
    /// How often the reaper inspects idle clients.
    pub check_client_freq: Duration,
    /// Runtime after which an idle client is stopped.
    pub max_client_runtime: Duration,
    /// Idle time after which an idle client is stopped.
    pub max_client_idle_time: Duration,
}

impl Default for ClientPoolParams {
    fn default() -> Self {
        ClientPoolParams {
            max_size: 10,
            get_timeout: Duration::from_millis(250),
            get_max_retries: 3,
            check_client_freq: Duration::from_secs(30),
            max_client_runtime: Duration::from_secs(600),
            max_client_idle_time: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct PoolState {
    open: bool,
    /// Idle clients, warmest last.
    idle: Vec<Arc<Client>>,
    /// Count of clients in existence, idle and checked-out.
    population: u8,
}

struct PoolShared {
    params: ClientPoolParams,
    args: Vec<String>,
    state: Mutex<PoolState>,
    /// Ticks the reaper; notified on close.
    wake: Condvar,
}

/// A bounded pool of running clients.
///
/// Use [`ClientPool::get`] and [`ClientPool::return_client`] to obtain
/// and release clients.
pub struct ClientPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ClientPool {
    /// Create a pool that holds up to `params.max_size` clients. The
    /// `client_args` are passed on each worker's command line, after the
    /// standard pool arguments.
    pub fn new<I, S>(params: ClientPoolParams, client_args: I) -> ClientPool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args = uniq_args(
            POOL_WORKER_ARGS
                .iter()
                .map(|s| s.to_string())
                .chain(client_args.into_iter().map(|s| s.as_ref().to_string())),
        );

        let shared = Arc::new(PoolShared {
            params,
            args,
            state: Mutex::new(PoolState {
                open: true,
                ..PoolState::default()
            }),
            wake: Condvar::new(),
        });

        let reaper = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("baton-pool-reaper".to_string())
                .spawn(move || reap_loop(shared))
                .expect("failed to spawn pool reaper thread")
        };

        ClientPool {
            shared,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Returns true if the pool is open.
    pub fn is_open(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .open
    }

    /// The number of clients in existence, idle and checked-out.
    pub fn population(&self) -> u8 {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .population
    }

    /// The number of idle clients parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .idle
            .len()
    }

    /// Obtain a running client from the pool, creating a new one if the
    /// pool is not full. Fails if the pool is closed, or once the
    /// configured retries are exhausted.
    pub fn get(&self) -> Result<Arc<Client>> {
        let tries = self.shared.params.get_max_retries;

        for attempt in 0..tries {
            debug!(attempt, "getting a client");

            match self.get_with_timeout() {
                Ok(client) => {
                    if client.is_running() {
                        return Ok(client);
                    }

                    debug!(attempt, "dead client in the pool, retrying");
                    let mut state = self.shared.state.lock().expect("pool state lock poisoned");
                    state.population = state.population.saturating_sub(1);
                }
                Err(BatonError::PoolClosed) => return Err(BatonError::PoolClosed),
                Err(e) => {
                    debug!(attempt, error = %e, "retrying");
                }
            }
        }

        Err(BatonError::PoolExhausted { tries })
    }

    /// One acquisition attempt, bounded by the pool's get timeout.
    fn get_with_timeout(&self) -> Result<Arc<Client>> {
        let deadline = Instant::now() + self.shared.params.get_timeout;

        loop {
            {
                let mut state = self.shared.state.lock().expect("pool state lock poisoned");

                if !state.open {
                    return Err(BatonError::PoolClosed);
                }

                if let Some(client) = state.idle.pop() {
                    debug!(idle = state.idle.len(), "got a client from the pool");
                    return Ok(client);
                }

                if state.population < self.shared.params.max_size {
                    state.population += 1;
                    let population = state.population;
                    drop(state);

                    match find_and_start(self.shared.args.iter()) {
                        Ok(client) => {
                            debug!(population, "added a new client to the pool");
                            return Ok(client);
                        }
                        Err(e) => {
                            let mut state =
                                self.shared.state.lock().expect("pool state lock poisoned");
                            state.population = state.population.saturating_sub(1);
                            return Err(e);
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(BatonError::PoolTimeout);
            }

            // Let a concurrent return free a slot.
            thread::sleep(GET_POLL_INTERVAL);
        }
    }

    /// Return a client to the pool. Never fails.
    ///
    /// A running client is parked for reuse; a stopped one is discarded
    /// and its slot freed. If the pool is full, or has been closed, the
    /// client is stopped, with any error logged.
    pub fn return_client(&self, client: Arc<Client>) {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");

        if !state.open {
            debug!("discarding a client returned to a closed pool");
            drop(state);
            client.stop_ignore_error();
            return;
        }

        if !client.is_running() {
            debug!("discarding a stopped client");
            state.population = state.population.saturating_sub(1);
            return;
        }

        if state.idle.len() < usize::from(self.shared.params.max_size) {
            state.idle.push(client);
            debug!(idle = state.idle.len(), "returned a client to the pool");
            return;
        }

        debug!("discarding a running client, pool full");
        drop(state);
        client.stop_ignore_error();
    }

    /// Close the pool for further [`ClientPool::get`] operations,
    /// stopping every idle client. Clients may still be returned to a
    /// closed pool, see [`ClientPool::return_client`].
    pub fn close(&self) {
        let idle = {
            let mut state = self.shared.state.lock().expect("pool state lock poisoned");
            if !state.open {
                return;
            }
            state.open = false;

            let idle = std::mem::take(&mut state.idle);
            state.population = state.population.saturating_sub(idle.len() as u8);
            idle
        };

        self.shared.wake.notify_all();

        debug!(stopping = idle.len(), "closing the pool");
        for client in idle {
            debug!(pid = client.pid(), "stopping client");
            if let Err(e) = client.stop() {
                error!(error = %e, "client did not stop cleanly");
            }
        }

        let reaper = self
            .reaper
            .lock()
            .expect("pool reaper lock poisoned")
            .take();
        if let Some(handle) = reaper {
            let _ = handle.join();
        }
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wakes every check interval and stops idle clients that are dead, have
/// run past the maximum runtime, or have idled past the maximum idle
/// time. Checked-out clients are invisible here, so no in-flight request
/// is ever interrupted.
fn reap_loop(shared: Arc<PoolShared>) {
    debug!("client reaper started");

    let mut state = shared.state.lock().expect("pool state lock poisoned");
    while state.open {
        let (guard, wait) = shared
            .wake
            .wait_timeout(state, shared.params.check_client_freq)
            .expect("pool state lock poisoned");
        state = guard;

        if !state.open {
            break;
        }
        if wait.timed_out() {
            sweep(&mut state, &shared.params);
        }
    }

    debug!("client reaper stopped");
}

fn sweep(state: &mut PoolState, params: &ClientPoolParams) {
    let idle = std::mem::take(&mut state.idle);

    for client in idle {
        if !client.is_running() {
            debug!("dropping a dead idle client");
            state.population = state.population.saturating_sub(1);
        } else if client.runtime() > params.max_client_runtime {
            debug!(
                runtime_ms = client.runtime().as_millis() as u64,
                "stopping an idle client over the runtime limit"
            );
            client.stop_ignore_error();
            state.population = state.population.saturating_sub(1);
        } else if client.idle_time() > params.max_client_idle_time {
            debug!(
                idle_ms = client.idle_time().as_millis() as u64,
                "stopping an idle client over the idle limit"
            );
            client.stop_ignore_error();
            state.population = state.population.saturating_sub(1);
        } else {
            state.idle.push(client);
        }
    }
}

/// Deduplicate arguments, preserving first-occurrence order.
fn uniq_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    args.into_iter().filter(|arg| seen.insert(arg.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_default() {
        let params = ClientPoolParams::default();
        assert_eq!(params.max_size, 10);
        assert_eq!(params.get_timeout, Duration::from_millis(250));
        assert_eq!(params.get_max_retries, 3);
        assert_eq!(params.check_client_freq, Duration::from_secs(30));
    }

    #[test]
    fn test_uniq_args_preserves_order() {
        let args = uniq_args(
            ["--unbuffered", "--no-error", "--zone", "testZone", "--unbuffered"]
                .iter()
                .map(|s| s.to_string()),
        );
        assert_eq!(args, vec!["--unbuffered", "--no-error", "--zone", "testZone"]);
    }

    #[test]
    fn test_pool_worker_args_prefixed() {
        let pool = ClientPool::new(ClientPoolParams::default(), ["--zone", "testZone"]);
        assert_eq!(
            pool.shared.args,
            vec!["--unbuffered", "--no-error", "--zone", "testZone"]
        );
        pool.close();
    }
}
