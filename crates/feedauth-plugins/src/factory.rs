//! Plugin process table.
//!
//! One process serves every consumer of the same executable. Consumers hold a
//! [`PluginLease`]; the process is closed once the last lease is dropped and
//! the idle timeout elapses without a new acquisition.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::PluginConnection;
use crate::error::{PluginError, Result};
use crate::options::ConnectionOptions;

/// How long a closed plugin may take to exit before it is killed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection to a freshly started plugin, before the handshake.
pub struct LaunchedPlugin {
    pub connection: PluginConnection,
    pub process: Option<Child>,
}

/// Starts plugin executables.
#[async_trait]
pub trait PluginLauncher: Send + Sync {
    async fn launch(&self, path: &Path, options: &ConnectionOptions) -> Result<LaunchedPlugin>;
}

/// Spawns the executable with `-Plugin` and talks to it over stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(&self, path: &Path, options: &ConnectionOptions) -> Result<LaunchedPlugin> {
        let mut command = Command::new(path);
        command
            .arg("-Plugin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("plugin stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("plugin stdout unavailable"))?;

        Ok(LaunchedPlugin {
            connection: PluginConnection::new(stdout, stdin, options.clone()),
            process: Some(child),
        })
    }
}

/// Runs setup steps at most once per plugin process.
#[derive(Default)]
pub struct PluginUtilities {
    once: DashMap<String, Arc<OnceCell<()>>>,
}

impl PluginUtilities {
    /// Run `f` unless an earlier call with `key` succeeded. Failures may be retried.
    pub async fn do_once<F, Fut>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cell = self.once.entry(key.to_string()).or_default().clone();
        cell.get_or_try_init(f).await.map(|_| ())
    }
}

pub struct Plugin {
    id: String,
    file_path: PathBuf,
    connection: PluginConnection,
    process_id: Option<u32>,
    kill: CancellationToken,
    utilities: PluginUtilities,
}

impl Plugin {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn connection(&self) -> &PluginConnection {
        &self.connection
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn utilities(&self) -> &PluginUtilities {
        &self.utilities
    }

    /// Send `Close` and stop the process.
    pub fn close(&self) {
        debug!(path = %self.file_path.display(), "Closing plugin");
        self.connection.close();
        self.kill.cancel();
    }
}

struct TableEntry {
    id: u64,
    cell: Arc<OnceCell<Arc<Plugin>>>,
    leases: usize,
    generation: u64,
}

type PluginTable = Arc<Mutex<HashMap<PathBuf, TableEntry>>>;

/// Decrements the lease count of one table entry when dropped.
struct LeaseRelease {
    table: PluginTable,
    path: PathBuf,
    entry_id: u64,
    idle_timeout: Duration,
}

impl Drop for LeaseRelease {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(&self.path) else {
            return;
        };
        if entry.id != self.entry_id {
            return;
        }
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases > 0 {
            return;
        }

        let runtime = tokio::runtime::Handle::try_current().ok();
        let linger = !self.idle_timeout.is_zero() && entry.cell.get().is_some();
        match runtime {
            Some(runtime) if linger => {
                let generation = entry.generation;
                let table = self.table.clone();
                let path = self.path.clone();
                let entry_id = self.entry_id;
                let idle_timeout = self.idle_timeout;
                runtime.spawn(async move {
                    tokio::time::sleep(idle_timeout).await;
                    let expired = {
                        let mut table = table.lock();
                        match table.get(&path) {
                            Some(entry)
                                if entry.id == entry_id
                                    && entry.leases == 0
                                    && entry.generation == generation =>
                            {
                                table.remove(&path)
                            }
                            _ => None,
                        }
                    };
                    if let Some(plugin) = expired.as_ref().and_then(|entry| entry.cell.get()) {
                        debug!(path = %path.display(), "Plugin idle timeout elapsed");
                        plugin.close();
                    }
                });
            }
            _ => {
                let removed = table.remove(&self.path);
                drop(table);
                if let Some(plugin) = removed.as_ref().and_then(|entry| entry.cell.get()) {
                    plugin.close();
                }
            }
        }
    }
}

/// Shared use of a running plugin. Dropping the lease releases it.
pub struct PluginLease {
    plugin: Arc<Plugin>,
    _release: LeaseRelease,
}

impl PluginLease {
    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }
}

pub struct PluginFactory {
    launcher: Arc<dyn PluginLauncher>,
    idle_timeout: Duration,
    table: PluginTable,
    next_entry_id: AtomicU64,
}

impl PluginFactory {
    pub fn new(launcher: Arc<dyn PluginLauncher>, idle_timeout: Duration) -> Self {
        Self {
            launcher,
            idle_timeout,
            table: Arc::new(Mutex::new(HashMap::new())),
            next_entry_id: AtomicU64::new(1),
        }
    }

    /// Lease the plugin at `path`, starting it if no live process exists.
    ///
    /// Concurrent callers for the same path share a single launch.
    pub async fn get_or_create(
        &self,
        path: &Path,
        options: &ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<PluginLease> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let (cell, release) = {
            let mut table = self.table.lock();
            let exited = table
                .get(path)
                .and_then(|entry| entry.cell.get())
                .is_some_and(|plugin| plugin.connection().is_closed());
            if exited && let Some(stale) = table.remove(path) {
                debug!(path = %path.display(), "Replacing exited plugin");
                if let Some(plugin) = stale.cell.get() {
                    plugin.close();
                }
            }

            let entry = table
                .entry(path.to_path_buf())
                .or_insert_with(|| TableEntry {
                    id: self.next_entry_id.fetch_add(1, Ordering::SeqCst),
                    cell: Arc::new(OnceCell::new()),
                    leases: 0,
                    generation: 0,
                });
            entry.leases += 1;
            entry.generation += 1;

            let release = LeaseRelease {
                table: self.table.clone(),
                path: path.to_path_buf(),
                entry_id: entry.id,
                idle_timeout: self.idle_timeout,
            };
            (entry.cell.clone(), release)
        };

        let plugin = tokio::select! {
            plugin = cell.get_or_try_init(|| self.create(path, options, cancel)) => plugin?.clone(),
            _ = cancel.cancelled() => return Err(PluginError::Cancelled),
        };

        Ok(PluginLease {
            plugin,
            _release: release,
        })
    }

    async fn create(
        &self,
        path: &Path,
        options: &ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Plugin>> {
        let started = Instant::now();
        let LaunchedPlugin {
            connection,
            mut process,
        } = self
            .launcher
            .launch(path, options)
            .await
            .map_err(|err| creation_error(path, started, None, err))?;

        if let Err(err) = connection.connect(cancel).await {
            let exit_code = process
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten())
                .and_then(|status| status.code());
            connection.close();
            if let Some(child) = process.as_mut() {
                let _ = child.start_kill();
            }
            return Err(match err {
                PluginError::Cancelled => PluginError::Cancelled,
                err => creation_error(path, started, exit_code, err),
            });
        }

        let process_id = process.as_ref().and_then(|child| child.id());
        let kill = CancellationToken::new();
        let plugin = Arc::new(Plugin {
            id: Uuid::new_v4().to_string(),
            file_path: path.to_path_buf(),
            connection,
            process_id,
            kill: kill.clone(),
            utilities: PluginUtilities::default(),
        });
        if let Some(child) = process {
            tokio::spawn(monitor_process(child, Arc::downgrade(&plugin), kill));
        }

        info!(
            path = %path.display(),
            pid = ?process_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Plugin started"
        );
        Ok(plugin)
    }

    /// Number of outstanding leases for `path`.
    pub fn lease_count(&self, path: &Path) -> usize {
        self.table
            .lock()
            .get(path)
            .map(|entry| entry.leases)
            .unwrap_or(0)
    }

    /// Whether a table entry exists for `path`.
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.table.lock().contains_key(path)
    }

    /// Close every plugin regardless of outstanding leases.
    pub fn shutdown(&self) {
        let entries: Vec<TableEntry> = self.table.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if let Some(plugin) = entry.cell.get() {
                plugin.close();
            }
        }
    }
}

impl Drop for PluginFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn creation_error(path: &Path, started: Instant, exit_code: Option<i32>, err: PluginError) -> PluginError {
    let exit = exit_code
        .map(|code| format!(", exit code {}", code))
        .unwrap_or_default();
    PluginError::Creation {
        path: path.to_path_buf(),
        message: format!(
            "{} (after {} ms{})",
            err,
            started.elapsed().as_millis(),
            exit
        ),
    }
}

async fn monitor_process(mut child: Child, plugin: Weak<Plugin>, kill: CancellationToken) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => debug!(code = ?status.code(), "Plugin process exited"),
                Err(err) => warn!(error = %err, "Failed waiting for plugin process"),
            }
            if let Some(plugin) = plugin.upgrade() {
                plugin.connection().mark_closed();
            }
        }
        _ = kill.cancelled() => {
            if tokio::time::timeout(CLOSE_GRACE, child.wait()).await.is_err() {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "Failed to kill plugin process");
                }
            }
        }
    }
}
