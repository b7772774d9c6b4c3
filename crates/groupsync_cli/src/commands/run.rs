//! Run command implementation.

use super::{CliError, CliResult};
use groupsync_engine::{
    AccountConfig, ControlHandle, ControlStatus, HttpClient, ItemStore, ItemStoreExt, MemoryStore, Phase,
    ProtocolControl, ReqwestClient, SyncConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Options of the run command.
#[derive(Debug)]
pub struct RunOptions {
    /// Server endpoint.
    pub url: Url,
    /// User name.
    pub user: String,
    /// Device id.
    pub device_id: String,
    /// Password.
    pub password: Option<String>,
    /// Store snapshot path.
    pub store: Option<PathBuf>,
    /// Stop once idle.
    pub once: bool,
    /// Idle poll interval in seconds.
    pub poll: Option<u64>,
}

fn open_store(path: Option<&PathBuf>) -> CliResult<MemoryStore> {
    match path {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "loading store snapshot");
            Ok(MemoryStore::load(path)?)
        }
        _ => Ok(MemoryStore::new()),
    }
}

fn print_status(status: &ControlStatus) {
    let phase = match status.phase {
        Phase::Starting => "starting",
        Phase::FolderSync => "folder sync",
        Phase::Sync => "sync",
        Phase::Command => "sending",
        Phase::Idle => "idle",
        Phase::NeedsUser => "needs user",
        Phase::Stopped => "stopped",
    };
    println!("[{:>4}] {phase}", status.round_trips);
    if let Some(err) = &status.last_error {
        println!("       error: {err}");
    }
    if let Some(action) = &status.user_action {
        println!("       action required: {action}");
    }
}

async fn follow(handle: &ControlHandle, once: bool) {
    let mut status = handle.subscribe();
    loop {
        let current = status.borrow_and_update().clone();
        print_status(&current);
        match current.phase {
            Phase::Stopped => return,
            Phase::Idle | Phase::NeedsUser if once => return,
            _ => {}
        }
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return;
            }
        }
    }
}

fn print_summary(store: &MemoryStore) -> CliResult<()> {
    let (folders, items, pending) = store.read(|txn| {
        let folders = txn.folders();
        let items: usize = folders.iter().map(|f| txn.items_in_folder(&f.id).len()).sum();
        (folders.len(), items, txn.pending().len())
    })?;
    println!("{folders} folders, {items} items, {pending} pending");
    Ok(())
}

/// Runs the run command.
pub fn run(options: RunOptions) -> CliResult<()> {
    let mut account = AccountConfig::new(options.url, options.user, options.device_id);
    if let Some(password) = options.password {
        account = account.with_password(password);
    }
    let mut config = SyncConfig::new(account);
    if let Some(secs) = options.poll {
        config = config.with_idle_interval(Duration::from_secs(secs));
    }

    let store = Arc::new(open_store(options.store.as_ref())?);
    let client: Arc<dyn HttpClient> =
        Arc::new(ReqwestClient::new().map_err(|e| CliError::Usage(e.to_string()))?);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (handle, join) =
            ProtocolControl::new(config, Arc::clone(&store) as Arc<dyn ItemStore>, client).start()?;
        follow(&handle, options.once).await;
        handle.shutdown();
        match join.await {
            Ok(result) => result?,
            Err(err) => warn!(%err, "control task did not finish cleanly"),
        }
        Ok::<_, CliError>(())
    })?;

    print_summary(&store)?;
    if let Some(path) = &options.store {
        store.save(path)?;
        info!(path = %path.display(), "store snapshot saved");
    }
    Ok(())
}
