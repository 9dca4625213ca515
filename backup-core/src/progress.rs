use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// `state ∈ {Started, InProgress, Finished, Error, Warning}` from spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressState {
    Started,
    InProgress,
    Finished,
    Error,
    Warning,
}

/// `Update({state, tableName, currentRows, totalRows?, message})` from spec §6.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub state: ProgressState,
    pub table_name: String,
    pub current_rows: u64,
    pub total_rows: Option<u64>,
    pub message: String,
}

/// The one UI-facing boundary the core talks through. Implementations must
/// serialise internally: `Backup`/`Restore` call this concurrently from
/// every worker thread (spec §5, "Logger / progress manager").
pub trait ProgressManager: Send + Sync {
    fn update(&self, event: ProgressEvent);
    fn set_max_table_name_length(&self, n: usize);
    fn set_total_items(&self, n: u64);
    fn on_items_processed(&self, delta: u64);
    fn all_done(&self);
    fn error_count(&self) -> u64;
}

/// A `ProgressManager` that records events and counts errors without
/// producing any UI. Used by tests and as the default when the caller has
/// no concrete UI layer (the human-facing renderer is the dbtool CLI's job,
/// out of scope here).
#[derive(Default)]
pub struct NullProgressManager {
    error_count: AtomicUsize,
    events: Mutex<Vec<ProgressEvent>>,
}

impl NullProgressManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressManager for NullProgressManager {
    fn update(&self, event: ProgressEvent) {
        if matches!(event.state, ProgressState::Error) {
            self.error_count.fetch_add(1, Ordering::SeqCst);
        }
        match event.state {
            ProgressState::Error => log::error!("{}: {}", event.table_name, event.message),
            ProgressState::Warning => log::warn!("{}: {}", event.table_name, event.message),
            ProgressState::Started | ProgressState::Finished => {
                log::info!("{:?} {}: {}", event.state, event.table_name, event.message)
            }
            ProgressState::InProgress => log::debug!("{:?} {}: {}", event.state, event.table_name, event.message),
        }
        self.events.lock().unwrap().push(event);
    }

    fn set_max_table_name_length(&self, _n: usize) {}
    fn set_total_items(&self, _n: u64) {}
    fn on_items_processed(&self, _delta: u64) {}
    fn all_done(&self) {}

    fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst) as u64
    }
}
