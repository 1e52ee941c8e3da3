//! Operation progress tracking and cooperative cancellation.
//!
//! A [`DicomProgress`] is shared between the thread driving a DIMSE
//! operation and any observers. Counters are updated with atomic adds;
//! listeners are invoked synchronously after each response and may set
//! the cancel flag, which the driving thread observes at the next
//! response boundary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};

/// A listener invoked after each processed response.
pub type ProgressListener = Box<dyn Fn(&DicomProgress) + Send + Sync>;

/// Shared progress state of one DIMSE operation.
#[derive(Default)]
pub struct DicomProgress {
    remaining: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    warning: AtomicUsize,
    /// total payload bytes attributed to successful or warned operations
    total_size: AtomicU64,
    cancelled: AtomicBool,
    processed_file: Mutex<Option<PathBuf>>,
    listeners: Mutex<Vec<ProgressListener>>,
}

impl std::fmt::Debug for DicomProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DicomProgress")
            .field("remaining", &self.remaining())
            .field("completed", &self.completed())
            .field("failed", &self.failed())
            .field("warning", &self.warning())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl DicomProgress {
    pub fn new() -> Arc<DicomProgress> {
        Arc::new(DicomProgress::default())
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn warning(&self) -> usize {
        self.warning.load(Ordering::Relaxed)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn set_remaining(&self, value: usize) {
        self.remaining.store(value, Ordering::Relaxed);
    }

    pub fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.decrement_remaining();
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.decrement_remaining();
    }

    pub fn add_warning(&self) {
        self.warning.fetch_add(1, Ordering::Relaxed);
        self.decrement_remaining();
    }

    pub fn add_total_size(&self, bytes: u64) {
        self.total_size.fetch_add(bytes, Ordering::Relaxed);
    }

    fn decrement_remaining(&self) {
        let _ = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Request cooperative cancellation of the operation.
    ///
    /// The flag is observed by the operation
    /// at its next response boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Record the most recently processed file.
    pub fn set_processed_file(&self, path: impl Into<PathBuf>) {
        *self.processed_file.lock().unwrap() = Some(path.into());
    }

    pub fn processed_file(&self) -> Option<PathBuf> {
        self.processed_file.lock().unwrap().clone()
    }

    /// Register a listener invoked synchronously after each response.
    pub fn add_listener(&self, listener: ProgressListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Invoke every registered listener with the current state.
    pub fn notify(&self) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(self);
        }
    }

    /// Lift the standard sub-operation counters from a response command set
    /// into this progress handle, then notify listeners.
    pub fn update_from_command(&self, command: &InMemDicomObject<StandardDataDictionary>) {
        let ops = SubOperations::from_command(command);
        if let Some(remaining) = ops.remaining {
            self.remaining.store(remaining as usize, Ordering::Relaxed);
        }
        if let Some(completed) = ops.completed {
            self.completed.store(completed as usize, Ordering::Relaxed);
        }
        if let Some(failed) = ops.failed {
            self.failed.store(failed as usize, Ordering::Relaxed);
        }
        if let Some(warning) = ops.warning {
            self.warning.store(warning as usize, Ordering::Relaxed);
        }
        self.notify();
    }
}

/// The four standardized sub-operation counters of a
/// C-GET or C-MOVE response command set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

impl SubOperations {
    /// Extract the counters which are present in the command set.
    pub fn from_command(command: &InMemDicomObject<StandardDataDictionary>) -> SubOperations {
        let read = |tag| command.get(tag).and_then(|e| e.to_int::<u16>().ok());
        SubOperations {
            remaining: read(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: read(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: read(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: read(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }
}

/// The composite outcome of one DIMSE operation:
/// the last status code, an optional message,
/// and the shared progress handle.
#[derive(Debug, Clone)]
pub struct DicomState {
    status: u16,
    message: Option<String>,
    progress: Arc<DicomProgress>,
}

impl Default for DicomState {
    fn default() -> Self {
        DicomState {
            status: crate::status::codes::SUCCESS,
            message: None,
            progress: DicomProgress::new(),
        }
    }
}

impl DicomState {
    pub fn new(progress: Arc<DicomProgress>) -> Self {
        DicomState {
            status: crate::status::codes::SUCCESS,
            message: None,
            progress,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn progress(&self) -> &Arc<DicomProgress> {
        &self.progress
    }
}

/// Record a processed file path and notify the listeners in one step.
pub fn note_processed(progress: &DicomProgress, path: &Path) {
    progress.set_processed_file(path);
    progress.notify();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn counters_balance() {
        let progress = DicomProgress::new();
        progress.set_remaining(5);
        progress.add_completed();
        progress.add_completed();
        progress.add_failed();
        progress.add_warning();
        // remaining = total - (completed + failed + warning)
        assert_eq!(progress.remaining(), 1);
        assert_eq!(progress.completed(), 2);
        assert_eq!(progress.failed(), 1);
        assert_eq!(progress.warning(), 1);
    }

    #[test]
    fn listener_can_cancel() {
        let progress = DicomProgress::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        progress.add_listener(Box::new(move |p| {
            calls2.fetch_add(1, Ordering::SeqCst);
            p.cancel();
        }));

        assert!(!progress.is_cancelled());
        progress.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(progress.is_cancelled());
    }

    #[test]
    fn sub_operations_from_command() {
        let command = crate::commands::retrieve_rsp(
            crate::commands::CommandField::CGetRsp,
            1,
            "1.2.840.10008.5.1.4.1.2.2.3",
            0xFF00,
            9,
            3,
            1,
            0,
        );
        let progress = DicomProgress::new();
        progress.update_from_command(&command);
        assert_eq!(progress.remaining(), 9);
        assert_eq!(progress.completed(), 3);
        assert_eq!(progress.failed(), 1);
        assert_eq!(progress.warning(), 0);
    }
}
