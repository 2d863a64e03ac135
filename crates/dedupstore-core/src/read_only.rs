//! Process-wide read-only mode notification.
//!
//! Read-only mode is absorbing: the first structural error latches, later
//! entries are no-ops, and every registered listener is notified exactly
//! once. The flag itself is readable from any zone without locking.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::CoreError;

/// A listener callback invoked when read-only mode is entered.
pub type ReadOnlyListener = Box<dyn FnMut(&CoreError) + Send>;

struct NotifierInner {
    error: Option<CoreError>,
    listeners: Vec<ReadOnlyListener>,
}

/// The read-only mode notifier shared by all core components.
pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
    inner: Mutex<NotifierInner>,
}

impl Default for ReadOnlyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadOnlyNotifier {
    /// Creates a notifier in normal (writable) mode.
    pub fn new() -> Self {
        Self {
            read_only: AtomicBool::new(false),
            inner: Mutex::new(NotifierInner {
                error: None,
                listeners: Vec::new(),
            }),
        }
    }

    /// Registers a listener to be notified when read-only mode is entered.
    ///
    /// If the notifier is already read-only the listener fires immediately.
    pub fn register_listener(&self, mut listener: ReadOnlyListener) {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.error.clone() {
            listener(&error);
        }
        inner.listeners.push(listener);
    }

    /// Enters read-only mode, latching `error` and notifying listeners.
    /// Later calls are no-ops; the first error wins.
    pub fn enter_read_only_mode(&self, error: CoreError) {
        let mut inner = self.inner.lock();
        if inner.error.is_some() {
            return;
        }
        tracing::error!(%error, "entering read-only mode");
        inner.error = Some(error.clone());
        self.read_only.store(true, Ordering::Release);
        for listener in inner.listeners.iter_mut() {
            listener(&error);
        }
    }

    /// Returns true once read-only mode has been entered.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Returns the latched error, if any.
    pub fn read_only_error(&self) -> Option<CoreError> {
        self.inner.lock().error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_starts_writable() {
        let notifier = ReadOnlyNotifier::new();
        assert!(!notifier.is_read_only());
        assert_eq!(notifier.read_only_error(), None);
    }

    #[test]
    fn test_first_error_latches() {
        let notifier = ReadOnlyNotifier::new();
        notifier.enter_read_only_mode(CoreError::JournalFull);
        notifier.enter_read_only_mode(CoreError::ReadOnly);

        assert!(notifier.is_read_only());
        assert_eq!(notifier.read_only_error(), Some(CoreError::JournalFull));
    }

    #[test]
    fn test_listeners_notified_once() {
        let notifier = ReadOnlyNotifier::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        notifier.register_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        notifier.enter_read_only_mode(CoreError::JournalFull);
        notifier.enter_read_only_mode(CoreError::JournalFull);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_listener_fires_immediately() {
        let notifier = ReadOnlyNotifier::new();
        notifier.enter_read_only_mode(CoreError::JournalFull);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        notifier.register_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
