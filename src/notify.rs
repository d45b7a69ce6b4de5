//! The `record_appended` publish/subscribe contract.
//!
//! Modeled as an owned [`Notifier`] with explicit subscribe/unsubscribe
//! handles whose `Drop` disconnects — no signal-framework magic, no weak
//! references. Subscribers own their registration token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Payload delivered to `record_appended` subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAppended {
    /// Workspace path the record was appended under.
    pub workspace: String,
    /// Project name the record was appended under.
    pub project: String,
    /// `message_id` from the record's payload, if present.
    pub message_id: Option<String>,
    /// The GSN assigned to the appended record.
    pub gsn: u64,
    /// The allocator's current GSN at the time of delivery.
    pub current_gsn: u64,
}

type Callback = Box<dyn Fn(&RecordAppended) + Send + Sync>;

/// Owns the set of subscribers for one facade's `record_appended` events.
///
/// Subscribers are invoked synchronously, in the thread that performed the
/// append, after the record is durably on disk. A subscriber that panics
/// is caught and logged; it does not fail the write. Subscribers that
/// must not block the writer should hand off to their own queue.
pub struct Notifier {
    subscribers: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
}

impl Notifier {
    /// Create an empty notifier.
    pub fn new() -> Arc<Self> {
        Arc::new(Notifier {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Register `callback`. Dropping the returned [`Subscription`]
    /// unregisters it.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&RecordAppended) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("notifier mutex poisoned")
            .insert(id, Box::new(callback));
        Subscription {
            id,
            notifier: Arc::clone(self),
        }
    }

    pub(crate) fn publish(&self, event: &RecordAppended) {
        let subscribers = self.subscribers.lock().expect("notifier mutex poisoned");
        for callback in subscribers.values() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
            if outcome.is_err() {
                log::error!(
                    "record_appended subscriber panicked for workspace={} project={} gsn={}",
                    event.workspace,
                    event.project,
                    event.gsn
                );
            }
        }
    }
}

/// A live registration with a [`Notifier`]. Dropping it unsubscribes.
#[must_use = "dropping this immediately unsubscribes the callback"]
pub struct Subscription {
    id: u64,
    notifier: Arc<Notifier>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier
            .subscribers
            .lock()
            .expect("notifier mutex poisoned")
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscriber_receives_published_event() {
        let notifier = Notifier::new();
        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        let _sub = notifier.subscribe(move |event| {
            *received_clone.lock().unwrap() = Some(event.gsn);
        });

        notifier.publish(&RecordAppended {
            workspace: "ws".into(),
            project: "proj".into(),
            message_id: None,
            gsn: 7,
            current_gsn: 7,
        });

        assert_eq!(*received.lock().unwrap(), Some(7));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let notifier = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub = notifier.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let event = RecordAppended {
            workspace: "ws".into(),
            project: "proj".into(),
            message_id: None,
            gsn: 1,
            current_gsn: 1,
        };
        notifier.publish(&event);
        drop(sub);
        notifier.publish(&event);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_prevent_other_subscribers() {
        let notifier = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _panicker = notifier.subscribe(|_| panic!("boom"));
        let _counter = notifier.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(&RecordAppended {
            workspace: "ws".into(),
            project: "proj".into(),
            message_id: None,
            gsn: 1,
            current_gsn: 1,
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
