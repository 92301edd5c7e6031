//! User notifications (pop-up dialogs and tray balloons).
//!
//! Modules never talk to a display directly. When the host runs an
//! interactive front end it hands out a [`DisplayQueue`] through
//! [`ManagerHandle::display`](crate::module::ManagerHandle::display); each
//! notification is queued there with `try_send`, so the caller never blocks,
//! and the host's display loop drains the matching [`DisplayReceiver`].
//! Messages from one module arrive in the order they were sent.
//!
//! Without a display, or when the queue is full or closed, the notification
//! is written to the log at warning level instead. Nothing is dropped silently.

use crate::error::NotificationError;
use crate::module::ManagerHandle;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Default capacity of a display queue.
pub const DEFAULT_DISPLAY_QUEUE_CAPACITY: usize = 64;

/// What kind of notification to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Modal dialog with an OK button.
    PopUp,
    /// Transient tray balloon, optionally with a lingering time.
    Balloon {
        /// How long the balloon stays visible. `None` uses the host default.
        duration: Option<Duration>,
    },
}

/// A notification queued for the display thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Name of the sending module.
    pub module: Arc<str>,
    /// Pop-up or balloon.
    pub kind: NotificationKind,
    /// Window or balloon title.
    pub title: String,
    /// Message body.
    pub message: String,
}

impl Notification {
    fn kind_label(&self) -> &'static str {
        match self.kind {
            NotificationKind::PopUp => "pop-up",
            NotificationKind::Balloon { .. } => "balloon",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message)
    }
}

/// Receiving end of a display queue, drained by the host's display thread.
pub type DisplayReceiver = mpsc::Receiver<Notification>;

/// Sending end of the host's bounded display queue.
#[derive(Debug, Clone)]
pub struct DisplayQueue {
    tx: mpsc::Sender<Notification>,
}

impl DisplayQueue {
    /// Create a bounded queue. The host keeps the receiver.
    pub fn channel(capacity: usize) -> (Self, DisplayReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue without blocking. Gives the notification back if it could not be queued.
    fn offer(&self, notification: Notification) -> Result<(), (Notification, &'static str)> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(n) => (n, "display queue full"),
            mpsc::error::TrySendError::Closed(n) => (n, "display queue closed"),
        })
    }
}

/// Per-module notification front end.
#[derive(Clone)]
pub struct Notifier {
    module: Arc<str>,
    manager: Arc<dyn ManagerHandle>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("module", &self.module)
            .field("manager", &"<Arc<dyn ManagerHandle>>")
            .finish()
    }
}

impl Notifier {
    /// Create a notifier for one module.
    pub fn new(module: Arc<str>, manager: Arc<dyn ManagerHandle>) -> Self {
        Self { module, manager }
    }

    /// Show a modal dialog with an OK button.
    pub fn pop_up(&self, title: &str, message: &str) {
        self.send(NotificationKind::PopUp, title, message);
    }

    /// Show a tray balloon.
    pub fn balloon(&self, title: &str, message: &str, duration: Option<Duration>) {
        self.send(NotificationKind::Balloon { duration }, title, message);
    }

    fn send(&self, kind: NotificationKind, title: &str, message: &str) {
        let notification = Notification {
            module: Arc::clone(&self.module),
            kind,
            title: title.to_string(),
            message: message.to_string(),
        };

        if let Err(err) = validate(&notification) {
            error!(module = %self.module, "{}", err);
            return;
        }

        let Some(display) = self.manager.display() else {
            warn!(
                module = %self.module,
                kind = notification.kind_label(),
                title = %notification.title,
                "{}",
                notification.message
            );
            return;
        };

        if let Err((notification, reason)) = display.offer(notification) {
            warn!(
                module = %self.module,
                kind = notification.kind_label(),
                title = %notification.title,
                reason,
                "{}",
                notification.message
            );
        }
    }
}

fn validate(notification: &Notification) -> Result<(), NotificationError> {
    if notification.title.trim().is_empty() {
        return Err(NotificationError::EmptyTitle {
            kind: notification.kind_label(),
        });
    }
    Ok(())
}
