//! User-visible notices emitted by the core for an external UI to display.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
  /// The circuit breaker tripped; sent once per trip
  ServiceUnavailable,
  /// Credentials were dropped; the UI should re-authenticate
  SessionExpired,
  MutationSucceeded(String),
  MutationFailed(String),
  /// Informational message from a push event
  Push(String),
}

impl Notice {
  pub fn message(&self) -> &str {
    match self {
      Notice::ServiceUnavailable => "Service unavailable, please try again shortly",
      Notice::SessionExpired => "Session expired. Please login again.",
      Notice::MutationSucceeded(msg) | Notice::MutationFailed(msg) | Notice::Push(msg) => msg,
    }
  }
}

/// Receiving half, consumed by whatever displays notices.
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

/// Sending half of the notice stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NoticeSink {
  tx: mpsc::UnboundedSender<Notice>,
}

impl NoticeSink {
  pub fn channel() -> (Self, NoticeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }

  /// A sink whose notices are dropped.
  pub fn discard() -> Self {
    Self::channel().0
  }

  pub fn send(&self, notice: Notice) {
    // Nobody listening is not an error
    let _ = self.tx.send(notice);
  }
}

/// Drain every notice currently queued.
pub fn drain(rx: &mut NoticeReceiver) -> Vec<Notice> {
  let mut notices = Vec::new();
  while let Ok(notice) = rx.try_recv() {
    notices.push(notice);
  }
  notices
}
