//! User-facing notification channel.
//!
//! Anything the user has to see (rejected sends, interrupted streams, server
//! errors, the permanent connectivity banner) is published here. Front ends
//! subscribe and render however they like.

use tokio::sync::broadcast;

use crate::error::EngineError;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Recoverable problem, shown transiently.
    Error(EngineError),
    /// Connected (or reconnected) to the server.
    Connected,
    /// Reconnect attempts exhausted. Stays up until a manual reconnect.
    ConnectivityLost { attempts: u32 },
}

impl Notice {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Notice::ConnectivityLost { .. })
    }
}

/// Cloneable publisher for [`Notice`]s.
#[derive(Clone)]
pub struct Notices {
    sender: broadcast::Sender<Notice>,
}

impl Default for Notices {
    fn default() -> Self {
        Self::new()
    }
}

impl Notices {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        match &notice {
            Notice::Error(e) => crate::log_warn!("Notice: {}", e),
            Notice::Connected => crate::log_info!("Notice: connected"),
            Notice::ConnectivityLost { attempts } => {
                crate::log_error!("Notice: connectivity lost after {} attempts", attempts)
            }
        }
        // No subscribers is fine; the log line above still records it.
        let _ = self.sender.send(notice);
    }

    pub fn error(&self, error: EngineError) {
        self.publish(Notice::Error(error));
    }
}
