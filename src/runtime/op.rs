//! Operation kinds and completion status recorded on I/O contexts.
//!
//! Every finished operation stamps its kind, transfer size, and status
//! onto the context that carried it, so a single routing step can pick
//! the handler when the completion is processed.

use std::io;

/// Kind of operation a context last carried.
///
/// Accepts never borrow a pooled context, so only receives and sends
/// are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Receive into the context window.
    Receive,
    /// Send of the context window.
    Send,
}

/// Outcome of the last operation on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    #[default]
    Success,
    /// The operation failed with this error kind.
    Failed(io::ErrorKind),
}

impl IoStatus {
    pub fn is_success(self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

/// What the loop that issued a receive should do next.
#[derive(Debug)]
pub enum Next<C> {
    /// Re-arm the receive with this context.
    Receive(C),
    /// The connection is closed and the context was returned to the pool.
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default_is_success() {
        assert!(IoStatus::default().is_success());
        assert!(!IoStatus::Failed(io::ErrorKind::ConnectionReset).is_success());
    }
}
