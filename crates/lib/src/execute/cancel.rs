//! Cooperative cancellation for build requests.

use std::sync::Arc;

use tokio::sync::watch;

/// Signal shared by the caller of a build and every worker of that build.
///
/// Cancelling is permanent. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Completes once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives as long as `self`, so this only returns on cancel
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn clones_share_the_signal() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());

    let waiter = tokio::spawn(async move { clone.cancelled().await });
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(token.is_cancelled());
  }

  #[tokio::test]
  async fn cancelled_returns_immediately_after_cancel() {
    let token = CancelToken::new();
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await.unwrap();
  }

  #[tokio::test]
  async fn uncancelled_token_keeps_waiting() {
    let token = CancelToken::new();

    let result = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
    assert!(result.is_err());
  }
}
