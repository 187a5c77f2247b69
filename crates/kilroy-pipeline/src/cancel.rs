//! Cancelable scopes: a tree of tokens where canceling an ancestor reaches
//! every descendant.
//!
//! The driver owns a root token; each handler runs under a child. Handlers
//! poll [`CancelToken::is_cancelled`] or await [`CancelToken::cancelled`]
//! inside `tokio::select!` arms next to their blocking work.

use std::sync::Arc;

use tokio::sync::watch;

type ReasonSlot = Arc<std::sync::Mutex<Option<String>>>;

#[derive(Clone)]
struct Link {
    rx: watch::Receiver<bool>,
    reason: ReasonSlot,
}

#[derive(Clone)]
pub struct CancelToken {
    own: Arc<watch::Sender<bool>>,
    own_reason: ReasonSlot,
    /// Own link plus one per ancestor, root first.
    chain: Vec<Link>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        let reason: ReasonSlot = Arc::new(std::sync::Mutex::new(None));
        Self {
            own: Arc::new(tx),
            own_reason: reason.clone(),
            chain: vec![Link { rx, reason }],
        }
    }

    /// Create a child scope. Canceling the child does not affect the parent;
    /// canceling the parent cancels the child.
    pub fn child(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        let reason: ReasonSlot = Arc::new(std::sync::Mutex::new(None));
        let mut chain = self.chain.clone();
        chain.push(Link {
            rx,
            reason: reason.clone(),
        });
        Self {
            own: Arc::new(tx),
            own_reason: reason,
            chain,
        }
    }

    /// Cancel this scope and everything below it.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut guard = self.own_reason.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                *guard = Some(reason.into());
            }
        }
        let _ = self.own.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|link| *link.rx.borrow())
    }

    /// The reason recorded by whichever scope in the chain fired, innermost
    /// first.
    pub fn reason(&self) -> Option<String> {
        for link in self.chain.iter().rev() {
            if *link.rx.borrow() {
                let guard = link.reason.lock().unwrap_or_else(|e| e.into_inner());
                if guard.is_some() {
                    return guard.clone();
                }
            }
        }
        None
    }

    /// Resolves when this scope or any ancestor is canceled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut receivers: Vec<watch::Receiver<bool>> =
            self.chain.iter().map(|link| link.rx.clone()).collect();
        let waits = receivers
            .iter_mut()
            .map(|rx| Box::pin(async move { rx.wait_for(|v| *v).await.map(|_| ()) }))
            .collect::<Vec<_>>();
        // If every sender has been dropped the scope can never fire; park
        // forever rather than reporting a phantom cancellation.
        match select_first_ok(waits).await {
            Some(()) => {}
            None => std::future::pending().await,
        }
    }

    /// Sleep that wakes early on cancellation. Returns `true` when the full
    /// duration elapsed, `false` when canceled.
    pub async fn sleep(&self, dur: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.cancelled() => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Await the first successful future in the set; `None` when every future
/// resolves to an error (all senders dropped).
async fn select_first_ok<F>(mut futures: Vec<std::pin::Pin<Box<F>>>) -> Option<()>
where
    F: std::future::Future<Output = Result<(), watch::error::RecvError>> + ?Sized,
{
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct SelectOk<'a, F: ?Sized> {
        futures: &'a mut Vec<Pin<Box<F>>>,
    }

    impl<F> Future for SelectOk<'_, F>
    where
        F: Future<Output = Result<(), watch::error::RecvError>> + ?Sized,
    {
        type Output = Option<()>;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let mut i = 0;
            while i < self.futures.len() {
                match self.futures[i].as_mut().poll(cx) {
                    Poll::Ready(Ok(())) => return Poll::Ready(Some(())),
                    Poll::Ready(Err(_)) => {
                        self.futures.swap_remove(i);
                    }
                    Poll::Pending => i += 1,
                }
            }
            if self.futures.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Pending
            }
        }
    }

    SelectOk {
        futures: &mut futures,
    }
    .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_fires_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel("test");
        assert!(token.is_cancelled());
        token.cancelled().await;
        assert_eq!(token.reason().as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel("shutdown");
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        grandchild.cancelled().await;
        assert_eq!(grandchild.reason().as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel("local");
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(parent.reason(), None);
    }

    #[tokio::test]
    async fn sibling_cancel_does_not_pollute_reasons() {
        let parent = CancelToken::new();
        let a = parent.child();
        let b = parent.child();
        a.cancel("a cleanup");
        assert!(!b.is_cancelled());
        assert_eq!(b.reason(), None);
        b.cancel("b stall watchdog");
        assert_eq!(b.reason().as_deref(), Some("b stall watchdog"));
    }

    #[tokio::test]
    async fn sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t2.cancel("wake");
        });
        let completed = token.sleep(Duration::from_secs(30)).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn first_cancel_reason_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }
}
