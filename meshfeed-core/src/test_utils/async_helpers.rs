//! Async test helpers
//!
//! Timeouts around futures and channel receivers. Everything here panics
//! on timeout so a stuck actor fails the test instead of hanging it.

use std::fmt::Debug;
use std::future::Future;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Duration};

/// Default timeout for test operations
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `future`, panicking if it takes longer than [`DEFAULT_TEST_TIMEOUT`]
pub async fn completes<F, T>(future: F) -> T
where
    F: Future<Output = T>,
{
    assert_completes_within(DEFAULT_TEST_TIMEOUT, future).await
}

/// Await `future`, panicking if it takes longer than `duration`
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Receive until `pred` matches, skipping everything else
pub async fn next_matching<T, P>(rx: &mut mpsc::UnboundedReceiver<T>, mut pred: P) -> T
where
    T: Debug,
    P: FnMut(&T) -> bool,
{
    completes(async {
        loop {
            match rx.recv().await {
                Some(item) if pred(&item) => return item,
                Some(_) => continue,
                None => panic!("channel closed before a matching item arrived"),
            }
        }
    })
    .await
}

/// Broadcast flavour of [`next_matching`]. Lagging is tolerated.
pub async fn next_event_matching<T, P>(rx: &mut broadcast::Receiver<T>, mut pred: P) -> T
where
    T: Clone + Debug,
    P: FnMut(&T) -> bool,
{
    completes(async {
        loop {
            match rx.recv().await {
                Ok(item) if pred(&item) => return item,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("broadcast closed before a matching event arrived")
                }
            }
        }
    })
    .await
}

/// Wait until the watched value satisfies `pred` and return a copy of it
pub async fn watch_until<T, P>(rx: &mut watch::Receiver<T>, mut pred: P) -> T
where
    T: Clone,
    P: FnMut(&T) -> bool,
{
    completes(async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                panic!("watch sender dropped before the condition held");
            }
        }
    })
    .await
}

/// Poll `check` every few milliseconds until it returns true
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    completes(async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Events already queued on a broadcast receiver; lagged gaps are skipped
pub fn drain_events<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut results = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => results.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_returns_value() {
        let value = completes(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            42
        })
        .await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_next_matching_skips_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        assert_eq!(next_matching(&mut rx, |v| *v == 3).await, 3);
        assert_eq!(rx.try_recv().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_next_event_matching() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send("a").unwrap();
        tx.send("b").unwrap();
        assert_eq!(next_event_matching(&mut rx, |v| *v == "b").await, "b");
        tx.send("c").unwrap();
        assert_eq!(drain_events(&mut rx), vec!["c"]);
    }

    #[tokio::test]
    async fn test_watch_until() {
        let (tx, mut rx) = watch::channel(0u32);
        tokio::spawn(async move {
            for i in 1..=3 {
                let _ = tx.send(i);
                tokio::task::yield_now().await;
            }
        });
        assert_eq!(watch_until(&mut rx, |v| *v == 3).await, 3);
    }

    #[tokio::test]
    async fn test_eventually() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        eventually(move || {
            let c = c.clone();
            async move { c.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 3 }
        })
        .await;
        assert!(counter.load(std::sync::atomic::Ordering::SeqCst) >= 4);
    }
}
