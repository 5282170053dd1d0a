//! Single-assignment result cells bridging the negotiation engine's completion callbacks
//! (create/set session description) into values that can be awaited.

use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Slot<T> = Option<Result<T, Error>>;

/// Creates a connected pair: the resolver is handed to the engine together with the request,
/// the future stays with the caller.
pub fn description_future<T>() -> (DescriptionResolver<T>, DescriptionFuture<T>) {
    let (tx, rx) = watch::channel(None);
    (
        DescriptionResolver { tx: Arc::new(tx) },
        DescriptionFuture { rx },
    )
}

/// Completion side of a [DescriptionFuture]. Only the first of [DescriptionResolver::success]
/// or [DescriptionResolver::failure] has any effect.
#[derive(Debug)]
pub struct DescriptionResolver<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for DescriptionResolver<T> {
    fn clone(&self) -> Self {
        DescriptionResolver {
            tx: self.tx.clone(),
        }
    }
}

impl<T> DescriptionResolver<T> {
    /// Returns `false` if the future had already been resolved.
    pub fn success(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Returns `false` if the future had already been resolved.
    pub fn failure(&self, message: impl Into<String>) -> bool {
        self.resolve(Err(Error::Negotiation(message.into())))
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn resolve(&self, result: Result<T, Error>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = result.take();
                true
            } else {
                false
            }
        })
    }
}

/// Awaitable side. Cloning it lets several tasks observe the same outcome.
#[derive(Debug, Clone)]
pub struct DescriptionFuture<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone> DescriptionFuture<T> {
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits until the engine resolves the request. A resolver dropped without ever being
    /// completed surfaces as a [Error::Negotiation].
    pub async fn wait(&self) -> Result<T, Error> {
        let mut rx = self.rx.clone();
        let slot = rx.wait_for(Option::is_some).await.map_err(|_| {
            Error::Negotiation("description request dropped before completion".into())
        })?;
        slot.clone()
            .unwrap_or_else(|| Err(Error::Negotiation("description request unresolved".into())))
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, Error> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Waits with an optional bound, the shape in which connections carry their timeout.
    pub async fn wait_for(&self, timeout: Option<Duration>) -> Result<T, Error> {
        match timeout {
            Some(timeout) => self.wait_timeout(timeout).await,
            None => self.wait().await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::description_future;
    use crate::error::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn first_resolution_wins() {
        let (resolver, future) = description_future::<String>();
        assert!(resolver.failure("rejected"));
        assert!(!resolver.success("v=0".to_string()));
        match future.wait().await {
            Err(Error::Negotiation(msg)) => assert_eq!(msg, "rejected"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let (resolver, future) = description_future::<String>();
        assert!(resolver.success("v=0".to_string()));
        assert!(!resolver.failure("late"));
        assert_eq!(future.wait().await.unwrap(), "v=0");
    }

    #[tokio::test]
    async fn every_waiter_sees_the_same_value() {
        let (resolver, future) = description_future::<u32>();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let f = future.clone();
                tokio::spawn(async move { f.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        resolver.success(7);
        for w in waiters {
            assert_eq!(w.await.unwrap().unwrap(), 7);
        }
        // late waiters after resolution
        assert_eq!(future.wait().await.unwrap(), 7);
        assert_eq!(future.clone().wait().await.unwrap(), 7);
        assert!(future.is_done());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let (resolver, future) = description_future::<()>();
        let res = future.wait_timeout(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
        assert!(!resolver.is_resolved());
    }

    #[tokio::test]
    async fn dropped_resolver_is_a_negotiation_error() {
        let (resolver, future) = description_future::<()>();
        drop(resolver);
        assert!(matches!(future.wait().await, Err(Error::Negotiation(_))));
    }
}
