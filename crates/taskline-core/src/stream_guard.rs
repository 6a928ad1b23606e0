use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Idle-timeout wrapper around a task's outgoing event stream.
///
/// The wrapped stream ends without an error item once `idle` passes with no
/// event. Ending or dropping it cancels `disconnect`, which the dispatcher
/// treats as a client disconnect.
pub struct StreamGuard {
    idle: Duration,
    disconnect: CancellationToken,
}

impl StreamGuard {
    pub fn new(idle: Duration, disconnect: CancellationToken) -> Self {
        Self { idle, disconnect }
    }

    pub fn wrap<S, T>(self, upstream: S) -> impl Stream<Item = T> + Send + 'static
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
    {
        let Self { idle, disconnect } = self;
        let guard = disconnect.drop_guard();
        async_stream::stream! {
            let _guard = guard;
            let mut upstream = Box::pin(upstream);
            loop {
                match tokio::time::timeout(idle, upstream.next()).await {
                    Ok(Some(item)) => yield item,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(
                            "event stream idle for {}s, closing without error",
                            idle.as_secs()
                        );
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_items_in_order_then_signals_disconnect() {
        let token = CancellationToken::new();
        let guarded = StreamGuard::new(Duration::from_secs(5), token.clone())
            .wrap(futures::stream::iter(vec![1, 2, 3]));
        let items = guarded.collect::<Vec<_>>().await;
        assert_eq!(items, vec![1, 2, 3]);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn idle_stream_ends_silently() {
        let token = CancellationToken::new();
        let upstream = futures::stream::iter(vec![7]).chain(futures::stream::pending());
        let guarded = StreamGuard::new(Duration::from_millis(50), token.clone()).wrap(upstream);
        let items = tokio::time::timeout(Duration::from_secs(5), guarded.collect::<Vec<i32>>())
            .await
            .expect("guard should close the idle stream");
        assert_eq!(items, vec![7]);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_unpolled_stream_signals_disconnect() {
        let token = CancellationToken::new();
        let guarded = StreamGuard::new(Duration::from_secs(5), token.clone())
            .wrap(futures::stream::pending::<i32>());
        assert!(!token.is_cancelled());
        drop(guarded);
        assert!(token.is_cancelled());
    }
}
