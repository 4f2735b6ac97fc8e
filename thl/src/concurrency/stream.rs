use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Duration;

use config::shared::BatchConfig;
use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;

// Implementation adapted from:
//  https://github.com/tokio-rs/tokio/blob/master/tokio-stream/src/stream_ext/chunks_timeout.rs.
pin_project! {
    /// A stream adapter that groups items into batches.
    ///
    /// A batch is emitted when it reaches `max_size` items, when the inner stream has nothing
    /// ready and `max_fill_ms` elapsed since the batch was started, or when the inner stream
    /// ends. With `max_fill_ms` set to zero a batch is emitted as soon as the inner stream has
    /// nothing ready, so a task commits whatever it could read without waiting.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct BatchStream<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        items: Vec<S::Item>,
        batch_config: BatchConfig,
        reset_timer: bool,
        inner_stream_ended: bool,
    }
}

impl<S: Stream> BatchStream<S> {
    pub fn wrap(stream: S, batch_config: BatchConfig) -> Self {
        BatchStream {
            stream,
            deadline: None,
            items: Vec::with_capacity(batch_config.max_size),
            batch_config,
            reset_timer: true,
            inner_stream_ended: false,
        }
    }
}

impl<S: Stream> Stream for BatchStream<S> {
    type Item = Vec<S::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.inner_stream_ended {
            return Poll::Ready(None);
        }

        loop {
            if *this.reset_timer && this.batch_config.max_fill_ms > 0 {
                this.deadline
                    .set(Some(tokio::time::sleep(Duration::from_millis(
                        this.batch_config.max_fill_ms,
                    ))));
                *this.reset_timer = false;
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(item)) => {
                    this.items.push(item);

                    if this.items.len() >= this.batch_config.max_size {
                        *this.reset_timer = true;
                        return Poll::Ready(Some(std::mem::take(this.items)));
                    }
                }
                Poll::Ready(None) => {
                    *this.inner_stream_ended = true;

                    let last = if this.items.is_empty() {
                        None
                    } else {
                        *this.reset_timer = true;
                        Some(std::mem::take(this.items))
                    };

                    return Poll::Ready(last);
                }
            }
        }

        if this.items.is_empty() {
            return Poll::Pending;
        }

        // A zero fill time means no waiting for more items.
        if this.batch_config.max_fill_ms > 0
            && let Some(deadline) = this.deadline.as_pin_mut()
        {
            ready!(deadline.poll(cx));
        }

        *this.reset_timer = true;

        Poll::Ready(Some(std::mem::take(this.items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::future::poll_fn;

    pin_project! {
        struct TwoThenPending {
            emitted: usize,
        }
    }

    impl Stream for TwoThenPending {
        type Item = i32;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            if self.emitted < 2 {
                self.emitted += 1;
                Poll::Ready(Some(self.emitted as i32))
            } else {
                Poll::Pending
            }
        }
    }

    #[tokio::test]
    async fn emits_full_batches_then_remainder_on_end() {
        let batch_config = BatchConfig {
            max_size: 3,
            max_fill_ms: 10_000,
        };
        let stream = BatchStream::wrap(futures::stream::iter(1..=7), batch_config);

        let batches: Vec<Vec<i32>> = stream.collect().await;

        assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[tokio::test]
    async fn zero_fill_time_emits_ready_items_immediately() {
        let batch_config = BatchConfig {
            max_size: 10,
            max_fill_ms: 0,
        };
        let mut stream = Box::pin(BatchStream::wrap(TwoThenPending { emitted: 0 }, batch_config));

        let batch = poll_fn(|cx| stream.as_mut().poll_next(cx)).await;

        assert_eq!(batch, Some(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_fill_time() {
        let batch_config = BatchConfig {
            max_size: 10,
            max_fill_ms: 500,
        };
        let mut stream = Box::pin(BatchStream::wrap(TwoThenPending { emitted: 0 }, batch_config));

        poll_fn(|cx| match stream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Ready(()),
            _ => panic!("expected pending before the fill time elapsed"),
        })
        .await;

        tokio::time::advance(Duration::from_millis(501)).await;
        let batch = poll_fn(|cx| stream.as_mut().poll_next(cx)).await;

        assert_eq!(batch, Some(vec![1, 2]));
    }
}
