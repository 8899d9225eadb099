//! Stream plumbing for inbound message sequences

use super::A2AMessage;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::mpsc;

/// Boxed lazy sequence of inbound messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = A2AMessage> + Send>>;

/// Turns a channel receiver into a message stream that ends when every sender is dropped.
pub fn channel_stream(rx: mpsc::UnboundedReceiver<A2AMessage>) -> MessageStream {
    Box::pin(async_stream::stream! {
        let mut rx = rx;
        while let Some(message) = rx.recv().await {
            yield message;
        }
    })
}

/// Interleaves several handler streams into one. Ordering is only preserved per source stream.
pub fn merge_streams(streams: Vec<MessageStream>) -> MessageStream {
    if streams.is_empty() {
        return Box::pin(stream::empty());
    }
    stream::select_all(streams).boxed()
}
