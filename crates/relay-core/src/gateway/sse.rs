//! Reply stream decoding.
//!
//! `eventsource-stream` buffers fragmented chunks until a full `\n\n`
//! delimiter arrives; this layer turns each `data:` payload into a
//! [`ReplyEvent`].

use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;

use super::{GatewayError, GatewayResult, ReplyEvent};

const DONE_SENTINEL: &str = "[DONE]";

/// SSE parser that converts a byte stream into reply events.
pub struct SseParser<S> {
    inner: EventStream<S>,
    finished: bool,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
            finished: false,
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = GatewayResult<ReplyEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == DONE_SENTINEL {
                        self.finished = true;
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(parse_event_data(data)));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(GatewayError::parse(format!(
                        "SSE stream error: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Parses the JSON payload of one `data:` line.
pub fn parse_event_data(data: &str) -> GatewayResult<ReplyEvent> {
    serde_json::from_str(data).map_err(|err| {
        let mut error = GatewayError::parse(format!("Failed to parse reply event: {err}"));
        error.details = Some(data.to_string());
        error
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};

    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    async fn collect(parts: &[&str]) -> Vec<GatewayResult<ReplyEvent>> {
        SseParser::new(chunks(parts)).collect().await
    }

    #[tokio::test]
    async fn test_event_split_across_chunks_is_reassembled() {
        let events = collect(&[
            "data: {\"type\":\"Fin",
            "ish\",\"reason\":\"stop\"}",
            "\n\n",
        ])
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &ReplyEvent::Finish {
                reason: "stop".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_sentinel_ends_stream() {
        let events = collect(&[
            "data: {\"type\":\"Ping\"}\n\n",
            "data: [DONE]\n\n",
            "data: {\"type\":\"Ping\"}\n\n",
        ])
        .await;

        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_parse_error() {
        let events = collect(&["data: {not json}\n\n"]).await;

        let err = events[0].as_ref().unwrap_err();
        assert_eq!(err.kind, crate::gateway::GatewayErrorKind::Parse);
        assert_eq!(err.details.as_deref(), Some("{not json}"));
    }

    #[tokio::test]
    async fn test_comment_and_empty_events_are_skipped() {
        let events = collect(&[
            ": keepalive\n\n",
            "data:\n\n",
            "data: {\"type\":\"Ping\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_parse_message_event() {
        let event = parse_event_data(
            r#"{"type":"Message","message":{"role":"assistant","created":1,"content":[{"type":"text","text":"hi"}]}}"#,
        )
        .unwrap();
        let ReplyEvent::Message { message } = event else {
            panic!("expected message event");
        };
        assert_eq!(message.text(), "hi");
    }
}
