use crate::extract::{inspect_chunk, Delta};
use crate::hardening::classify_upstream_failure;
use crate::constants::DEFAULT_MAX_STREAM_EVENTS;
use crate::logging::StreamMetric;
use crate::relay::RelayEvent;
use crate::sse::SseFrames;
use crate::types::*;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

/// In-band errors without a numeric code are treated as a gateway failure.
const IN_BAND_ERROR_STATUS: u16 = 502;

/// How a stream that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    Eof,
}

/// Where decoded deltas go during one call. Outlives the individual attempts.
pub struct DeltaSink<'a> {
    progress: &'a mpsc::Sender<RelayEvent>,
    pub aggregate: AggregatedResult,
    pub metric: StreamMetric,
    forwarded: bool,
    receiver_gone: bool,
    max_events: usize,
}

impl<'a> DeltaSink<'a> {
    pub fn new(progress: &'a mpsc::Sender<RelayEvent>) -> Self {
        Self {
            progress,
            aggregate: AggregatedResult::new(),
            metric: StreamMetric::new(),
            forwarded: false,
            receiver_gone: false,
            max_events: DEFAULT_MAX_STREAM_EVENTS,
        }
    }

    /// Caps the events read from a single upstream body.
    pub fn with_event_limit(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Drops what an attempt aggregated before failing ahead of any forwarded content,
    /// so a retry starts from nothing.
    pub fn discard_attempt(&mut self) {
        self.aggregate = AggregatedResult::new();
        self.metric.clear_usage();
    }

    /// True once any content delta has reached the caller. Retrying after this would duplicate output.
    pub fn has_forwarded(&self) -> bool {
        self.forwarded
    }

    pub async fn emit(&mut self, event: RelayEvent) {
        if self.receiver_gone {
            return;
        }
        if self.progress.send(event).await.is_err() {
            tracing::debug!("[⚙️  -> 🖥️ ] Progress receiver dropped, continuing to aggregate");
            self.receiver_gone = true;
        }
    }

    async fn push_delta(&mut self, text: String) {
        self.aggregate.push(&text);
        self.metric.record_delta(&text);
        self.forwarded = true;
        self.emit(RelayEvent::Delta(text)).await;
    }
}

pub struct StreamHandler;

impl StreamHandler {
    /// Drives one upstream body until `[DONE]`, EOF or failure.
    ///
    /// Each content delta is aggregated and forwarded before the next read.
    pub async fn handle_stream<S>(mut frames: SseFrames<S>, sink: &mut DeltaSink<'_>) -> Result<StreamEnd>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let mut events = 0usize;
        while let Some(frame) = frames.next().await {
            let event = frame?;
            sink.metric.record_event();
            events += 1;
            if events > sink.max_events {
                tracing::error!(
                    "[☁️  -> ⚙️ ] Stream exceeded max event limit ({})",
                    sink.max_events
                );
                return Err(RelayError::MalformedUpstream(format!(
                    "stream exceeded {} events",
                    sink.max_events
                ))
                .into());
            }

            let info = inspect_chunk(&event.raw_data);
            if let Some(usage) = info.usage {
                sink.metric.record_usage(&usage);
                sink.aggregate.usage = Some(usage);
            }
            if let Some(err) = info.error {
                let status = err.status().unwrap_or(IN_BAND_ERROR_STATUS);
                tracing::error!(
                    "[☁️  -> ⚙️ ] In-band upstream error (status {}): {}",
                    status,
                    err.message
                );
                return Err(classify_upstream_failure(status, &event.raw_data).into());
            }

            match info.delta {
                Delta::Content(text) if text.is_empty() => {}
                Delta::Content(text) => sink.push_delta(text).await,
                Delta::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] [DONE] after {} events", events);
                    return Ok(StreamEnd::Done);
                }
                Delta::Unparseable => {
                    sink.metric.record_skip();
                    tracing::debug!(
                        "[☁️  -> ⚙️ ] Skipping event without content: {}",
                        crate::str_utils::snippet(&event.raw_data, 200)
                    );
                }
            }
        }
        tracing::debug!("[☁️  -> ⚙️ ] Body ended without [DONE]");
        Ok(StreamEnd::Eof)
    }

    /// Non-streaming bodies: one JSON document carrying `choices[0].message.content`.
    pub fn handle_full_body(body: &str, sink: &mut DeltaSink<'_>) -> Result<()> {
        let info = inspect_chunk(body);
        if let Some(usage) = info.usage {
            sink.metric.record_usage(&usage);
            sink.aggregate.usage = Some(usage);
        }
        if info.error.is_some() {
            let status = info
                .error
                .as_ref()
                .and_then(|e| e.status())
                .unwrap_or(IN_BAND_ERROR_STATUS);
            return Err(classify_upstream_failure(status, body).into());
        }
        match info.delta {
            Delta::Content(text) => {
                sink.metric.record_delta(&text);
                sink.aggregate.push(&text);
                Ok(())
            }
            Delta::Done | Delta::Unparseable => Err(RelayError::MalformedUpstream(format!(
                "response has no choices[0].message.content: {}",
                crate::str_utils::snippet(body.trim(), 200)
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::frame_body;
    use futures_util::stream;

    fn body(chunks: Vec<&'static str>) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_deltas_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = DeltaSink::new(&tx);
        let frames = frame_body(body(vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n: keep-alive\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        ]));
        let end = StreamHandler::handle_stream(frames, &mut sink).await.unwrap();
        assert_eq!(end, StreamEnd::Done);
        assert_eq!(sink.aggregate.full_content, "Hello");
        assert_eq!(sink.aggregate.usage.map(|u| u.total_tokens), Some(5));
        assert!(sink.has_forwarded());
        assert_eq!(sink.metric.skipped, 2);
        drop(sink);
        drop(tx);

        let mut deltas = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                RelayEvent::Delta(d) => deltas.push(d),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_in_band_quota_error() {
        let (tx, _rx) = mpsc::channel(16);
        let mut sink = DeltaSink::new(&tx);
        let frames = frame_body(body(vec![
            "data: {\"error\":{\"message\":\"You exceeded your current quota\",\"code\":429}}\n\n",
        ]));
        let err = StreamHandler::handle_stream(frames, &mut sink).await.unwrap_err();
        assert!(matches!(err.inner, RelayError::QuotaExceeded { status: Some(429), .. }));
        assert!(!sink.has_forwarded());
    }

    #[tokio::test]
    async fn test_event_limit_is_per_sink() {
        let (tx, _rx) = mpsc::channel(16);
        let mut sink = DeltaSink::new(&tx).with_event_limit(2);
        let frames = frame_body(body(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n\n",
        ]));
        let err = StreamHandler::handle_stream(frames, &mut sink).await.unwrap_err();
        assert_eq!(err.inner.code(), "malformed_upstream");
        assert_eq!(sink.aggregate.full_content, "ab");
    }

    #[tokio::test]
    async fn test_discard_attempt_drops_usage() {
        let (tx, _rx) = mpsc::channel(16);
        let mut sink = DeltaSink::new(&tx);
        let frames = frame_body(body(vec![
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":9,\"total_tokens\":18}}\n\n",
        ]));
        StreamHandler::handle_stream(frames, &mut sink).await.unwrap();
        assert_eq!(sink.aggregate.usage.map(|u| u.total_tokens), Some(18));

        sink.discard_attempt();
        assert_eq!(sink.aggregate.usage, None);
        assert_eq!(sink.metric.tokens, None);
        assert!(sink.aggregate.full_content.is_empty());
    }

    #[tokio::test]
    async fn test_eof_without_done() {
        let (tx, _rx) = mpsc::channel(16);
        let mut sink = DeltaSink::new(&tx);
        let frames = frame_body(body(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}"]));
        let end = StreamHandler::handle_stream(frames, &mut sink).await.unwrap();
        assert_eq!(end, StreamEnd::Eof);
        assert_eq!(sink.aggregate.full_content, "Hi");
    }

    #[test]
    fn test_full_body() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = DeltaSink::new(&tx);
        StreamHandler::handle_full_body(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hello"}}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
            &mut sink,
        )
        .unwrap();
        assert_eq!(sink.aggregate.full_content, "Hello");
        assert_eq!(sink.aggregate.usage.map(|u| u.total_tokens), Some(2));
        assert!(!sink.has_forwarded());

        let err = StreamHandler::handle_full_body("<!DOCTYPE html><html></html>", &mut sink).unwrap_err();
        assert!(matches!(err.inner, RelayError::MalformedUpstream(_)));
    }
}
