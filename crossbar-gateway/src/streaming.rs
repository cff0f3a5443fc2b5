//! The SSE pipeline between adapter streams and the caller.
//!
//! Once the first chunk is written the response is committed: later
//! upstream failures become a terminal in-band error chunk, never a new
//! HTTP status. Frames go out as `data: <json>\n\n` and the stream always
//! ends with `data: [DONE]`. The body is pulled one frame at a time, so
//! the transport's flush pace is the upstream read pace; there is no
//! internal buffer.
//!
//! Dropping the body (caller disconnect) trips the request's
//! cancellation token through a guard, which aborts the upstream call
//! and settles usage for the tokens emitted so far.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crossbar_adapters::adapters::ChunkStream;
use crossbar_adapters::error::AdapterError;
use crossbar_adapters::normalize;

use crate::metrics;
use crate::usage::{UsageEvent, UsageRecorder};

/// Settles cancellation and usage exactly once, even when the stream is
/// dropped mid-flight.
struct StreamGuard {
    cancel: CancellationToken,
    usage: UsageRecorder,
    request_id: String,
    key_id: Option<String>,
    emitted_tokens: u64,
    settled: bool,
}

impl StreamGuard {
    fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        metrics::metrics().stream_finished();
        if let Some(key_id) = &self.key_id {
            self.usage.record(UsageEvent {
                request_id: self.request_id.clone(),
                key_id: key_id.clone(),
                tokens: self.emitted_tokens,
            });
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // A drop before settle means the caller went away; abort the
        // upstream and bill what was actually emitted.
        if !self.settled {
            self.cancel.cancel();
            tracing::debug!(
                request_id = %self.request_id,
                emitted_tokens = self.emitted_tokens,
                "stream dropped by caller"
            );
        }
        self.settle();
    }
}

/// Wrap an adapter stream as a committed SSE response.
///
/// `key_id` is the authenticated key to bill; `precharged` tokens were
/// already deducted and the emitted total is reconciled by the caller's
/// usage path.
pub fn sse_response(
    stream: ChunkStream,
    model: String,
    request_id: String,
    key_id: Option<String>,
    cancel: CancellationToken,
    usage: UsageRecorder,
) -> Response<Body> {
    metrics::metrics().stream_started();

    let stream_id = normalize::new_completion_id();
    let created = normalize::now_unix();

    let body_stream = async_stream::stream! {
        let mut guard = StreamGuard {
            cancel,
            usage,
            request_id,
            key_id,
            emitted_tokens: 0,
            settled: false,
        };
        let mut upstream = stream;

        loop {
            // One upstream frame per downstream poll: the previous write
            // must complete before this read is issued.
            let next = futures::StreamExt::next(&mut upstream).await;
            match next {
                Some(Ok(chunk)) => {
                    for choice in &chunk.choices {
                        if let Some(content) = &choice.delta.content {
                            guard.emitted_tokens += (content.len() as u64 / 4).max(1);
                        }
                    }
                    match serde_json::to_string(&chunk) {
                        Ok(json) => {
                            yield Ok::<_, std::convert::Infallible>(
                                axum::body::Bytes::from(format!("data: {json}\n\n")),
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "chunk serialization failed");
                            break;
                        }
                    }
                }
                Some(Err(AdapterError::Cancelled)) => {
                    // The caller is gone; nothing to write to.
                    break;
                }
                Some(Err(e)) => {
                    // Committed response: report in-band and terminate.
                    let error_chunk = normalize::error_chunk(
                        &model,
                        &stream_id,
                        created,
                        &e.to_string(),
                    );
                    let json = error_chunk.to_string();
                    yield Ok(axum::body::Bytes::from(format!("data: {json}\n\n")));
                    break;
                }
                None => break,
            }
        }

        yield Ok(axum::body::Bytes::from("data: [DONE]\n\n"));
        guard.settle();
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap()
}
