use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use prism_codec::{StopReason, StreamConverter, UsageInfo, peek_embedded_error};
use prism_common::ApiFormat;
use prism_protocol::sse::SseParser;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct StreamProcessorConfig {
    /// Non-empty SSE events inspected before any byte reaches the client.
    pub prefetch_events: usize,
    /// How often the forwarder polls for client disconnect.
    pub disconnect_check: Duration,
    pub channel_capacity: usize,
}

impl Default for StreamProcessorConfig {
    fn default() -> Self {
        Self {
            prefetch_events: 5,
            disconnect_check: Duration::from_millis(250),
            channel_capacity: 16,
        }
    }
}

/// Final accounting for one streamed attempt.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub status_code: u16,
    pub usage: UsageInfo,
    pub stop_reason: Option<StopReason>,
    pub ttfb_ms: Option<i64>,
    pub error: Option<String>,
}

/// Read ahead far enough to decide whether the 200 actually carries an
/// error envelope (Gemini returns errors with HTTP 200). Returns the
/// consumed chunks so the forwarder can replay them; raises `Embedded`
/// before a single byte is forwarded when an error is found.
pub(crate) async fn prefetch_embedded_error(
    upstream: &mut mpsc::Receiver<Bytes>,
    endpoint_format: ApiFormat,
    max_events: usize,
) -> Result<Vec<Bytes>, GatewayError> {
    let mut prefetched = Vec::new();
    let mut parser = SseParser::new();
    let mut inspected = 0usize;

    while inspected < max_events {
        let Some(chunk) = upstream.recv().await else {
            break;
        };
        let events = parser.push_bytes(&chunk);
        prefetched.push(chunk);

        let mut settled = false;
        for event in events {
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            inspected += 1;
            if data == "[DONE]" {
                settled = true;
                break;
            }
            if let Some(error) = peek_embedded_error(endpoint_format, data) {
                return Err(GatewayError::Embedded(error));
            }
            // First well-formed payload without an error envelope: the
            // stream is healthy, stop looking.
            if serde_json::from_str::<serde_json::Value>(data).is_ok() {
                settled = true;
                break;
            }
            if inspected >= max_events {
                settled = true;
                break;
            }
        }
        if settled {
            break;
        }
    }

    Ok(prefetched)
}

/// Forward the upstream stream to the client, converting on the fly when
/// the dialects differ. Returns the client byte channel and a receiver
/// that resolves to the final accounting once the stream ends.
pub(crate) fn spawn_stream_forwarder(
    config: StreamProcessorConfig,
    mut converter: StreamConverter,
    prefetched: Vec<Bytes>,
    mut upstream: mpsc::Receiver<Bytes>,
    started_at: Instant,
    request_id: String,
) -> (mpsc::Receiver<Bytes>, oneshot::Receiver<StreamOutcome>) {
    let (tx, rx) = mpsc::channel::<Bytes>(config.channel_capacity);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut ttfb_ms: Option<i64> = None;
        let mut status_code: u16 = 200;
        let mut error: Option<String> = None;
        let mut check = tokio::time::interval(config.disconnect_check);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'outer: {
            for chunk in prefetched {
                let events = parser.push_bytes(&chunk);
                if converter.is_passthrough() {
                    if !forward(&tx, &mut ttfb_ms, started_at, chunk).await {
                        status_code = 499;
                        error = Some("client_disconnected".to_string());
                        break 'outer;
                    }
                }
                for event in events {
                    match converter.push_event(&event) {
                        Ok(frames) => {
                            for frame in frames {
                                if !forward(&tx, &mut ttfb_ms, started_at, frame).await {
                                    status_code = 499;
                                    error = Some("client_disconnected".to_string());
                                    break 'outer;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(request_id, %err, "stream event conversion failed");
                        }
                    }
                }
            }

            loop {
                let chunk = tokio::select! {
                    chunk = upstream.recv() => chunk,
                    _ = check.tick() => {
                        if tx.is_closed() {
                            status_code = 499;
                            error = Some("client_disconnected".to_string());
                            break 'outer;
                        }
                        continue;
                    }
                };
                let Some(chunk) = chunk else {
                    break;
                };

                let events = parser.push_bytes(&chunk);
                if converter.is_passthrough() {
                    if !forward(&tx, &mut ttfb_ms, started_at, chunk).await {
                        status_code = 499;
                        error = Some("client_disconnected".to_string());
                        break 'outer;
                    }
                }
                for event in events {
                    match converter.push_event(&event) {
                        Ok(frames) => {
                            for frame in frames {
                                if !forward(&tx, &mut ttfb_ms, started_at, frame).await {
                                    status_code = 499;
                                    error = Some("client_disconnected".to_string());
                                    break 'outer;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(request_id, %err, "stream event conversion failed");
                        }
                    }
                }
            }

            // Upstream closed normally: flush parser and converter tails.
            for event in parser.finish() {
                if let Ok(frames) = converter.push_event(&event) {
                    for frame in frames {
                        if !forward(&tx, &mut ttfb_ms, started_at, frame).await {
                            status_code = 499;
                            error = Some("client_disconnected".to_string());
                            break 'outer;
                        }
                    }
                }
            }
            match converter.finish() {
                Ok(frames) => {
                    for frame in frames {
                        if !forward(&tx, &mut ttfb_ms, started_at, frame).await {
                            status_code = 499;
                            error = Some("client_disconnected".to_string());
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(request_id, %err, "stream finish conversion failed");
                }
            }
        }

        if status_code == 499 {
            // Stop reading the upstream; dropping the receiver cancels it.
            upstream.close();
        }

        if let Some(embedded) = converter.embedded_error() {
            tracing::warn!(request_id, error = ?embedded, "error arrived mid-stream");
            error.get_or_insert_with(|| embedded.message.clone());
        }

        let outcome = StreamOutcome {
            status_code,
            usage: converter.usage(),
            stop_reason: converter.stop_reason(),
            ttfb_ms,
            error,
        };
        let _ = outcome_tx.send(outcome);
    });

    (rx, outcome_rx)
}

/// Forward one buffer to the client, stamping TTFB on the first byte.
/// Returns false once the client side is gone.
async fn forward(
    tx: &mpsc::Sender<Bytes>,
    ttfb: &mut Option<i64>,
    started_at: Instant,
    bytes: Bytes,
) -> bool {
    if bytes.is_empty() {
        return true;
    }
    if ttfb.is_none() {
        *ttfb = Some(started_at.elapsed().as_millis() as i64);
    }
    tx.send(bytes).await.is_ok()
}

#[cfg(test)]
mod tests {
    use prism_codec::ErrorKind;

    use super::*;

    fn chunked(body: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(64);
        let body = body.to_string();
        tokio::spawn(async move {
            for chunk in body.as_bytes().chunks(16) {
                if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn prefetch_detects_gemini_embedded_error() {
        let body = "data: {\"error\":{\"message\":\"quota exhausted\",\"status\":\"RESOURCE_EXHAUSTED\"}}\n\n";
        let mut rx = chunked(body);
        let result = prefetch_embedded_error(&mut rx, ApiFormat::Gemini, 5).await;
        match result {
            Err(GatewayError::Embedded(error)) => {
                assert_eq!(error.kind, ErrorKind::RateLimit);
            }
            other => panic!("expected embedded error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefetch_passes_healthy_stream_through() {
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n\n";
        let mut rx = chunked(body);
        let prefetched = prefetch_embedded_error(&mut rx, ApiFormat::Gemini, 5)
            .await
            .unwrap();
        let total: usize = prefetched.iter().map(|b| b.len()).sum();
        assert_eq!(total, body.len());
    }

    #[tokio::test]
    async fn passthrough_forwarder_preserves_bytes_and_usage() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",",
            "\"role\":\"assistant\",\"model\":\"claude-sonnet-4-5\",\"content\":[],",
            "\"usage\":{\"input_tokens\":3,\"output_tokens\":0}}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},",
            "\"usage\":{\"input_tokens\":3,\"output_tokens\":7}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let upstream = chunked(body);
        let converter = StreamConverter::passthrough(ApiFormat::Claude);
        let (mut client_rx, outcome_rx) = spawn_stream_forwarder(
            StreamProcessorConfig::default(),
            converter,
            Vec::new(),
            upstream,
            Instant::now(),
            "req-1".to_string(),
        );

        let mut collected = Vec::new();
        while let Some(chunk) = client_rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, body.as_bytes());

        let outcome = outcome_rx.await.unwrap();
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.usage.input_tokens, 3);
        assert_eq!(outcome.usage.output_tokens, 7);
        assert_eq!(outcome.stop_reason, Some(StopReason::EndTurn));
        assert!(outcome.ttfb_ms.is_some());
    }

    #[tokio::test]
    async fn dropped_client_records_499() {
        let (upstream_tx, upstream) = mpsc::channel::<Bytes>(4);
        let converter = StreamConverter::passthrough(ApiFormat::Claude);
        let config = StreamProcessorConfig {
            disconnect_check: Duration::from_millis(10),
            ..StreamProcessorConfig::default()
        };
        let (client_rx, outcome_rx) = spawn_stream_forwarder(
            config,
            converter,
            Vec::new(),
            upstream,
            Instant::now(),
            "req-1".to_string(),
        );

        drop(client_rx);
        // Keep the upstream open so only the disconnect check can end it.
        let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx)
            .await
            .expect("forwarder should notice the disconnect")
            .unwrap();
        assert_eq!(outcome.status_code, 499);
        assert_eq!(outcome.error.as_deref(), Some("client_disconnected"));
        drop(upstream_tx);
    }
}
