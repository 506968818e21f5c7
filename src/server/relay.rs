use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

/// Token counts reported by the upstream, attached to the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Best-effort parse of a top-level `usage` object.
pub fn parse_usage(body: &[u8]) -> Option<TokenUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    usage_from_value(&value)
}

fn usage_from_value(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_i64);
    let completion = usage.get("completion_tokens").and_then(Value::as_i64);
    let total = usage.get("total_tokens").and_then(Value::as_i64);

    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }

    let prompt = prompt.unwrap_or(0);
    let completion = completion.unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total.unwrap_or(prompt + completion),
    })
}

/// Parses SSE data frames for `usage`, retaining the last one seen.
/// `[DONE]` markers and malformed frames are skipped.
#[derive(Default)]
pub struct SseUsageScanner {
    last: Option<TokenUsage>,
}

impl SseUsageScanner {
    pub fn scan_line(&mut self, line: &str) {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" || !data.contains("\"usage\"") {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            if let Some(usage) = usage_from_value(&value) {
                self.last = Some(usage);
            }
        }
    }

    pub fn into_usage(self) -> Option<TokenUsage> {
        self.last
    }
}

/// How a streaming relay ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// Upstream finished; the client received everything.
    Complete,
    /// The client went away; reading stopped and upstream was dropped.
    ClientGone,
    /// Upstream failed mid-stream after the response headers.
    UpstreamError(String),
}

/// Forwards the upstream SSE body line by line into the response channel,
/// scanning each line for token usage. The reader never buffers more than
/// the current incomplete line; every complete line is sent (and therefore
/// flushed) individually.
pub async fn relay_sse_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> (Option<TokenUsage>, StreamEnd) {
    let mut scanner = SseUsageScanner::default();
    let mut buf: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();

    let end = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    scanner.scan_line(&String::from_utf8_lossy(&line));
                    if tx.send(Ok(Bytes::from(line))).await.is_err() {
                        return (scanner.into_usage(), StreamEnd::ClientGone);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Error reading upstream stream: {}", e);
                break StreamEnd::UpstreamError(e.to_string());
            }
            None => break StreamEnd::Complete,
        }
    };

    // Trailing bytes without a final newline still belong to the client.
    if !buf.is_empty() {
        scanner.scan_line(&String::from_utf8_lossy(&buf));
        if tx.send(Ok(Bytes::from(buf))).await.is_err() {
            return (scanner.into_usage(), StreamEnd::ClientGone);
        }
    }

    (scanner.into_usage(), end)
}
