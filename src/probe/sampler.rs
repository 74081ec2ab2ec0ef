//! # 流式响应采样
//!
//! 逐行解析上游的流式响应，记录首个 data 行的到达时间（近似 TTFT），
//! 并截取一段有限长度的文本样本。整个过程只读取响应体的有限前缀。

use bytes::BytesMut;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::codec::Decoder;

use crate::config::ProbeConfig;
use crate::logging::{LogComponent, LogStage};
use crate::transport::BodyStream;
use crate::utils::sse::{DONE_SENTINEL, SseLine, SseLineCodec};
use crate::utils::text::{summarize_upstream_error_body, trim_summary, truncate_chars};
use crate::ldebug;

/// 采样上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerLimits {
    /// 样本文本最大字符数
    pub max_chars: usize,
    /// 最多解析的 data 事件数
    pub max_events: usize,
    /// 最多读取的响应体字节数
    pub max_prefix_bytes: usize,
}

impl Default for SamplerLimits {
    fn default() -> Self {
        Self {
            max_chars: 200,
            max_events: 12,
            max_prefix_bytes: 256 * 1024,
        }
    }
}

impl From<&ProbeConfig> for SamplerLimits {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_chars: config.max_sample_chars,
            max_events: config.max_events,
            max_prefix_bytes: config.max_prefix_bytes,
        }
    }
}

/// 采样结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSample {
    /// 首个非空 data 行到达的耗时
    pub ttft_ms: Option<u64>,
    /// 单行化的样本文本
    pub text: String,
    /// 解析过的 data 事件数（不含结束哨兵）
    pub events: usize,
    /// 读取到的字节数
    pub bytes_read: usize,
    /// 按非流式响应兜底解析
    pub fallback_used: bool,
    pub error: Option<String>,
}

impl StreamSample {
    /// 拿到了非空样本且没有错误
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.text.trim().is_empty()
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Collector<'a> {
    limits: &'a SamplerLimits,
    start: Instant,
    out: StreamSample,
    raw: String,
    saw_data: bool,
}

impl Collector<'_> {
    fn on_line(&mut self, line: &SseLine) -> Flow {
        let Some(data) = line.data() else {
            return Flow::Continue;
        };
        self.saw_data = true;
        if self.out.ttft_ms.is_none() {
            self.out.ttft_ms = Some(elapsed_ms(self.start));
        }
        if data == DONE_SENTINEL {
            return Flow::Stop;
        }

        self.out.events += 1;
        if let Ok(event) = serde_json::from_str::<Value>(data) {
            if let Some(delta) = event_delta(&event) {
                self.raw.push_str(delta);
            } else if self.raw.is_empty() {
                if let Some(text) = non_blank(event.get("text")) {
                    self.raw.push_str(text);
                }
            }
        }

        if self.raw.chars().count() >= self.limits.max_chars || self.out.events >= self.limits.max_events {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn finish(mut self, prefix: &[u8], content_type: Option<&str>) -> StreamSample {
        let is_event_stream = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"));
        if !self.saw_data && !is_event_stream && self.out.error.is_none() {
            self.out.fallback_used = true;
            match fallback_sample(prefix) {
                Some(text) => self.raw = text,
                None => {
                    let summary = summarize_upstream_error_body(prefix);
                    let ct = content_type.unwrap_or_default();
                    self.out.error = Some(if summary.is_empty() {
                        format!("no SSE (Content-Type={ct:?})")
                    } else {
                        format!("no SSE (Content-Type={ct:?}): {summary}")
                    });
                }
            }
        }

        self.out.text = trim_summary(truncate_chars(&self.raw, self.limits.max_chars));
        if self.out.error.is_none() && self.out.text.is_empty() {
            self.out.error = Some("SSE stream produced no text".to_string());
        }
        self.out
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn non_blank(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// 增量文本：Responses 的 `delta` 字符串，或 Anthropic 的 `delta.text`
fn event_delta(event: &Value) -> Option<&str> {
    let delta = event.get("delta")?;
    non_blank(Some(delta)).or_else(|| non_blank(delta.get("text")))
}

/// 非流式响应体的兜底样本
///
/// JSON 依次尝试 `output_text`、`text`、`output[].content[].text`、`content[].text`；
/// 非 JSON 的纯文本直接作为样本；JSON 中没有可识别的文本时返回 None。
fn fallback_sample(prefix: &[u8]) -> Option<String> {
    let raw = String::from_utf8_lossy(prefix);
    if raw.trim().is_empty() {
        return None;
    }
    let Ok(root) = serde_json::from_str::<Value>(&raw) else {
        return Some(raw.trim().to_string());
    };

    if let Some(text) = non_blank(root.get("output_text")).or_else(|| non_blank(root.get("text"))) {
        return Some(text.to_string());
    }
    let parts = |items: Option<&Value>| -> String {
        items
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|part| non_blank(part.get("text")))
            .collect()
    };
    let from_output: String = root
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|item| parts(item.get("content")))
        .collect();
    if !from_output.trim().is_empty() {
        return Some(from_output);
    }
    let from_content = parts(root.get("content"));
    (!from_content.trim().is_empty()).then_some(from_content)
}

/// 采样流式响应
///
/// `start` 为请求发出的时刻；`content_type` 为上游声明的类型，
/// 未声明为 event-stream 且没有任何 data 行时按普通响应体兜底解析。
pub async fn sample_stream(
    mut body: BodyStream,
    start: Instant,
    content_type: Option<&str>,
    limits: &SamplerLimits,
) -> StreamSample {
    let mut codec = SseLineCodec::new(limits.max_prefix_bytes);
    let mut pending = BytesMut::new();
    let mut prefix = BytesMut::new();
    let mut collector = Collector {
        limits,
        start,
        out: StreamSample::default(),
        raw: String::new(),
        saw_data: false,
    };

    'read: loop {
        loop {
            match codec.decode(&mut pending) {
                Ok(Some(line)) => {
                    if let Flow::Stop = collector.on_line(&line) {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    collector.out.error = Some(format!("SSE read failed: {err}"));
                    break 'read;
                }
            }
        }

        if prefix.len() >= limits.max_prefix_bytes {
            break;
        }
        match body.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(limits.max_prefix_bytes - prefix.len());
                prefix.extend_from_slice(&chunk[..take]);
                pending.extend_from_slice(&chunk[..take]);
            }
            Some(Err(err)) => {
                collector.out.error = Some(format!("SSE read failed: {err}"));
                break;
            }
            None => {
                while let Ok(Some(line)) = codec.decode_eof(&mut pending) {
                    if let Flow::Stop = collector.on_line(&line) {
                        break;
                    }
                }
                break;
            }
        }
    }

    collector.out.bytes_read = prefix.len();
    let sample = collector.finish(&prefix, content_type);
    ldebug!(
        "system",
        LogStage::Probe,
        LogComponent::Sampler,
        "stream_sampled",
        "流式响应采样完成",
        ttft_ms = ?sample.ttft_ms,
        events = sample.events,
        bytes = sample.bytes_read,
        fallback = sample.fallback_used
    );
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::helpers::sse_body;
    use bytes::Bytes;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn chunks(parts: Vec<String>) -> BodyStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p)))).boxed()
    }

    fn delayed(parts: Vec<(Duration, String)>) -> BodyStream {
        stream::iter(parts)
            .then(|(delay, part)| async move {
                tokio::time::sleep(delay).await;
                Ok(Bytes::from(part))
            })
            .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_sample_and_first_line_ttft() {
        let events: Vec<(Duration, String)> = (0..50)
            .map(|i| {
                let line = format!("data: {{\"delta\":\"{:0>10}\"}}\n\n", i);
                (Duration::from_millis(if i == 0 { 120 } else { 40 }), line)
            })
            .collect();
        let limits = SamplerLimits {
            max_events: 100,
            ..SamplerLimits::default()
        };

        let sample = sample_stream(delayed(events), Instant::now(), Some("text/event-stream"), &limits).await;
        assert!(sample.text.chars().count() <= 200);
        assert_eq!(sample.ttft_ms, Some(120));
        assert_eq!(sample.events, 20);
        assert!(sample.is_usable());
    }

    #[tokio::test]
    async fn stops_at_event_cap() {
        let deltas: Vec<String> = (0..30).map(|i| format!("{i} ")).collect();
        let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();

        let sample = sample_stream(
            chunks(vec![sse_body(&refs)]),
            Instant::now(),
            Some("text/event-stream"),
            &SamplerLimits::default(),
        )
        .await;
        assert_eq!(sample.events, 12);
        assert_eq!(sample.text, "0 1 2 3 4 5 6 7 8 9 10 11");
    }

    #[tokio::test]
    async fn handles_lines_split_across_chunks_and_crlf() {
        let parts = vec![
            "data: {\"del".to_string(),
            "ta\":\"po\"}\r\n\r\ndata: {\"delta\":\"ng\"}\r\n".to_string(),
            "\r\ndata: [DONE]\r\n\r\n".to_string(),
        ];
        let sample = sample_stream(chunks(parts), Instant::now(), Some("text/event-stream"), &SamplerLimits::default()).await;
        assert_eq!(sample.text, "pong");
        assert_eq!(sample.events, 2);
    }

    #[tokio::test]
    async fn anthropic_delta_objects_are_understood() {
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"pong\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        let sample = sample_stream(chunks(vec![body.to_string()]), Instant::now(), Some("text/event-stream"), &SamplerLimits::default()).await;
        assert_eq!(sample.text, "pong");
    }

    #[tokio::test]
    async fn event_stream_body_without_content_type_still_parses() {
        let sample = sample_stream(chunks(vec![sse_body(&["pong"])]), Instant::now(), None, &SamplerLimits::default()).await;
        assert_eq!(sample.text, "pong");
        assert!(!sample.fallback_used);
    }

    #[tokio::test]
    async fn falls_back_to_json_shapes() {
        let body = r#"{"output":[{"type":"message","content":[{"type":"output_text","text":"pong"}]}]}"#;
        let sample = sample_stream(chunks(vec![body.to_string()]), Instant::now(), Some("application/json"), &SamplerLimits::default()).await;
        assert!(sample.fallback_used);
        assert_eq!(sample.text, "pong");
        assert!(sample.is_usable());
    }

    #[tokio::test]
    async fn unknown_json_without_stream_is_an_error() {
        let body = r#"{"error":{"message":"model not allowed"}}"#;
        let sample = sample_stream(chunks(vec![body.to_string()]), Instant::now(), Some("application/json"), &SamplerLimits::default()).await;
        assert!(!sample.is_usable());
        assert_eq!(
            sample.error.as_deref(),
            Some("no SSE (Content-Type=\"application/json\"): model not allowed")
        );
    }

    #[tokio::test]
    async fn declared_event_stream_without_text_is_an_error() {
        let sample = sample_stream(
            chunks(vec![": keep-alive\n\ndata: [DONE]\n\n".to_string()]),
            Instant::now(),
            Some("text/event-stream"),
            &SamplerLimits::default(),
        )
        .await;
        assert!(sample.ttft_ms.is_some());
        assert_eq!(sample.error.as_deref(), Some("SSE stream produced no text"));
    }

    #[tokio::test]
    async fn never_reads_past_prefix_cap() {
        let limits = SamplerLimits {
            max_prefix_bytes: 64,
            ..SamplerLimits::default()
        };
        let body = vec![": ".to_string() + &"x".repeat(40) + "\n"; 10];
        let sample = sample_stream(chunks(body), Instant::now(), Some("text/event-stream"), &limits).await;
        assert_eq!(sample.bytes_read, 64);
        assert!(!sample.is_usable());
    }
}
