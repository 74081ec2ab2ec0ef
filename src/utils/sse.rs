//! # Event-stream 行解码
//!
//! 逐行解析 `text/event-stream`，在第一条 `data:` 行到达时即可产出，
//! 不必等待事件结束的空行。

use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

/// 流结束哨兵
pub const DONE_SENTINEL: &str = "[DONE]";

/// 单行解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// `data:` 字段，值已去掉首个空格
    Data(String),
    /// `event:` 字段
    Event(String),
    /// `id:` 字段
    Id(String),
    /// `retry:` 字段
    Retry(u64),
    /// 以冒号开头的注释行（心跳）
    Comment,
    /// 空行，事件边界
    Blank,
    /// 非 event-stream 格式的行
    Other(String),
}

impl SseLine {
    /// 去除首尾空白后的 data 内容，空 data 返回 None
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::Data(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            _ => None,
        }
    }

    fn parse(line: &str) -> Self {
        let line = line.trim_start_matches('\u{feff}');
        if line.trim().is_empty() {
            return Self::Blank;
        }
        if line.starts_with(':') {
            return Self::Comment;
        }

        let Some(idx) = line.find(':') else {
            return Self::Other(line.to_string());
        };
        let field = line[..idx].trim();
        let value = line[idx + 1..].strip_prefix(' ').unwrap_or(&line[idx + 1..]);

        match field {
            "data" => Self::Data(value.to_string()),
            "event" => Self::Event(value.to_string()),
            "id" => Self::Id(value.to_string()),
            "retry" => value
                .trim()
                .parse::<u64>()
                .map_or_else(|_| Self::Other(line.to_string()), Self::Retry),
            _ => Self::Other(line.to_string()),
        }
    }
}

/// 行解码器，单行超过上限时报错
#[derive(Debug, Clone)]
pub struct SseLineCodec {
    max_line_bytes: usize,
}

impl SseLineCodec {
    /// 默认单行上限 256 KiB
    pub const DEFAULT_MAX_LINE_BYTES: usize = 256 * 1024;

    #[must_use]
    pub const fn new(max_line_bytes: usize) -> Self {
        Self { max_line_bytes }
    }

    fn take_one_line(&self, src: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_line_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("event-stream line exceeds {} bytes", self.max_line_bytes),
                ));
            }
            return Ok(None);
        };

        let mut line_bytes = src.split_to(pos + 1);
        line_bytes.truncate(line_bytes.len() - 1);
        if line_bytes.ends_with(b"\r") {
            line_bytes.truncate(line_bytes.len() - 1);
        }
        String::from_utf8(line_bytes.to_vec())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Default for SseLineCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_LINE_BYTES)
    }
}

impl Decoder for SseLineCodec {
    type Item = SseLine;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        Ok(self.take_one_line(src)?.map(|line| SseLine::parse(&line)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        let mut last = String::from_utf8(rest.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if last.ends_with('\r') {
            last.pop();
        }
        Ok(Some(SseLine::parse(&last)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_with_garbage_is_other() {
        let mut codec = SseLineCodec::default();
        let mut buf = BytesMut::from("retry: soon\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(SseLine::Other("retry: soon".to_string()))
        );
    }

    #[test]
    fn oversized_partial_line_errors() {
        let mut codec = SseLineCodec::new(8);
        let mut buf = BytesMut::from("data: 0123456789");
        assert!(codec.decode(&mut buf).is_err());
    }
}
