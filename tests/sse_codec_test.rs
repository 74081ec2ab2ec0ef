//! `测试：utils::sse` 的逐行解析行为

use bytes::BytesMut;
use tokio_util::codec::Decoder; // bring decode/decode_eof into scope
use upstream_scheduler::utils::sse::{DONE_SENTINEL, SseLine, SseLineCodec};

fn decode_all(codec: &mut SseLineCodec, buf: &mut BytesMut) -> Vec<SseLine> {
    let mut lines = Vec::new();
    while let Some(line) = codec.decode(buf).unwrap() {
        lines.push(line);
    }
    lines
}

#[test]
fn sse_data_line_is_available_before_event_boundary() {
    let mut codec = SseLineCodec::default();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"data: {\"a\":1}\n");

    let line = codec.decode(&mut buf).unwrap().expect("one line");
    assert_eq!(line, SseLine::Data("{\"a\":1}".to_string()));
    let value: serde_json::Value = serde_json::from_str(line.data().unwrap()).unwrap();
    assert_eq!(value.get("a").and_then(serde_json::Value::as_i64), Some(1));
}

#[test]
fn sse_fields_and_comment_lines() {
    let mut codec = SseLineCodec::default();
    let mut buf = BytesMut::new();
    // 注释行以冒号开头，作为心跳处理
    buf.extend_from_slice(b": keep-alive\n");
    buf.extend_from_slice(b"event: delta\n");
    buf.extend_from_slice(b"id: 7\n");
    buf.extend_from_slice(b"retry: 1500\n");
    buf.extend_from_slice(b"data:  padded\n\n");

    let lines = decode_all(&mut codec, &mut buf);
    assert_eq!(
        lines,
        vec![
            SseLine::Comment,
            SseLine::Event("delta".to_string()),
            SseLine::Id("7".to_string()),
            SseLine::Retry(1500),
            SseLine::Data(" padded".to_string()),
            SseLine::Blank,
        ]
    );
    assert_eq!(lines[4].data(), Some("padded"));
}

#[test]
fn sse_cross_chunk_and_crlf() {
    let mut codec = SseLineCodec::default();
    let mut buf = BytesMut::new();
    // 第一块：行未结束
    buf.extend_from_slice(b"event: delta\r\ndata: {\"k\":");
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(SseLine::Event("delta".to_string())));
    assert!(codec.decode(&mut buf).unwrap().is_none(), "no complete line yet");

    // 第二块：补齐该行
    buf.extend_from_slice(b"\"v\"}\r\n\r\n");
    let line = codec.decode(&mut buf).unwrap().expect("line after newline");
    assert_eq!(line.data(), Some("{\"k\":\"v\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(SseLine::Blank));
}

#[test]
fn sse_done_sentinel_and_empty_data() {
    let mut codec = SseLineCodec::default();
    let mut buf = BytesMut::from("data: [DONE]\ndata:   \n");
    let lines = decode_all(&mut codec, &mut buf);
    assert_eq!(lines[0].data(), Some(DONE_SENTINEL));
    assert_eq!(lines[1].data(), None, "blank data is not a payload");
}

#[test]
fn sse_trailing_line_without_newline_is_flushed_at_eof() {
    let mut codec = SseLineCodec::default();
    let mut buf = BytesMut::from("{\"output_text\":\"pong\"}");
    assert!(codec.decode(&mut buf).unwrap().is_none());
    let last = codec.decode_eof(&mut buf).unwrap().expect("flushed line");
    assert_eq!(last, SseLine::Other("{\"output_text\":\"pong\"}".to_string()));
    assert!(codec.decode_eof(&mut buf).unwrap().is_none());
}

#[test]
fn sse_overlong_line_is_rejected() {
    let mut codec = SseLineCodec::new(16);
    let mut buf = BytesMut::from("data: this line keeps going without a newline");
    assert!(codec.decode(&mut buf).is_err());
}

#[tokio::test]
async fn sse_framed_reader_over_split_reads() {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    // 模拟上游分多次写入
    let reader = tokio_test::io::Builder::new()
        .read(b"event: response.output_text.delta\nda")
        .read(b"ta: {\"delta\":\"po\"}\n\n")
        .read(b"data: [DONE]")
        .build();

    let lines: Vec<SseLine> = FramedRead::new(reader, SseLineCodec::default())
        .map(|line| line.unwrap())
        .collect()
        .await;

    assert_eq!(
        lines,
        vec![
            SseLine::Event("response.output_text.delta".to_string()),
            SseLine::Data("{\"delta\":\"po\"}".to_string()),
            SseLine::Blank,
            SseLine::Data("[DONE]".to_string()),
        ]
    );
}
