//! # 测试辅助函数

use serde_json::json;
use std::io::Write;
use std::sync::Once;
use tempfile::NamedTempFile;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static INIT: Once = Once::new();

/// 初始化测试日志，多次调用只生效一次
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("upstream_scheduler=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Responses 风格的 event-stream 响应体
#[must_use]
pub fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let event = json!({"type": "response.output_text.delta", "delta": delta});
        body.push_str(&format!("event: response.output_text.delta\ndata: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// 写入临时配置文件
pub fn write_config(contents: &str) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// 在 mock 上游挂载一个 event-stream 响应
pub async fn mount_sse(server: &MockServer, route: &str, body: String) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(server)
        .await;
}
