//! # 探测结果汇总
//!
//! 把逐模型的结果折叠成渠道级的 (是否健康, 延迟) 与一段人类可读的说明。

use crate::types::TestResult;
use crate::utils::text::trim_summary;

/// 失败说明中最多列出的模型数
const MAX_LISTED_FAILURES: usize = 3;

/// 渠道级健康与延迟
///
/// - 全部成功：健康，延迟取成功结果中最小的 TTFT
/// - 部分成功：不健康，延迟取成功结果中最小的 TTFT
/// - 全部失败：不健康，延迟取所有结果中最小的 TTFT
///
/// 未真正发起尝试的结果 TTFT 为 0，只要存在非零 TTFT 就不参与取最小值。
#[must_use]
pub fn aggregate(results: &[TestResult]) -> (bool, u64) {
    let all_ok = !results.is_empty() && results.iter().all(|r| r.ok);
    let successes: Vec<_> = results.iter().filter(|r| r.ok).collect();
    let latency = if successes.is_empty() {
        fastest(results.iter())
    } else {
        fastest(successes.into_iter())
    };
    (all_ok, latency)
}

fn fastest<'a>(results: impl Iterator<Item = &'a TestResult> + Clone) -> u64 {
    results
        .clone()
        .map(|r| r.ttft_ms)
        .filter(|ms| *ms > 0)
        .min()
        .or_else(|| results.map(|r| r.ttft_ms).min())
        .unwrap_or(0)
}

fn model_label(result: &TestResult) -> String {
    if result.upstream_model.is_empty() || result.upstream_model == result.public_model {
        result.public_model.clone()
    } else {
        format!("{} ({})", result.public_model, result.upstream_model)
    }
}

fn reason(result: &TestResult) -> &str {
    let trimmed = result.error.trim();
    if trimmed.is_empty() { "unknown" } else { trimmed }
}

/// 健康时的说明
#[must_use]
pub fn ok_message(results: &[TestResult], latency_ms: u64) -> String {
    let message = match results {
        [single] => format!(
            "stream probe ok: model={}, TTFT {}ms, sample: {}",
            model_label(single),
            single.ttft_ms,
            single.sample
        ),
        _ => format!("stream probe ok: {} models, fastest TTFT {latency_ms}ms", results.len()),
    };
    trim_summary(&message)
}

/// 不健康时的说明，列出前几个失败模型及原因
#[must_use]
pub fn fail_message(results: &[TestResult], latency_ms: u64) -> String {
    let message = match results {
        [] => "stream probe failed: no models tested".to_string(),
        [single] => format!(
            "stream probe failed: model={}, TTFT {}ms, reason: {}",
            model_label(single),
            single.ttft_ms,
            reason(single)
        ),
        _ => {
            let ok = results.iter().filter(|r| r.ok).count();
            let failures: Vec<_> = results.iter().filter(|r| !r.ok).collect();
            let mut listed = failures
                .iter()
                .take(MAX_LISTED_FAILURES)
                .map(|r| format!("{}({})", r.public_model, reason(r)))
                .collect::<Vec<_>>()
                .join("; ");
            if failures.len() > MAX_LISTED_FAILURES {
                listed.push_str(&format!(" (+{} more)", failures.len() - MAX_LISTED_FAILURES));
            }
            format!(
                "stream probe failed: ok {ok}/{}, fastest TTFT {latency_ms}ms, failures: {listed}",
                results.len()
            )
        }
    };
    trim_summary(&message)
}
