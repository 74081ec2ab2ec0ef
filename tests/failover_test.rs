//! # 故障转移执行器测试
//!
//! 截止时间嵌套与尝试顺序，使用暂停的 tokio 时钟

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use upstream_scheduler::{
    scheduler::{
        AttemptError, AttemptOutcome, Deadline, FailoverContext, FailoverOutcome, FailoverPolicy,
        FailoverRun, run_with_failover,
    },
    types::{ChannelType, CredentialKind, Selection},
};

fn selections(n: i64) -> Vec<Selection> {
    (0..n)
        .map(|i| Selection {
            channel_id: 1,
            channel_type: ChannelType::OpenaiCompatible,
            endpoint_id: 10,
            base_url: "https://upstream.example.com/v1".to_string(),
            credential_kind: CredentialKind::ApiKey,
            credential_id: 100 + i,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn hanging_attempts_stop_at_batch_deadline() {
    let list = selections(5);
    let ctx = FailoverContext {
        request_id: "batch",
        deadline: Deadline::after(Duration::from_secs(90)),
    };

    let run: FailoverRun<(), &str> = run_with_failover(
        ctx,
        &list,
        &FailoverPolicy::probe(Duration::from_secs(20)),
        |_, _, _| async {
            std::future::pending::<()>().await;
            AttemptOutcome::Success(())
        },
    )
    .await;

    // 4 次完整的 20s 尝试，第 5 次只剩 10s
    assert_eq!(run.attempts, 5);
    assert!(matches!(
        run.outcome,
        FailoverOutcome::DeadlineExceeded(Some(AttemptError::TimedOut { after })) if after == Duration::from_secs(10)
    ));
}

#[tokio::test(start_paused = true)]
async fn attempt_deadline_never_outlives_outer_deadline() {
    let list = selections(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let ctx = FailoverContext {
        request_id: "nested",
        deadline: Deadline::after(Duration::from_secs(5)),
    };

    let sink = seen.clone();
    let run = run_with_failover(
        ctx,
        &list,
        &FailoverPolicy::probe(Duration::from_secs(20)),
        move |_, _, sub: Deadline| {
            sink.lock().unwrap().push(sub.remaining());
            async { AttemptOutcome::<u8, &str>::Success(1) }
        },
    )
    .await;

    assert!(run.is_success());
    assert_eq!(seen.lock().unwrap().as_slice(), &[Duration::from_secs(5)]);
}

#[tokio::test]
async fn attempts_follow_selection_order() {
    let list = selections(3);
    let order = Mutex::new(Vec::new());
    let ctx = FailoverContext {
        request_id: "order",
        deadline: Deadline::after(Duration::from_secs(10)),
    };

    let run = run_with_failover(
        ctx,
        &list,
        &FailoverPolicy::probe(Duration::from_secs(1)),
        |index, selection, _| {
            order.lock().unwrap().push(selection.credential_id);
            async move {
                if index < 2 {
                    AttemptOutcome::Retryable(format!("failed {index}"))
                } else {
                    AttemptOutcome::Success(selection.credential_id)
                }
            }
        },
    )
    .await;

    assert_eq!(*order.lock().unwrap(), vec![100, 101, 102]);
    assert_eq!(run.used_index, Some(2));
    assert!(matches!(run.outcome, FailoverOutcome::Success(102)));
}

#[tokio::test]
async fn exhausted_run_keeps_last_error() {
    let list = selections(2);
    let ctx = FailoverContext {
        request_id: "exhausted",
        deadline: Deadline::after(Duration::from_secs(10)),
    };

    let run: FailoverRun<(), String> = run_with_failover(
        ctx,
        &list,
        &FailoverPolicy::probe(Duration::from_secs(1)),
        |index, _, _| async move { AttemptOutcome::Retryable(format!("status 50{index}")) },
    )
    .await;

    let FailoverOutcome::Exhausted(Some(last)) = run.outcome else {
        panic!("expected exhaustion");
    };
    assert_eq!(last.to_string(), "status 501");
}
