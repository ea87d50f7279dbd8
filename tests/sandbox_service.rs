mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use common::{FakeLauncher, FakeReferences};
use webjudge::browser::BrowserPool;
use webjudge::channel::{SandboxClient, TaskDispatcher};
use webjudge::sandbox::{RuntimeLimits, SandboxService, ScriptRuntime, serve};
use webjudge::task::{CheckStatus, JudgeOutcome, JudgeReply, Mode, Task};

fn service() -> Arc<SandboxService> {
    let pool = BrowserPool::new(Arc::new(FakeLauncher::default()), 1, 4);
    let runtime = ScriptRuntime::new(
        RuntimeLimits {
            script_timeout: Duration::from_secs(5),
            ..RuntimeLimits::default()
        },
        Arc::new(FakeReferences::default()),
    );
    Arc::new(SandboxService::new(pool, runtime))
}

fn task(record_id: i64, heading: &str) -> Task {
    Task {
        judge_record_id: record_id,
        judge_script: format!(
            r#"
            fn main(system, page) {{
                system.define_checkpoint("heading", 10, |ctx| {{
                    system.expect(page.text("h1") == "{heading}", "heading matches");
                    ctx.set(10);
                }});
            }}
            "#
        ),
        mode: Mode::Judge,
        url: "http://target:8080".to_string(),
        info: Some(HashMap::new()),
    }
}

fn status(reply: &JudgeReply) -> CheckStatus {
    match &reply.outcome {
        JudgeOutcome::Done(summary) => summary.status,
        JudgeOutcome::Error { message } => panic!("unexpected error reply: {message}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_tasks_get_error_replies() {
    let service = service();

    let empty_script = json!({
        "judgeRecordId": 5,
        "judgeScript": " ",
        "mode": "audit",
        "url": "http://target:8080"
    });
    let reply = service
        .handle_request(empty_script.to_string().as_bytes())
        .await;
    assert_eq!(reply.judge_record_id, 5);
    assert!(matches!(reply.outcome, JudgeOutcome::Error { ref message } if message.contains("judgeScript")));

    let judge_without_info = json!({
        "judgeRecordId": 6,
        "judgeScript": "fn main(system, page) {}",
        "mode": "judge",
        "url": "http://target:8080"
    });
    let reply = service
        .handle_request(judge_without_info.to_string().as_bytes())
        .await;
    assert_eq!(reply.judge_record_id, 6);
    assert!(matches!(reply.outcome, JudgeOutcome::Error { .. }));

    let reply = service.handle_request(b"not json at all").await;
    assert_eq!(reply.judge_record_id, 0);
    assert!(matches!(reply.outcome, JudgeOutcome::Error { .. }));

    // Nothing was opened for rejected tasks
    assert!(service.pool().is_empty().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replies_survive_framing() {
    let service = service();
    let frame = service
        .handle_frame(serde_json::to_vec(&task(9, "Hello")).unwrap().as_slice())
        .await;
    let reply = JudgeReply::decode(&frame).unwrap();

    assert_eq!(reply.judge_record_id, 9);
    assert_eq!(status(&reply), CheckStatus::Pass);
    let JudgeOutcome::Done(summary) = reply.outcome else {
        unreachable!()
    };
    assert!(summary.first_screen.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_tasks_over_shared_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let token = CancellationToken::new();
    // Short heartbeat so pings interleave with replies
    let server = tokio::spawn(serve(
        listener,
        service(),
        Duration::from_millis(20),
        token.clone(),
    ));

    let client = SandboxClient::new();
    let client_task = tokio::spawn(Arc::clone(&client).run(
        address,
        Duration::from_millis(50),
        token.clone(),
    ));
    for _ in 0..100 {
        if client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(client.is_connected());

    let passing = task(1, "Hello");
    let failing = task(2, "Goodbye");
    let (a, b) = tokio::join!(client.send(&passing), client.send(&failing));
    let timeout = Duration::from_secs(10);
    let (a, b) = tokio::join!(a.unwrap().wait(timeout), b.unwrap().wait(timeout));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.judge_record_id, 1);
    assert_eq!(status(&a), CheckStatus::Pass);
    assert_eq!(b.judge_record_id, 2);
    assert_eq!(status(&b), CheckStatus::Fail);
    assert!(client.pending().is_empty());

    token.cancel();
    server.await.unwrap().unwrap();
    client_task.await.unwrap();
}
