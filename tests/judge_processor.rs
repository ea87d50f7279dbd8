mod common;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{FakeContainers, FakeDispatcher, MemoryArtifacts, MemoryRecords, Responder};
use webjudge::config::{Seconds, TargetConfig};
use webjudge::judge::{JobProcessor, JudgeProcessor};
use webjudge::queue::ClaimedJob;
use webjudge::target::TargetOrchestrator;
use webjudge::task::{
    CheckPointResult, CheckStatus, JobRequest, JudgeOutcome, JudgeReply, JudgeSummary, Mode,
    SnapshotFile,
};

struct Harness {
    containers: Arc<FakeContainers>,
    dispatcher: Arc<FakeDispatcher>,
    artifacts: Arc<MemoryArtifacts>,
    records: Arc<MemoryRecords>,
    processor: JudgeProcessor,
    _work_dir: tempfile::TempDir,
}

fn harness(ready: bool, reply_timeout: Duration, respond: Responder) -> Harness {
    let work_dir = tempfile::tempdir().unwrap();
    let containers = FakeContainers::new(ready);
    let targets = Arc::new(TargetOrchestrator::new(
        containers.clone(),
        TargetConfig {
            start_timeout: Seconds(0.3),
            work_dir: Some(work_dir.path().to_path_buf()),
            ..TargetConfig::default()
        },
    ));
    let dispatcher = FakeDispatcher::new(respond);
    let artifacts = Arc::new(MemoryArtifacts::default());
    let records = Arc::new(MemoryRecords::default());
    let processor = JudgeProcessor::new(
        targets,
        dispatcher.clone(),
        artifacts.clone(),
        records.clone(),
        reply_timeout,
    );
    Harness {
        containers,
        dispatcher,
        artifacts,
        records,
        processor,
        _work_dir: work_dir,
    }
}

fn job(mode: Mode, expected_score: Option<f64>) -> ClaimedJob {
    let mut fs_snapshot = BTreeMap::new();
    fs_snapshot.insert(
        "index.html".to_string(),
        SnapshotFile::Text("<h1>Hello</h1>".to_string()),
    );
    ClaimedJob {
        job_id: 1,
        queued_at: webjudge::create_timestamp(),
        attempts: 0,
        request: JobRequest {
            judge_record_id: 77,
            judge_script: "fn main(system, page) {}".to_string(),
            fs_snapshot,
            mode,
            problem_id: 3,
            user_id: 9,
            expected_score,
        },
    }
}

fn done(record_id: i64, results: Vec<CheckPointResult>) -> JudgeReply {
    JudgeReply {
        judge_record_id: record_id,
        judge_time: 120,
        outcome: JudgeOutcome::Done(JudgeSummary::from_results(results, Some(vec![1, 2, 3]))),
    }
}

fn checkpoint(name: &str, score: f64, total: f64) -> CheckPointResult {
    CheckPointResult::new(name.to_string(), score, total, String::new(), BTreeMap::new())
}

#[tokio::test]
async fn test_audit_below_declared_total_is_not_passing() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| {
            Some(done(
                task.judge_record_id,
                vec![checkpoint("a", 5.0, 5.0), checkpoint("b", 3.0, 3.0)],
            ))
        }),
    );

    let verdict = h.processor.process(&job(Mode::Audit, Some(10.0))).await.unwrap();

    assert_eq!(verdict.status, CheckStatus::Fail);
    assert_eq!(verdict.total_score, 8.0);
    let records = h.records.records.lock();
    assert_eq!(records.len(), 1);
    assert!(!records[0].passed);
    assert!(records[0].message.is_empty());
    // A failed audit must not replace the problem's references
    assert!(h.records.references.lock().is_empty());
    assert_eq!(h.containers.stopped.lock().len(), 1);
}

#[tokio::test]
async fn test_passing_audit_records_references() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| {
            let mut files = BTreeMap::new();
            files.insert("home.png".to_string(), vec![9, 9, 9]);
            Some(done(
                task.judge_record_id,
                vec![CheckPointResult::new("looks".to_string(), 10.0, 10.0, String::new(), files)],
            ))
        }),
    );

    let verdict = h.processor.process(&job(Mode::Audit, Some(10.0))).await.unwrap();

    assert_eq!(verdict.status, CheckStatus::Pass);
    assert!(verdict.first_finalisation);
    let references = h.records.references.lock();
    let url = &references[&3]["home.png"];
    assert!(url.starts_with("mem://"));

    let records = h.records.records.lock();
    assert_eq!(records[0].results[0].cache_files["home.png"], *url);
    assert!(records[0].first_screen.is_some());
    // first screen and one checkpoint file
    assert_eq!(h.artifacts.files.lock().len(), 2);
}

#[tokio::test]
async fn test_judge_task_carries_problem_references() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| Some(done(task.judge_record_id, vec![checkpoint("a", 1.0, 1.0)]))),
    );
    h.records.references.lock().insert(
        3,
        HashMap::from([("home.png".to_string(), "mem://ref".to_string())]),
    );

    let verdict = h.processor.process(&job(Mode::Judge, None)).await.unwrap();

    assert_eq!(verdict.status, CheckStatus::Pass);
    let sent = h.dispatcher.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].info.as_ref().unwrap()["home.png"],
        "mem://ref".to_string()
    );
    assert!(sent[0].url.starts_with("http://target-77-"));
    assert!(sent[0].url.ends_with(":8080"));
}

#[tokio::test]
async fn test_target_never_ready_fails_and_stops_container() {
    let h = harness(
        false,
        Duration::from_secs(5),
        Box::new(|task| Some(done(task.judge_record_id, vec![]))),
    );

    let err = h
        .processor
        .process(&job(Mode::Judge, None))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("did not become ready within"));
    assert_eq!(h.containers.stopped.lock().len(), 1);
    assert!(h.dispatcher.sent.lock().is_empty());
    for dir in h.containers.mounted_dirs() {
        assert!(!dir.exists());
    }

    let records = h.records.records.lock();
    assert_eq!(records.len(), 1);
    assert!(records[0].message.contains("did not become ready within"));
}

#[tokio::test]
async fn test_reply_timeout_fails_and_cleans_up() {
    let h = harness(true, Duration::from_millis(100), Box::new(|_| None));

    let err = h
        .processor
        .process(&job(Mode::Judge, None))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("no reply"));
    assert_eq!(h.containers.stopped.lock().len(), 1);
    assert!(h.dispatcher.pending.is_empty());
    // A reply that shows up now has no waiter
    assert!(!h.dispatcher.pending.resolve(done(77, vec![])));
}

#[tokio::test]
async fn test_sandbox_error_reply_fails_job() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| Some(JudgeReply::error(task.judge_record_id, 5, "script exploded"))),
    );

    let err = h
        .processor
        .process(&job(Mode::Judge, None))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("script exploded"));
    assert_eq!(h.containers.stopped.lock().len(), 1);
    assert!(h.artifacts.files.lock().is_empty());
}

#[tokio::test]
async fn test_concurrent_jobs_receive_their_own_reply() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| {
            let score = task.judge_record_id as f64;
            Some(done(task.judge_record_id, vec![checkpoint("own", score, score)]))
        }),
    );

    let mut first = job(Mode::Judge, None);
    first.request.judge_record_id = 101;
    let mut second = job(Mode::Judge, None);
    second.request.judge_record_id = 202;
    second.job_id = 2;

    let (a, b) = tokio::join!(h.processor.process(&first), h.processor.process(&second));

    assert_eq!(a.unwrap().total_score, 101.0);
    assert_eq!(b.unwrap().total_score, 202.0);
    assert_eq!(h.containers.stopped.lock().len(), 2);
}

#[tokio::test]
async fn test_artifact_failure_fails_job_and_stops_target() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| Some(done(task.judge_record_id, vec![checkpoint("a", 1.0, 1.0)]))),
    );
    h.artifacts.broken.store(true, Ordering::SeqCst);

    let err = h
        .processor
        .process(&job(Mode::Judge, None))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("artifact storage unavailable"));
    assert_eq!(h.containers.stopped.lock().len(), 1);
    let records = h.records.records.lock();
    assert_eq!(records.len(), 1);
    assert!(!records[0].passed);
    assert!(records[0].message.contains("artifact storage unavailable"));
}

#[tokio::test]
async fn test_record_failure_is_recorded_as_failed_run() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| Some(done(task.judge_record_id, vec![checkpoint("a", 1.0, 1.0)]))),
    );
    h.records.fail_next_save.store(true, Ordering::SeqCst);

    let err = h
        .processor
        .process(&job(Mode::Judge, None))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("record store is locked"));
    assert_eq!(h.containers.stopped.lock().len(), 1);
    // The completed record was lost; the failure record took its place
    let records = h.records.records.lock();
    assert_eq!(records.len(), 1);
    assert!(records[0].message.contains("record store is locked"));
}

#[tokio::test]
async fn test_redelivery_clears_container_left_by_crash() {
    let h = harness(
        true,
        Duration::from_secs(5),
        Box::new(|task| Some(done(task.judge_record_id, vec![checkpoint("a", 1.0, 1.0)]))),
    );
    let job = job(Mode::Judge, None);
    h.processor.process(&job).await.unwrap();

    // The coordinator died before cleanup, so the container still holds its name
    let name = h.containers.started.lock()[0].name.clone();
    h.containers.running.lock().insert(name.clone());

    let mut redelivered = job.clone();
    redelivered.attempts = 1;
    let verdict = h.processor.process(&redelivered).await.unwrap();

    assert_eq!(verdict.status, CheckStatus::Pass);
    assert_eq!(h.containers.started.lock().len(), 2);
    assert!(h.containers.removed.lock().contains(&name));
    assert!(h.containers.running.lock().is_empty());
}
