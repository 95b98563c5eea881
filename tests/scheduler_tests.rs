use std::collections::BTreeSet;

use chrono::{Duration, Utc};

use overseer::config::RetryConfig;
use overseer::scheduler::assigner::Assigner;
use overseer::scheduler::task::{Task, TaskStatus};
use overseer::scheduler::SessionStatus;

fn caps(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn assigner() -> Assigner {
    Assigner::new(RetryConfig::default(), 60_000, 600)
}

#[test]
fn test_task_creation() {
    let task = Task::new("run the payroll export".to_string(), 5, 3);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, 5);
    assert_eq!(task.attempts, 0);
    assert!(task.assigned_session.is_none());
}

#[test]
fn test_priority_then_fifo_ordering() {
    let mut assigner = assigner();
    assigner.registry.register("s1", caps(&[]));
    assigner.registry.register("s2", caps(&[]));

    let base = Utc::now();
    let mut ids = Vec::new();
    for (i, priority) in [1i64, 3, 1, 2, 3].iter().enumerate() {
        let mut task = Task::new(format!("task {i}"), *priority, 3);
        task.created_at = base + Duration::milliseconds(i as i64);
        ids.push(task.id);
        assigner.submit(task).unwrap();
    }

    let now = base + Duration::seconds(1);
    let mut served = Vec::new();

    // Two sessions drain the two priority-3 tasks first.
    for _ in 0..2 {
        let (task_id, session) = assigner.assign_next(now).unwrap();
        served.push(task_id);
        assigner
            .report_result(&task_id, &session, true, None, now)
            .unwrap();
    }
    assert_eq!(served, vec![ids[1], ids[4]]);

    // Then priority 2, then the two priority-1 tasks oldest-first.
    for expected in [ids[3], ids[0], ids[2]] {
        let (task_id, session) = assigner.assign_next(now).unwrap();
        assert_eq!(task_id, expected);
        assigner
            .report_result(&task_id, &session, true, None, now)
            .unwrap();
    }
    assert!(assigner.assign_next(now).is_none());
}

#[test]
fn test_capability_subset_matching() {
    let mut assigner = assigner();
    assigner.registry.register("plain", caps(&[]));

    let task = Task::new("migrate the database".to_string(), 0, 3)
        .with_caps(["db".to_string(), "rust".to_string()]);
    let task_id = task.id;
    assigner.submit(task).unwrap();

    let now = Utc::now();
    assert!(assigner.assign_next(now).is_none());

    assigner.registry.register("skilled", caps(&["db", "rust", "extra"]));
    let (assigned, session) = assigner.assign_next(now).unwrap();
    assert_eq!(assigned, task_id);
    assert_eq!(session, "skilled");
}

#[test]
fn test_claim_is_exclusive() {
    let mut assigner = assigner();
    assigner.registry.register("s1", caps(&[]));
    assigner.registry.register("s2", caps(&[]));

    let task = Task::new("only one winner".to_string(), 0, 3);
    let task_id = task.id;
    assigner.submit(task).unwrap();

    let now = Utc::now();
    let first = assigner.claim_for("s1", now).unwrap();
    assert_eq!(first.unwrap().id, task_id);
    let second = assigner.claim_for("s2", now).unwrap();
    assert!(second.is_none());

    let task = assigner.queue.get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_session.as_deref(), Some("s1"));
}

#[test]
fn test_busy_session_gets_no_second_task() {
    let mut assigner = assigner();
    assigner.registry.register("solo", caps(&[]));
    assigner.submit(Task::new("first".to_string(), 0, 3)).unwrap();
    assigner.submit(Task::new("second".to_string(), 0, 3)).unwrap();

    let now = Utc::now();
    assert!(assigner.assign_next(now).is_some());
    assert!(assigner.assign_next(now).is_none());
    assert_eq!(
        assigner.registry.get("solo").unwrap().status,
        SessionStatus::Busy
    );
}

#[test]
fn test_failure_sets_backoff_gate() {
    let mut assigner = assigner();
    assigner.registry.register("s1", caps(&[]));
    let task_id = assigner.submit(Task::new("flaky".to_string(), 0, 3)).unwrap();

    let now = Utc::now();
    assigner.claim_for("s1", now).unwrap().unwrap();
    let status = assigner
        .report_result(&task_id, "s1", false, Some("boom".to_string()), now)
        .unwrap();
    assert_eq!(status, TaskStatus::Pending);

    // Back in the queue but gated; an immediate claim finds nothing.
    assert!(assigner.claim_for("s1", now).unwrap().is_none());
    let gate = assigner.queue.get(&task_id).unwrap().not_before.unwrap();
    assert!(gate > now);

    // Past the gate it is claimable again.
    let later = now + Duration::seconds(60);
    let reclaimed = assigner.claim_for("s1", later).unwrap().unwrap();
    assert_eq!(reclaimed.id, task_id);
}

#[test]
fn test_dead_letter_after_retry_budget() {
    let mut assigner = Assigner::new(
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        },
        60_000,
        600,
    );
    assigner.registry.register("s1", caps(&[]));
    let task_id = assigner
        .submit(Task::new("doomed".to_string(), 0, 2))
        .unwrap();

    let mut now = Utc::now();
    let mut statuses = Vec::new();
    for _ in 0..2 {
        now = now + Duration::seconds(60);
        assert!(assigner.claim_for("s1", now).unwrap().is_some());
        statuses.push(
            assigner
                .report_result(&task_id, "s1", false, Some("err".to_string()), now)
                .unwrap(),
        );
    }

    // The max_retries-th failure dead-letters; never requeued after that.
    assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::DeadLetter]);
    let task = assigner.queue.get(&task_id).unwrap();
    assert_eq!(task.attempts, 2);
    assert!(assigner.claim_for("s1", now + Duration::days(1)).unwrap().is_none());
}

#[test]
fn test_reaper_requeues_after_heartbeat_lapse() {
    let mut assigner = Assigner::new(RetryConfig::default(), 50, 600);
    assigner.registry.register("mortal", caps(&[]));
    let task_id = assigner
        .submit(Task::new("interrupted work".to_string(), 0, 3))
        .unwrap();

    let now = Utc::now();
    assigner.claim_for("mortal", now).unwrap().unwrap();

    // Let the heartbeat lapse past the 50ms grace.
    std::thread::sleep(std::time::Duration::from_millis(100));
    let report = assigner.reap(Utc::now());
    assert_eq!(report.reclaimed, 1);
    // The session died, not the task; nothing dead-lettered.
    assert!(report.dead_lettered.is_empty());

    let task = assigner.queue.get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    // The session died, not the task; no attempt was spent.
    assert_eq!(task.attempts, 0);
    assert_eq!(
        assigner.registry.get("mortal").unwrap().status,
        SessionStatus::Offline
    );
}

#[test]
fn test_visibility_timeout_reclaims_stalled_task() {
    let mut assigner = Assigner::new(RetryConfig::default(), 3_600_000, 60);
    assigner.registry.register("quiet", caps(&[]));
    let task_id = assigner
        .submit(Task::new("stalls out".to_string(), 0, 3))
        .unwrap();

    let now = Utc::now();
    assigner.claim_for("quiet", now).unwrap().unwrap();
    assigner.report_progress(&task_id, "quiet", now).unwrap();

    // No progress for well past the 60s visibility timeout.
    let later = now + Duration::seconds(300);
    let report = assigner.reap(later);
    assert_eq!(report.reclaimed, 1);
    assert!(report.dead_lettered.is_empty());

    let task = assigner.queue.get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(
        assigner.registry.get("quiet").unwrap().status,
        SessionStatus::Idle
    );
}

#[test]
fn test_reaper_reports_dead_lettered_task() {
    let mut assigner = Assigner::new(RetryConfig::default(), 3_600_000, 60);
    assigner.registry.register("quiet", caps(&[]));
    let task_id = assigner
        .submit(Task::new("stalls on its last attempt".to_string(), 0, 1))
        .unwrap();

    let now = Utc::now();
    assigner.claim_for("quiet", now).unwrap().unwrap();
    assigner.report_progress(&task_id, "quiet", now).unwrap();

    // The stall spends the only attempt; the reaper must surface the
    // dead-letter so an alert can be raised.
    let report = assigner.reap(now + Duration::seconds(300));
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.dead_lettered, vec![task_id]);
    assert_eq!(
        assigner.queue.get(&task_id).unwrap().status,
        TaskStatus::DeadLetter
    );
}

#[test]
fn test_release_session_requeues_task() {
    let mut assigner = assigner();
    assigner.registry.register("s1", caps(&[]));
    let task_id = assigner
        .submit(Task::new("handed back".to_string(), 0, 3))
        .unwrap();

    let now = Utc::now();
    assigner.claim_for("s1", now).unwrap().unwrap();
    assigner.release_session("s1").unwrap();

    assert_eq!(
        assigner.queue.get(&task_id).unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        assigner.registry.get("s1").unwrap().status,
        SessionStatus::Idle
    );
}

#[test]
fn test_archive_only_removes_terminal_tasks() {
    let mut assigner = assigner();
    assigner.registry.register("s1", caps(&[]));
    let done = assigner.submit(Task::new("done".to_string(), 0, 3)).unwrap();
    let open = assigner.submit(Task::new("open".to_string(), 0, 3)).unwrap();

    let now = Utc::now();
    assigner.claim_for("s1", now).unwrap().unwrap();
    assigner.report_result(&done, "s1", true, None, now).unwrap();

    assert_eq!(assigner.queue.archive_finished(), 1);
    assert!(assigner.queue.get(&done).is_none());
    assert!(assigner.queue.get(&open).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_double_assign() {
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    let mut assigner = assigner();
    for i in 0..8 {
        assigner.registry.register(&format!("s{i}"), caps(&[]));
    }
    let mut ids = HashSet::new();
    for i in 0..40 {
        ids.insert(
            assigner
                .submit(Task::new(format!("task {i}"), 0, 3))
                .unwrap(),
        );
    }
    let shared = Arc::new(RwLock::new(assigner));

    let now = Utc::now();
    let mut workers = Vec::new();
    for i in 0..8 {
        let shared = shared.clone();
        let session = format!("s{i}");
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let task = shared.write().await.claim_for(&session, now).unwrap();
                let Some(task) = task else { break };
                assert_eq!(task.assigned_session.as_deref(), Some(session.as_str()));
                claimed.push(task.id);
                tokio::task::yield_now().await;
                shared
                    .write()
                    .await
                    .report_result(&task.id, &session, true, None, now)
                    .unwrap();
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(seen.insert(id), "task assigned to two sessions");
        }
    }
    assert_eq!(seen, ids);

    let assigner = shared.read().await;
    for id in &ids {
        assert_eq!(assigner.queue.get(id).unwrap().status, TaskStatus::Completed);
    }
    for i in 0..8 {
        let state = assigner.registry.get(&format!("s{i}")).unwrap();
        assert_eq!(state.status, SessionStatus::Idle);
        assert!(state.current_task.is_none());
    }
}

#[test]
fn test_reregister_revives_offline_session() {
    let mut assigner = Assigner::new(RetryConfig::default(), 50, 600);
    assigner.registry.register("phoenix", caps(&["rust"]));

    std::thread::sleep(std::time::Duration::from_millis(100));
    assigner.reap(Utc::now());
    assert_eq!(
        assigner.registry.get("phoenix").unwrap().status,
        SessionStatus::Offline
    );

    assigner.registry.register("phoenix", caps(&["rust"]));
    assert_eq!(
        assigner.registry.get("phoenix").unwrap().status,
        SessionStatus::Idle
    );
}
