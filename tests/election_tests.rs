//! Election tests: one master per task, worker roster capping, stick
//! affinity.


use std::time::Duration;

use dcron::config::RetryPolicy;
use harness::{status, wait_for, workers, TestAgent};

const NAME: &str = "batch.report.20260801_1200";
const RUN_2S: [&str; 3] = ["/bin/sh", "-c", "sleep 2; exit 0"];

/// Three agents race one task capped at two workers: one runs it, one
/// stands by until the clean exit, one is turned away.
#[tokio::test]
async fn fleet_elects_one_master_and_caps_the_roster() {
    let ns = "it-basic-election";
    let agents: Vec<TestAgent> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|id| TestAgent::new(ns, NAME, id, 2, RetryPolicy::OnCrash))
        .collect();

    let handles: Vec<_> = agents.iter().map(|a| a.spawn(&RUN_2S)).collect();
    let mut codes = Vec::new();
    for handle in handles {
        codes.push(handle.await.unwrap());
    }

    // The master's program exited 0; the standby saw the clean status and
    // stood down; the capped agent stood down immediately.
    assert_eq!(codes, [0, 0, 0]);

    let roster = workers(ns, NAME);
    assert_eq!(roster.len(), 2, "roster grows to master plus one standby");

    let status = status(ns, NAME).expect("terminal status");
    assert_eq!(status.status, 0);
    assert!(roster.contains(&status.id), "status names the elected master");

    assert!(
        harness::results(ns, NAME).is_empty(),
        "a clean first attempt writes no per-attempt records"
    );
}

/// Any fleet size: at most one agent observes the master role, and the
/// roster never exceeds the retry cap.
#[tokio::test]
async fn larger_fleet_converges_to_a_single_status() {
    let ns = "it-fleet-five";
    let agents: Vec<TestAgent> = (1..=5)
        .map(|i| TestAgent::new(ns, NAME, &format!("10.0.1.{i}"), 3, RetryPolicy::OnCrash))
        .collect();

    let handles: Vec<_> = agents.iter().map(|a| a.spawn(&RUN_2S)).collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 0);
    }

    let roster = workers(ns, NAME);
    assert!(
        roster.len() <= 3,
        "roster {roster:?} exceeded the retry cap"
    );
    assert!(status(ns, NAME).is_some());
}

/// The agent holding a fresh stick marker skips the startup jitter and
/// reclaims leadership ahead of everyone still sleeping.
#[tokio::test]
async fn fresh_stick_marker_reclaims_leadership() {
    let ns = "it-stick-affinity";
    let returning =
        TestAgent::new(ns, NAME, "10.0.2.1", 3, RetryPolicy::OnCrash).sticky(60);
    let newcomer = TestAgent::new(ns, NAME, "10.0.2.2", 3, RetryPolicy::OnCrash);

    let handles = [returning.spawn(&RUN_2S), newcomer.spawn(&RUN_2S)];
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 0);
    }

    let status = status(ns, NAME).expect("terminal status");
    assert_eq!(status.id, "10.0.2.1");

    // The marker was consumed on startup and re-written after the run.
    let stick = returning.scratch_path("batch.report.stick");
    assert!(stick.exists(), "master re-marks after a concluded attempt");
}

/// With a dump path configured, the agent leaves a JSON snapshot of the
/// task's subtree after the invocation.
#[tokio::test]
async fn dump_snapshots_the_task_subtree() {
    let ns = "it-zkdump";
    let agent = TestAgent::new(ns, NAME, "10.0.4.1", 2, RetryPolicy::OnCrash).with_dump();

    assert_eq!(agent.spawn(&["/bin/sh", "-c", "exit 0"]).await.unwrap(), 0);

    let dump = std::fs::read_to_string(agent.scratch_path("zkdump.json")).unwrap();
    let snapshot: serde_json::Value = serde_json::from_str(dump.trim()).unwrap();
    assert_eq!(snapshot["workers"], serde_json::json!(["10.0.4.1"]));
    assert_eq!(snapshot["status"]["status"], 0);
    assert_eq!(snapshot["taskPath"], "/batch/report/20260801_1200");
}

/// Under the no-retry policy a loser neither runs nor waits.
#[tokio::test]
async fn no_retry_losers_exit_immediately() {
    let ns = "it-no-retry";
    let master = TestAgent::new(ns, NAME, "10.0.3.1", 3, RetryPolicy::None).sticky(60);
    let loser = TestAgent::new(ns, NAME, "10.0.3.2", 3, RetryPolicy::None);

    let master_handle = master.spawn(&RUN_2S);
    // Give the sticky agent the head start it would win anyway.
    assert!(
        wait_for(
            || harness::node_exists(ns, "/batch/report/20260801_1200/master"),
            Duration::from_secs(2)
        )
        .await
    );

    let loser_start = tokio::time::Instant::now();
    assert_eq!(loser.spawn(&RUN_2S).await.unwrap(), 0);
    // The loser joined, was ruled out, and left well before the master's
    // two-second run completed.
    assert!(loser_start.elapsed() < Duration::from_secs(2));

    assert_eq!(master_handle.await.unwrap(), 0);
    assert_eq!(workers(ns, NAME).len(), 2);
}
