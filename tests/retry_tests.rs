//! Retry tests: the in-master attempt loop, exit-code translation and
//! internal failure reporting.


use dcron::config::RetryPolicy;
use harness::{results, status, TestAgent};

const NAME: &str = "batch.retry.20260801_1200";

/// Under on-abexit a failing program is re-run by the same master, leaving
/// one result record per non-final attempt and a terminal status from the
/// attempt that succeeded.
#[tokio::test]
async fn abexit_retries_until_success_within_the_cap() {
    let ns = "it-abexit-retries";
    let agent = TestAgent::new(ns, NAME, "10.2.0.1", 3, RetryPolicy::OnAbexit);

    // Exits 7 on the first two attempts, 0 on the third.
    let counter = agent.scratch_path("attempts");
    let script = format!(
        "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
         [ $n -ge 3 ] && exit 0 || exit 7",
        c = counter.display()
    );

    let code = agent.spawn(&["/bin/sh", "-c", &script]).await.unwrap();
    assert_eq!(code, 0);

    let records = results(ns, NAME);
    assert_eq!(records.len(), 2);
    for (seq, record) in records.iter().enumerate() {
        assert_eq!(record.status, 7);
        assert_eq!(record.retry, seq as u32);
        assert_eq!(record.id, "10.2.0.1");
        assert!(record.error.is_none());
    }

    let status = status(ns, NAME).expect("terminal status");
    assert_eq!(status.status, 0);
    assert_eq!(status.id, "10.2.0.1");
}

/// Once the attempt counter reaches the cap, the failure is terminal.
#[tokio::test]
async fn abexit_gives_up_at_the_retry_cap() {
    let ns = "it-abexit-cap";
    let agent = TestAgent::new(ns, NAME, "10.2.1.1", 2, RetryPolicy::OnAbexit);

    let code = agent.spawn(&["/bin/sh", "-c", "exit 7"]).await.unwrap();
    assert_eq!(code, 7);

    let records = results(ns, NAME);
    assert_eq!(records.len(), 1, "only the non-final attempt left a record");
    assert_eq!(records[0].retry, 0);

    let status = status(ns, NAME).expect("terminal status");
    assert_eq!(status.status, 7);
}

/// Under on-crash a non-zero exit is terminal immediately.
#[tokio::test]
async fn crash_policy_writes_status_on_first_failure() {
    let ns = "it-crash-once";
    let agent = TestAgent::new(ns, NAME, "10.2.2.1", 3, RetryPolicy::OnCrash);

    let code = agent.spawn(&["/bin/sh", "-c", "exit 7"]).await.unwrap();
    assert_eq!(code, 7);
    assert!(results(ns, NAME).is_empty());
    assert_eq!(status(ns, NAME).unwrap().status, 7);
}

/// Death by signal N is reported as 128 + N.
#[tokio::test]
async fn signal_death_is_translated() {
    let ns = "it-sigkill";
    let agent = TestAgent::new(ns, NAME, "10.2.3.1", 2, RetryPolicy::OnCrash);

    let code = agent
        .spawn(&["/bin/sh", "-c", "kill -9 $$"])
        .await
        .unwrap();
    assert_eq!(code, 137);
    assert_eq!(status(ns, NAME).unwrap().status, 137);
}

/// A program that cannot be executed reads like a child that died with
/// EXIT_FAILURE right after fork.
#[tokio::test]
async fn unexecutable_program_concludes_with_exit_failure() {
    let ns = "it-exec-fail";
    let agent = TestAgent::new(ns, NAME, "10.2.4.1", 2, RetryPolicy::OnCrash);

    let code = agent.spawn(&["/no/such/binary"]).await.unwrap();
    assert_eq!(code, 1);
    assert_eq!(status(ns, NAME).unwrap().status, 1);
}
