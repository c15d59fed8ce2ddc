//! Integration tests for the spec-to-queue pipeline.
//!
//! Each test expands a JSON task-group spec into real jobs, drives a
//! [`Taskpile`] until it goes idle, and checks the effects the job
//! processes had on disk.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use taskpile::job::{Job, JobState, OutputSinks};
use taskpile::pile::Taskpile;
use taskpile::spec::TaskGroupSpec;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Helper: expand a JSON spec into jobs with sinks under `dir`.
fn jobs_from_spec(value: &serde_json::Value, dir: &Path) -> Vec<Arc<Job>> {
    let spec = TaskGroupSpec::from_json(value).expect("spec should parse");
    spec.expand()
        .enumerate()
        .map(|(i, result)| {
            let instance = result.expect("instance should expand");
            let sinks = OutputSinks {
                stdout: File::create(dir.join(format!("job{i}.out"))).unwrap(),
                stderr: File::create(dir.join(format!("job{i}.err"))).unwrap(),
            };
            let job = Job::from_instance_in(&instance, 0, sinks, dir)
                .expect("job should build");
            Arc::new(job)
        })
        .collect()
}

/// Helper: reconcile on a fast clock until the queue drains.
async fn drive(pile: &mut Taskpile) {
    for _ in 0..1000 {
        pile.reconcile().await.expect("reconcile should not fail");
        if pile.is_idle() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never went idle");
}

// ── End-to-end Tests ─────────────────────────────────────────────────

#[tokio::test]
async fn expanded_spec_runs_every_combination() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        let value = serde_json::json!({
            "__cmd__": "touch {outdir}/out-{x}",
            "outdir": dir_str,
            "_x": ["a", "b", "c"],
        });

        let jobs = jobs_from_spec(&value, dir.path());
        assert_eq!(jobs.len(), 3);

        let mut pile = Taskpile::new(2);
        for job in &jobs {
            pile.enqueue(job.clone());
        }
        drive(&mut pile).await;

        assert_eq!(pile.finished().len(), 3);
        for job in pile.finished() {
            assert_eq!(job.state(), JobState::Finished);
            assert_eq!(job.succeeded(), Some(true));
        }
        for x in ["a", "b", "c"] {
            assert!(
                dir.path().join(format!("out-{x}")).is_file(),
                "job for x={x} should have run"
            );
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn template_files_reach_the_job_processes() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        let template = dir.path().join("params.cfg");
        std::fs::write(&template, "lr = {lr}\n").unwrap();

        let value = serde_json::json!({
            "__cmd__": "cp {cfg!t} {outdir}/copied-{lr}",
            "cfg": template.to_str().unwrap(),
            "outdir": dir_str,
            "_lr": ["0.1", "0.2"],
        });

        let jobs = jobs_from_spec(&value, dir.path());
        assert_eq!(jobs.len(), 2);
        let instance_paths: Vec<_> = jobs
            .iter()
            .flat_map(|job| job.instance_files().keys().cloned())
            .collect();
        assert_eq!(instance_paths.len(), 2);

        let mut pile = Taskpile::new(1);
        for job in &jobs {
            pile.enqueue(job.clone());
        }
        drive(&mut pile).await;

        for lr in ["0.1", "0.2"] {
            let copied = dir.path().join(format!("copied-{lr}"));
            assert_eq!(
                std::fs::read_to_string(&copied).unwrap(),
                format!("lr = {lr}\n")
            );
        }

        // Instance files stay on disk until explicitly removed.
        for path in &instance_paths {
            assert!(path.is_file());
        }
        for job in pile.finished() {
            job.remove_instance_files();
        }
        for path in &instance_paths {
            assert!(!path.exists());
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn outcomes_are_reported_per_job() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let value = serde_json::json!({
            "__cmd__": "{prog}",
            "_prog": ["true", "false", "exit 7"],
        });

        let jobs = jobs_from_spec(&value, dir.path());
        let mut pile = Taskpile::new(3);
        for job in &jobs {
            pile.enqueue(job.clone());
        }
        drive(&mut pile).await;

        assert_eq!(pile.finished().len(), 3);
        for job in pile.finished() {
            let expected = match job.command() {
                "true" => ("[0]", Some(true)),
                "false" => ("[1]", Some(false)),
                "exit 7" => ("[7]", Some(false)),
                other => panic!("unexpected command {other:?}"),
            };
            assert_eq!(job.describe_outcome().as_deref(), Some(expected.0));
            assert_eq!(job.succeeded(), expected.1);
            assert!(job.name().contains("prog="));
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn quoted_values_round_trip_through_the_shell() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        let value = serde_json::json!({
            "__cmd__": "printf %s {x!r} > {outdir}/roundtrip",
            "outdir": dir_str,
            "x": "a'b $HOME *",
        });

        let jobs = jobs_from_spec(&value, dir.path());
        let mut pile = Taskpile::new(1);
        pile.enqueue(jobs[0].clone());
        drive(&mut pile).await;

        assert_eq!(pile.finished()[0].succeeded(), Some(true));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("roundtrip")).unwrap(),
            "a'b $HOME *"
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn lowering_the_limit_mid_run_suspends_and_recovers() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let value = serde_json::json!({
            "__cmd__": "sleep 30",
            "_n": ["1", "2"],
        });

        let jobs = jobs_from_spec(&value, dir.path());
        let mut pile = Taskpile::new(2);
        for job in &jobs {
            pile.enqueue(job.clone());
        }
        pile.reconcile().await.unwrap();
        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 2);

        pile.set_max_parallel(1);
        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 1);
        let stopped: Vec<_> = jobs
            .iter()
            .filter(|j| j.state() == JobState::Stopped)
            .collect();
        assert_eq!(stopped.len(), 1);

        pile.set_max_parallel(2);
        pile.reconcile().await.unwrap();
        assert!(jobs.iter().all(|j| j.state() == JobState::Running));

        pile.terminate_all().await;
        assert_eq!(pile.finished().len(), 2);
    })
    .await
    .expect("test timed out");
}
