//! Integration tests for the core crate.

use std::collections::BTreeMap;

use qualification_core::condition::{self, ConditionStatus, ALL_JOBS_FINISHED, ALL_JOBS_TRIGGERED};
use qualification_core::merge::{apply_job_status, merge_run_status};
use qualification_core::meta::ObjectMeta;
use qualification_core::model::{
    ConfigMetadata, ExecutionJob, ExecutionJobDocument, ExecutionJobStatus, JobSpec, JobState,
    QualificationRun, QualificationRunSpec, QualificationRunStatus, ReleaseJobSpec, RunJobStatus,
};

fn release_job(test: &str) -> ReleaseJobSpec {
    ReleaseJobSpec {
        config: ConfigMetadata {
            org: "org".into(),
            repo: "repo".into(),
            branch: "main".into(),
            variant: None,
        },
        test: test.into(),
        shard: None,
        aggregated_count: 0,
    }
}

fn run(tests: &[&str]) -> QualificationRun {
    QualificationRun {
        metadata: ObjectMeta::named("ci", "run"),
        spec: QualificationRunSpec {
            jobs: JobSpec {
                jobs: tests.iter().map(|t| release_job(t)).collect(),
                ..Default::default()
            },
            ..Default::default()
        },
        status: QualificationRunStatus::default(),
    }
}

fn execution_job(name: &str, state: JobState) -> ExecutionJob {
    ExecutionJob {
        metadata: ObjectMeta::named("ci", name),
        spec: ExecutionJobDocument::default(),
        status: ExecutionJobStatus {
            state,
            ..Default::default()
        },
    }
}

/// What the run controller computes right after triggering every job.
fn triggered_view(run: &QualificationRun) -> BTreeMap<String, RunJobStatus> {
    run.spec
        .jobs
        .jobs
        .iter()
        .map(|spec| {
            let name = spec.job_name();
            let job = execution_job(&format!("pj-{}", spec.test), JobState::Triggered);
            (name.clone(), RunJobStatus::for_job(name, &job))
        })
        .collect()
}

fn sync(run: &mut QualificationRun, job: &ExecutionJob) {
    apply_job_status(&mut run.status, job);
    let finished = condition::all_jobs_finished(&run.status.jobs, 2);
    condition::set_condition(&mut run.status.conditions, finished);
}

#[test]
fn test_job_state_serde() {
    let serialized = serde_json::to_string(&JobState::Aborted).unwrap();
    assert_eq!(serialized, r#""aborted""#);
    let deserialized: JobState = serde_json::from_str(r#""scheduling""#).unwrap();
    assert_eq!(deserialized, JobState::Scheduling);
}

#[test]
fn test_run_yaml_manifest() {
    let manifest = r#"
metadata:
  name: run-1
  namespace: ci
spec:
  pull_requests:
    - org: org
      repo: repo
      base_ref: main
      base_sha: abc
      pull_request:
        number: 100
        author: dev
        sha: def
  jobs:
    source:
      ocp: "4.16"
      release: nightly
      specifier: informing
    jobs:
      - org: org
        repo: repo
        branch: main
        variant: nightly
        test: e2e-aws
        aggregated_count: 3
      - org: org
        repo: repo
        branch: main
        test: e2e-gcp
        shard:
          index: 2
          count: 2
"#;
    let run: QualificationRun = serde_yaml::from_str(manifest).unwrap();
    assert_eq!(run.metadata.resource_version, 0);
    assert_eq!(run.spec.pull_requests[0].pull_request.as_ref().unwrap().number, 100);
    assert_eq!(run.spec.jobs.jobs.len(), 2);
    assert_eq!(
        run.spec.jobs.jobs[0].job_name(),
        "aggregator-periodic-ci-org-repo-main-nightly-e2e-aws"
    );
    assert_eq!(
        run.spec.jobs.jobs[1].job_name(),
        "periodic-ci-org-repo-main-e2e-gcp-2of2"
    );
    assert!(run.status.jobs.is_empty());
}

#[test]
fn test_condition_serde_uses_type_key() {
    let c = condition::all_jobs_triggered(std::iter::empty::<&RunJobStatus>(), 5);
    let value = serde_json::to_value(&c).unwrap();
    assert_eq!(value["type"], ALL_JOBS_TRIGGERED);
    assert_eq!(value["status"], "True");
}

#[test]
fn test_merge_converges_in_both_orders() {
    let base = run(&["e2e-aws", "e2e-gcp"]);
    let computed = triggered_view(&base);
    let triggered = condition::all_jobs_triggered(computed.values(), 1);
    let finished_aws = execution_job("pj-e2e-aws", JobState::Success);

    // Run controller writes, then the syncer writes.
    let mut first = base.clone();
    merge_run_status(&mut first, &computed, triggered.clone());
    sync(&mut first, &finished_aws);

    // The syncer writes onto a run the run controller already expanded once,
    // then the run controller merges its stale view.
    let mut second = base.clone();
    merge_run_status(&mut second, &computed, triggered.clone());
    sync(&mut second, &finished_aws);
    let anomalies = merge_run_status(&mut second, &computed, triggered);
    assert!(anomalies.is_empty());

    assert_eq!(first.status.jobs, second.status.jobs);
    assert_eq!(first.status.jobs.len(), 2);
    assert_eq!(first.status.jobs[0].status.state, JobState::Success);
    assert_eq!(first.status.jobs[1].status.state, JobState::Triggered);
    let finished = second.status.condition(ALL_JOBS_FINISHED).unwrap();
    assert_eq!(finished.status, ConditionStatus::False);
}

#[test]
fn test_recovered_error_converges_in_both_orders() {
    let base = run(&["e2e-aws", "e2e-gcp"]);
    let gcp = release_job("e2e-gcp").job_name();

    // First pass: e2e-gcp could not be created.
    let mut errored = triggered_view(&base);
    errored.insert(
        gcp.clone(),
        RunJobStatus::error(gcp.as_str(), None, "failed to create job: store unavailable"),
    );
    let mut persisted = base.clone();
    merge_run_status(
        &mut persisted,
        &errored,
        condition::all_jobs_triggered(errored.values(), 1),
    );
    assert_eq!(persisted.status.jobs[1].status.state, JobState::Error);

    // Second pass materializes e2e-gcp while the syncer finishes e2e-aws.
    let recovered = triggered_view(&base);
    let triggered = condition::all_jobs_triggered(recovered.values(), 3);
    let finished_aws = execution_job("pj-e2e-aws", JobState::Success);

    let mut controller_first = persisted.clone();
    let anomalies = merge_run_status(&mut controller_first, &recovered, triggered.clone());
    assert!(anomalies.is_empty());
    sync(&mut controller_first, &finished_aws);

    let mut syncer_first = persisted.clone();
    sync(&mut syncer_first, &finished_aws);
    let anomalies = merge_run_status(&mut syncer_first, &recovered, triggered);
    assert!(anomalies.is_empty());

    assert_eq!(controller_first.status.jobs, syncer_first.status.jobs);
    let recovered_gcp = &syncer_first.status.jobs[1];
    assert_eq!(recovered_gcp.status.state, JobState::Triggered);
    assert_eq!(recovered_gcp.execution_job.as_deref(), Some("pj-e2e-gcp"));
    assert_eq!(syncer_first.status.jobs[0].status.state, JobState::Success);
    let triggered = syncer_first.status.condition(ALL_JOBS_TRIGGERED).unwrap();
    assert_eq!(triggered.status, ConditionStatus::True);
}

#[test]
fn test_stale_expansion_keeps_synced_terminal_states() {
    let base = run(&["e2e-aws", "e2e-gcp", "e2e-metal"]);
    let stale = triggered_view(&base);
    let triggered = condition::all_jobs_triggered(stale.values(), 1);

    let mut persisted = base.clone();
    merge_run_status(&mut persisted, &stale, triggered.clone());

    // The syncer records outcomes after the controller computed its view.
    sync(&mut persisted, &execution_job("pj-e2e-gcp", JobState::Failure));
    sync(&mut persisted, &execution_job("pj-e2e-metal", JobState::Aborted));
    let before = persisted.status.clone();

    let anomalies = merge_run_status(&mut persisted, &stale, triggered);
    assert!(anomalies.is_empty());
    assert_eq!(persisted.status, before);
    let states: Vec<JobState> = persisted.status.jobs.iter().map(|j| j.status.state).collect();
    assert_eq!(
        states,
        vec![JobState::Triggered, JobState::Failure, JobState::Aborted]
    );
    let finished = persisted.status.condition(ALL_JOBS_FINISHED).unwrap();
    assert_eq!(finished.status, ConditionStatus::False);
}

#[test]
fn test_merge_keeps_request_order_and_drops_duplicates() {
    let mut r = run(&["b", "a", "b"]);
    let computed = triggered_view(&r);
    let c = condition::all_jobs_triggered(computed.values(), 1);
    merge_run_status(&mut r, &computed, c);
    let names: Vec<&str> = r.status.jobs.iter().map(|j| j.job_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["periodic-ci-org-repo-main-b", "periodic-ci-org-repo-main-a"]
    );
}

#[test]
fn test_apply_job_status_only_touches_backed_entries() {
    let mut r = run(&["a", "b"]);
    let computed = triggered_view(&r);
    merge_run_status(&mut r, &computed, condition::all_jobs_triggered(computed.values(), 1));

    let unrelated = execution_job("pj-other", JobState::Failure);
    assert!(!apply_job_status(&mut r.status, &unrelated));

    let failed = execution_job("pj-b", JobState::Failure);
    assert!(apply_job_status(&mut r.status, &failed));
    assert!(!apply_job_status(&mut r.status, &failed));
    assert_eq!(r.status.jobs[1].status.state, JobState::Failure);
    assert_eq!(r.status.jobs[0].status.state, JobState::Triggered);
}
