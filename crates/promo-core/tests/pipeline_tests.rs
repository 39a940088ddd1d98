use pretty_assertions::assert_eq;
use promo_core::pipeline::{APPROVAL_STEP, PROMOTE_STEP, UPDATE_STEP, VERIFY_STEP};
use promo_core::{
    ApprovalConfig, DeploymentPolicyId, Decision, ExecutionPhase, ExportRegistry, GateError,
    PipelineError, PipelineStatus, PromotionPipeline, StepOutcome, WriteKind,
    DEFAULT_APPROVAL_COMMENT,
};
use promo_kernel::{ErrorKind, GateState, MachineKind};
use promo_test_utils::{
    primary_config, primary_id, staging_config, test_pipeline_config, TestEnv, STAGED_POLICY,
};

fn promotions(env: &TestEnv) -> usize {
    env.service
        .list_executions()
        .iter()
        .filter(|e| e.machine == MachineKind::Promotion)
        .count()
}

fn unconditional_writes(env: &TestEnv) -> usize {
    env.store
        .writes_to(&primary_id())
        .iter()
        .filter(|w| w.kind == WriteKind::Unconditional)
        .count()
}

#[tokio::test]
async fn rejected_run_keeps_the_merged_primary() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();
    assert_eq!(outputs.deployment_policy_id, DeploymentPolicyId::new(STAGED_POLICY));

    let run = pipeline.start(outputs).unwrap();
    let gate = pipeline.gate(run).unwrap();
    assert_eq!(gate.wait_until_open().await, GateState::AwaitingDecision);
    assert_eq!(gate.comment(), DEFAULT_APPROVAL_COMMENT);

    // Update wave has run; the primary only gained the policy.
    let merged = primary_config().with_policy(DeploymentPolicyId::new(STAGED_POLICY));
    assert_eq!(env.primary(), merged);
    assert_eq!(pipeline.status(run).unwrap(), PipelineStatus::Running);

    pipeline
        .reject(run, "bob", Some("origin change not reviewed".into()))
        .unwrap();
    let report = pipeline.wait(run).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Rejected);
    assert_eq!(pipeline.status(run).unwrap(), PipelineStatus::Rejected);
    assert_eq!(report.outcome_of(APPROVAL_STEP), Some(&StepOutcome::Rejected));
    assert_eq!(report.outcome_of(PROMOTE_STEP), None);
    assert_eq!(report.approval.as_ref().map(|a| a.decision), Some(Decision::Reject));
    assert_eq!(promotions(&env), 0);
    assert_eq!(unconditional_writes(&env), 0);
    assert_eq!(env.primary(), merged);
}

#[tokio::test]
async fn approved_run_promotes_staging_onto_primary() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();

    let run = pipeline.start(outputs).unwrap();
    pipeline.gate(run).unwrap().wait_until_open().await;
    pipeline.approve(run, "alice", None).unwrap();
    let report = pipeline.wait(run).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert!(matches!(
        report.outcome_of(UPDATE_STEP),
        Some(StepOutcome::Succeeded { execution: Some(_) })
    ));
    assert_eq!(report.outcome_of(APPROVAL_STEP), Some(&StepOutcome::Approved));
    assert!(matches!(
        report.outcome_of(PROMOTE_STEP),
        Some(StepOutcome::Succeeded { .. })
    ));

    let primary = env.primary();
    assert_eq!(primary.id, primary_id());
    assert!(primary.same_owned_fields(&staging_config()));
    assert_eq!(unconditional_writes(&env), 1);

    let executions = pipeline.executions();
    let machines: Vec<MachineKind> = executions.iter().map(|e| e.machine).collect();
    assert_eq!(machines, vec![MachineKind::Update, MachineKind::Promotion]);
    assert!(executions.iter().all(|e| e.phase == ExecutionPhase::Succeeded));
}

#[tokio::test]
async fn failed_update_blocks_the_gate() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();
    // Someone edits the primary between the update's fetch and its write.
    env.control.concurrent_write_after_read(|config| {
        config.fields.insert("comment".into(), "out-of-band".into());
    });

    let report = pipeline.run(outputs).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    match report.outcome_of(UPDATE_STEP) {
        Some(StepOutcome::Failed { error, .. }) => assert_eq!(error.kind, ErrorKind::Conflict),
        other => panic!("expected failed update, got {other:?}"),
    }
    assert_eq!(report.outcome_of(APPROVAL_STEP), Some(&StepOutcome::Blocked));
    assert_eq!(report.outcome_of(PROMOTE_STEP), None);
    assert!(report.approval.is_none());

    let gate = pipeline.gate(report.run).unwrap();
    assert_eq!(gate.state(), GateState::Blocked);
    assert!(gate.is_held());
    assert!(matches!(
        pipeline.approve(report.run, "alice", None),
        Err(PipelineError::Gate(GateError::Held))
    ));
    assert!(matches!(
        pipeline.cancel(report.run, "ops"),
        Err(PipelineError::Gate(GateError::Held))
    ));
    assert_eq!(gate.state(), GateState::Blocked);
    let actions: Vec<String> = env
        .audit
        .events_for(report.run)
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"gate.held".to_string()));
    assert!(!actions.contains(&"gate.cancelled".to_string()));
    assert_eq!(promotions(&env), 0);
    assert_eq!(env.primary().field("comment"), Some(&"out-of-band".into()));
}

#[tokio::test]
async fn exhausted_reads_fail_the_run() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();
    env.control.fail_reads(10);

    let report = pipeline.run(outputs).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    match report.outcome_of(UPDATE_STEP) {
        Some(StepOutcome::Failed { error, .. }) => {
            assert_eq!(error.kind, ErrorKind::TransientInfra)
        }
        other => panic!("expected failed update, got {other:?}"),
    }
    assert_eq!(env.primary(), primary_config());
}

#[tokio::test]
async fn cancelled_gate_aborts_the_run() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();

    let run = pipeline.start(outputs).unwrap();
    pipeline.gate(run).unwrap().wait_until_open().await;
    pipeline.cancel(run, "release-manager").unwrap();
    let report = pipeline.wait(run).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Aborted);
    assert_eq!(report.outcome_of(APPROVAL_STEP), Some(&StepOutcome::Cancelled));
    assert_eq!(promotions(&env), 0);
    assert!(matches!(
        pipeline.approve(run, "alice", None),
        Err(PipelineError::Gate(GateError::AlreadyDecided(GateState::Cancelled)))
    ));
}

#[tokio::test(start_paused = true)]
async fn undecided_gate_times_out() {
    let env = TestEnv::with_config(test_pipeline_config().with_approval(ApprovalConfig {
        timeout_secs: Some(3600),
        ..ApprovalConfig::default()
    }));
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();

    let report = pipeline.run(outputs).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Aborted);
    assert_eq!(pipeline.gate(report.run).unwrap().state(), GateState::Cancelled);
    assert_eq!(unconditional_writes(&env), 0);
}

#[tokio::test]
async fn only_listed_approvers_may_decide() {
    let env = TestEnv::with_config(test_pipeline_config().with_approval(ApprovalConfig {
        approvers: vec!["alice".into()],
        ..ApprovalConfig::default()
    }));
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();

    let run = pipeline.start(outputs).unwrap();
    pipeline.gate(run).unwrap().wait_until_open().await;

    assert!(matches!(
        pipeline.approve(run, "mallory", None),
        Err(PipelineError::Gate(GateError::Unauthorized(_)))
    ));
    assert_eq!(pipeline.status(run).unwrap(), PipelineStatus::Running);

    pipeline.approve(run, "alice", Some("reviewed".into())).unwrap();
    let report = pipeline.wait(run).await.unwrap();
    assert_eq!(report.status, PipelineStatus::Completed);
    assert_eq!(report.approval.unwrap().actor, "alice");
}

#[tokio::test]
async fn bootstrap_mode_only_verifies_primary() {
    let env = TestEnv::with_config(test_pipeline_config().with_continuous_deployment(false));
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();

    let report = pipeline.run(outputs).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert!(matches!(
        report.outcome_of(VERIFY_STEP),
        Some(StepOutcome::Succeeded { .. })
    ));
    assert!(matches!(
        pipeline.gate(report.run),
        Err(PipelineError::Configuration(_))
    ));
    assert!(env.store.journal().is_empty());
    assert!(pipeline.executions().is_empty());
}

#[test]
fn missing_primary_export_is_a_configuration_error() {
    let env = TestEnv::new();
    let err = PromotionPipeline::new(env.config.clone(), &ExportRegistry::new(), env.service.clone())
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn continuous_deployment_requires_a_context() {
    let env = TestEnv::new();
    let mut config = env.config.clone();
    config.execution_context = None;

    let err = PromotionPipeline::new(config.clone(), &env.exports, env.service.clone()).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));

    // Bootstrap mode has no update or promotion to run.
    let bootstrap = config.with_continuous_deployment(false);
    assert!(PromotionPipeline::new(bootstrap, &env.exports, env.service.clone()).is_ok());
}

#[tokio::test]
async fn missing_staging_export_is_a_configuration_error() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let names = env.config.export_names();
    let partial = ExportRegistry::new();
    partial
        .publish(names.primary_distribution_id, primary_id().as_str())
        .unwrap();

    let err = pipeline.collect_staging_outputs(&partial).await.unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn audit_trail_covers_the_run() {
    let env = TestEnv::new();
    let pipeline = env.pipeline();
    let outputs = pipeline.collect_staging_outputs(&env.exports).await.unwrap();

    let run = pipeline.start(outputs).unwrap();
    pipeline.gate(run).unwrap().wait_until_open().await;
    pipeline.approve(run, "alice", None).unwrap();
    pipeline.wait(run).await.unwrap();

    let run_actions: Vec<String> = env
        .audit
        .events_for(run)
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        run_actions,
        vec!["pipeline.started", "gate.approved", "pipeline.finished"]
    );
    let all: Vec<String> = env.audit.events().into_iter().map(|e| e.action).collect();
    assert!(all.contains(&"update.succeeded".to_string()));
    assert!(all.contains(&"promotion.succeeded".to_string()));
    assert_eq!(env.audit.verify_integrity().unwrap(), env.audit.len());
}
