//! Tests for treeline-engine: registry, stage control, node-result
//! contracts, GPU accounting, journal search, and an offline end-to-end
//! iteration of the parallel agent.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use treeline_core::{Config, Journal, MetricValue, Node, StageIdentifier, TaskDescription};
use treeline_engine::contract::{validate_node_result, ContractContext};
use treeline_engine::gpu::GpuManager;
use treeline_engine::registry::RegistryStatus;
use treeline_engine::{
    ExecutionRegistry, JournalSearch, ParallelAgent, StageControl, StageManager,
    TerminationOutcome,
};
use treeline_llm::{LlmClient, LlmError, LlmResult, StructuredQueryRequest, VisionQueryRequest};
use treeline_telemetry::EventEmitter;

// ===========================================================================
// Test LLM client
// ===========================================================================

type SchemaResponder = Box<dyn Fn(&str) -> LlmResult<Value> + Send + Sync>;

struct MockLlm {
    responder: SchemaResponder,
    calls: AtomicUsize,
}

impl MockLlm {
    fn new(responder: SchemaResponder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            calls: AtomicUsize::new(0),
        })
    }

    /// Every structured query fails; forces deterministic fallbacks.
    fn failing() -> Arc<Self> {
        Self::new(Box::new(|_| {
            Err(LlmError::RequestFailed("offline".to_string()))
        }))
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn structured_query(&self, request: StructuredQueryRequest) -> LlmResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(&request.schema_name)
    }

    async fn vision_query(&self, request: VisionQueryRequest) -> LlmResult<(Value, String)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(&request.schema_name).map(|v| (v, String::new()))
    }
}

// ===========================================================================
// Execution registry
// ===========================================================================

#[test]
fn registry_register_update_complete_cycle() {
    let registry = ExecutionRegistry::new();
    let node = Node::with_id("n1");
    registry.register_execution("e1", Some(&node));
    assert!(registry.has_active_execution("e1"));

    registry.update_pid("e1", 4242);
    assert_eq!(registry.get_pid("e1"), Some(4242));

    registry.mark_completed("e1");
    assert!(!registry.has_active_execution("e1"));
    assert_eq!(registry.get_pid("e1"), None);
    assert_eq!(
        registry.get_entry("e1").unwrap().status,
        RegistryStatus::Completed
    );
}

#[test]
fn registry_begin_termination_handshake() {
    let registry = ExecutionRegistry::new();
    assert!(matches!(
        registry.begin_termination("missing", "fb"),
        TerminationOutcome::NotFound
    ));

    let node = Node::with_id("n1");
    registry.register_execution("e1", Some(&node));
    // Running but no PID reported yet.
    assert!(matches!(
        registry.begin_termination("e1", "fb"),
        TerminationOutcome::Conflict
    ));

    registry.update_pid("e1", 777);
    match registry.begin_termination("e1", "try a smaller model") {
        TerminationOutcome::Ok { pid, node } => {
            assert_eq!(pid, 777);
            let node = node.unwrap();
            assert!(node.is_user_feedback);
            assert!(node.user_feedback_pending);
            assert_eq!(node.user_feedback_payload.as_deref(), Some("try a smaller model"));
        }
        other => panic!("expected Ok, got {:?}", other),
    }
    assert!(registry.is_terminated("e1"));

    // A second termination of the same execution conflicts.
    assert!(matches!(
        registry.begin_termination("e1", "again"),
        TerminationOutcome::Conflict
    ));
}

#[test]
fn registry_skip_flags_are_per_execution() {
    let registry = ExecutionRegistry::new();
    registry.register_execution("e1", None);
    registry.register_execution("e2", None);
    registry.flag_skip_pending("e1", "operator skip");
    assert_eq!(registry.is_skip_pending("e1").as_deref(), Some("operator skip"));
    assert!(registry.is_skip_pending("e2").is_none());

    registry.clear_execution("e1");
    assert!(registry.is_skip_pending("e1").is_none());
    assert!(registry.get_entry("e1").is_none());
}

// ===========================================================================
// Stage control / skip coordinator
// ===========================================================================

#[test]
fn stage_control_rejects_without_active_stage() {
    let control = StageControl::new();
    let (ok, message) = control.request_stage_skip(Some("please"));
    assert!(!ok);
    assert!(message.contains("No active stage"));
}

#[test]
fn stage_control_rejects_when_not_skippable() {
    let control = StageControl::new();
    control.publish_stage_state("1_initial_implementation", 1, false, Some("no good node yet"));
    let (ok, message) = control.request_stage_skip(None);
    assert!(!ok);
    assert_eq!(message, "no good node yet");
}

#[test]
fn stage_control_request_and_consume() {
    let control = StageControl::new();
    control.publish_stage_state("3_creative_research", 3, true, None);
    let (ok, _) = control.request_stage_skip(Some("operator"));
    assert!(ok);
    assert!(control.get_stage_state().skip_pending);

    // Duplicate requests for the same stage are idempotent.
    let (ok, message) = control.request_stage_skip(Some("again"));
    assert!(ok);
    assert!(message.contains("already requested"));

    // The consumer must name the matching stage.
    assert!(control.consume_skip_request("1_initial_implementation").is_none());
    assert_eq!(
        control.consume_skip_request("3_creative_research").as_deref(),
        Some("operator")
    );
    // Single-consumer: the second consume sees nothing.
    assert!(control.consume_skip_request("3_creative_research").is_none());
    assert!(!control.get_stage_state().skip_pending);
}

#[test]
fn stage_change_discards_pending_skip() {
    let control = StageControl::new();
    control.publish_stage_state("1_initial_implementation", 1, true, None);
    let (ok, _) = control.request_stage_skip(None);
    assert!(ok);
    control.publish_stage_state("2_baseline_tuning", 2, true, None);
    assert!(control.consume_skip_request("1_initial_implementation").is_none());
    assert!(control.consume_skip_request("2_baseline_tuning").is_none());
}

#[test]
fn stage_control_reset_restores_defaults() {
    let control = StageControl::new();
    control.publish_stage_state("2_baseline_tuning", 2, true, None);
    control.reset_stage_state();
    let state = control.get_stage_state();
    assert!(state.stage_name.is_none());
    assert!(!state.can_be_skipped);
}

// ===========================================================================
// Node-result contract
// ===========================================================================

fn ctx_for(stage: StageIdentifier) -> ContractContext {
    ContractContext {
        stage_identifier: stage,
        is_seed_aggregation: false,
        seed_eval: false,
        seed_value: 0,
        working_png_count: 0,
        expected_hyperparam_name: None,
        expected_ablation_name: None,
    }
}

fn valid_result() -> Value {
    json!({
        "plan": "baseline",
        "code": "print(1)",
        "analysis": "ran fine",
        "is_buggy": false,
        "is_buggy_plots": true,
        "is_seed_node": false,
        "is_seed_agg_node": false,
        "datasets_successfully_tested": ["mnist"],
    })
}

#[test]
fn contract_accepts_a_valid_stage1_result() {
    let errors = validate_node_result(&valid_result(), &ctx_for(StageIdentifier::Stage1));
    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
}

#[test]
fn contract_rejects_unexpected_keys_and_metric() {
    let mut result = valid_result();
    result["surprise"] = json!(1);
    result["metric"] = json!({"value": 0.5});
    let errors = validate_node_result(&result, &ctx_for(StageIdentifier::Stage1));
    assert!(errors.iter().any(|e| e.contains("Unexpected key")));
    assert!(errors.iter().any(|e| e.contains("Do NOT include metric")));
}

#[test]
fn contract_requires_boolean_flags_and_dataset_list() {
    let result = json!({"plan": "p", "code": "c"});
    let errors = validate_node_result(&result, &ctx_for(StageIdentifier::Stage1));
    assert!(errors.iter().any(|e| e.contains("is_buggy_plots must be a boolean")));
    assert!(errors
        .iter()
        .any(|e| e.contains("datasets_successfully_tested is required")));
}

#[test]
fn contract_seed_eval_requires_seed_mention_in_plan() {
    let mut ctx = ctx_for(StageIdentifier::Stage1);
    ctx.seed_eval = true;
    ctx.seed_value = 2;

    let mut result = valid_result();
    result["is_seed_node"] = json!(true);
    result["plan"] = json!("re-run with random seed 2 fixed");
    assert!(validate_node_result(&result, &ctx).is_empty());

    result["plan"] = json!("just a re-run");
    let errors = validate_node_result(&result, &ctx);
    assert!(errors.iter().any(|e| e.contains("mention the seed value")));

    result["is_seed_node"] = json!(false);
    let errors = validate_node_result(&result, &ctx);
    assert!(errors.iter().any(|e| e.contains("is_seed_node=true")));
}

#[test]
fn contract_stage2_requires_assigned_hyperparam_name() {
    let mut ctx = ctx_for(StageIdentifier::Stage2);
    ctx.expected_hyperparam_name = Some("learning rate".to_string());

    let mut result = valid_result();
    let errors = validate_node_result(&result, &ctx);
    assert!(errors.iter().any(|e| e.contains("hyperparam_name")));

    result["hyperparam_name"] = json!("batch size");
    let errors = validate_node_result(&result, &ctx);
    assert!(errors.iter().any(|e| e.contains("exactly to the assigned idea name")));

    result["hyperparam_name"] = json!("learning rate");
    assert!(validate_node_result(&result, &ctx).is_empty());
}

#[test]
fn contract_stage3_needs_png_when_plots_claimed_good() {
    let mut result = valid_result();
    result["is_buggy_plots"] = json!(false);
    let errors = validate_node_result(&result, &ctx_for(StageIdentifier::Stage3));
    assert!(errors.iter().any(|e| e.contains("at least one .png")));

    let mut ctx = ctx_for(StageIdentifier::Stage3);
    ctx.working_png_count = 2;
    assert!(validate_node_result(&result, &ctx).is_empty());
}

#[test]
fn contract_stage4_requires_ablation_evidence() {
    let mut ctx = ctx_for(StageIdentifier::Stage4);
    ctx.expected_ablation_name = Some("remove attention".to_string());
    ctx.working_png_count = 1;

    let mut result = valid_result();
    result["is_buggy_plots"] = json!(false);
    result["ablation_name"] = json!("remove attention");
    let errors = validate_node_result(&result, &ctx);
    assert!(errors.iter().any(|e| e.contains("plot_analyses")));
    assert!(errors.iter().any(|e| e.contains("vlm_feedback_summary")));

    result["plot_analyses"] = json!([{"analysis": "worse without attention"}]);
    result["vlm_feedback_summary"] = json!(["clear degradation"]);
    assert!(validate_node_result(&result, &ctx).is_empty());
}

#[test]
fn contract_seed_aggregation_rules() {
    let mut ctx = ctx_for(StageIdentifier::Stage1);
    ctx.is_seed_aggregation = true;

    let mut result = valid_result();
    let errors = validate_node_result(&result, &ctx);
    assert!(errors.iter().any(|e| e.contains("is_seed_agg_node=true")));

    result["is_seed_node"] = json!(true);
    result["is_seed_agg_node"] = json!(true);
    result["analysis"] = json!("variance across seeds is small");
    assert!(validate_node_result(&result, &ctx).is_empty());

    // A non-aggregation run must not claim to be one.
    let mut plain = valid_result();
    plain["is_seed_agg_node"] = json!(true);
    let errors = validate_node_result(&plain, &ctx_for(StageIdentifier::Stage1));
    assert!(errors.iter().any(|e| e.contains("is_seed_agg_node=false")));
}

// ===========================================================================
// GPU manager
// ===========================================================================

#[test]
fn gpu_manager_hands_out_distinct_indices() {
    let manager = GpuManager::new(2);
    let a = manager.acquire("w0").unwrap();
    let b = manager.acquire("w1").unwrap();
    assert_ne!(a, b);
    assert!(manager.acquire("w2").is_none());

    // Re-acquiring for the same worker is idempotent.
    assert_eq!(manager.acquire("w0"), Some(a));

    manager.release("w0");
    assert_eq!(manager.acquire("w3"), Some(a));
    manager.release_all();
    assert!(manager.acquire("w4").is_some());
}

// ===========================================================================
// Journal search
// ===========================================================================

fn good_node(id: &str, metric: f64) -> Node {
    let mut node = Node::with_id(id);
    node.plan = format!("attempt {}", id);
    node.code = "print(1)".to_string();
    node.is_buggy = Some(false);
    node.is_buggy_plots = Some(false);
    node.metric = Some(MetricValue::new(json!(metric)));
    node
}

fn search_with(nodes: Vec<Node>) -> JournalSearch {
    let mut search = JournalSearch::new(
        Journal::new("1_initial_implementation", Some("run-1".into())),
        EventEmitter::noop(),
        "feedback-model",
        0.5,
    );
    for node in nodes {
        search.append(node);
    }
    search
}

#[tokio::test]
async fn best_node_is_none_without_good_candidates() {
    let llm = MockLlm::failing();
    let mut buggy = Node::with_id("b");
    buggy.is_buggy = Some(true);
    let mut search = search_with(vec![buggy]);
    assert!(search.get_best_node(llm.as_ref(), true, false).await.is_none());
    // No LLM call for an empty candidate set.
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn metric_only_selection_skips_the_llm() {
    let llm = MockLlm::failing();
    let mut search = search_with(vec![good_node("a", 0.2), good_node("b", 0.9)]);
    let best = search.get_best_node(llm.as_ref(), true, true).await.unwrap();
    assert_eq!(best.id, "b");
    assert_eq!(llm.call_count(), 0);
    // The selected node records its reasoning.
    assert!(search
        .journal
        .node_by_id("b")
        .unwrap()
        .best_node_reasoning
        .is_some());
}

#[tokio::test]
async fn single_candidate_bypasses_the_llm() {
    let llm = MockLlm::failing();
    let mut search = search_with(vec![good_node("only", 0.5)]);
    let best = search.get_best_node(llm.as_ref(), true, false).await.unwrap();
    assert_eq!(best.id, "only");
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn llm_selection_is_memoised_until_state_changes() {
    let llm = MockLlm::new(Box::new(|schema| {
        assert_eq!(schema, "node_selection_response");
        Ok(json!({"selected_id": "a", "reasoning": "cleaner training dynamics"}))
    }));
    let mut search = search_with(vec![good_node("a", 0.2), good_node("b", 0.9)]);

    let first = search.get_best_node(llm.as_ref(), true, false).await.unwrap();
    assert_eq!(first.id, "a");
    assert_eq!(llm.call_count(), 1);

    // Unchanged candidate set: cached, no second call.
    let second = search.get_best_node(llm.as_ref(), true, false).await.unwrap();
    assert_eq!(second.id, "a");
    assert_eq!(llm.call_count(), 1);

    // New good node invalidates the cache.
    search.append(good_node("c", 0.95));
    let _ = search.get_best_node(llm.as_ref(), true, false).await.unwrap();
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn unknown_llm_choice_falls_back_to_metric_argmax() {
    let llm = MockLlm::new(Box::new(|_| {
        Ok(json!({"selected_id": "nonexistent", "reasoning": "?"}))
    }));
    let mut search = search_with(vec![good_node("a", 0.2), good_node("b", 0.9)]);
    let best = search.get_best_node(llm.as_ref(), true, false).await.unwrap();
    assert_eq!(best.id, "b");
}

#[tokio::test]
async fn llm_error_falls_back_to_metric_argmax() {
    let llm = MockLlm::failing();
    let mut search = search_with(vec![good_node("a", 0.4), good_node("b", 0.6)]);
    let best = search.get_best_node(llm.as_ref(), true, false).await.unwrap();
    assert_eq!(best.id, "b");
    assert!(!best.buggy());
}

#[tokio::test]
async fn seed_nodes_are_excluded_unless_nothing_else_exists() {
    let llm = MockLlm::failing();
    let mut seed = good_node("seed", 0.99);
    seed.is_seed_node = true;
    let mut search = search_with(vec![seed, good_node("real", 0.5)]);
    let best = search.get_best_node(llm.as_ref(), true, true).await.unwrap();
    assert_eq!(best.id, "real");

    // Only seed nodes left: fall back to including them.
    let mut only_seed = good_node("s2", 0.7);
    only_seed.is_seed_node = true;
    let mut search = search_with(vec![only_seed]);
    let best = search.get_best_node(llm.as_ref(), true, true).await.unwrap();
    assert_eq!(best.id, "s2");
}

#[test]
fn summary_is_deterministic_and_cached() {
    let mut buggy = Node::with_id("bad");
    buggy.is_buggy = Some(true);
    buggy.exc_type = Some("ValueError".into());
    buggy.analysis = Some("shape mismatch in the decoder".into());
    let mut search = search_with(vec![good_node("ok", 0.8), buggy]);

    let summary = search.generate_summary(false);
    assert!(summary.contains("Total nodes: 2"));
    assert!(summary.contains("Good nodes: 1"));
    assert!(summary.contains("Recent failures:"));
    assert!(summary.contains("ValueError"));

    // Same state: identical cached text.
    assert_eq!(search.generate_summary(false), summary);

    let with_code = search.generate_summary(true);
    assert_ne!(with_code, summary);
}

#[test]
fn empty_journal_summary() {
    let mut search = search_with(vec![]);
    assert_eq!(search.generate_summary(false), "No experiments conducted yet.");
}

// ===========================================================================
// Parallel agent (offline end-to-end iteration)
// ===========================================================================

fn offline_config(workspace: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.workspace_dir = workspace.join("run");
    cfg.min_num_gpus = 0;
    cfg.agent.num_workers = 1;
    cfg.agent.search.num_drafts = 1;
    cfg.exec.timeout_secs = 30;
    // Guarantee the spawn fails fast even on machines with a real Codex CLI.
    cfg.exec.codex_argv = vec!["treeline-test-missing-codex".to_string()];
    cfg.telemetry.run_id = "run-test".into();
    cfg
}

fn engine_mock_llm() -> Arc<MockLlm> {
    MockLlm::new(Box::new(|schema| match schema {
        "evaluation_metric_spec" => Ok(json!({
            "name": "accuracy",
            "maximize": true,
            "description": "validation accuracy"
        })),
        "training_review" => Ok(json!({"is_bug": true, "summary": "Codex unavailable"})),
        "node_selection_response" => Err(LlmError::RequestFailed("offline".into())),
        _ => Err(LlmError::RequestFailed("offline".into())),
    }))
}

/// One full agent iteration with no Codex binary on PATH: the draft attempt
/// must degrade to a buggy node and the journal must grow by exactly the
/// worker count.
#[tokio::test]
async fn agent_step_without_codex_yields_buggy_draft() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = offline_config(dir.path());
    std::fs::create_dir_all(&cfg.workspace_dir).unwrap();
    // Pre-seed the venv marker so the worker skips interpreter setup.
    std::fs::create_dir_all(cfg.workspace_dir.join(".venv/bin")).unwrap();
    std::fs::write(cfg.workspace_dir.join(".venv/bin/python"), "").unwrap();

    let llm = engine_mock_llm();
    let registry = Arc::new(ExecutionRegistry::new());
    let mut agent = ParallelAgent::new(
        "task".into(),
        "goals".into(),
        TaskDescription::default(),
        cfg,
        StageIdentifier::Stage1,
        None,
        None,
        EventEmitter::noop(),
        registry.clone(),
        llm,
    )
    .await
    .unwrap();

    let mut search = search_with(vec![]);
    agent.step(&mut search).await.unwrap();

    assert_eq!(search.journal.len(), 1);
    let node = &search.journal.nodes[0];
    assert_eq!(node.step, Some(0));
    assert!(node.buggy());
    assert!(node.exc_type.is_some());
    assert!(node.parent.is_none());
    // The registry entry was cleared after collection.
    assert!(!registry.has_active_execution(&node.id));
    agent.cleanup();
}

#[tokio::test]
async fn abort_active_executions_flags_in_flight_ids() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = offline_config(dir.path());
    std::fs::create_dir_all(&cfg.workspace_dir).unwrap();
    let registry = Arc::new(ExecutionRegistry::new());
    let agent = ParallelAgent::new(
        "task".into(),
        "goals".into(),
        TaskDescription::default(),
        cfg,
        StageIdentifier::Stage1,
        None,
        None,
        EventEmitter::noop(),
        registry.clone(),
        engine_mock_llm(),
    )
    .await
    .unwrap();

    // With nothing in flight this is a no-op.
    agent.abort_active_executions("operator skip");
    assert!(registry.is_skip_pending("anything").is_none());
}

// ===========================================================================
// Stage manager boundaries
// ===========================================================================

#[tokio::test]
async fn zero_iteration_budget_completes_immediately_without_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = offline_config(dir.path());
    cfg.agent.stages.stage1_max_iters = 0;
    std::fs::create_dir_all(&cfg.workspace_dir).unwrap();

    let mut manager = StageManager::new(
        cfg,
        TaskDescription::default(),
        EventEmitter::noop(),
        Arc::new(ExecutionRegistry::new()),
        Arc::new(StageControl::new()),
        engine_mock_llm(),
    );

    let mut noop_step = |_: &treeline_core::StageMeta, _: &JournalSearch| {};
    let mut noop_iter = |_: &treeline_core::StageMeta, _: &JournalSearch| {};
    manager.run(&mut noop_step, &mut noop_iter).await.unwrap();

    // Stage 1 exhausted its (empty) budget without a working implementation:
    // the run ends in failure and no nodes were ever appended.
    assert!(manager.failure_reason().is_some());
    assert_eq!(
        manager
            .journal("1_initial_implementation")
            .map(|s| s.journal.len()),
        Some(0)
    );
    assert!(manager.has_stage_completed("1_initial_implementation"));
    assert!(manager.current_stage().is_none());
}
