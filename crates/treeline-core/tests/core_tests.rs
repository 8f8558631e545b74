//! Tests for treeline-core: config, stages, metrics, nodes, journal, events

use serde_json::json;
use treeline_core::*;

// ===========================================================================
// StageIdentifier / StageMeta
// ===========================================================================

#[test]
fn stage_identifier_numbers_and_slugs() {
    assert_eq!(StageIdentifier::Stage1.number(), 1);
    assert_eq!(StageIdentifier::Stage1.slug(), "initial_implementation");
    assert_eq!(StageIdentifier::Stage2.prefixed_name(), "2_baseline_tuning");
    assert_eq!(StageIdentifier::Stage3.prefixed_name(), "3_creative_research");
    assert_eq!(StageIdentifier::Stage4.prefixed_name(), "4_ablation_studies");
}

#[test]
fn stage_identifier_ordering() {
    assert_eq!(StageIdentifier::Stage1.next(), Some(StageIdentifier::Stage2));
    assert_eq!(StageIdentifier::Stage2.next(), Some(StageIdentifier::Stage3));
    assert_eq!(StageIdentifier::Stage3.next(), Some(StageIdentifier::Stage4));
    assert_eq!(StageIdentifier::Stage4.next(), None);
}

#[test]
fn stage_identifier_from_prefixed_name() {
    assert_eq!(
        StageIdentifier::from_prefixed_name("1_initial_implementation"),
        Some(StageIdentifier::Stage1)
    );
    assert_eq!(StageIdentifier::from_prefixed_name("9_unknown"), None);
}

#[test]
fn stage_meta_derived_fields() {
    let meta = StageMeta {
        identifier: StageIdentifier::Stage2,
        goals: "tune".into(),
        max_iterations: 10,
        num_drafts: 2,
    };
    assert_eq!(meta.number(), 2);
    assert_eq!(meta.slug(), "baseline_tuning");
    assert_eq!(meta.name(), "2_baseline_tuning");
}

// ===========================================================================
// Config
// ===========================================================================

#[test]
fn config_defaults_are_valid() {
    let cfg = Config::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.agent.num_workers, 1);
    assert_eq!(cfg.agent.multi_seed_eval.num_seeds, 3);
}

#[test]
fn config_rejects_zero_workers() {
    let mut cfg = Config::default();
    cfg.agent.num_workers = 0;
    assert!(matches!(cfg.validate(), Err(Error::Config(_))));
}

#[test]
fn config_rejects_bad_debug_prob() {
    let mut cfg = Config::default();
    cfg.agent.search.debug_prob = 1.5;
    assert!(cfg.validate().is_err());
}

#[test]
fn config_stage_iteration_budgets() {
    let cfg = Config::default();
    assert_eq!(
        cfg.agent.stages.max_iters_for(StageIdentifier::Stage1),
        cfg.agent.stages.stage1_max_iters
    );
    assert_eq!(
        cfg.agent.stages.max_iters_for(StageIdentifier::Stage4),
        cfg.agent.stages.stage4_max_iters
    );
}

#[test]
fn config_load_from_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{
            "workspace_dir": "/tmp/ws/run1",
            "agent": {"num_workers": 4},
            "telemetry": {"run_id": "r-1", "base_url": "http://x", "token": "t"}
        }"#,
    )
    .unwrap();
    let cfg = Config::load(&path).unwrap();
    assert_eq!(cfg.agent.num_workers, 4);
    assert_eq!(cfg.telemetry.run_id, "r-1");
    // Defaults fill everything the file omits.
    assert_eq!(cfg.agent.search.num_drafts, 3);
}

#[test]
fn config_run_logs_dir_is_sibling_of_workspace() {
    let mut cfg = Config::default();
    cfg.workspace_dir = "/data/workspaces/run42".into();
    assert_eq!(
        cfg.run_logs_dir(),
        std::path::PathBuf::from("/data/workspaces/logs/run42")
    );
}

// ===========================================================================
// MetricValue
// ===========================================================================

#[test]
fn metric_worst_orders_below_everything() {
    let worst = MetricValue::worst();
    let real = MetricValue::new(json!(0.001));
    assert!(real > worst);
    assert!(worst.is_worst());
    assert_eq!(worst.comparable_score(), None);
}

#[test]
fn metric_plain_number_ordering() {
    let low = MetricValue::new(json!(0.1));
    let high = MetricValue::new(json!(0.9));
    assert!(high > low);
}

#[test]
fn metric_lower_is_better_negates() {
    let mut loss = MetricValue::new(json!(0.5));
    loss.maximize = Some(false);
    assert_eq!(loss.comparable_score(), Some(-0.5));
}

#[test]
fn metric_aggregates_metric_names_shape() {
    let value = json!({
        "metric_names": [
            {
                "metric_name": "accuracy",
                "lower_is_better": false,
                "description": "val accuracy",
                "data": [
                    {"dataset_name": "a", "final_value": 0.8, "best_value": 0.85},
                    {"dataset_name": "b", "final_value": 0.6, "best_value": 0.7}
                ]
            },
            {
                "metric_name": "loss",
                "lower_is_better": true,
                "description": "val loss",
                "data": [
                    {"dataset_name": "a", "final_value": 0.4, "best_value": 0.3}
                ]
            }
        ]
    });
    let metric = MetricValue::new(value);
    // (0.8 + 0.6 - 0.4) / 3
    let score = metric.comparable_score().unwrap();
    assert!((score - 1.0 / 3.0).abs() < 1e-9);
}

#[test]
fn metric_display_renders_worst() {
    assert_eq!(MetricValue::worst().to_string(), "worst");
}

// ===========================================================================
// Node
// ===========================================================================

#[test]
fn node_defaults() {
    let node = Node::default();
    assert_eq!(node.id.len(), 32);
    assert!(node.step.is_none());
    assert!(!node.is_seed_node);
    assert!(!node.user_feedback_pending);
}

#[test]
fn node_with_exc_type_is_buggy() {
    let mut node = Node::default();
    node.exc_type = Some("TimeoutError".into());
    assert!(node.buggy());
    // Explicitly flagged nodes are buggy regardless of exc_type.
    let mut node = Node::default();
    node.is_buggy = Some(true);
    assert!(node.buggy());
}

#[test]
fn node_good_requires_both_flags() {
    let mut node = Node::default();
    node.is_buggy = Some(false);
    assert!(!node.good());
    node.is_buggy_plots = Some(false);
    assert!(node.good());
}

#[test]
fn node_serde_round_trip() {
    let mut node = Node::with_id("abc123");
    node.plan = "run the baseline".into();
    node.code = "print(1)".into();
    node.parent = Some("parent-id".into());
    node.metric = Some(MetricValue::new(json!(0.75)));
    node.is_buggy = Some(false);
    node.is_buggy_plots = Some(false);
    node.datasets_successfully_tested = vec!["mnist".into()];
    node.plots = vec!["a.png".into()];

    let value = node.to_value();
    let back = Node::from_value(value.clone()).unwrap();
    assert_eq!(back.to_value(), value);
}

#[test]
fn node_from_value_ignores_unknown_keys() {
    let value = json!({
        "id": "n1",
        "plan": "p",
        "code": "c",
        "mystery_field": true,
    });
    let node = Node::from_value(value).unwrap();
    assert_eq!(node.id, "n1");
    assert_eq!(node.plan, "p");
}

#[test]
fn node_from_value_accepts_parent_id_and_bare_metric() {
    let value = json!({
        "id": "n1",
        "parent_id": "n0",
        "metric": 0.5,
    });
    let node = Node::from_value(value).unwrap();
    assert_eq!(node.parent.as_deref(), Some("n0"));
    assert_eq!(node.metric.unwrap().comparable_score(), Some(0.5));
}

#[test]
fn node_from_value_drops_null_metric() {
    let value = json!({
        "id": "n1",
        "metric": {"value": null, "maximize": null, "name": null, "description": null},
    });
    let node = Node::from_value(value).unwrap();
    assert!(node.metric.is_none());
}

#[test]
fn trim_long_string_keeps_head_and_tail() {
    let s = "x".repeat(100);
    let trimmed = node::trim_long_string(&s, 20);
    assert!(trimmed.contains("[output truncated]"));
    assert!(trimmed.len() < 100);
    assert_eq!(node::trim_long_string("short", 20), "short");
}

// ===========================================================================
// Journal
// ===========================================================================

fn journal_with(nodes: Vec<Node>) -> Journal {
    let mut journal = Journal::new("1_initial_implementation", Some("run".into()));
    for node in nodes {
        journal.append(node);
    }
    journal
}

#[test]
fn journal_append_assigns_steps() {
    let journal = journal_with(vec![Node::default(), Node::default(), Node::default()]);
    for (idx, node) in journal.nodes.iter().enumerate() {
        assert_eq!(node.step, Some(idx));
    }
    assert_eq!(journal.len(), journal.nodes.last().unwrap().step.unwrap() + 1);
}

#[test]
fn journal_draft_and_good_and_buggy_partitions() {
    let mut root = Node::with_id("root");
    root.is_buggy = Some(false);
    root.is_buggy_plots = Some(false);
    let mut child = Node::with_id("child");
    child.parent = Some("root".into());
    child.is_buggy = Some(true);

    let journal = journal_with(vec![root, child]);
    assert_eq!(journal.draft_nodes().len(), 1);
    assert_eq!(journal.good_nodes().len(), 1);
    assert_eq!(journal.buggy_nodes().len(), 1);
}

#[test]
fn journal_children_and_leaves() {
    let root = Node::with_id("r");
    let mut a = Node::with_id("a");
    a.parent = Some("r".into());
    let mut b = Node::with_id("b");
    b.parent = Some("r".into());
    let mut c = Node::with_id("c");
    c.parent = Some("a".into());

    let journal = journal_with(vec![root, a, b, c]);
    assert_eq!(journal.children_of("r").len(), 2);
    assert!(journal.is_leaf("c"));
    assert!(!journal.is_leaf("a"));
    let leaves: Vec<&str> = journal.leaves_of("r").iter().map(|n| n.id.as_str()).collect();
    assert_eq!(leaves.len(), 2);
    assert!(leaves.contains(&"b"));
    assert!(leaves.contains(&"c"));
}

#[test]
fn journal_debug_depth_counts_consecutive_buggy_parents() {
    let mut root = Node::with_id("r");
    root.is_buggy = Some(true);
    let mut fix1 = Node::with_id("f1");
    fix1.parent = Some("r".into());
    fix1.is_buggy = Some(true);
    let mut fix2 = Node::with_id("f2");
    fix2.parent = Some("f1".into());

    let journal = journal_with(vec![root, fix1, fix2]);
    assert_eq!(journal.debug_depth("r"), 0);
    assert_eq!(journal.debug_depth("f1"), 1);
    assert_eq!(journal.debug_depth("f2"), 2);
}

#[test]
fn journal_root_of_walks_to_the_top() {
    let root = Node::with_id("r");
    let mut mid = Node::with_id("m");
    mid.parent = Some("r".into());
    let mut leaf = Node::with_id("l");
    leaf.parent = Some("m".into());
    let journal = journal_with(vec![root, mid, leaf]);
    assert_eq!(journal.root_of("l").unwrap().id, "r");
    assert_eq!(journal.root_of("r").unwrap().id, "r");
}

#[test]
fn journal_node_kind_classification() {
    let mut buggy_root = Node::with_id("bad");
    buggy_root.is_buggy = Some(true);
    let mut good_root = Node::with_id("good");
    good_root.is_buggy = Some(false);
    let journal = journal_with(vec![buggy_root, good_root]);
    assert_eq!(journal.node_kind(None), "draft");
    assert_eq!(journal.node_kind(Some("bad")), "debug");
    assert_eq!(journal.node_kind(Some("good")), "improve");
}

// ===========================================================================
// Events
// ===========================================================================

#[test]
fn run_log_event_persistence_record() {
    let event = TimelineEvent::run_log("hello", "info");
    let record = event.persistence_record().unwrap();
    assert_eq!(record.kind, EventKind::RunLog);
    assert_eq!(record.data["message"], "hello");
    assert_eq!(record.data["level"], "info");
}

#[test]
fn gpu_shortage_has_no_persistence_record() {
    let event = TimelineEvent::GpuShortage(GpuShortagePayload {
        required_gpus: 2,
        available_gpus: 0,
        message: "need more".into(),
    });
    assert!(event.persistence_record().is_none());
    assert_eq!(event.kind_label(), "ai.run.gpu_shortage");
}

#[test]
fn codex_event_payload_round_trip() {
    let payload = CodexEventPayload {
        stage: "1_initial_implementation".into(),
        node: 3,
        event_type: "turn.completed".into(),
        event_content: "{}".into(),
        occurred_at: "2025-01-01T00:00:00Z".into(),
    };
    let event = TimelineEvent::CodexEvent(payload);
    let record = event.persistence_record().unwrap();
    assert_eq!(record.kind, EventKind::CodexEvent);
    assert_eq!(record.data["node"], 3);
    assert_eq!(record.data["event_type"], "turn.completed");
}

#[test]
fn event_kind_serializes_snake_case() {
    assert_eq!(
        serde_json::to_string(&EventKind::RunStageProgress).unwrap(),
        r#""run_stage_progress""#
    );
    assert_eq!(
        serde_json::to_string(&EventKind::StageSkipWindow).unwrap(),
        r#""stage_skip_window""#
    );
}

#[test]
fn run_type_and_execution_type_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&RunType::CodexExecution).unwrap(),
        r#""codex_execution""#
    );
    assert_eq!(
        serde_json::to_string(&ExecutionType::StageGoal).unwrap(),
        r#""stage_goal""#
    );
    assert_eq!(
        serde_json::to_string(&ExecutionType::Aggregation).unwrap(),
        r#""aggregation""#
    );
}

#[test]
fn skip_window_reason_omitted_when_none() {
    let payload = StageSkipWindowPayload {
        stage: "s".into(),
        state: SkipWindowState::Opened,
        timestamp: "t".into(),
        reason: None,
    };
    let json = serde_json::to_string(&payload).unwrap();
    assert!(!json.contains("reason"));
    assert!(json.contains(r#""state":"opened""#));
}

#[test]
fn running_code_precedes_completed_shapes_agree() {
    let running = RunningCodePayload {
        execution_id: "e1".into(),
        stage: "1_initial_implementation".into(),
        run_type: RunType::CodexExecution,
        execution_type: ExecutionType::StageGoal,
        code: "(Codex-managed)".into(),
        started_at: "t0".into(),
        is_seed_node: false,
        is_seed_agg_node: false,
        node_index: 1,
    };
    let completed = RunCompletedPayload {
        execution_id: "e1".into(),
        stage: "1_initial_implementation".into(),
        run_type: RunType::CodexExecution,
        execution_type: ExecutionType::StageGoal,
        status: RunStatus::Success,
        exec_time: 1.5,
        completed_at: "t1".into(),
        is_seed_node: false,
        is_seed_agg_node: false,
        node_index: 1,
    };
    assert_eq!(running.execution_id, completed.execution_id);
    let json = serde_json::to_string(&completed).unwrap();
    assert!(json.contains(r#""status":"success""#));
}

// ===========================================================================
// TaskDescription
// ===========================================================================

#[test]
fn task_description_renders_idea_sections() {
    let task = TaskDescription {
        title: "T".into(),
        abstract_text: "A".into(),
        short_hypothesis: "H".into(),
        code: Some("print(1)".into()),
        experiments: vec![],
        risk_factors_and_limitations: vec![],
    };
    let rendered = task.render();
    assert!(rendered.contains("Title:\nT"));
    assert!(rendered.contains("Abstract:\nA"));
    assert!(rendered.contains("Code To Use:\nprint(1)"));
}

#[test]
fn task_description_parses_abstract_key() {
    let task: TaskDescription = serde_json::from_str(
        r#"{"title": "T", "abstract": "A", "short_hypothesis": "H"}"#,
    )
    .unwrap();
    assert_eq!(task.abstract_text, "A");
}
