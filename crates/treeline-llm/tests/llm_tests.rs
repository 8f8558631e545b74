//! Tests for treeline-llm: schema shapes, typed deserialization, the
//! structured-query helper against a scripted client.

use serde_json::{json, Value};
use treeline_llm::provider::ResponseSchema;
use treeline_llm::*;

// ===========================================================================
// Schema declarations
// ===========================================================================

fn assert_object_schema(schema: Value) {
    assert_eq!(schema["type"], "object");
    assert!(schema["properties"].is_object());
    assert!(schema["required"].is_array());
}

#[test]
fn all_schemas_declare_objects() {
    assert_object_schema(PlanAndCodeSchema::json_schema());
    assert_object_schema(GpuUsageValidationSchema::json_schema());
    assert_object_schema(MetricParseResponse::json_schema());
    assert_object_schema(PlotFeedback::json_schema());
    assert_object_schema(PlotSelectionResponse::json_schema());
    assert_object_schema(TrainingReview::json_schema());
    assert_object_schema(ExperimentSummary::json_schema());
    assert_object_schema(StageCompletionEvaluation::json_schema());
    assert_object_schema(NodeSelectionResponse::json_schema());
    assert_object_schema(HyperparamTuningIdea::json_schema());
    assert_object_schema(AblationIdea::json_schema());
    assert_object_schema(EvaluationMetricSpecResponse::json_schema());
    assert_object_schema(SubstageGoalResponse::json_schema());
    assert_object_schema(TransitionSummaryResponse::json_schema());
}

#[test]
fn schema_names_are_distinct() {
    let names = [
        PlanAndCodeSchema::schema_name(),
        MetricParseResponse::schema_name(),
        PlotFeedback::schema_name(),
        PlotSelectionResponse::schema_name(),
        TrainingReview::schema_name(),
        StageCompletionEvaluation::schema_name(),
        NodeSelectionResponse::schema_name(),
        HyperparamTuningIdea::schema_name(),
        AblationIdea::schema_name(),
        EvaluationMetricSpecResponse::schema_name(),
        SubstageGoalResponse::schema_name(),
    ];
    let unique: std::collections::HashSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len());
}

// ===========================================================================
// Typed deserialization
// ===========================================================================

#[test]
fn metric_parse_response_deserializes() {
    let value = json!({
        "valid_metrics_received": true,
        "metric_names": [
            {
                "metric_name": "accuracy",
                "lower_is_better": false,
                "description": "validation accuracy",
                "data": [
                    {"dataset_name": "mnist", "final_value": 0.97, "best_value": 0.98}
                ]
            }
        ]
    });
    let parsed: MetricParseResponse = serde_json::from_value(value).unwrap();
    assert!(parsed.valid_metrics_received);
    assert_eq!(parsed.metric_names.len(), 1);
    assert_eq!(parsed.metric_names[0].data[0].dataset_name, "mnist");
}

#[test]
fn plot_feedback_deserializes() {
    let value = json!({
        "plot_analyses": [{"analysis": "loss decreases smoothly"}],
        "valid_plots_received": true,
        "vlm_feedback_summary": "healthy training curves"
    });
    let parsed: PlotFeedback = serde_json::from_value(value).unwrap();
    assert!(parsed.valid_plots_received);
    assert_eq!(parsed.plot_analyses.len(), 1);
}

#[test]
fn training_review_deserializes() {
    let parsed: TrainingReview =
        serde_json::from_value(json!({"is_bug": true, "summary": "CUDA OOM; reduce batch size"}))
            .unwrap();
    assert!(parsed.is_bug);
}

#[test]
fn stage_completion_evaluation_deserializes() {
    let parsed: StageCompletionEvaluation = serde_json::from_value(json!({
        "is_complete": false,
        "reasoning": "only one dataset tested",
        "missing_criteria": ["second dataset"]
    }))
    .unwrap();
    assert!(!parsed.is_complete);
    assert_eq!(parsed.missing_criteria.len(), 1);
}

#[test]
fn experiment_summary_next_steps_optional() {
    let parsed: ExperimentSummary = serde_json::from_value(json!({
        "findings": "f",
        "significance": "s"
    }))
    .unwrap();
    assert!(parsed.next_steps.is_none());
}

// ===========================================================================
// structured_query_as against a scripted client
// ===========================================================================

struct ScriptedClient {
    response: Value,
}

#[async_trait::async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn structured_query(&self, request: StructuredQueryRequest) -> LlmResult<Value> {
        assert!(!request.schema_name.is_empty());
        Ok(self.response.clone())
    }

    async fn vision_query(&self, _request: VisionQueryRequest) -> LlmResult<(Value, String)> {
        Ok((self.response.clone(), "raw".to_string()))
    }
}

#[tokio::test]
async fn structured_query_as_parses_matching_response() {
    let client = ScriptedClient {
        response: json!({"selected_id": "n1", "reasoning": "best metric"}),
    };
    let parsed: NodeSelectionResponse =
        structured_query_as(&client, "pick one", None, "model-x", 0.3)
            .await
            .unwrap();
    assert_eq!(parsed.selected_id, "n1");
}

#[tokio::test]
async fn structured_query_as_rejects_mismatched_response() {
    let client = ScriptedClient {
        response: json!({"unexpected": true}),
    };
    let result: LlmResult<NodeSelectionResponse> =
        structured_query_as(&client, "pick one", None, "model-x", 0.3).await;
    assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
}

#[tokio::test]
async fn vision_query_returns_value_and_raw_text() {
    let client = ScriptedClient {
        response: json!({
            "plot_analyses": [],
            "valid_plots_received": false,
            "vlm_feedback_summary": "empty plots"
        }),
    };
    let request = VisionQueryRequest {
        message: "review".into(),
        system_message: None,
        image_paths: vec![],
        model: "model-v".into(),
        temperature: 0.2,
        schema_name: PlotFeedback::schema_name().into(),
        schema: PlotFeedback::json_schema(),
        max_images: 10,
    };
    let (value, raw) = client.vision_query(request).await.unwrap();
    let parsed: PlotFeedback = serde_json::from_value(value).unwrap();
    assert!(!parsed.valid_plots_received);
    assert_eq!(raw, "raw");
}
