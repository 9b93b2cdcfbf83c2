mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use oppmatch_core::{Category, ErrorKind, Stage};
use oppmatch_inference::mock::ScriptedModel;
use oppmatch_inference::{DisabledKnowledgeBase, StaticKnowledgeBase, NO_EVIDENCE_RATIONALE};
use oppmatch_pipeline::envelope::MessageAttributes;
use oppmatch_pipeline::QueueMessage;

const STRONG_FIT: &str = r#"{"match_score": 0.8, "rationale": "Strong overlap with GovCloud migration past performance.",
  "citations": [1, 2], "opportunity_required_skills": ["AWS GovCloud", "Terraform"],
  "company_skills": ["AWS GovCloud", "Terraform", "FedRAMP"]}"#;

#[tokio::test]
async fn strong_fit_is_written_to_matches_with_both_citations() {
    let h = Harness::new();
    h.seed_opportunity("FA8650-26-R-0001").await;
    let scoring = Arc::new(ScriptedModel::replying(STRONG_FIT));
    let worker = h.worker(
        test_config(),
        extraction_model(),
        scoring.clone(),
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );

    let response = worker
        .handle_batch(&batch(vec![pointer_message("m1", "FA8650-26-R-0001")]))
        .await;

    assert!(response.batch_item_failures.is_empty());
    let result = h.result("raw/2026-06-01/matches/FA8650-26-R-0001.json").await;
    assert!(result.is_match);
    assert_eq!(result.category, Category::Matches);
    assert_eq!(result.match_score, 0.8);
    assert_eq!(result.match_threshold, 0.7);
    assert_eq!(result.solicitation_id, "SOL-FA8650-26-R-0001");
    assert_eq!(result.citations.len(), 2);
    assert_eq!(result.citations[0].document_name, "past-performance.pdf");
    assert_eq!(result.opportunity_summary.naics_code, "541512");
    assert_eq!(result.processed_timestamp, ts(12, 0));
    assert_eq!(scoring.calls(), 1);
    let prompt = &scoring.prompts()[0].user;
    assert!(prompt.contains("[1] (past-performance.pdf)"));
}

#[tokio::test]
async fn disabled_knowledge_base_scores_zero_without_calling_the_model() {
    let h = Harness::new();
    h.seed_opportunity("W912-26-Q-0042").await;
    let scoring = Arc::new(ScriptedModel::replying(r#"{"match_score": 0.99, "rationale": "great"}"#));
    let worker = h.worker(test_config(), extraction_model(), scoring.clone(), Arc::new(DisabledKnowledgeBase));

    let response = worker
        .handle_batch(&batch(vec![pointer_message("m1", "W912-26-Q-0042")]))
        .await;

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(scoring.calls(), 0);
    let result = h.result("raw/2026-06-01/no_matches/W912-26-Q-0042.json").await;
    assert_eq!(result.match_score, 0.0);
    assert!(!result.is_match);
    assert_eq!(result.category, Category::NoMatches);
    assert_eq!(result.rationale, NO_EVIDENCE_RATIONALE);
    assert!(result.citations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_scoring_fails_the_item_and_writes_only_an_error_record() {
    let h = Harness::new();
    h.seed_opportunity("N00024-26-R-7").await;
    let scoring = Arc::new(ScriptedModel::replying(STRONG_FIT).with_delay(Duration::from_secs(30)));
    let worker = h.worker(
        test_config(),
        extraction_model(),
        scoring.clone(),
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );

    let response = worker
        .handle_batch(&batch(vec![pointer_message("m1", "N00024-26-R-7")]))
        .await;

    assert_eq!(response.failed_ids(), vec!["m1"]);
    assert_eq!(scoring.calls(), 4);
    assert!(h.keys_under("raw/2026-06-01/matches/").await.is_empty());
    assert!(h.keys_under("raw/2026-06-01/no_matches/").await.is_empty());
    let error = h.result("raw/2026-06-01/errors/N00024-26-R-7.json").await;
    let detail = error.error.clone().unwrap();
    assert_eq!(detail.stage, Stage::Scoring);
    assert_eq!(detail.kind, ErrorKind::Transient);
    assert!(!error.is_match);
    assert_eq!(error.opportunity_summary.title, "Cloud migration support N00024-26-R-7");
    assert_eq!(error.solicitation_id, "SOL-N00024-26-R-7");
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_is_a_transient_failure() {
    let h = Harness::new();
    h.seed_opportunity("SLOW-1").await;
    let mut config = test_config();
    config.timeouts.processing_budget_secs = 3;
    let extraction = Arc::new(ScriptedModel::replying("{}").with_delay(Duration::from_secs(10)));
    let worker = h.worker(
        config,
        extraction,
        Arc::new(ScriptedModel::replying(STRONG_FIT)),
        Arc::new(DisabledKnowledgeBase),
    );

    let err = worker.handle_message(&pointer_message("m1", "SLOW-1")).await.unwrap_err();

    assert_eq!(err.stage, Stage::Budget);
    assert_eq!(err.kind, ErrorKind::Transient);
    let error = h.result("raw/2026-06-01/errors/SLOW-1.json").await;
    assert_eq!(error.error.unwrap().stage, Stage::Budget);
}

#[tokio::test]
async fn only_failed_messages_are_reported() {
    let h = Harness::new();
    for id in ["A-1", "A-2", "A-3"] {
        h.seed_opportunity(id).await;
    }
    let worker = h.worker(
        test_config(),
        extraction_model(),
        Arc::new(ScriptedModel::replying(STRONG_FIT)),
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );
    let malformed = QueueMessage {
        message_id: "bad-envelope".into(),
        body: "{\"unexpected\": true}".into(),
        attributes: MessageAttributes {
            approximate_receive_count: Some("3".into()),
        },
    };

    let response = worker
        .handle_batch(&batch(vec![
            pointer_message("m1", "A-1"),
            pointer_message("missing", "DOES-NOT-EXIST"),
            pointer_message("m2", "A-2"),
            malformed,
            pointer_message("m3", "A-3"),
        ]))
        .await;

    assert_eq!(response.failed_ids(), vec!["missing", "bad-envelope"]);
    assert_eq!(h.keys_under("raw/2026-06-01/matches/").await.len(), 3);
    assert_eq!(
        h.keys_under("raw/2026-06-01/errors/").await,
        vec!["raw/2026-06-01/errors/DOES-NOT-EXIST.json".to_string()]
    );
}

#[tokio::test]
async fn reprocessing_on_the_same_day_overwrites() {
    let h = Harness::new();
    h.seed_opportunity("DUP-1").await;
    let worker = h.worker(
        test_config(),
        extraction_model(),
        Arc::new(ScriptedModel::replying(STRONG_FIT)),
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );

    for attempt in 0..3 {
        h.clock.set(ts(12, attempt * 10));
        let response = worker
            .handle_batch(&batch(vec![pointer_message(&format!("m{attempt}"), "DUP-1")]))
            .await;
        assert!(response.batch_item_failures.is_empty());
    }

    assert_eq!(
        h.keys_under("raw/").await,
        vec!["raw/2026-06-01/matches/DUP-1.json".to_string()]
    );
    let result = h.result("raw/2026-06-01/matches/DUP-1.json").await;
    assert_eq!(result.processed_timestamp, ts(12, 20));
}

#[tokio::test]
async fn rescoring_across_the_threshold_leaves_one_record_for_the_day() {
    let h = Harness::new();
    h.seed_opportunity("FLIP-1").await;
    let scoring = Arc::new(ScriptedModel::sequence(vec![
        Ok(STRONG_FIT.to_string()),
        Ok(r#"{"match_score": 0.4, "rationale": "Only partial overlap.", "citations": [1]}"#.to_string()),
    ]));
    let worker = h.worker(
        test_config(),
        extraction_model(),
        scoring,
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );

    worker.handle_batch(&batch(vec![pointer_message("m1", "FLIP-1")])).await;
    assert_eq!(
        h.keys_under("raw/").await,
        vec!["raw/2026-06-01/matches/FLIP-1.json".to_string()]
    );

    h.clock.set(ts(12, 10));
    let response = worker.handle_batch(&batch(vec![pointer_message("m2", "FLIP-1")])).await;

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(
        h.keys_under("raw/").await,
        vec!["raw/2026-06-01/no_matches/FLIP-1.json".to_string()]
    );
    let result = h.result("raw/2026-06-01/no_matches/FLIP-1.json").await;
    assert_eq!(result.match_score, 0.4);
    assert_eq!(result.processed_timestamp, ts(12, 10));
}

#[tokio::test(start_paused = true)]
async fn success_after_a_failed_attempt_replaces_the_error_record() {
    let h = Harness::new();
    h.seed_opportunity("RETRY-1").await;
    let hung = Arc::new(ScriptedModel::replying(STRONG_FIT).with_delay(Duration::from_secs(30)));
    let failing = h.worker(
        test_config(),
        extraction_model(),
        hung,
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );
    let response = failing.handle_batch(&batch(vec![pointer_message("m1", "RETRY-1")])).await;
    assert_eq!(response.failed_ids(), vec!["m1"]);
    assert_eq!(
        h.keys_under("raw/").await,
        vec!["raw/2026-06-01/errors/RETRY-1.json".to_string()]
    );

    let healthy = h.worker(
        test_config(),
        extraction_model(),
        Arc::new(ScriptedModel::replying(STRONG_FIT)),
        Arc::new(StaticKnowledgeBase::new(capability_passages())),
    );
    let response = healthy.handle_batch(&batch(vec![pointer_message("m1", "RETRY-1")])).await;

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(
        h.keys_under("raw/").await,
        vec!["raw/2026-06-01/matches/RETRY-1.json".to_string()]
    );
}

#[tokio::test]
async fn storage_notification_envelopes_are_processed() {
    let h = Harness::new();
    h.seed_opportunity("SPACE ID").await;
    let worker = h.worker(
        test_config(),
        extraction_model(),
        Arc::new(ScriptedModel::replying(STRONG_FIT)),
        Arc::new(DisabledKnowledgeBase),
    );
    let notification = serde_json::json!({
        "Records": [{"s3": {"bucket": {"name": INBOX}, "object": {"key": "notices/SPACE+ID.json"}}}]
    });
    let wrapped = serde_json::json!({"Type": "Notification", "Message": notification.to_string()});
    let message = QueueMessage {
        message_id: "n1".into(),
        body: wrapped.to_string(),
        attributes: MessageAttributes::default(),
    };

    let response = worker.handle_batch(&batch(vec![message])).await;

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(
        h.keys_under("raw/").await,
        vec!["raw/2026-06-01/no_matches/SPACE_ID.json".to_string()]
    );
}
