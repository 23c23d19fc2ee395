//! End-to-end scenarios through the public API, with scripted providers.

use std::sync::Arc;
use std::time::Duration;

use studyweave::internals::extraction::ResponseError;
use studyweave::internals::orchestrator::{Chapter, CompanionExcerpt};
use studyweave::{
    CacheStore, ChapterStatus, Document, ExitCode, FacadeSettings, GenerationError,
    GenerationFacade, GenerationRequest, LlmBackend, LlmError, Orchestrator, OrchestratorSettings,
    ParseOptions, Phase, RetryPolicy, ValidationError,
};
use studyweave_llm::LlmInvocation;
use studyweave_llm::testing::{Scripted, ScriptedBackend};
use studyweave_utils::test_support::{sample_chapter_text, utf8_temp_dir};
use tokio_util::sync::CancellationToken;

const ANALYSIS_NO_TARGETS: &str = r#"BEGIN_JSON
{"summary": "Identity and aggregates.", "key_concepts": ["entity"], "related_chapters": [], "targets": []}
END_JSON"#;

const ENRICHMENT: &str =
    r#"BEGIN_JSON {"synthesis": "Entities map to aggregates.", "related_chapters": ["ch2"]} END_JSON"#;

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(500),
        backoff_factor: 2.0,
        max_delay: Duration::from_secs(8),
        min_output_budget: 256,
        shrink_factor: 0.5,
    }
}

fn facade(backend: Arc<dyn LlmBackend>, max_attempts: u32) -> GenerationFacade {
    GenerationFacade::new(
        Some(backend),
        FacadeSettings {
            analyze_policy: policy(max_attempts),
            enhance_policy: policy(max_attempts),
            attempt_timeout: Duration::from_secs(30),
            max_concurrent_calls: 4,
            call_limit: None,
        },
    )
}

fn domain_modeling() -> Document {
    Document {
        title: "Software Design Study Guide".into(),
        chapters: vec![Chapter {
            id: "ch1".into(),
            title: "Domain Modeling".into(),
            text: sample_chapter_text().into(),
            companion_excerpts: vec![CompanionExcerpt {
                id: "ddd-5".into(),
                book: "Domain-Driven Design".into(),
                section: "Chapter 5".into(),
                text: "A model expressed in software: entities, value objects, services.".into(),
            }],
        }],
    }
}

fn enrichment_request(budget: u32) -> GenerationRequest {
    GenerationRequest::new(
        Phase::Enhance,
        "ch1",
        "You connect passages to companion books.",
        "Passage: entities have identity.",
        budget,
    )
    .with_target("t1")
    .with_parse_options(
        ParseOptions::new()
            .delimiters("BEGIN_JSON", "END_JSON")
            .require(["synthesis", "related_chapters"]),
    )
}

#[tokio::test(start_paused = true)]
async fn phase1_result_is_served_from_cache_on_second_run() {
    let (_temp, dir) = utf8_temp_dir();
    let cache = Arc::new(CacheStore::open(dir.join("cache")).unwrap());
    let backend = Arc::new(ScriptedBackend::always(Scripted::json(ANALYSIS_NO_TARGETS)));
    let document = domain_modeling();

    let first = Orchestrator::new(
        facade(Arc::clone(&backend) as Arc<dyn LlmBackend>, 3),
        OrchestratorSettings::default(),
    )
    .with_cache(Arc::clone(&cache))
    .run(&document, &CancellationToken::new())
    .await;
    assert_eq!(backend.call_count(), 1);
    assert_eq!(first.report.provider_calls, 1);
    assert_eq!(first.report.cache_hits, 0);
    assert_eq!(cache.stats().writes, 1);

    let second = Orchestrator::new(
        facade(Arc::clone(&backend) as Arc<dyn LlmBackend>, 3),
        OrchestratorSettings::default(),
    )
    .with_cache(Arc::clone(&cache))
    .run(&document, &CancellationToken::new())
    .await;
    assert_eq!(backend.call_count(), 1, "second run must not reach the provider");
    assert_eq!(second.report.provider_calls, 0);
    assert_eq!(second.report.cache_hits, 1);
    assert_eq!(second.report.total_tokens, 0);
    assert_eq!(
        second.chapters[0].as_ref().unwrap().analysis,
        first.chapters[0].as_ref().unwrap().analysis
    );
    assert_eq!(second.exit_code(), ExitCode::SUCCESS);
}

#[tokio::test(start_paused = true)]
async fn truncated_twice_then_succeeds_with_smaller_budget() {
    let backend = Arc::new(ScriptedBackend::sequence(vec![
        Scripted::truncated(r#"BEGIN_JSON {"synthesis": "Entities are"#),
        Scripted::truncated(r#"BEGIN_JSON {"synthesis": "Ent"#),
        Scripted::json(ENRICHMENT),
    ]));
    let facade = facade(Arc::clone(&backend) as Arc<dyn LlmBackend>, 3);

    let generation = facade
        .call(&enrichment_request(2048), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(generation.attempts, 3);
    assert!(generation.final_budget < 2048);
    let budgets = backend.requested_budgets();
    assert_eq!(budgets, vec![2048, 1024, 512]);
    assert!(budgets.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(generation.response.data["synthesis"], "Entities map to aggregates.");
    assert_eq!(facade.calls_made(), 3);
}

#[tokio::test(start_paused = true)]
async fn provider_that_always_times_out_exhausts_retries() {
    let backend = Arc::new(ScriptedBackend::always(Scripted::Hang));
    let facade = facade(Arc::clone(&backend) as Arc<dyn LlmBackend>, 3);

    let err = facade
        .call(&enrichment_request(1024), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        GenerationError::RetryExhausted {
            attempts,
            last_error,
            history,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.to_string().contains("Timeout"));
            assert_eq!(history.len(), 3);
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    assert_eq!(backend.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_required_field_is_not_retried() {
    let backend = Arc::new(ScriptedBackend::always(Scripted::json(
        r#"BEGIN_JSON {"synthesis": "no related chapters here"} END_JSON"#,
    )));
    let facade = facade(Arc::clone(&backend) as Arc<dyn LlmBackend>, 3);

    let err = facade
        .call(&enrichment_request(1024), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        GenerationError::Response(ResponseError::Validation(ValidationError::MissingFields {
            missing,
        })) => assert_eq!(missing, vec!["related_chapters".to_string()]),
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn one_exhausted_target_of_five_leaves_a_partial_chapter() {
    let analysis = {
        let targets: Vec<String> = (1..=5)
            .map(|i| {
                format!(
                    r#"{{"id": "t{i}", "concept": "concept {i}", "excerpt": "passage {i}", "companion_sections": ["ddd-5"]}}"#
                )
            })
            .collect();
        format!(
            "BEGIN_JSON {{\"summary\": \"s\", \"key_concepts\": [], \"related_chapters\": [], \"targets\": [{}]}} END_JSON",
            targets.join(",")
        )
    };
    let backend = Arc::new(ScriptedBackend::from_fn(move |inv: &LlmInvocation, _| {
        match (inv.phase, inv.target_id.as_deref()) {
            (Phase::Analyze, _) => Scripted::json(analysis.clone()),
            (Phase::Enhance, Some("t4")) => Scripted::Fail(LlmError::ProviderQuota("429".into())),
            (Phase::Enhance, _) => Scripted::json(ENRICHMENT),
        }
    }));

    let outcome = Orchestrator::new(
        facade(Arc::clone(&backend) as Arc<dyn LlmBackend>, 3),
        OrchestratorSettings::default(),
    )
    .run(&domain_modeling(), &CancellationToken::new())
    .await;

    let chapter = outcome.chapters[0].as_ref().unwrap();
    assert_eq!(chapter.enrichments.len(), 4);
    assert_eq!(chapter.omissions.len(), 1);
    assert_eq!(chapter.omissions[0].target_id, "t4");
    assert_eq!(chapter.status(), ChapterStatus::Partial);
    assert_eq!(outcome.report.failed_targets.len(), 1);
    assert_eq!(outcome.report.failed_targets[0].target_id, "t4");
    assert_eq!(outcome.exit_code(), ExitCode::PARTIAL_SUCCESS);
    // 1 analysis, 4 enrichments, 3 attempts for t4.
    assert_eq!(backend.call_count(), 8);
}
