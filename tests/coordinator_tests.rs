mod common;

use chrono::Duration;
use idempotency_receiver::error::AppError;
use idempotency_receiver::idempotency::{
    CapturedResponse, ContentCodec, ContentRegistry, Coordinator, Execution, Fingerprinter,
    HandlerFailure, Lookup, OperationPolicy, ReplayBody, ReplayDecision, RequestDescriptor,
};
use idempotency_receiver::repositories::{Repository, ResilientRepository};
use idempotency_receiver::resilience::{CircuitBreakerConfig, CircuitBreakerState, RetryPolicy};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn create_book_policy() -> OperationPolicy {
    OperationPolicy::new("create_book").with_registerable("books::ResourceManagement")
}

fn created(id: u32) -> CapturedResponse {
    CapturedResponse::json(201, &json!({ "id": id, "title": "Dune" }))
        .unwrap()
        .with_header("Location", format!("/books/{}", id))
}

#[tokio::test]
async fn test_books_scenario_replays_201() {
    let (coordinator, repository, _) = common::memory_coordinator();
    let policy = create_book_policy();
    let request = common::books_request("b-1", r#"{"title":"Dune"}"#);
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let first = coordinator
        .execute(&request, &policy, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(created(1))
        })
        .await
        .unwrap();
    assert_eq!(first, Execution::Executed(created(1)));

    let second = coordinator
        .execute(&request, &policy, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(created(2))
        })
        .await
        .unwrap();

    match second {
        Execution::Replayed(replayed) => {
            assert_eq!(replayed.status, 201);
            assert_eq!(replayed.headers.get("Location"), Some("/books/1"));
            assert_eq!(replayed.body, ReplayBody::Json(json!({ "id": 1, "title": "Dune" })));
        }
        other => panic!("expected replay, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // begin + complete
    assert_eq!(repository.puts(), 2);

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.requests, 2);
    assert_eq!(snapshot.first_presentations, 1);
    assert_eq!(snapshot.replays, 1);
}

#[tokio::test]
async fn test_different_body_is_a_new_request() {
    let (coordinator, _, _) = common::memory_coordinator();
    let policy = create_book_policy();
    let calls = AtomicU32::new(0);
    let calls = &calls;

    for body in [r#"{"title":"Dune"}"#, r#"{"title":"Emma"}"#] {
        let execution = coordinator
            .execute(&common::books_request("b-1", body), &policy, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(created(1))
            })
            .await
            .unwrap();
        assert!(execution.handler_ran());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_still_processing_reports_elapsed_duration() {
    let (coordinator, _, clock) = common::memory_coordinator();
    let request = common::books_request("b-2", r#"{"title":"Dune"}"#);
    let key = coordinator.fingerprinter().fingerprint(&request).unwrap();

    // First presentation has started but not finished.
    coordinator.begin(&key).await;
    clock.advance(Duration::milliseconds(1000));

    let execution = coordinator
        .execute(&request, &create_book_policy(), || async {
            Err::<CapturedResponse, _>(HandlerFailure::new("test::Unexpected", "handler ran"))
        })
        .await
        .unwrap();

    match execution {
        Execution::StillProcessing(pending) => {
            assert_eq!(pending.status(), http::StatusCode::ACCEPTED);
            assert_eq!(pending.header_name(), "Processing-Duration");
            assert_eq!(pending.header_value(), "1000");
        }
        other => panic!("expected still processing, got {:?}", other),
    }
    assert_eq!(coordinator.metrics().snapshot().still_processing, 1);
}

#[tokio::test]
async fn test_registerable_failure_is_replayed() {
    let (coordinator, _, _) = common::memory_coordinator();
    let policy = create_book_policy();
    let request = common::books_request("b-3", r#"{"title":"Dune"}"#);
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let handler = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<CapturedResponse, _>(HandlerFailure::new(
            "books::ResourceManagement::AlreadyExists",
            "a book titled 'Dune' already exists",
        ))
    };

    let first = coordinator.execute(&request, &policy, handler).await.unwrap();
    assert!(matches!(first, Execution::Failed(ref f) if f.descriptor.ends_with("AlreadyExists")));

    let second = coordinator.execute(&request, &policy, handler).await.unwrap();
    match second {
        Execution::ReplayedFailure(failure) => {
            assert_eq!(failure.kind(), "books::ResourceManagement::AlreadyExists");
            assert_eq!(failure.message, "a book titled 'Dune' already exists");
        }
        other => panic!("expected replayed failure, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.metrics().snapshot().registered_failures, 1);
}

#[tokio::test]
async fn test_non_registerable_failure_is_discarded() {
    let (coordinator, repository, _) = common::memory_coordinator();
    let policy = create_book_policy();
    let request = common::books_request("b-4", r#"{"title":"Dune"}"#);
    let key = coordinator.fingerprinter().fingerprint(&request).unwrap();

    let failed = coordinator
        .execute(&request, &policy, || async {
            Err::<CapturedResponse, _>(HandlerFailure::new("io::Timeout", "upstream timed out"))
        })
        .await
        .unwrap();
    assert!(matches!(failed, Execution::Failed(_)));
    assert_eq!(repository.deletes(), 1);
    assert!(repository.get(&key).await.unwrap().is_none());

    // The retry runs the handler again.
    let retried = coordinator
        .execute(&request, &policy, || async { Ok(created(4)) })
        .await
        .unwrap();
    assert_eq!(retried, Execution::Executed(created(4)));
}

#[tokio::test]
async fn test_repository_outage_degrades_to_unprotected_execution() {
    let backend = Arc::new(common::FlakyRepository::new());
    backend.set_down(true);
    let repository = Arc::new(ResilientRepository::new(
        backend.clone(),
        RetryPolicy::new(std::time::Duration::from_millis(1), 1),
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            delay: std::time::Duration::from_secs(60),
        },
    ));
    let coordinator = Coordinator::new(Fingerprinter::new(true), repository.clone());
    let policy = create_book_policy();
    let calls = AtomicU32::new(0);
    let calls = &calls;

    for attempt in 0..3u32 {
        let request = common::books_request(&format!("b-5-{}", attempt), "{}");
        let execution = coordinator
            .execute(&request, &policy, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(created(5))
            })
            .await
            .unwrap();
        assert_eq!(execution, Execution::Executed(created(5)));
    }

    // Each request ran its handler exactly once.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.metrics().snapshot().skips, 3);
    assert_eq!(repository.circuit_state().await, CircuitBreakerState::Open);
    // Two lookups reached the backend (two attempts each); the third was refused by the breaker.
    assert_eq!(backend.calls(), 4);
}

#[tokio::test]
async fn test_lookup_skip_on_failure() {
    let backend = Arc::new(common::FlakyRepository::new());
    backend.set_down(true);
    let coordinator = Coordinator::new(Fingerprinter::new(true), backend);
    assert_eq!(coordinator.lookup("anything").await, Lookup::Skip);
}

struct CsvCodec;

impl ContentCodec for CsvCodec {
    fn id(&self) -> &str {
        "csv"
    }

    fn unmarshal(&self, body: &[u8]) -> idempotency_receiver::error::Result<ReplayBody> {
        Ok(ReplayBody::Text(String::from_utf8_lossy(body).into_owned()))
    }
}

#[tokio::test]
async fn test_unregistered_codec_falls_through() {
    let (writer, repository, _) = common::memory_coordinator();
    let mut registry = ContentRegistry::with_defaults();
    registry.register(Arc::new(CsvCodec));
    let writer = writer.with_registry(registry);
    let reader = Coordinator::new(Fingerprinter::new(true), repository.clone());

    let request = common::books_request("b-6", "");
    let policy = OperationPolicy::new("export_books");
    let csv = || async {
        let mut response = CapturedResponse::text(200, "id,title\n1,Dune\n");
        response.content_descriptor = "text/csv;codec=csv;v=1".to_string();
        Ok(response)
    };

    writer.execute(&request, &policy, csv).await.unwrap();
    assert!(matches!(
        writer.execute(&request, &policy, csv).await.unwrap(),
        Execution::Replayed(_)
    ));

    // The reader cannot decode CSV, so it handles the request as a first presentation.
    let execution = reader.execute(&request, &policy, csv).await.unwrap();
    assert!(execution.handler_ran());
    assert_eq!(reader.metrics().snapshot().fallthroughs, 1);
}

#[tokio::test]
async fn test_record_state_is_monotonic() {
    let (coordinator, repository, _) = common::memory_coordinator();
    let policy = create_book_policy();

    let running = coordinator.begin("k-mono").await;
    let done = coordinator.complete(&running, created(7)).await;
    assert!(done.is_done());

    // A late failure for the same record cannot overwrite its outcome.
    let failure = HandlerFailure::new("books::ResourceManagement::Conflict", "late");
    assert!(coordinator.abort(&done, Some(&failure), &policy).await.is_none());
    let again = coordinator.complete(&done, created(8)).await;
    assert_eq!(again, done);

    let stored = repository.get("k-mono").await.unwrap().unwrap();
    assert_eq!(stored, done);
    assert!(matches!(
        coordinator.present_subsequent(&stored, coordinator.registry()),
        ReplayDecision::ReplayResponse(_)
    ));
}

#[tokio::test]
async fn test_repeated_headers_are_replayed_in_order() {
    let (coordinator, _, _) = common::memory_coordinator();
    let policy = OperationPolicy::new("login");
    let request = common::books_request("b-8", "");
    let response = || async {
        Ok(CapturedResponse::empty(204)
            .with_header("Set-Cookie", "a=1")
            .with_header("Set-Cookie", "b=2"))
    };

    coordinator.execute(&request, &policy, response).await.unwrap();
    match coordinator.execute(&request, &policy, response).await.unwrap() {
        Execution::Replayed(replayed) => {
            let cookies: Vec<_> = replayed.headers.get_all("set-cookie").collect();
            assert_eq!(cookies, vec!["a=1", "b=2"]);
            assert_eq!(replayed.body, ReplayBody::Empty);
        }
        other => panic!("expected replay, got {:?}", other),
    }
}

#[tokio::test]
async fn test_optional_key_header() {
    let (_, repository, _) = common::memory_coordinator();
    let coordinator = Coordinator::new(Fingerprinter::new(false), repository);
    let request = RequestDescriptor::new("acme.books", "POST", "/books");

    let execution = coordinator
        .execute(&request, &create_book_policy(), || async { Ok(created(9)) })
        .await
        .unwrap();
    assert!(execution.handler_ran());

    let strict = Coordinator::new(Fingerprinter::new(true), Arc::new(common::FlakyRepository::new()));
    let rejected = strict
        .execute(&request, &create_book_policy(), || async { Ok(created(9)) })
        .await;
    assert!(matches!(rejected, Err(AppError::MissingIdempotencyKey(_))));
}
