//! HTTP adapter behavior against a mock back-end: payload shape on the wire,
//! error mapping, timeouts, and the image pipeline end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use starmeter::artifact::{ArtifactRecord, ArtifactRef, ArtifactStore, PersistenceError};
use starmeter::backend::{
    BackendError, BackendRegistry, GenerationBackend, ImageBackend, SpeechBackend, VideoBackend,
};
use starmeter::notify::{
    AdminAlert, AdminNotifier, DeliveryChannel, DeliveryContent, DeliveryError, Receipt,
};
use starmeter::types::{ActorId, CanonicalInput, ChannelId, GenerationKind, JobRequest, Locale};
use starmeter::{BalanceLedger, JobResult, MemoryLedger, Orchestrator, PriceTableBuilder};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Route adapter logs through the test harness; `RUST_LOG` overrides.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("starmeter=debug")),
            )
            .with_test_writer()
            .init();
    });
}

#[tokio::test]
async fn image_backend_sends_bearer_auth_and_parses_urls() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "nova-image-2", "n": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "url": "https://cdn.example/a.png" },
                { "url": "https://cdn.example/b.png" },
            ]
        })))
        .mount(&server)
        .await;

    let backend = ImageBackend::new(format!("{}/v1/images", server.uri()), "test-key");
    let refs = backend
        .invoke(
            &reqwest::Client::new(),
            &CanonicalInput::new("nova-image-2", "a fox").units(2),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert_eq!(
        refs,
        vec![
            ArtifactRef::RemoteUrl("https://cdn.example/a.png".to_string()),
            ArtifactRef::RemoteUrl("https://cdn.example/b.png".to_string()),
        ]
    );
}

#[tokio::test]
async fn image_backend_maps_api_errors() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images"))
        .respond_with(ResponseTemplate::new(402).set_body_string("quota exhausted"))
        .mount(&server)
        .await;

    let backend = ImageBackend::new(format!("{}/v1/images", server.uri()), "test-key");
    let err = backend
        .invoke(
            &reqwest::Client::new(),
            &CanonicalInput::new("nova-image-2", "a fox"),
            TIMEOUT,
        )
        .await
        .unwrap_err();

    match err {
        BackendError::Api { status, message } => {
            assert_eq!(status, 402);
            assert!(message.contains("quota exhausted"));
        }
        other => panic!("expected Api error, got {other}"),
    }
}

#[tokio::test]
async fn slow_backend_times_out() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": [] }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let backend = ImageBackend::new(format!("{}/v1/images", server.uri()), "test-key");
    let err = backend
        .invoke(
            &reqwest::Client::new(),
            &CanonicalInput::new("nova-image-2", "a fox"),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BackendError::Timeout(_)));
}

#[tokio::test]
async fn video_backend_submits_then_polls_to_completion() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/renders"))
        .and(body_partial_json(json!({ "duration": 8 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "r-17" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/renders/r-17"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "completed",
            "video_url": "https://cdn.example/r-17.mp4",
        })))
        .mount(&server)
        .await;

    let backend = VideoBackend::new(format!("{}/v1/renders", server.uri()), "test-key")
        .poll_interval(Duration::from_millis(10));
    let refs = backend
        .invoke(
            &reqwest::Client::new(),
            &CanonicalInput::new("nova-video-1", "waves").duration_secs(8),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert_eq!(
        refs,
        vec![ArtifactRef::RemoteUrl("https://cdn.example/r-17.mp4".to_string())]
    );
}

#[tokio::test]
async fn video_backend_surfaces_render_failure() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/renders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "r-18" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/renders/r-18"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "error": "content policy",
        })))
        .mount(&server)
        .await;

    let backend = VideoBackend::new(format!("{}/v1/renders", server.uri()), "test-key")
        .poll_interval(Duration::from_millis(10));
    let err = backend
        .invoke(
            &reqwest::Client::new(),
            &CanonicalInput::new("nova-video-1", "waves").duration_secs(8),
            TIMEOUT,
        )
        .await
        .unwrap_err();

    match err {
        BackendError::Api { message, .. } => assert!(message.contains("content policy")),
        other => panic!("expected Api error, got {other}"),
    }
}

#[tokio::test]
async fn speech_backend_returns_inline_audio() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3fake-audio".to_vec()))
        .mount(&server)
        .await;

    let backend = SpeechBackend::new(format!("{}/v1/speech", server.uri()), "test-key");
    let refs = backend
        .invoke(
            &reqwest::Client::new(),
            &CanonicalInput::new("voice-hd", "hello there").voice("ember"),
            TIMEOUT,
        )
        .await
        .unwrap();

    match &refs[0] {
        ArtifactRef::Inline { bytes, media_type } => {
            assert_eq!(&bytes[..], b"ID3fake-audio");
            assert_eq!(media_type, "audio/mpeg");
        }
        other => panic!("expected inline audio, got {other:?}"),
    }
}

#[derive(Debug, Default)]
struct NullStore;

#[async_trait]
impl ArtifactStore for NullStore {
    async fn save(&self, _record: &ArtifactRecord) -> Result<String, PersistenceError> {
        Ok("record-1".to_string())
    }
}

#[derive(Debug, Default)]
struct NullDelivery;

#[async_trait]
impl DeliveryChannel for NullDelivery {
    async fn send(
        &self,
        _actor: ActorId,
        _content: DeliveryContent,
    ) -> Result<Receipt, DeliveryError> {
        Ok(Receipt { message_id: None })
    }
}

#[derive(Debug, Default)]
struct NullAdmin;

#[async_trait]
impl AdminNotifier for NullAdmin {
    async fn notify(&self, _channel: ChannelId, _alert: &AdminAlert) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[tokio::test]
async fn image_pipeline_stages_downloaded_artifact() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "url": format!("{}/cdn/out.png", server.uri()) }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/out.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNGfake".to_vec()))
        .mount(&server)
        .await;

    let actor = ActorId(42);
    let ledger = Arc::new(MemoryLedger::new());
    ledger.register_with_balance(actor, Locale::En, dec!(100));
    let staging = tempfile::tempdir().unwrap();

    let orchestrator = Orchestrator::builder()
        .ledger(ledger.clone())
        .price_table(
            PriceTableBuilder::new()
                .kind(GenerationKind::ImageGeneration, dec!(30))
                .build(),
        )
        .registry(BackendRegistry::new().register(Arc::new(ImageBackend::new(
            format!("{}/v1/images", server.uri()),
            "test-key",
        ))))
        .staging_dir(staging.path())
        .store(Arc::new(NullStore))
        .delivery(Arc::new(NullDelivery))
        .admin(Arc::new(NullAdmin), ChannelId(-1001))
        .build()
        .unwrap();

    let result = orchestrator
        .run_generation_job(JobRequest {
            actor,
            locale: Locale::En,
            channel: ChannelId(42),
            kind: GenerationKind::ImageGeneration,
            input: CanonicalInput::new("nova-image-2", "a fox"),
        })
        .await;

    let summary = match result {
        JobResult::Completed(summary) => summary,
        JobResult::Failed { error, .. } => panic!("expected success, got {error}"),
    };
    assert_eq!(summary.artifacts.len(), 1);
    let staged = std::fs::read(&summary.artifacts[0]).unwrap();
    assert_eq!(staged, b"\x89PNGfake");
    assert_eq!(ledger.balance(actor).await.unwrap().balance, dec!(70));
}
