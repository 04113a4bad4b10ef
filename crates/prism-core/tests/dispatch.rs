use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use prism_catalog::{
    BillingType, CatalogHandle, CatalogSnapshot, ClientKey, Endpoint, FormatAcceptance,
    GatewayPolicy, GlobalModel, KeyAuthKind, ModelBinding, ModelCapabilities, PricingTable,
    Provider, ProviderKey,
};
use prism_common::{ApiFormat, header_get};
use prism_coord::MemoryStore;
use prism_core::{
    AuthContext, ClientRequest, DispatchConfig, Dispatcher, HealthMonitor, ReplyBody,
    UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse,
};
use prism_storage::{
    CandidateDraft, CandidateStatus, QuotaOutcome, Storage, StorageResult, UsageDraft,
};

#[derive(Debug, Clone)]
enum Scripted {
    Json(u16, serde_json::Value),
    Sse(u16, &'static str),
    Error(u16, serde_json::Value),
}

#[derive(Default)]
struct ScriptedClient {
    script: Mutex<Vec<Scripted>>,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedClient {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.seen.lock().unwrap().push(req.clone());
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        let next = next.expect("scripted client ran out of responses");
        let response = match next {
            Scripted::Json(status, body) | Scripted::Error(status, body) => UpstreamResponse {
                status,
                headers: Vec::new(),
                body: UpstreamBody::Full(Bytes::from(serde_json::to_vec(&body).unwrap())),
            },
            Scripted::Sse(status, body) => {
                let (tx, rx) = mpsc::channel(32);
                let bytes = body.as_bytes().to_vec();
                tokio::spawn(async move {
                    for chunk in bytes.chunks(24) {
                        if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                            return;
                        }
                    }
                });
                UpstreamResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Stream(rx),
                }
            }
        };
        Ok(response)
    }
}

#[derive(Default)]
struct RecordingStorage {
    usage: Mutex<Vec<UsageDraft>>,
    candidates: Mutex<Vec<CandidateDraft>>,
    quota_exceeded: Mutex<bool>,
}

impl RecordingStorage {
    fn usage_rows(&self) -> Vec<UsageDraft> {
        self.usage.lock().unwrap().clone()
    }

    fn set_quota_exceeded(&self) {
        *self.quota_exceeded.lock().unwrap() = true;
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn record_usage(&self, draft: &UsageDraft) -> StorageResult<QuotaOutcome> {
        if *self.quota_exceeded.lock().unwrap() {
            return Ok(QuotaOutcome::QuotaExceeded);
        }
        self.usage.lock().unwrap().push(draft.clone());
        Ok(QuotaOutcome::Recorded)
    }

    async fn insert_candidate(&self, draft: &CandidateDraft) -> StorageResult<()> {
        self.candidates.lock().unwrap().push(draft.clone());
        Ok(())
    }

    async fn update_candidate(
        &self,
        _request_id: &str,
        _candidate_index: i32,
        _status: CandidateStatus,
        _status_code: Option<i32>,
        _latency_ms: Option<i64>,
        _error_class: Option<String>,
    ) -> StorageResult<()> {
        Ok(())
    }

    async fn cleanup(
        &self,
        _policy: &prism_storage::RetentionPolicy,
    ) -> StorageResult<(u64, u64)> {
        Ok((0, 0))
    }
}

fn provider(id: i64, priority: i32) -> Arc<Provider> {
    Arc::new(Provider {
        id,
        name: format!("provider-{id}"),
        priority,
        billing_type: BillingType::PayAsYouGo,
        monthly_quota_usd: None,
        quota_reset_day: None,
        monthly_used_usd: 0.0,
        enabled: true,
    })
}

fn endpoint(id: i64, provider_id: i64, format: ApiFormat, base: &str) -> Arc<Endpoint> {
    Arc::new(Endpoint {
        id,
        provider_id,
        api_format: format,
        base_url: base.to_string(),
        custom_path: None,
        static_headers: Vec::new(),
        header_rules: Vec::new(),
        timeout_secs: 30,
        max_retries: 1,
        format_acceptance: Some(FormatAcceptance {
            enabled: true,
            accept_formats: Vec::new(),
            reject_formats: Vec::new(),
            stream_conversion: true,
        }),
        enabled: true,
    })
}

fn upstream_key(id: i64, provider_id: i64, format: ApiFormat) -> Arc<ProviderKey> {
    Arc::new(ProviderKey {
        id,
        provider_id,
        secret: format!("sk-upstream-{id}"),
        auth_kind: KeyAuthKind::ApiKey,
        api_formats: vec![format],
        internal_priority: 0,
        global_priority: None,
        rpm_limit: Some(1000),
        learned_rpm_limit: None,
        cache_ttl_minutes: Some(60),
        rate_multiplier: None,
        allowed_models: None,
        enabled: true,
    })
}

fn binding(provider_id: i64, name: &str) -> Arc<ModelBinding> {
    Arc::new(ModelBinding {
        id: provider_id,
        provider_id,
        global_model_id: 1,
        provider_model_name: name.to_string(),
        aliases: Vec::new(),
        pricing: None,
        billing_template: None,
        enabled: true,
    })
}

fn global_model() -> Arc<GlobalModel> {
    Arc::new(GlobalModel {
        id: 1,
        name: "claude-sonnet-4-5".to_string(),
        display_name: "Claude Sonnet 4.5".to_string(),
        capabilities: ModelCapabilities {
            streaming: true,
            ..ModelCapabilities::default()
        },
        model_aliases: Vec::new(),
        pricing: Some(PricingTable {
            input_per_million: 1.0,
            output_per_million: 1.0,
            cache_read_per_million: 0.1,
            cache_creation_per_million: 1.25,
            per_request: None,
            tiers: None,
        }),
        enabled: true,
    })
}

fn auth() -> AuthContext {
    AuthContext {
        user: None,
        client_key: Arc::new(ClientKey {
            id: 1,
            user_id: None,
            key_hash: "hash".to_string(),
            standalone: false,
            balance_usd: None,
            balance_used_usd: 0.0,
            allowed_providers: None,
            allowed_api_formats: None,
            allowed_models: None,
            enabled: true,
        }),
    }
}

fn claude_request(stream: bool) -> ClientRequest {
    ClientRequest {
        format: ApiFormat::Claude,
        model: "claude-sonnet-4-5".to_string(),
        stream,
        body: json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 256,
            "stream": stream,
            "messages": [{ "role": "user", "content": "hi" }]
        }),
    }
}

fn dispatcher(
    snapshot: CatalogSnapshot,
    client: Arc<ScriptedClient>,
    storage: Arc<RecordingStorage>,
) -> Dispatcher {
    Dispatcher::new(
        CatalogHandle::new(snapshot),
        Arc::new(MemoryStore::new()),
        Arc::new(HealthMonitor::default()),
        storage,
        client,
        DispatchConfig::default(),
    )
}

async fn collect_stream(body: ReplyBody) -> Vec<u8> {
    match body {
        ReplyBody::Full(bytes) => bytes.to_vec(),
        ReplyBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        }
    }
}

async fn wait_for_usage(storage: &RecordingStorage, count: usize) {
    for _ in 0..100 {
        if storage.usage_rows().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "usage rows never reached {count}, have {}",
        storage.usage_rows().len()
    );
}

const CLAUDE_STREAM: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",",
    "\"role\":\"assistant\",\"model\":\"claude-sonnet-4-5\",\"content\":[],",
    "\"usage\":{\"input_tokens\":3,\"output_tokens\":0}}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},",
    "\"usage\":{\"input_tokens\":3,\"output_tokens\":7}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

fn single_claude_snapshot() -> CatalogSnapshot {
    CatalogSnapshot {
        global_models: vec![global_model()],
        providers: vec![provider(1, 1)],
        endpoints: vec![endpoint(10, 1, ApiFormat::Claude, "https://anthropic-main.example")],
        keys: vec![upstream_key(100, 1, ApiFormat::Claude)],
        bindings: vec![binding(1, "claude-sonnet-4-5")],
        policy: GatewayPolicy::default(),
        ..CatalogSnapshot::default()
    }
}

#[tokio::test]
async fn passthrough_streaming_forwards_bytes_and_meters_usage() {
    let client = ScriptedClient::new(vec![Scripted::Sse(200, CLAUDE_STREAM)]);
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(single_claude_snapshot(), Arc::clone(&client), Arc::clone(&storage));

    let reply = dispatcher
        .dispatch(auth(), claude_request(true))
        .await
        .expect("dispatch should succeed");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.content_type, "text/event-stream");

    let body = collect_stream(reply.body).await;
    assert_eq!(body, CLAUDE_STREAM.as_bytes(), "passthrough must be byte-exact");

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].url,
        "https://anthropic-main.example/v1/messages"
    );
    assert_eq!(
        header_get(&requests[0].headers, "x-api-key"),
        Some("sk-upstream-100")
    );
    assert_eq!(
        header_get(&requests[0].headers, "anthropic-version"),
        Some("2023-06-01")
    );

    wait_for_usage(&storage, 1).await;
    let rows = storage.usage_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].input_tokens, 3);
    assert_eq!(rows[0].output_tokens, 7);
    assert_eq!(rows[0].status_code, 200);
    assert!(rows[0].is_stream);
    let expected_cost = (3.0 + 7.0) / 1_000_000.0;
    assert!((rows[0].cost_usd - expected_cost).abs() < 1e-12);
}

const OPENAI_STREAM: &str = concat!(
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":0,",
    "\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"hi\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":0,",
    "\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":0,",
    "\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":7,\"total_tokens\":10}}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn conversion_streaming_rewrites_request_and_emits_claude_events() {
    let snapshot = CatalogSnapshot {
        global_models: vec![global_model()],
        providers: vec![provider(2, 1)],
        endpoints: vec![endpoint(20, 2, ApiFormat::OpenAi, "https://provider-b.example")],
        keys: vec![upstream_key(200, 2, ApiFormat::OpenAi)],
        bindings: vec![binding(2, "gpt-4o")],
        policy: GatewayPolicy::default(),
        ..CatalogSnapshot::default()
    };
    let client = ScriptedClient::new(vec![Scripted::Sse(200, OPENAI_STREAM)]);
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(snapshot, Arc::clone(&client), Arc::clone(&storage));

    let reply = dispatcher
        .dispatch(auth(), claude_request(true))
        .await
        .expect("dispatch should succeed");

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].url,
        "https://provider-b.example/v1/chat/completions"
    );
    let sent: serde_json::Value =
        serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["model"], "gpt-4o");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["messages"][0]["role"], "user");

    let body = String::from_utf8(collect_stream(reply.body).await).unwrap();
    let order = [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ];
    let mut pos = 0;
    for marker in order {
        let found = body[pos..]
            .find(marker)
            .unwrap_or_else(|| panic!("missing {marker} in:\n{body}"));
        pos += found;
    }
    assert!(body.contains("\"text\":\"hi\""));

    wait_for_usage(&storage, 1).await;
    let rows = storage.usage_rows();
    assert_eq!(rows[0].input_tokens, 3);
    assert_eq!(rows[0].output_tokens, 7);
    assert_eq!(rows[0].client_api_format, "CLAUDE");
    assert_eq!(rows[0].target_api_format, "OPENAI");
}

#[tokio::test]
async fn embedded_gemini_error_fails_over_before_forwarding() {
    let snapshot = CatalogSnapshot {
        global_models: vec![global_model()],
        providers: vec![provider(1, 1), provider(2, 2)],
        endpoints: vec![
            endpoint(10, 1, ApiFormat::Gemini, "https://gemini.example"),
            endpoint(20, 2, ApiFormat::OpenAi, "https://openai.example"),
        ],
        keys: vec![
            upstream_key(100, 1, ApiFormat::Gemini),
            upstream_key(200, 2, ApiFormat::OpenAi),
        ],
        bindings: vec![binding(1, "gemini-2.0-flash"), binding(2, "gpt-4o")],
        policy: GatewayPolicy::default(),
        ..CatalogSnapshot::default()
    };
    // Gemini answers HTTP 200 whose body is an error envelope.
    let client = ScriptedClient::new(vec![
        Scripted::Json(
            200,
            json!({ "error": { "message": "quota exhausted", "status": "RESOURCE_EXHAUSTED" } }),
        ),
        Scripted::Json(
            200,
            json!({
                "id": "chatcmpl-2", "object": "chat.completion", "created": 0, "model": "gpt-4o",
                "choices": [{ "index": 0, "finish_reason": "stop",
                               "message": { "role": "assistant", "content": "ok" } }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 }
            }),
        ),
    ]);
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(snapshot, Arc::clone(&client), Arc::clone(&storage));

    let reply = dispatcher
        .dispatch(auth(), claude_request(false))
        .await
        .expect("second candidate should succeed");
    assert_eq!(reply.status, 200);
    let body: serde_json::Value =
        serde_json::from_slice(&collect_stream(reply.body).await).unwrap();
    // Client speaks Claude; the OpenAI success is converted.
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "ok");

    assert_eq!(client.requests().len(), 2);
    let rows = storage.usage_rows();
    assert_eq!(rows.len(), 1, "only the successful attempt is metered");
    assert_eq!(rows[0].target_api_format, "OPENAI");
}

#[tokio::test]
async fn upstream_auth_failure_retries_next_candidate() {
    let snapshot = CatalogSnapshot {
        global_models: vec![global_model()],
        providers: vec![provider(1, 1), provider(2, 2)],
        endpoints: vec![
            endpoint(10, 1, ApiFormat::Claude, "https://primary.example"),
            endpoint(20, 2, ApiFormat::Claude, "https://secondary.example"),
        ],
        keys: vec![
            upstream_key(100, 1, ApiFormat::Claude),
            upstream_key(200, 2, ApiFormat::Claude),
        ],
        bindings: vec![binding(1, "claude-sonnet-4-5"), binding(2, "claude-sonnet-4-5")],
        policy: GatewayPolicy::default(),
        ..CatalogSnapshot::default()
    };
    let client = ScriptedClient::new(vec![
        Scripted::Error(
            401,
            json!({ "type": "error", "error": { "type": "authentication_error", "message": "bad key" } }),
        ),
        Scripted::Json(
            200,
            json!({
                "id": "msg_2", "type": "message", "role": "assistant",
                "model": "claude-sonnet-4-5",
                "content": [{ "type": "text", "text": "ok" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 3, "output_tokens": 1 }
            }),
        ),
    ]);
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(snapshot, Arc::clone(&client), Arc::clone(&storage));

    let reply = dispatcher
        .dispatch(auth(), claude_request(false))
        .await
        .expect("failover should succeed");
    assert_eq!(reply.status, 200);
    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].url.starts_with("https://primary.example"));
    assert!(requests[1].url.starts_with("https://secondary.example"));
}

#[tokio::test]
async fn quota_exceeded_after_response_surfaces_429() {
    let client = ScriptedClient::new(vec![Scripted::Json(
        200,
        json!({
            "id": "msg_3", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [{ "type": "text", "text": "ok" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 100, "output_tokens": 100 }
        }),
    )]);
    let storage = Arc::new(RecordingStorage::default());
    storage.set_quota_exceeded();
    let dispatcher = dispatcher(single_claude_snapshot(), client, Arc::clone(&storage));

    let error = dispatcher
        .dispatch(auth(), claude_request(false))
        .await
        .expect_err("quota rejection must surface");
    assert_eq!(error.status, 429);
    assert_eq!(error.body["type"], "error");
    assert_eq!(error.body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn unknown_model_returns_client_error() {
    let client = ScriptedClient::new(Vec::new());
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(single_claude_snapshot(), client, storage);

    let mut request = claude_request(false);
    request.model = "nonexistent-model".to_string();
    request.body["model"] = json!("nonexistent-model");

    let error = dispatcher
        .dispatch(auth(), request)
        .await
        .expect_err("unknown model must fail");
    assert_eq!(error.status, 400);
}

#[tokio::test]
async fn exhausted_candidates_return_bad_gateway() {
    let client = ScriptedClient::new(vec![Scripted::Error(
        500,
        json!({ "type": "error", "error": { "type": "api_error", "message": "boom" } }),
    )]);
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(single_claude_snapshot(), client, storage);

    let error = dispatcher
        .dispatch(auth(), claude_request(false))
        .await
        .expect_err("single failing candidate must exhaust");
    assert_eq!(error.status, 502);
}

#[tokio::test]
async fn successful_dispatch_creates_sticky_affinity() {
    let snapshot = CatalogSnapshot {
        global_models: vec![global_model()],
        providers: vec![provider(1, 1), provider(2, 2)],
        endpoints: vec![
            endpoint(10, 1, ApiFormat::Claude, "https://primary.example"),
            endpoint(20, 2, ApiFormat::Claude, "https://secondary.example"),
        ],
        keys: vec![
            upstream_key(100, 1, ApiFormat::Claude),
            upstream_key(200, 2, ApiFormat::Claude),
        ],
        bindings: vec![binding(1, "claude-sonnet-4-5"), binding(2, "claude-sonnet-4-5")],
        policy: GatewayPolicy::default(),
        ..CatalogSnapshot::default()
    };
    let ok_body = json!({
        "id": "msg_4", "type": "message", "role": "assistant",
        "model": "claude-sonnet-4-5",
        "content": [{ "type": "text", "text": "ok" }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 1, "output_tokens": 1 }
    });
    let client = ScriptedClient::new(vec![
        Scripted::Json(200, ok_body.clone()),
        Scripted::Json(200, ok_body),
    ]);
    let storage = Arc::new(RecordingStorage::default());
    let dispatcher = dispatcher(snapshot, Arc::clone(&client), storage);

    dispatcher
        .dispatch(auth(), claude_request(false))
        .await
        .expect("first dispatch");

    let affinity_key = prism_coord::AffinityKey {
        client_api_key_id: 1,
        target_format: ApiFormat::Claude,
        global_model_id: 1,
    };
    let record = dispatcher
        .affinity()
        .get(&affinity_key)
        .await
        .expect("affinity stored after success");
    assert_eq!(record.target(), (1, 10, 100));

    // The next request from the same client sticks to the same triple.
    dispatcher
        .dispatch(auth(), claude_request(false))
        .await
        .expect("second dispatch");
    let requests = client.requests();
    assert!(requests[1].url.starts_with("https://primary.example"));
    let record = dispatcher.affinity().get(&affinity_key).await.unwrap();
    assert_eq!(record.request_count, 2);
}
