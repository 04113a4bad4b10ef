use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use prism_catalog::{
    Candidate, CandidateError, CandidateQuery, CatalogHandle, CatalogSnapshot, ClientKey,
    ResolvedModel, User, build_candidates, promote_affinity, resolve_model_name,
};
use prism_codec::{ErrorKind, InternalError, StreamConverter, stream_media_type};
use prism_common::{ApiFormat, is_passthrough, new_request_id};
use prism_coord::{
    AffinityKey, AffinityStore, CoordinationStore, ResolveCache, RpmAdmission, RpmGuard,
    RpmGuardConfig,
};
use prism_protocol::JsonValue;
use prism_storage::{CandidateDraft, CandidateStatus, QuotaOutcome, Storage};

use crate::classify::{FailureAction, classify_failure};
use crate::error::{ClientFacingError, GatewayError};
use crate::headers::{build_upstream_headers, build_upstream_url, rewrite_model_in_body};
use crate::health::HealthMonitor;
use crate::stream::{
    StreamOutcome, StreamProcessorConfig, prefetch_embedded_error, spawn_stream_forwarder,
};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest};
use crate::usage::{UsageContext, record_usage};

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: Option<Arc<User>>,
    pub client_key: Arc<ClientKey>,
}

/// One parsed client request, dialect already identified by the router.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub format: ApiFormat,
    pub model: String,
    pub stream: bool,
    pub body: JsonValue,
}

#[derive(Debug)]
pub enum ReplyBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct DispatchReply {
    pub status: u16,
    pub content_type: &'static str,
    pub request_id: String,
    pub body: ReplyBody,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Hard ceiling on attempts regardless of policy.
    pub max_attempts: usize,
    pub resolve_cache_ttl: Duration,
    pub stream: StreamProcessorConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            resolve_cache_ttl: Duration::from_secs(300),
            stream: StreamProcessorConfig::default(),
        }
    }
}

/// The dispatch loop: enumerate candidates, admit through the RPM guard,
/// execute, classify failures, and fail over until a candidate succeeds
/// or the list runs dry.
pub struct Dispatcher {
    catalog: CatalogHandle,
    rpm: RpmGuard,
    affinity: AffinityStore,
    resolve_cache: ResolveCache<dyn CoordinationStore>,
    health: Arc<HealthMonitor>,
    storage: Arc<dyn Storage>,
    client: Arc<dyn UpstreamClient>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        catalog: CatalogHandle,
        coord: Arc<dyn CoordinationStore>,
        health: Arc<HealthMonitor>,
        storage: Arc<dyn Storage>,
        client: Arc<dyn UpstreamClient>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            catalog,
            rpm: RpmGuard::new(Arc::clone(&coord), RpmGuardConfig::default()),
            affinity: AffinityStore::new(Arc::clone(&coord)),
            resolve_cache: ResolveCache::new(coord, config.resolve_cache_ttl),
            health,
            storage,
            client,
            config,
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn affinity(&self) -> &AffinityStore {
        &self.affinity
    }

    pub async fn dispatch(
        &self,
        auth: AuthContext,
        request: ClientRequest,
    ) -> Result<DispatchReply, ClientFacingError> {
        let request_id = new_request_id();
        let snapshot = self.catalog.load();

        let Some(resolved) = self.resolve(&snapshot, &request.model).await else {
            tracing::info!(request_id, model = request.model, "model not found");
            let error = GatewayError::ClientRequest {
                status: 400,
                error: InternalError::new(
                    ErrorKind::InvalidRequest,
                    format!("model not supported: {}", request.model),
                ),
            };
            return Err(ClientFacingError::render(
                &error,
                request.format,
                None,
                &request_id,
            ));
        };

        let query = CandidateQuery {
            user: auth.user.as_deref(),
            client_key: &auth.client_key,
            client_format: request.format,
            model_name: &request.model,
            resolved: &resolved,
            is_stream: request.stream,
        };
        let health = Arc::clone(&self.health);
        let mut candidates =
            match build_candidates(&snapshot, &query, &|key_id, format| {
                health.is_excluded(key_id, format)
            }) {
                Ok(candidates) => candidates,
                Err(err) => {
                    tracing::info!(request_id, %err, "no candidates");
                    let (status, kind) = match err {
                        CandidateError::ForbiddenByPolicy(_) => (403, ErrorKind::PermissionDenied),
                        _ => (400, ErrorKind::InvalidRequest),
                    };
                    let error = GatewayError::ClientRequest {
                        status,
                        error: InternalError::new(kind, err.to_string()),
                    };
                    return Err(ClientFacingError::render(
                        &error,
                        request.format,
                        None,
                        &request_id,
                    ));
                }
            };

        let affinity_key = AffinityKey {
            client_api_key_id: auth.client_key.id,
            target_format: request.format,
            global_model_id: resolved.global_model_id,
        };
        if let Some(record) = self.affinity.get(&affinity_key).await
            && promote_affinity(&mut candidates, record.target())
        {
            tracing::debug!(request_id, key_id = record.key_id, "affinity candidate first");
        }

        let budget = candidates
            .len()
            .min(snapshot.policy.max_attempts.max(1))
            .min(self.config.max_attempts);
        let mut last_error: Option<GatewayError> = None;

        for (index, candidate) in candidates.iter().take(budget).enumerate() {
            let key = &candidate.key;
            let endpoint_format = candidate.endpoint.api_format;
            let adaptive = key.rpm_limit.is_none();
            let effective_limit = self.rpm.effective_limit(
                key.rpm_limit,
                self.health.learned_rpm(key.id).or(key.learned_rpm_limit),
            );

            let admission = match self
                .rpm
                .admit(key.id, effective_limit, candidate.is_cached)
                .await
            {
                Ok(admission) => admission,
                Err(err) => {
                    last_error = Some(GatewayError::internal(err));
                    continue;
                }
            };
            if !admission.admitted {
                tracing::debug!(
                    request_id,
                    key = %prism_common::mask_key_id(key.id),
                    observed = admission.observed,
                    limit = admission.limit,
                    "rpm guard rejected attempt",
                );
                last_error = Some(GatewayError::ConcurrencyLimit {
                    observed: admission.observed,
                    limit: admission.limit,
                });
                continue;
            }

            self.insert_candidate_row(&request_id, index, candidate, &request)
                .await;
            let attempt_started = Instant::now();

            match self
                .execute_attempt(
                    &auth,
                    &request,
                    &request_id,
                    &snapshot,
                    &resolved,
                    candidate,
                    index as i32,
                    admission,
                    attempt_started,
                )
                .await
            {
                Ok(reply) => {
                    self.health.record_success(key.id, endpoint_format);
                    if adaptive {
                        self.health
                            .note_success_at(key.id, admission.observed + 1, effective_limit);
                    }
                    let ttl_minutes = key
                        .cache_ttl_minutes
                        .unwrap_or(snapshot.policy.default_affinity_ttl_minutes);
                    let ttl = Duration::from_secs(u64::from(ttl_minutes) * 60);
                    if let Err(err) = self
                        .affinity
                        .put(
                            &affinity_key,
                            (candidate.provider.id, candidate.endpoint.id, key.id),
                            ttl,
                        )
                        .await
                    {
                        tracing::warn!(request_id, %err, "affinity refresh failed");
                    }
                    return Ok(reply);
                }
                Err(error) => {
                    let status_code = attempt_status_code(&error);
                    self.finish_candidate_row(
                        &request_id,
                        index as i32,
                        CandidateStatus::Failed,
                        status_code,
                        Some(attempt_started.elapsed().as_millis() as i64),
                        Some(error_class(&error).to_string()),
                    )
                    .await;
                    tracing::warn!(
                        request_id,
                        attempt = index,
                        key = %prism_common::mask_key_id(key.id),
                        endpoint = candidate.endpoint.id,
                        status = ?status_code,
                        %error,
                        "attempt failed",
                    );

                    match classify_failure(&error, adaptive) {
                        FailureAction::Surface => {
                            return Err(ClientFacingError::render(
                                &error,
                                request.format,
                                Some(endpoint_format),
                                &request_id,
                            ));
                        }
                        FailureAction::RetryNext { health_penalty } => {
                            if health_penalty {
                                self.health.record_failure(key.id, endpoint_format, false);
                            }
                            self.drop_affinity_if_cached(candidate, &affinity_key).await;
                            last_error = Some(error);
                        }
                        FailureAction::OpenCircuit => {
                            self.health.record_failure(key.id, endpoint_format, true);
                            self.drop_affinity_if_cached(candidate, &affinity_key).await;
                            last_error = Some(error);
                        }
                        FailureAction::AdaptiveDownshift => {
                            self.health.note_rate_limited(key.id, effective_limit);
                            self.drop_affinity_if_cached(candidate, &affinity_key).await;
                            last_error = Some(error);
                        }
                    }
                }
            }
        }

        let error = GatewayError::NoCandidates {
            last: last_error.map(Box::new),
        };
        tracing::warn!(request_id, %error, "dispatch exhausted all candidates");
        Err(ClientFacingError::render(
            &error,
            request.format,
            None,
            &request_id,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_attempt(
        &self,
        auth: &AuthContext,
        request: &ClientRequest,
        request_id: &str,
        snapshot: &CatalogSnapshot,
        resolved: &ResolvedModel,
        candidate: &Candidate,
        candidate_index: i32,
        admission: RpmAdmission,
        attempt_started: Instant,
    ) -> Result<DispatchReply, GatewayError> {
        let endpoint = &candidate.endpoint;
        let binding = snapshot
            .provider_binding(candidate.provider.id, resolved.global_model_id)
            .ok_or_else(|| GatewayError::internal("model binding disappeared mid-dispatch"))?;
        let target_model = binding.provider_model_name.clone();

        let body = if candidate.needs_conversion {
            let src = prism_codec::normalizer(request.format.data_format());
            let mut internal = src.request_to_internal(&request.body)?;
            internal.model = target_model.clone();
            internal.stream = request.stream;
            let dst = prism_codec::normalizer(endpoint.api_format.data_format());
            let converted = dst.request_from_internal(&internal)?;
            Bytes::from(serde_json::to_vec(&converted).map_err(GatewayError::internal)?)
        } else {
            let rewritten = rewrite_model_in_body(&request.body, endpoint.api_format, &target_model);
            Bytes::from(serde_json::to_vec(&rewritten).map_err(GatewayError::internal)?)
        };

        let upstream_req = UpstreamRequest {
            method: "POST",
            url: build_upstream_url(endpoint, &target_model, request.stream),
            headers: build_upstream_headers(endpoint, &candidate.key),
            body: Some(body),
            timeout: Duration::from_secs(endpoint.timeout_secs.max(1)),
            is_stream: request.stream,
        };

        let response = self.client.send(upstream_req).await.map_err(|err| {
            GatewayError::UpstreamRetriable {
                status: None,
                message: err.to_string(),
                rate_limited: false,
                timeout: err.is_timeout(),
                body: None,
            }
        })?;

        if !(200..300).contains(&response.status) {
            let body = match response.body {
                UpstreamBody::Full(bytes) => bytes,
                UpstreamBody::Stream(_) => Bytes::new(),
            };
            return Err(GatewayError::from_upstream_status(response.status, body));
        }

        let usage_ctx = UsageContext {
            request_id: request_id.to_string(),
            user_id: auth.user.as_ref().map(|u| u.id),
            api_key_id: auth.client_key.id,
            standalone_key: auth.client_key.standalone,
            provider: Arc::clone(&candidate.provider),
            key: Arc::clone(&candidate.key),
            binding: Arc::clone(binding),
            global_model: Arc::clone(
                snapshot
                    .global_model(resolved.global_model_id)
                    .ok_or_else(|| GatewayError::internal("global model disappeared"))?,
            ),
            endpoint_id: endpoint.id,
            client_format: request.format,
            target_format: endpoint.api_format,
            is_stream: request.stream,
        };

        if request.stream {
            self.execute_stream(
                request,
                request_id,
                candidate,
                candidate_index,
                admission,
                attempt_started,
                usage_ctx,
                response.body,
            )
            .await
        } else {
            self.execute_sync(
                request,
                candidate,
                candidate_index,
                attempt_started,
                usage_ctx,
                response.body,
            )
            .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_stream(
        &self,
        request: &ClientRequest,
        request_id: &str,
        candidate: &Candidate,
        candidate_index: i32,
        _admission: RpmAdmission,
        attempt_started: Instant,
        usage_ctx: UsageContext,
        body: UpstreamBody,
    ) -> Result<DispatchReply, GatewayError> {
        let endpoint_format = candidate.endpoint.api_format;
        let mut upstream_rx = match body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Full(bytes) => {
                // Upstream answered without streaming; feed the one body
                // through the same pipeline.
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };

        let prefetched = prefetch_embedded_error(
            &mut upstream_rx,
            endpoint_format,
            self.config.stream.prefetch_events,
        )
        .await?;

        // Connection is established and clean: the attempt counts as
        // started for telemetry even though bytes are still flowing.
        self.finish_candidate_row(
            request_id,
            candidate_index,
            CandidateStatus::Streaming,
            Some(200),
            None,
            None,
        )
        .await;

        let converter = if is_passthrough(request.format, endpoint_format) {
            StreamConverter::passthrough(endpoint_format)
        } else {
            StreamConverter::converting(request.format, endpoint_format)
        };

        let (client_rx, outcome_rx) = spawn_stream_forwarder(
            self.config.stream.clone(),
            converter,
            prefetched,
            upstream_rx,
            attempt_started,
            request_id.to_string(),
        );
        self.spawn_stream_completion(outcome_rx, usage_ctx, candidate_index, attempt_started);

        Ok(DispatchReply {
            status: 200,
            content_type: stream_media_type(request.format),
            request_id: request_id.to_string(),
            body: ReplyBody::Stream(client_rx),
        })
    }

    async fn execute_sync(
        &self,
        request: &ClientRequest,
        candidate: &Candidate,
        candidate_index: i32,
        attempt_started: Instant,
        usage_ctx: UsageContext,
        body: UpstreamBody,
    ) -> Result<DispatchReply, GatewayError> {
        let endpoint_format = candidate.endpoint.api_format;
        let raw = match body {
            UpstreamBody::Full(bytes) => bytes,
            UpstreamBody::Stream(mut rx) => {
                let mut buf = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk);
                }
                Bytes::from(buf)
            }
        };

        let parsed: JsonValue =
            serde_json::from_slice(&raw).map_err(|err| GatewayError::UpstreamRetriable {
                status: Some(200),
                message: format!("upstream body is not json: {err}"),
                rate_limited: false,
                timeout: false,
                body: Some(raw.clone()),
            })?;

        let src = prism_codec::normalizer(endpoint_format.data_format());
        if src.is_error_response(&parsed) {
            let error = src
                .error_to_internal(&parsed, Some(200))
                .unwrap_or_else(|| {
                    InternalError::new(ErrorKind::ServerError, "embedded upstream error")
                });
            return Err(GatewayError::Embedded(error));
        }

        let passthrough = is_passthrough(request.format, endpoint_format);
        let (out_bytes, usage) = if passthrough {
            let usage = src
                .response_to_internal(&parsed)
                .ok()
                .and_then(|resp| resp.usage);
            // Byte-for-byte passthrough of the upstream body.
            (raw, usage)
        } else {
            let internal = src.response_to_internal(&parsed)?;
            let usage = internal.usage;
            let dst = prism_codec::normalizer(request.format.data_format());
            let converted = dst.response_from_internal(&internal)?;
            (
                Bytes::from(serde_json::to_vec(&converted).map_err(GatewayError::internal)?),
                usage,
            )
        };

        let usage = usage.unwrap_or_default();
        let latency = attempt_started.elapsed().as_millis() as i64;
        let outcome =
            record_usage(self.storage.as_ref(), &usage_ctx, &usage, 200, Some(latency)).await?;
        if outcome == QuotaOutcome::QuotaExceeded {
            self.finish_candidate_row(
                &usage_ctx.request_id,
                candidate_index,
                CandidateStatus::Failed,
                Some(429),
                Some(latency),
                Some("quota_exceeded".to_string()),
            )
            .await;
            return Err(GatewayError::ClientRequest {
                status: 429,
                error: InternalError::new(ErrorKind::RateLimit, "quota exceeded"),
            });
        }

        self.finish_candidate_row(
            &usage_ctx.request_id,
            candidate_index,
            CandidateStatus::Success,
            Some(200),
            Some(latency),
            None,
        )
        .await;

        Ok(DispatchReply {
            status: 200,
            content_type: "application/json",
            request_id: usage_ctx.request_id.clone(),
            body: ReplyBody::Full(out_bytes),
        })
    }

    fn spawn_stream_completion(
        &self,
        outcome_rx: oneshot::Receiver<StreamOutcome>,
        usage_ctx: UsageContext,
        candidate_index: i32,
        attempt_started: Instant,
    ) {
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            let Ok(outcome) = outcome_rx.await else {
                return;
            };
            let latency = attempt_started.elapsed().as_millis() as i64;
            let request_id = usage_ctx.request_id.clone();

            if outcome.status_code == 499 {
                // Disconnected mid-stream: telemetry only, no success row.
                if let Err(err) = storage
                    .update_candidate(
                        &request_id,
                        candidate_index,
                        CandidateStatus::Failed,
                        Some(499),
                        Some(latency),
                        outcome.error.clone(),
                    )
                    .await
                {
                    tracing::warn!(request_id, %err, "candidate telemetry update failed");
                }
                return;
            }

            let draft = usage_ctx.draft(
                &outcome.usage,
                outcome.status_code,
                Some(latency),
                outcome.error.clone(),
            );
            match storage.record_usage(&draft).await {
                Ok(QuotaOutcome::Recorded) => {}
                Ok(QuotaOutcome::QuotaExceeded) => {
                    // The stream already went out; the next request will be
                    // rejected by the pre-dispatch quota check.
                    tracing::warn!(request_id, "quota exceeded after streamed response");
                }
                Err(err) => {
                    tracing::error!(request_id, %err, "usage recording failed");
                }
            }
            if let Err(err) = storage
                .update_candidate(
                    &request_id,
                    candidate_index,
                    CandidateStatus::Success,
                    Some(i32::from(outcome.status_code)),
                    Some(latency),
                    None,
                )
                .await
            {
                tracing::warn!(request_id, %err, "candidate telemetry update failed");
            }
        });
    }

    async fn resolve(
        &self,
        snapshot: &CatalogSnapshot,
        model_name: &str,
    ) -> Option<ResolvedModel> {
        if let Some(cached) = self.resolve_cache.get(model_name).await {
            // Cached ids can go stale across catalog swaps.
            if snapshot.global_model(cached.global_model_id).is_some() {
                return Some(cached);
            }
        }
        let resolved = resolve_model_name(snapshot, model_name)?;
        self.resolve_cache.put(model_name, &resolved).await;
        Some(resolved)
    }

    async fn insert_candidate_row(
        &self,
        request_id: &str,
        index: usize,
        candidate: &Candidate,
        request: &ClientRequest,
    ) {
        let draft = CandidateDraft {
            request_id: request_id.to_string(),
            candidate_index: index as i32,
            provider_id: candidate.provider.id,
            endpoint_id: candidate.endpoint.id,
            key_id: candidate.key.id,
            client_format: request.format.as_str().to_string(),
            target_format: candidate.endpoint.api_format.as_str().to_string(),
            needs_conversion: candidate.needs_conversion,
            is_cached: candidate.is_cached,
            status: CandidateStatus::Started,
            status_code: None,
            latency_ms: None,
            error_class: None,
            started_at: time::OffsetDateTime::now_utc(),
            finished_at: None,
            extra_json: None,
        };
        if let Err(err) = self.storage.insert_candidate(&draft).await {
            tracing::warn!(request_id, %err, "candidate telemetry insert failed");
        }
    }

    async fn finish_candidate_row(
        &self,
        request_id: &str,
        candidate_index: i32,
        status: CandidateStatus,
        status_code: Option<i32>,
        latency_ms: Option<i64>,
        error_class: Option<String>,
    ) {
        if let Err(err) = self
            .storage
            .update_candidate(
                request_id,
                candidate_index,
                status,
                status_code,
                latency_ms,
                error_class,
            )
            .await
        {
            tracing::warn!(%err, "candidate telemetry update failed");
        }
    }

    async fn drop_affinity_if_cached(&self, candidate: &Candidate, key: &AffinityKey) {
        if !candidate.is_cached {
            return;
        }
        if let Err(err) = self.affinity.invalidate(key).await {
            tracing::warn!(%err, "affinity invalidation failed");
        }
    }
}

fn attempt_status_code(error: &GatewayError) -> Option<i32> {
    match error {
        GatewayError::UpstreamRetriable { status, .. } => status.map(i32::from),
        GatewayError::UpstreamAuth { status, .. }
        | GatewayError::UpstreamClient { status, .. } => Some(i32::from(*status)),
        GatewayError::ClientRequest { status, .. } => Some(i32::from(*status)),
        GatewayError::Embedded(error) => Some(i32::from(error.http_status())),
        _ => None,
    }
}

fn error_class(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::ClientRequest { .. } => "client_request",
        GatewayError::Conversion(_) => "conversion",
        GatewayError::ConcurrencyLimit { .. } => "concurrency_limit",
        GatewayError::UpstreamRetriable { timeout: true, .. } => "upstream_timeout",
        GatewayError::UpstreamRetriable { .. } => "upstream_retriable",
        GatewayError::UpstreamAuth { .. } => "upstream_auth",
        GatewayError::UpstreamClient { .. } => "upstream_client",
        GatewayError::Embedded(_) => "embedded_error",
        GatewayError::NoCandidates { .. } => "no_candidates",
        GatewayError::Internal(_) => "internal",
    }
}
