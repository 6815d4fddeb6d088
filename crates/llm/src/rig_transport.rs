use futures::StreamExt;
use rig::completion::{
    AssistantContent, CompletionModel, CompletionRequestBuilder, Message as RigMessage,
};
use rig::prelude::CompletionClient;
use rig::providers::{anthropic, azure, gemini, openai, perplexity};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::options::{ApiDialect, DEFAULT_MAX_TOKENS, ModelOptions};
use super::transport::{
    CompletionRequest, CompletionTransport, CompletionsFailedSnafu, HttpClientSnafu,
    MissingApiTokenSnafu, MissingCredentialsSnafu, MissingEndpointSnafu, MissingModelSnafu,
    PromptMessage, PromptRole, StreamEvent, StreamHandle, StreamWorker, TransportError,
    TransportResult, UnsupportedApiTypeSnafu, make_delta_stream,
};

pub const RIG_TRANSPORT_NAME: &str = "rig";

/// Streaming transport backed by rig-core provider clients, selected by `api_type`.
#[derive(Debug, Clone, Default)]
pub struct RigTransport;

impl RigTransport {
    pub fn new() -> Self {
        Self
    }

    fn validate(options: &ModelOptions) -> TransportResult<ApiDialect> {
        ensure!(
            !options.model.trim().is_empty(),
            MissingModelSnafu {
                stage: "rig-transport-validate-model",
            }
        );
        ensure!(
            !(options.api_token.is_empty() && options.endpoint.is_empty()),
            MissingCredentialsSnafu {
                stage: "rig-transport-validate-credentials",
            }
        );
        let dialect = options.dialect().context(UnsupportedApiTypeSnafu {
            stage: "rig-transport-validate-api-type",
            api_type: options.api_type.clone(),
        })?;
        ensure!(
            !(dialect.is_azure() && options.endpoint.is_empty()),
            MissingEndpointSnafu {
                stage: "rig-transport-validate-endpoint",
                api_type: dialect.as_str(),
            }
        );
        ensure!(
            !(dialect.requires_api_token() && options.api_token.is_empty()),
            MissingApiTokenSnafu {
                stage: "rig-transport-validate-api-token",
                api_type: dialect.as_str(),
            }
        );
        Ok(dialect)
    }

    fn openai_client(options: &ModelOptions) -> TransportResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(options.api_token.as_str());
        if !options.endpoint.is_empty() {
            builder = builder.base_url(options.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-openai-client",
        })
    }

    fn azure_client(dialect: ApiDialect, options: &ModelOptions) -> TransportResult<azure::Client> {
        let auth = match dialect {
            ApiDialect::AzureAd => azure::AzureOpenAIAuth::Token(options.api_token.clone()),
            _ => azure::AzureOpenAIAuth::ApiKey(options.api_token.clone()),
        };
        azure::Client::builder()
            .api_key(auth)
            .azure_endpoint(options.endpoint.clone())
            .api_version(options.azure_api_version())
            .build()
            .context(HttpClientSnafu {
                stage: "build-azure-client",
            })
    }

    fn anthropic_client(options: &ModelOptions) -> TransportResult<anthropic::Client> {
        let mut builder = anthropic::Client::builder().api_key(options.api_token.as_str());
        if !options.endpoint.is_empty() {
            builder = builder.base_url(options.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-anthropic-client",
        })
    }

    fn gemini_client(options: &ModelOptions) -> TransportResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(options.api_token.as_str());
        if !options.endpoint.is_empty() {
            builder = builder.base_url(options.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-gemini-client",
        })
    }

    fn perplexity_client(options: &ModelOptions) -> TransportResult<perplexity::Client> {
        let mut builder = perplexity::Client::builder().api_key(options.api_token.as_str());
        if !options.endpoint.is_empty() {
            builder = builder.base_url(options.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-perplexity-client",
        })
    }

    fn to_rig_message(message: &PromptMessage) -> Option<RigMessage> {
        match message.role {
            PromptRole::System => None,
            PromptRole::User => Some(RigMessage::user(message.content.clone())),
            PromptRole::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &CompletionRequest, options: &ModelOptions) -> Option<String> {
        if !options.capabilities.system_prompt {
            return None;
        }

        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system-role history entries are folded into it.
        for message in &request.history {
            if matches!(message.role, PromptRole::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    /// Anthropic rejects requests without a token limit.
    fn effective_max_tokens(dialect: ApiDialect, options: &ModelOptions) -> Option<u64> {
        match (dialect, options.max_tokens) {
            (ApiDialect::Anthropic, None) => Some(DEFAULT_MAX_TOKENS),
            (_, max_tokens) => max_tokens,
        }
    }

    fn request_builder<M>(
        model: &M,
        dialect: ApiDialect,
        options: &ModelOptions,
        request: &CompletionRequest,
    ) -> CompletionRequestBuilder<M>
    where
        M: CompletionModel,
    {
        let history = request
            .history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();
        let prompt = RigMessage::user(request.prompt.content.clone());

        tracing::debug!(
            model = %options.model,
            api_type = dialect.as_str(),
            history_len = history.len(),
            streaming = options.capabilities.streaming,
            "building rig completion request"
        );

        let mut builder = model.completion_request(prompt).messages(history);

        if let Some(preamble) = Self::merged_preamble(request, options) {
            builder = builder.preamble(preamble);
        }

        if let Some(max_tokens) = Self::effective_max_tokens(dialect, options) {
            builder = builder.max_tokens(max_tokens);
        }

        builder
    }

    async fn open_rig_stream<M>(
        model: &M,
        dialect: ApiDialect,
        options: &ModelOptions,
        request: &CompletionRequest,
    ) -> TransportResult<StreamingCompletionResponse<M::StreamingResponse>>
    where
        M: CompletionModel,
    {
        Self::request_builder(model, dialect, options, request)
            .stream()
            .await
            .context(CompletionsFailedSnafu {
                stage: "open-stream",
            })
    }

    /// One-shot completion for models that cannot stream; the text is joined from every choice.
    async fn complete_once<M>(
        model: &M,
        dialect: ApiDialect,
        options: &ModelOptions,
        request: &CompletionRequest,
    ) -> TransportResult<String>
    where
        M: CompletionModel,
    {
        let response = Self::request_builder(model, dialect, options, request)
            .send()
            .await
            .context(CompletionsFailedSnafu {
                stage: "complete-once",
            })?;

        Ok(response
            .choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<String>())
    }

    fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: TransportError) {
        let _ = event_tx.send(StreamEvent::Error(error.to_string()));
    }

    fn emit_timeout_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, options: &ModelOptions) {
        let timeout_ms = options.timeout_ms.unwrap_or_default();
        tracing::warn!(model = %options.model, timeout_ms, "completion stream timed out");
        let _ = event_tx.send(StreamEvent::Error(format!(
            "request timed out after {timeout_ms}ms"
        )));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEvent::Delta(text.text))
            }
            _ => None,
        }
    }

    async fn run_stream_worker<M>(
        model: M,
        dialect: ApiDialect,
        options: ModelOptions,
        request: CompletionRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) where
        M: CompletionModel + 'static,
    {
        let deadline = options.timeout().map(|timeout| Instant::now() + timeout);
        let deadline_timer = wait_for_deadline(deadline);
        tokio::pin!(deadline_timer);

        if !options.capabilities.streaming {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model = %options.model, "completion cancelled before it returned");
                }
                _ = &mut deadline_timer => {
                    Self::emit_timeout_event(&event_tx, &options);
                }
                completed = Self::complete_once(&model, dialect, &options, &request) => match completed {
                    Ok(text) => {
                        if !text.is_empty() {
                            let _ = event_tx.send(StreamEvent::Delta(text));
                        }
                        let _ = event_tx.send(StreamEvent::Done);
                    }
                    Err(error) => {
                        tracing::error!(
                            model = %options.model,
                            error = %error,
                            "completion request failed"
                        );
                        Self::emit_error_event(&event_tx, error);
                    }
                },
            }
            return;
        }

        let mut stream = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("completion stream cancelled before it opened");
                return;
            }
            _ = &mut deadline_timer => {
                Self::emit_timeout_event(&event_tx, &options);
                return;
            }
            opened = Self::open_rig_stream(&model, dialect, &options, &request) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        model = %options.model,
                        error = %error,
                        "failed to open completion stream"
                    );
                    Self::emit_error_event(&event_tx, error);
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(model = %options.model, "completion stream cancelled");
                    stream.cancel();
                    return;
                }
                _ = &mut deadline_timer => {
                    stream.cancel();
                    Self::emit_timeout_event(&event_tx, &options);
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(event) = Self::map_stream_item(item)
                                && event_tx.send(event).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model = %options.model,
                                error = %source,
                                "completion stream emitted an error chunk"
                            );
                            let error = TransportError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEvent::Done);
    }
}

impl CompletionTransport for RigTransport {
    fn name(&self) -> &str {
        RIG_TRANSPORT_NAME
    }

    fn open_stream(
        &self,
        request: CompletionRequest,
        options: &ModelOptions,
    ) -> TransportResult<StreamHandle> {
        let dialect = Self::validate(options)?;
        let options = options.clone();
        let (event_tx, stream, cancel_rx) = make_delta_stream();

        // Each arm names a different rig model type, so the worker is boxed per arm.
        let worker: StreamWorker = match dialect {
            ApiDialect::OpenAi => {
                // Chat completions, which local OpenAI-compatible servers also serve.
                let model = Self::openai_client(&options)?
                    .completion_model(options.model.clone())
                    .completions_api();
                Box::pin(Self::run_stream_worker(
                    model, dialect, options, request, event_tx, cancel_rx,
                ))
            }
            ApiDialect::Azure | ApiDialect::AzureAd | ApiDialect::CloudflareAzure => {
                let model = Self::azure_client(dialect, &options)?
                    .completion_model(options.azure_deployment());
                Box::pin(Self::run_stream_worker(
                    model, dialect, options, request, event_tx, cancel_rx,
                ))
            }
            ApiDialect::Anthropic => {
                let model = Self::anthropic_client(&options)?.completion_model(options.model.clone());
                Box::pin(Self::run_stream_worker(
                    model, dialect, options, request, event_tx, cancel_rx,
                ))
            }
            ApiDialect::Gemini => {
                let model = Self::gemini_client(&options)?.completion_model(options.model.clone());
                Box::pin(Self::run_stream_worker(
                    model, dialect, options, request, event_tx, cancel_rx,
                ))
            }
            ApiDialect::Perplexity => {
                let model = Self::perplexity_client(&options)?.completion_model(options.model.clone());
                Box::pin(Self::run_stream_worker(
                    model, dialect, options, request, event_tx, cancel_rx,
                ))
            }
        };

        Ok(StreamHandle { stream, worker })
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
