//! LLM interaction: one request per page, one response file per page.
//!
//! The stage talks to a [`LanguageModel`], a small seam over a hosted chat
//! model. [`EdgequakeModel`] is the production implementation on top of an
//! `edgequake-llm` provider; tests substitute canned replies.
//!
//! All prompt text lives in [`crate::prompts`] and all reply cleanup in
//! [`crate::pipeline::postprocess`], so this module only deals with message
//! layout, timeouts, retries and persistence.
//!
//! ## Retry Strategy
//!
//! Retries are off by default (`max_retries = 0`): a failed call aborts the
//! run and the user starts a new one. When enabled, the wait before retry
//! `n` is `retry_backoff_ms * 2^(n-1)`.

use crate::config::WorkflowConfig;
use crate::error::Exam2SqlError;
use crate::layout::{write_json, WorkspaceLayout};
use crate::pipeline::encode::encode_file;
use crate::pipeline::merge::DiagramInfo;
use crate::pipeline::postprocess::records_from_reply;
use crate::prompts::{page_user_message, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Model used when a provider is named without a model.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// One chat request: a system prompt, a user message and optional images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    /// Image files attached to the user message, in order.
    pub images: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A hosted chat model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply, Exam2SqlError>;
}

/// The records extracted from one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    pub page: String,
    pub page_number: usize,
    /// The response file written for this page.
    pub path: PathBuf,
    pub records: Vec<Value>,
}

/// Send every page of `info` to the model, in order, and write
/// `<run_id>_page_<n>.json` after each reply.
///
/// The first failure aborts the stage. Files written for earlier pages are
/// left in place.
pub async fn process_pages(
    model: &dyn LanguageModel,
    info: &DiagramInfo,
    layout: &WorkspaceLayout,
    config: &WorkflowConfig,
) -> Result<Vec<PageResponse>, Exam2SqlError> {
    let system = config
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    let mut responses = Vec::with_capacity(info.pages.len());
    for page in &info.pages {
        let start = Instant::now();
        let request = ModelRequest {
            system: system.to_string(),
            user: page_user_message(page),
            images: if config.attach_page_images {
                vec![page.image.clone()]
            } else {
                Vec::new()
            },
        };

        let reply = model.complete(request).await?;
        let records = records_from_reply(&reply.content, page.page_number).map_err(|detail| {
            Exam2SqlError::InvalidLlmResponse {
                page: page.page.clone(),
                detail,
            }
        })?;

        let path = layout.response_for(&info.run_id, page.page_number);
        write_json(&path, &records)?;
        debug!(
            "Page {}: {} records, {} input tokens, {} output tokens, {:?}",
            page.page_number,
            records.len(),
            reply.input_tokens,
            reply.output_tokens,
            start.elapsed()
        );

        responses.push(PageResponse {
            page: page.page.clone(),
            page_number: page.page_number,
            path,
            records,
        });
    }

    info!(
        "LLM processed {} pages ({} records)",
        responses.len(),
        responses.iter().map(|r| r.records.len()).sum::<usize>()
    );
    Ok(responses)
}

// ── edgequake-llm backed model ───────────────────────────────────────────

/// [`LanguageModel`] on top of an `edgequake-llm` provider.
///
/// The provider is resolved on first use, so constructing the workflow never
/// needs an API key.
pub struct EdgequakeModel {
    configured: Option<Arc<dyn LLMProvider>>,
    provider_name: Option<String>,
    model: Option<String>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout_secs: u64,
    resolved: OnceCell<Arc<dyn LLMProvider>>,
}

impl EdgequakeModel {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            configured: config.provider.clone(),
            provider_name: config.provider_name.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout_secs: config.api_timeout_secs,
            resolved: OnceCell::new(),
        }
    }

    async fn provider(&self) -> Result<&Arc<dyn LLMProvider>, Exam2SqlError> {
        self.resolved
            .get_or_try_init(|| async { self.resolve_provider() })
            .await
    }

    /// Resolve the provider, from most-specific to least-specific:
    ///
    /// 1. **Pre-built provider** (`config.provider`), used as-is.
    /// 2. **Named provider + model** (`config.provider_name`).
    /// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
    /// 4. **OpenAI** when `OPENAI_API_KEY` is set.
    /// 5. **Full auto-detection** (`ProviderFactory::from_env`).
    fn resolve_provider(&self) -> Result<Arc<dyn LLMProvider>, Exam2SqlError> {
        if let Some(ref provider) = self.configured {
            return Ok(Arc::clone(provider));
        }

        let model = self.model.as_deref().unwrap_or(DEFAULT_MODEL);
        if let Some(ref name) = self.provider_name {
            return create_provider(name, model);
        }

        if let (Ok(prov), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !env_model.is_empty() {
                return create_provider(&prov, &env_model);
            }
        }

        if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
            if !openai_key.is_empty() {
                return create_provider("openai", model);
            }
        }

        let (llm_provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| Exam2SqlError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No LLM provider could be auto-detected from environment.\n\
                    Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                    Error: {}",
                    e
                ),
            })?;
        Ok(llm_provider)
    }

    fn options(&self) -> CompletionOptions {
        build_options(self.temperature, self.max_tokens)
    }
}

fn create_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Exam2SqlError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Exam2SqlError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl LanguageModel for EdgequakeModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply, Exam2SqlError> {
        let provider = self.provider().await?;

        let mut images = Vec::with_capacity(request.images.len());
        for path in &request.images {
            images.push(encode_file(path).await?);
        }

        let user = if images.is_empty() {
            ChatMessage::user(request.user.as_str())
        } else {
            ChatMessage::user_with_images(request.user.as_str(), images)
        };
        let messages = vec![ChatMessage::system(request.system.as_str()), user];
        let options = self.options();
        let limit = Duration::from_secs(self.api_timeout_secs);

        let mut last_err: Option<Exam2SqlError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "LLM retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match timeout(limit, provider.chat(&messages, Some(&options))).await {
                Ok(Ok(response)) => {
                    return Ok(ModelReply {
                        content: response.content,
                        input_tokens: response.prompt_tokens as usize,
                        output_tokens: response.completion_tokens as usize,
                    });
                }
                Ok(Err(e)) => {
                    warn!("LLM attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(Exam2SqlError::LlmApiError {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!("LLM attempt {} timed out", attempt + 1);
                    last_err = Some(Exam2SqlError::LlmTimeout {
                        secs: self.api_timeout_secs,
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Exam2SqlError::LlmApiError {
            message: "Unknown error".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::merge::DiagramPage;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, String>>>,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .rev()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                requests: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, request: ModelRequest) -> Result<ModelReply, Exam2SqlError> {
            self.requests.lock().unwrap().push(request);
            match self.replies.lock().unwrap().pop() {
                Some(Ok(content)) => Ok(ModelReply {
                    content,
                    ..Default::default()
                }),
                Some(Err(message)) => Err(Exam2SqlError::LlmApiError { message }),
                None => Err(Exam2SqlError::LlmApiError {
                    message: "no more replies".into(),
                }),
            }
        }
    }

    fn info(pages: usize) -> DiagramInfo {
        DiagramInfo {
            run_id: "run1".into(),
            pages: (1..=pages)
                .map(|n| DiagramPage {
                    page: format!("page_{n}"),
                    page_number: n,
                    image: format!("static/page_images/page_{n}.png").into(),
                    text: format!("Q{n}. question text"),
                    ocr_missing: false,
                    diagrams: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn build_options_defaults() {
        let config = WorkflowConfig::default();
        let opts = build_options(config.temperature, config.max_tokens);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[tokio::test]
    async fn writes_one_file_per_page() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        layout.ensure().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(r#"[{"question_number": "1"}]"#),
            Ok("```json\n{\"questions\": [{\"question_number\": \"2\"}, {\"question_number\": \"3\"}]}\n```"),
        ]);

        let out = process_pages(&model, &info(2), &layout, &WorkflowConfig::default())
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].records.len(), 2);
        let saved: Vec<Value> = crate::layout::read_json(&layout.response_for("run1", 2)).unwrap();
        assert_eq!(saved[0]["page"], serde_json::json!(2));

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].system, DEFAULT_SYSTEM_PROMPT);
        assert!(requests[0].user.contains("Q1. question text"));
        assert_eq!(requests[0].images.len(), 1);
    }

    #[tokio::test]
    async fn images_omitted_when_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let config = WorkflowConfig::builder()
            .attach_page_images(false)
            .system_prompt("custom")
            .build()
            .unwrap();
        let model = ScriptedModel::new(vec![Ok("[]")]);

        process_pages(&model, &info(1), &layout, &config).await.unwrap();

        let requests = model.requests.lock().unwrap();
        assert!(requests[0].images.is_empty());
        assert_eq!(requests[0].system, "custom");
    }

    #[tokio::test]
    async fn failure_keeps_earlier_pages() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let model = ScriptedModel::new(vec![Ok("[]"), Err("HTTP 500")]);

        let err = process_pages(&model, &info(3), &layout, &WorkflowConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Exam2SqlError::LlmApiError { .. }));
        assert!(layout.response_for("run1", 1).exists());
        assert!(!layout.response_for("run1", 2).exists());
        assert_eq!(model.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unusable_reply_names_page() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let model = ScriptedModel::new(vec![Ok("I cannot read this page.")]);

        let err = process_pages(&model, &info(1), &layout, &WorkflowConfig::default())
            .await
            .unwrap_err();

        match err {
            Exam2SqlError::InvalidLlmResponse { page, .. } => assert_eq!(page, "page_1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
