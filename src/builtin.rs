use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::Cacheable;
use crate::records::{SutInteraction, SutResponse, TextPrompt};
use crate::registry::{TargetParameters, TargetRegistry};
use crate::targets::{Annotator, AnnotatorHandle, Sut, SutHandle};

pub fn register_defaults(registry: &mut TargetRegistry) {
    registry.register_sut("echo", |uid, params| {
        Ok(SutHandle::new(uid, EchoSut::from_params(uid, params)?))
    });
    registry.register_sut("template", |uid, params| {
        Ok(SutHandle::new(uid, TemplateSut::from_params(params)?))
    });
    registry.register_annotator("word_count", |uid, params| {
        ensure_consumed("word_count", &params)?;
        Ok(AnnotatorHandle::new(uid, WordCountAnnotator))
    });
    registry.register_annotator("keyword", |uid, params| {
        Ok(AnnotatorHandle::new(uid, KeywordAnnotator::from_params(params)?))
    });
}

pub fn default_registry() -> TargetRegistry {
    let mut registry = TargetRegistry::new();
    register_defaults(&mut registry);
    registry
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The SUT's own setup (prefix or template), so changing it misses the
    /// cache.
    pub setup: String,
    pub prompt: String,
}

impl Cacheable for CompletionRequest {
    const TYPE_TAG: &'static str = "builtin.CompletionRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReply {
    pub completion: String,
}

impl Cacheable for CompletionReply {
    const TYPE_TAG: &'static str = "builtin.CompletionReply";
}

struct EchoSut {
    prefix: String,
}

impl EchoSut {
    fn from_params(uid: &str, mut params: TargetParameters) -> Result<Self> {
        let prefix = take_string(&mut params, "prefix").unwrap_or_else(|| uid.to_string());
        ensure_consumed("echo", &params)?;
        Ok(Self { prefix })
    }
}

impl Sut for EchoSut {
    type Request = CompletionRequest;
    type Response = CompletionReply;

    fn translate_text_prompt(&self, prompt: &TextPrompt) -> Result<CompletionRequest> {
        Ok(CompletionRequest {
            setup: self.prefix.clone(),
            prompt: prompt.text.clone(),
        })
    }

    fn evaluate(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        Ok(CompletionReply {
            completion: format!("{}{}", request.setup, request.prompt),
        })
    }

    fn translate_response(
        &self,
        _request: &CompletionRequest,
        response: CompletionReply,
    ) -> Result<SutResponse> {
        Ok(SutResponse::new(response.completion))
    }
}

struct TemplateSut {
    template: String,
}

impl TemplateSut {
    fn from_params(mut params: TargetParameters) -> Result<Self> {
        let template = take_string(&mut params, "template")
            .ok_or_else(|| anyhow!("template SUT requires 'template' parameter"))?;
        if !template.contains("{prompt}") {
            bail!("template SUT 'template' must contain a {{prompt}} placeholder");
        }
        ensure_consumed("template", &params)?;
        Ok(Self { template })
    }
}

impl Sut for TemplateSut {
    type Request = CompletionRequest;
    type Response = CompletionReply;

    fn translate_text_prompt(&self, prompt: &TextPrompt) -> Result<CompletionRequest> {
        Ok(CompletionRequest {
            setup: self.template.clone(),
            prompt: prompt.text.clone(),
        })
    }

    fn evaluate(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        Ok(CompletionReply {
            completion: request.setup.replace("{prompt}", &request.prompt),
        })
    }

    fn translate_response(
        &self,
        _request: &CompletionRequest,
        response: CompletionReply,
    ) -> Result<SutResponse> {
        Ok(SutResponse::new(response.completion))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseText {
    pub text: String,
}

impl Cacheable for ResponseText {
    const TYPE_TAG: &'static str = "builtin.ResponseText";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordCount {
    pub words: usize,
}

impl Cacheable for WordCount {
    const TYPE_TAG: &'static str = "builtin.WordCount";
}

struct WordCountAnnotator;

impl Annotator for WordCountAnnotator {
    type Request = ResponseText;
    type Response = WordCount;
    type Annotation = WordCount;

    fn translate_request(&self, interaction: &SutInteraction) -> Result<ResponseText> {
        Ok(ResponseText {
            text: interaction.response.text.clone(),
        })
    }

    fn annotate(&self, request: &ResponseText) -> Result<WordCount> {
        Ok(WordCount {
            words: request.text.split_whitespace().count(),
        })
    }

    fn translate_response(&self, _request: &ResponseText, response: WordCount) -> Result<WordCount> {
        Ok(response)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRequest {
    pub text: String,
    pub keywords_digest: String,
    pub case_sensitive: bool,
}

impl Cacheable for KeywordRequest {
    const TYPE_TAG: &'static str = "builtin.KeywordRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordMatches {
    pub matched: Vec<String>,
}

impl Cacheable for KeywordMatches {
    const TYPE_TAG: &'static str = "builtin.KeywordMatches";
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordAnnotation {
    pub is_safe: bool,
    pub matched: Vec<String>,
}

struct KeywordAnnotator {
    keywords: Vec<String>,
    keywords_digest: String,
    case_sensitive: bool,
}

impl KeywordAnnotator {
    fn from_params(mut params: TargetParameters) -> Result<Self> {
        let mut keywords = take_string_list(&mut params, "keywords")?.unwrap_or_default();
        if let Some(path) = take_string(&mut params, "keywords_file") {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read keywords file: {path}"))?;
            keywords.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }
        if keywords.is_empty() {
            bail!("keyword annotator requires 'keywords' or 'keywords_file'");
        }
        let case_sensitive = take_bool(&mut params, "case_sensitive")?.unwrap_or(false);
        ensure_consumed("keyword", &params)?;
        let keywords = if case_sensitive {
            keywords
        } else {
            keywords.iter().map(|k| k.to_lowercase()).collect()
        };
        let mut hasher = Sha256::new();
        for keyword in &keywords {
            hasher.update(keyword.as_bytes());
            hasher.update(b"\n");
        }
        Ok(Self {
            keywords_digest: format!("{:x}", hasher.finalize()),
            keywords,
            case_sensitive,
        })
    }
}

impl Annotator for KeywordAnnotator {
    type Request = KeywordRequest;
    type Response = KeywordMatches;
    type Annotation = KeywordAnnotation;

    fn translate_request(&self, interaction: &SutInteraction) -> Result<KeywordRequest> {
        let text = &interaction.response.text;
        Ok(KeywordRequest {
            text: if self.case_sensitive {
                text.clone()
            } else {
                text.to_lowercase()
            },
            keywords_digest: self.keywords_digest.clone(),
            case_sensitive: self.case_sensitive,
        })
    }

    fn annotate(&self, request: &KeywordRequest) -> Result<KeywordMatches> {
        Ok(KeywordMatches {
            matched: self
                .keywords
                .iter()
                .filter(|keyword| request.text.contains(keyword.as_str()))
                .cloned()
                .collect(),
        })
    }

    fn translate_response(
        &self,
        _request: &KeywordRequest,
        response: KeywordMatches,
    ) -> Result<KeywordAnnotation> {
        Ok(KeywordAnnotation {
            is_safe: response.matched.is_empty(),
            matched: response.matched,
        })
    }
}

fn take_string(params: &mut TargetParameters, key: &str) -> Option<String> {
    params.remove(key).map(|value| match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn take_bool(params: &mut TargetParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(flag)),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be true or false, got '{s}'")),
        Some(other) => bail!("'{key}' must be a boolean, got {other}"),
    }
}

fn take_string_list(params: &mut TargetParameters, key: &str) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None => Ok(None),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(anyhow!("'{key}' entries must be strings, got {other}")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(Value::String(s)) => Ok(Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        Some(other) => bail!("'{key}' must be a list of strings, got {other}"),
    }
}

fn ensure_consumed(kind: &str, params: &TargetParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let unknown: Vec<&str> = params.keys().map(String::as_str).collect();
    bail!("{kind} does not accept parameter(s): {}", unknown.join(", "))
}
