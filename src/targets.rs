use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::cache::{Cache, CacheExt, Cacheable};
use crate::records::{SutInteraction, SutResponse, TextPrompt};

pub trait Sut: Send + Sync + 'static {
    type Request: Cacheable;
    type Response: Cacheable;

    fn translate_text_prompt(&self, prompt: &TextPrompt) -> Result<Self::Request>;

    fn evaluate(&self, request: &Self::Request) -> Result<Self::Response>;

    fn translate_response(
        &self,
        request: &Self::Request,
        response: Self::Response,
    ) -> Result<SutResponse>;
}

pub trait Annotator: Send + Sync + 'static {
    type Request: Cacheable;
    type Response: Cacheable;
    type Annotation: Serialize;

    fn translate_request(&self, interaction: &SutInteraction) -> Result<Self::Request>;

    fn annotate(&self, request: &Self::Request) -> Result<Self::Response>;

    fn translate_response(
        &self,
        request: &Self::Request,
        response: Self::Response,
    ) -> Result<Self::Annotation>;
}

trait CompletionTarget: Send + Sync {
    fn complete(&self, prompt: &TextPrompt, cache: &dyn Cache) -> Result<SutResponse>;
}

impl<S: Sut> CompletionTarget for S {
    fn complete(&self, prompt: &TextPrompt, cache: &dyn Cache) -> Result<SutResponse> {
        let request = self.translate_text_prompt(prompt)?;
        let response = cache.get_or_call(&request, |request| self.evaluate(request))?;
        self.translate_response(&request, response)
    }
}

trait AnnotationTarget: Send + Sync {
    fn annotate_interaction(&self, interaction: &SutInteraction, cache: &dyn Cache)
    -> Result<Value>;
}

impl<A: Annotator> AnnotationTarget for A {
    fn annotate_interaction(
        &self,
        interaction: &SutInteraction,
        cache: &dyn Cache,
    ) -> Result<Value> {
        let request = self.translate_request(interaction)?;
        let response = cache.get_or_call(&request, |request| self.annotate(request))?;
        let annotation = self.translate_response(&request, response)?;
        serde_json::to_value(annotation).context("Annotation is not representable as JSON")
    }
}

#[derive(Clone)]
pub struct SutHandle {
    uid: String,
    target: Arc<dyn CompletionTarget>,
}

impl SutHandle {
    pub fn new(uid: impl Into<String>, sut: impl Sut) -> Self {
        Self {
            uid: uid.into(),
            target: Arc::new(sut),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn complete(&self, prompt: &TextPrompt, cache: &dyn Cache) -> Result<SutResponse> {
        self.target
            .complete(prompt, cache)
            .with_context(|| format!("SUT '{}' failed on prompt '{}'", self.uid, prompt.uid))
    }
}

impl fmt::Debug for SutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SutHandle").field("uid", &self.uid).finish()
    }
}

#[derive(Clone)]
pub struct AnnotatorHandle {
    uid: String,
    target: Arc<dyn AnnotationTarget>,
}

impl AnnotatorHandle {
    pub fn new(uid: impl Into<String>, annotator: impl Annotator) -> Self {
        Self {
            uid: uid.into(),
            target: Arc::new(annotator),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn annotate(&self, interaction: &SutInteraction, cache: &dyn Cache) -> Result<Value> {
        self.target
            .annotate_interaction(interaction, cache)
            .with_context(|| {
                format!(
                    "Annotator '{}' failed on prompt '{}' answered by '{}'",
                    self.uid, interaction.prompt.uid, interaction.sut_uid
                )
            })
    }
}

impl fmt::Debug for AnnotatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotatorHandle")
            .field("uid", &self.uid)
            .finish()
    }
}
