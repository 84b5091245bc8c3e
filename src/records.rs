use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextPrompt {
    pub uid: String,
    pub text: String,
}

impl TextPrompt {
    pub fn new(uid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            text: text.into(),
        }
    }
}

/// A SUT's answer, normalized away from any provider-specific shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SutResponse {
    pub text: String,
}

impl SutResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SutInteraction {
    pub prompt: TextPrompt,
    pub sut_uid: String,
    pub response: SutResponse,
}

impl SutInteraction {
    /// Natural key of an interaction: one prompt answered by one SUT.
    pub fn key(&self) -> (String, String) {
        (self.prompt.uid.clone(), self.sut_uid.clone())
    }
}
