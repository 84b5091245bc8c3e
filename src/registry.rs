use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};

use crate::targets::{AnnotatorHandle, SutHandle};

pub type TargetParameters = Map<String, Value>;

type SutConstructor = Arc<dyn Fn(&str, TargetParameters) -> Result<SutHandle> + Send + Sync>;
type AnnotatorConstructor =
    Arc<dyn Fn(&str, TargetParameters) -> Result<AnnotatorHandle> + Send + Sync>;

/// Maps SUT and annotator kinds to constructors. Built once at startup and
/// passed by reference to whatever needs to instantiate targets.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    suts: HashMap<String, SutConstructor>,
    annotators: HashMap<String, AnnotatorConstructor>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sut<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&str, TargetParameters) -> Result<SutHandle> + Send + Sync + 'static,
    {
        self.suts.insert(kind.into(), Arc::new(constructor));
    }

    pub fn register_annotator<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&str, TargetParameters) -> Result<AnnotatorHandle> + Send + Sync + 'static,
    {
        self.annotators.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create_sut(&self, kind: &str, uid: &str, params: TargetParameters) -> Result<SutHandle> {
        let factory = self.suts.get(kind).ok_or_else(|| {
            anyhow!(
                "Unknown SUT kind '{}'. Available SUT kinds: {}",
                kind,
                self.known_suts().join(", ")
            )
        })?;
        factory(uid, params)
    }

    pub fn create_annotator(
        &self,
        kind: &str,
        uid: &str,
        params: TargetParameters,
    ) -> Result<AnnotatorHandle> {
        let factory = self.annotators.get(kind).ok_or_else(|| {
            anyhow!(
                "Unknown annotator kind '{}'. Available annotator kinds: {}",
                kind,
                self.known_annotators().join(", ")
            )
        })?;
        factory(uid, params)
    }

    pub fn known_suts(&self) -> Vec<String> {
        sorted_keys(&self.suts)
    }

    pub fn known_annotators(&self) -> Vec<String> {
        sorted_keys(&self.annotators)
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut names: Vec<_> = map.keys().cloned().collect();
    names.sort();
    names
}
