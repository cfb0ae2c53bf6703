//! Named tensor sets: model weights and reference checkpoints.
//!
//! Both are stored as one JSON object. Every key except `config` is a tensor
//! record `{ "shape": [..], "dtype": "float32", "data": "<base64 LE bytes>" }`;
//! `config` holds the [`GptConfig`] the tensors belong to.

mod json;
mod layout;
mod synthetic;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::GptConfig;
use crate::error::{PipelineError, Result};
use crate::tensor::TensorView;

pub use json::{decode_f32_le, encode_f32_le};
pub use layout::{gpt_tensor_layout, TensorSpec};

/// A configuration plus named tensors, ordered by name.
#[derive(Debug, Clone)]
pub struct TensorSet {
    config: GptConfig,
    tensors: BTreeMap<String, TensorView>,
}

impl TensorSet {
    pub fn new(config: GptConfig) -> Self {
        Self {
            config,
            tensors: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GptConfig {
        &mut self.config
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: TensorView) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&TensorView> {
        self.tensors.get(name)
    }

    /// Like [`get`](Self::get), but a missing tensor is an error.
    pub fn require(&self, name: &str) -> Result<&TensorView> {
        self.tensors
            .get(name)
            .ok_or_else(|| PipelineError::MissingTensor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorView)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        json::parse_tensor_set(serde_json::from_str(json)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        json::parse_tensor_set(serde_json::from_reader(reader)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("loading tensor set from {}", path.display());
        let set = Self::from_reader(BufReader::new(File::open(path)?))?;
        log::debug!(
            "loaded {} tensors (model_type '{}')",
            set.len(),
            set.config.model_type
        );
        Ok(set)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&json::to_json_value(self)?)?)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, &json::to_json_value(self)?)?;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        log::info!("wrote {} tensors to {}", self.len(), path.display());
        Ok(())
    }

    /// Deterministic toy weights for `config`, in the minGPT naming scheme.
    pub fn synthetic(config: &GptConfig, seed: u64) -> Result<Self> {
        synthetic::generate(config, seed)
    }
}
