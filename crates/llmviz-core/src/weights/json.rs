use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TensorSet;
use crate::config::GptConfig;
use crate::error::{PipelineError, Result};
use crate::tensor::TensorView;

const CONFIG_KEY: &str = "config";

#[derive(Debug, Serialize, Deserialize)]
struct TensorRecord {
    shape: Vec<usize>,
    dtype: String,
    data: String,
}

fn is_float32(dtype: &str) -> bool {
    matches!(dtype, "float32" | "torch.float32")
}

/// Decodes little-endian `f32` bytes.
///
/// Zero-copy when the input happens to be aligned on a little-endian target,
/// element-wise otherwise.
pub fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(PipelineError::InvalidShape {
            shape: vec![bytes.len()],
            reason: "byte count is not a multiple of 4".to_string(),
        });
    }
    if cfg!(target_endian = "little") {
        if let Ok(slice) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
            return Ok(slice.to_vec());
        }
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        return bytemuck::cast_slice::<f32, u8>(values).to_vec();
    }
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn parse_tensor(name: &str, value: Value) -> Result<TensorView> {
    let record: TensorRecord = serde_json::from_value(value)?;
    if !is_float32(&record.dtype) {
        return Err(PipelineError::UnsupportedDtype {
            tensor: name.to_string(),
            dtype: record.dtype,
        });
    }
    let bytes = STANDARD.decode(record.data.as_bytes())?;
    let data = decode_f32_le(&bytes).map_err(|_| PipelineError::InvalidShape {
        shape: record.shape.clone(),
        reason: format!(
            "tensor '{name}' has {} data bytes, not a multiple of 4",
            bytes.len()
        ),
    })?;
    let needed: usize = record.shape.iter().product();
    if needed > data.len() {
        return Err(PipelineError::SizeMismatch {
            label: name.to_string(),
            expected: needed,
            actual: data.len(),
        });
    }
    TensorView::new(record.shape, data)
}

pub(super) fn parse_tensor_set(root: Value) -> Result<TensorSet> {
    let Value::Object(mut entries) = root else {
        return Err(PipelineError::InvalidConfig(
            "tensor set must be a JSON object".to_string(),
        ));
    };

    let config_value = entries.remove(CONFIG_KEY).ok_or_else(|| {
        PipelineError::InvalidConfig(format!("tensor set has no '{CONFIG_KEY}' entry"))
    })?;
    let config: GptConfig = serde_json::from_value(config_value)?;

    let mut set = TensorSet::new(config);
    for (name, value) in entries {
        let tensor = parse_tensor(&name, value)?;
        set.insert(name, tensor);
    }
    Ok(set)
}

pub(super) fn to_json_value(set: &TensorSet) -> Result<Value> {
    let mut entries = Map::new();
    entries.insert(CONFIG_KEY.to_string(), serde_json::to_value(set.config())?);
    for (name, tensor) in set.iter() {
        let record = TensorRecord {
            shape: tensor.shape().to_vec(),
            dtype: "float32".to_string(),
            data: STANDARD.encode(encode_f32_le(&tensor.to_dense_vec())),
        };
        entries.insert(name.to_string(), serde_json::to_value(record)?);
    }
    Ok(Value::Object(entries))
}
