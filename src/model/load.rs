//! Model artifact resolution and weight loading.
//!
//! A model spec is either a local directory or a Hugging Face repo id. The
//! directory must hold `tekken.json` plus either an original checkpoint
//! (`params.json` + raw `*.safetensors`, Mistral-style tensor names) or a
//! converted one (`config.json` + `model*.safetensors`, canonical names).
//! Original names are rewritten through an anchored-regex table into the
//! canonical layout used by the module tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use hf_hub::api::sync::ApiBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::config::ModelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// `params.json` + raw safetensors with original tensor names.
    Original,
    /// `config.json` + `model*.safetensors` with canonical names.
    Converted,
}

#[derive(Debug)]
pub struct ModelPaths {
    pub dir: PathBuf,
    pub format: ModelFormat,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Resolve a model spec to a local directory, downloading from the Hugging
/// Face hub when the spec is not an existing path. `HF_HUB_CACHE` /
/// `HF_HOME` control the cache location, `HF_TOKEN` /
/// `HUGGINGFACE_HUB_TOKEN` supply auth.
pub fn resolve_model(spec: &str) -> Result<PathBuf> {
    if spec.is_empty() {
        return Err(Error::InvalidModelSpec(spec.to_string()));
    }
    let as_path = Path::new(spec);
    if as_path.is_dir() {
        return Ok(as_path.to_path_buf());
    }
    if as_path.exists() {
        // A file is not a model directory.
        return Err(Error::InvalidModelSpec(spec.to_string()));
    }
    fetch_from_hub(spec)
}

fn fetch_from_hub(repo_id: &str) -> Result<PathBuf> {
    let token = std::env::var("HF_TOKEN")
        .or_else(|_| std::env::var("HUGGINGFACE_HUB_TOKEN"))
        .ok();
    let api = ApiBuilder::new().with_token(token).build()?;
    let repo = api.model(repo_id.to_string());

    let info = repo.info()?;
    let files: Vec<String> = info
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .filter(|name| {
            name == "tekken.json"
                || name == "params.json"
                || name == "config.json"
                || name.ends_with(".safetensors")
        })
        .collect();
    if files.is_empty() {
        return Err(Error::InvalidModelSpec(repo_id.to_string()));
    }

    info!(repo = repo_id, files = files.len(), "fetching model from hub");
    let mut snapshot = None;
    for name in &files {
        let path = repo.get(name)?;
        snapshot = path.parent().map(Path::to_path_buf);
    }
    snapshot.ok_or_else(|| Error::InvalidModelSpec(repo_id.to_string()))
}

/// Locate the artifacts inside a model directory and classify the format.
pub fn locate(dir: &Path) -> Result<ModelPaths> {
    let tokenizer = dir.join("tekken.json");
    if !tokenizer.is_file() {
        return Err(Error::MissingFile(tokenizer));
    }

    let params = dir.join("params.json");
    let config = dir.join("config.json");
    let (format, config_path) = if params.is_file() {
        (ModelFormat::Original, params)
    } else if config.is_file() {
        (ModelFormat::Converted, config)
    } else {
        return Err(Error::UnsupportedModelFormat(format!(
            "{}: neither params.json nor config.json present",
            dir.display()
        )));
    };

    let mut weights = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let wanted = match format {
            ModelFormat::Original => name.ends_with(".safetensors"),
            ModelFormat::Converted => {
                name.starts_with("model") && name.ends_with(".safetensors")
            }
        };
        if wanted {
            weights.push(path);
        }
    }
    weights.sort();
    if weights.is_empty() {
        return Err(Error::MissingFile(dir.join("*.safetensors")));
    }

    Ok(ModelPaths {
        dir: dir.to_path_buf(),
        format,
        config: config_path,
        tokenizer,
        weights,
    })
}

pub fn load_config(paths: &ModelPaths) -> Result<ModelConfig> {
    let raw = std::fs::read_to_string(&paths.config)?;
    let cfg: ModelConfig = serde_json::from_str(&raw)?;
    if let Some(q) = &cfg.quantization {
        return Err(Error::UnsupportedModelFormat(format!(
            "quantized checkpoint (group_size={}, bits={}); convert to an unquantized snapshot",
            q.group_size, q.bits
        )));
    }
    Ok(cfg)
}

/// Prefixes stripped from original tensor names before the rewrite table.
const STRIP_PREFIXES: &[&str] = &[
    "mm_streams_embeddings.embedding_module.",
    "mm_whisper_embeddings.",
];

/// Table W: anchored rewrites from original to canonical tensor names.
static REMAP_TABLE: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // Encoder conv frontend.
        (
            r"^whisper_encoder\.conv_layers\.0\.conv\.(weight|bias)$",
            "audio_encoder.conv1.$1",
        ),
        (
            r"^whisper_encoder\.conv_layers\.1\.conv\.(weight|bias)$",
            "audio_encoder.conv2.$1",
        ),
        // Encoder transformer.
        (
            r"^whisper_encoder\.transformer\.layers\.(\d+)\.attention\.w([qkvo])\.(weight|bias)$",
            "audio_encoder.layers.$1.attention.${2}_proj.$3",
        ),
        (
            r"^whisper_encoder\.transformer\.layers\.(\d+)\.attention_norm\.weight$",
            "audio_encoder.layers.$1.attention_norm.weight",
        ),
        (
            r"^whisper_encoder\.transformer\.layers\.(\d+)\.ffn_norm\.weight$",
            "audio_encoder.layers.$1.ffn_norm.weight",
        ),
        (
            r"^whisper_encoder\.transformer\.layers\.(\d+)\.feed_forward\.w1\.weight$",
            "audio_encoder.layers.$1.feed_forward.gate_proj.weight",
        ),
        (
            r"^whisper_encoder\.transformer\.layers\.(\d+)\.feed_forward\.w2\.weight$",
            "audio_encoder.layers.$1.feed_forward.down_proj.weight",
        ),
        (
            r"^whisper_encoder\.transformer\.layers\.(\d+)\.feed_forward\.w3\.weight$",
            "audio_encoder.layers.$1.feed_forward.up_proj.weight",
        ),
        (
            r"^whisper_encoder\.transformer\.norm\.weight$",
            "audio_encoder.norm.weight",
        ),
        // Downsample adapter.
        (
            r"^audio_language_projection\.0\.weight$",
            "adapter.w_in.weight",
        ),
        (
            r"^audio_language_projection\.2\.weight$",
            "adapter.w_out.weight",
        ),
        // Language model.
        (
            r"^tok_embeddings\.weight$",
            "language_model.embed_tokens.weight",
        ),
        (
            r"^layers\.(\d+)\.attention\.w([qkvo])\.weight$",
            "language_model.layers.$1.self_attn.${2}_proj.weight",
        ),
        (
            r"^layers\.(\d+)\.attention_norm\.weight$",
            "language_model.layers.$1.input_layernorm.weight",
        ),
        (
            r"^layers\.(\d+)\.ffn_norm\.weight$",
            "language_model.layers.$1.post_attention_layernorm.weight",
        ),
        (
            r"^layers\.(\d+)\.feed_forward\.w1\.weight$",
            "language_model.layers.$1.mlp.gate_proj.weight",
        ),
        (
            r"^layers\.(\d+)\.feed_forward\.w2\.weight$",
            "language_model.layers.$1.mlp.down_proj.weight",
        ),
        (
            r"^layers\.(\d+)\.feed_forward\.w3\.weight$",
            "language_model.layers.$1.mlp.up_proj.weight",
        ),
        (
            r"^layers\.(\d+)\.ada_norm\.in_proj\.weight$",
            "language_model.layers.$1.ada_norm.w_in.weight",
        ),
        (
            r"^layers\.(\d+)\.ada_norm\.out_proj\.weight$",
            "language_model.layers.$1.ada_norm.w_out.weight",
        ),
        (r"^norm\.weight$", "language_model.norm.weight"),
    ]
    .iter()
    .map(|(pattern, repl)| (Regex::new(pattern).expect("remap pattern"), *repl))
    .collect()
});

fn remap_name(name: &str) -> Option<String> {
    let mut name = name;
    for prefix in STRIP_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
        }
    }
    // The standalone output projection is tied to the embedding; drop it.
    if name == "output.weight" {
        return None;
    }
    for (re, repl) in REMAP_TABLE.iter() {
        if re.is_match(name) {
            return Some(re.replace(name, *repl).into_owned());
        }
    }
    debug!(tensor = name, "no remap rule; keeping name as-is");
    Some(name.to_string())
}

/// Load all weight files into a canonical name -> tensor map.
pub fn load_tensors(paths: &ModelPaths, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for file in &paths.weights {
        debug!(file = %file.display(), "reading safetensors");
        tensors.extend(candle_core::safetensors::load(file, device)?);
    }

    let tensors = match paths.format {
        ModelFormat::Original => {
            let mut out = HashMap::with_capacity(tensors.len());
            for (name, tensor) in tensors {
                if let Some(new_name) = remap_name(&name) {
                    out.insert(new_name, tensor);
                }
            }
            out
        }
        ModelFormat::Converted => {
            // Converted conv weights are stored `(out, k, in)`; the
            // canonical layout is `(out, in, k)`.
            let mut out = HashMap::with_capacity(tensors.len());
            for (name, tensor) in tensors {
                if name == "output.weight" {
                    continue;
                }
                let tensor = if name == "audio_encoder.conv1.weight"
                    || name == "audio_encoder.conv2.weight"
                {
                    tensor.transpose(1, 2)?.contiguous()?
                } else {
                    tensor
                };
                out.insert(name, tensor);
            }
            out
        }
    };
    info!(tensors = tensors.len(), format = ?paths.format, "weights loaded");
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_multimodal_prefixes() {
        let name = "mm_whisper_embeddings.whisper_encoder.conv_layers.0.conv.weight";
        assert_eq!(
            remap_name(name).as_deref(),
            Some("audio_encoder.conv1.weight")
        );
    }

    #[test]
    fn rewrites_encoder_attention_names() {
        let name = "mm_whisper_embeddings.whisper_encoder.transformer.layers.7.attention.wq.bias";
        assert_eq!(
            remap_name(name).as_deref(),
            Some("audio_encoder.layers.7.attention.q_proj.bias")
        );
    }

    #[test]
    fn rewrites_adapter_and_lm_names() {
        assert_eq!(
            remap_name("mm_whisper_embeddings.audio_language_projection.0.weight").as_deref(),
            Some("adapter.w_in.weight")
        );
        assert_eq!(
            remap_name("layers.11.feed_forward.w3.weight").as_deref(),
            Some("language_model.layers.11.mlp.up_proj.weight")
        );
        assert_eq!(
            remap_name("layers.3.ada_norm.out_proj.weight").as_deref(),
            Some("language_model.layers.3.ada_norm.w_out.weight")
        );
        assert_eq!(
            remap_name("tok_embeddings.weight").as_deref(),
            Some("language_model.embed_tokens.weight")
        );
    }

    #[test]
    fn discards_untied_output_projection() {
        assert_eq!(remap_name("output.weight"), None);
    }

    #[test]
    fn lm_norm_does_not_shadow_encoder_norm() {
        assert_eq!(
            remap_name("norm.weight").as_deref(),
            Some("language_model.norm.weight")
        );
        assert_eq!(
            remap_name("mm_whisper_embeddings.whisper_encoder.transformer.norm.weight").as_deref(),
            Some("audio_encoder.norm.weight")
        );
    }
}
