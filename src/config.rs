use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tokenizer::{ASCII_VOCAB_SIZE, EOS_TOKEN, PAD_TOKEN};

/// Everything a run needs, loaded from one or more TOML files.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Dataset name: corpora live under `datasets/<dataset>/`, checkpoints under `checkpoints/<dataset>/`.
    pub dataset: String,
    pub codec: Codec,
    /// HuggingFace `tokenizer.json`, read when `codec` is `huggingface`.
    pub tokenizer: PathBuf,
    /// CUDA device ordinal; negative selects the CPU.
    pub gpu_id: i64,
    /// libtorch CUDA library to preload before probing for a GPU.
    pub cuda_library: Option<PathBuf>,
    pub seed: u64,
    /// Draw a fresh seed instead of using `seed`.
    pub seed_random: bool,
    pub model: ModelConfig,
    pub data: DataConfig,
    pub sampling: SamplingConfig,
    pub train: TrainConfig,
    pub test: TestConfig,
    pub predict: PredictConfig,
    pub question: QuestionConfig,
}

/// Text codec feeding the model.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    HuggingFace,
    /// One id per ASCII character; needs `vocab_size = 130`, `endoftext = 129`, `padding = 128`.
    Ascii,
}

/// Shape of the transformer. All of it is fixed at construction.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: i64,
    /// Maximum window: training example length and generation context length.
    pub sequence: i64,
    pub emb_dim: i64,
    pub n_heads: i64,
    pub n_layers: i64,
    pub droprate: f64,
    /// Bias on the query/key/value projections.
    pub qkv_bias: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Tokens the window advances between consecutive examples of one file.
    pub stride: usize,
    pub endoftext: i64,
    pub padding: i64,
    /// Loader gather threads; 0 gathers on the calling thread.
    pub num_workers: usize,
    pub pin_memory: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub topk: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    pub train_dir: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Checkpoint to resume from (`"latest"` or an epoch number).
    pub load_epoch: Option<String>,
    pub save_epoch: usize,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    /// Leave padding targets out of the loss.
    pub ignore_padding: bool,
    pub valid: bool,
    pub valid_dir: String,
    pub valid_batch_size: usize,
    pub valid_freq: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    pub test_dir: String,
    pub load_epoch: String,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PredictConfig {
    pub predict_dir: String,
    /// Token budget per file.
    pub tokens: usize,
    pub load_epoch: String,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QuestionConfig {
    /// Token budget per answer.
    pub tokens: usize,
    pub load_epoch: String,
    pub result_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset: String::from("default"),
            codec: Codec::HuggingFace,
            tokenizer: PathBuf::from("dist/tokenizer.json"),
            gpu_id: 0,
            cuda_library: None,
            seed: 0,
            seed_random: false,
            model: ModelConfig::default(),
            data: DataConfig::default(),
            sampling: SamplingConfig::default(),
            train: TrainConfig::default(),
            test: TestConfig::default(),
            predict: PredictConfig::default(),
            question: QuestionConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50277,
            sequence: 2048,
            emb_dim: 12288,
            n_heads: 96,
            n_layers: 96,
            droprate: 0.0,
            qkv_bias: true,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            endoftext: 0,
            padding: 1,
            num_workers: 0,
            pin_memory: false,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            topk: 50,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_dir: String::from("train"),
            epochs: 200,
            batch_size: 8,
            shuffle: true,
            drop_last: false,
            load_epoch: None,
            save_epoch: 20,
            lr: 2e-5,
            beta1: 0.9,
            beta2: 0.999,
            ignore_padding: false,
            valid: false,
            valid_dir: String::from("valid"),
            valid_batch_size: 1,
            valid_freq: 1,
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            test_dir: String::from("test"),
            load_epoch: String::from("latest"),
            result_dir: PathBuf::from("test_result"),
        }
    }
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            predict_dir: String::from("predict"),
            tokens: 3000,
            load_epoch: String::from("latest"),
            result_dir: PathBuf::from("predict_result"),
        }
    }
}

impl Default for QuestionConfig {
    fn default() -> Self {
        Self {
            tokens: 1000,
            load_epoch: String::from("latest"),
            result_dir: PathBuf::from("question_result"),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        ensure!(self.sequence > 0, "sequence must be positive");
        ensure!(self.n_layers > 0, "n_layers must be positive");
        ensure!(self.n_heads > 0, "n_heads must be positive");
        ensure!(
            self.emb_dim > 0 && self.emb_dim % self.n_heads == 0,
            "emb_dim ({}) must be a positive multiple of n_heads ({})",
            self.emb_dim,
            self.n_heads
        );
        ensure!(
            (0.0..1.0).contains(&self.droprate),
            "droprate must lie in [0, 1), got {}",
            self.droprate
        );
        Ok(())
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.temperature.is_finite() && self.temperature > 0.0,
            "temperature must be a positive finite number, got {}",
            self.temperature
        );
        ensure!(self.topk > 0, "topk must be positive, got {}", self.topk);
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.sampling.validate()?;
        ensure!(self.data.stride > 0, "stride must be positive");
        for (name, id) in [("endoftext", self.data.endoftext), ("padding", self.data.padding)] {
            ensure!(
                (0..self.model.vocab_size).contains(&id),
                "{} id {} is outside the vocabulary 0..{}",
                name,
                id,
                self.model.vocab_size
            );
        }
        if self.codec == Codec::Ascii {
            ensure!(
                self.model.vocab_size == ASCII_VOCAB_SIZE
                    && self.data.endoftext == EOS_TOKEN
                    && self.data.padding == PAD_TOKEN,
                "the ascii codec needs vocab_size = {}, endoftext = {}, padding = {}",
                ASCII_VOCAB_SIZE,
                EOS_TOKEN,
                PAD_TOKEN
            );
        }
        ensure!(self.train.batch_size > 0, "train.batch_size must be positive");
        ensure!(
            self.train.valid_batch_size > 0,
            "train.valid_batch_size must be positive"
        );
        ensure!(self.train.valid_freq > 0, "train.valid_freq must be positive");
        ensure!(self.train.save_epoch > 0, "train.save_epoch must be positive");
        Ok(())
    }

    /// `datasets/<dataset>/<sub>`
    pub fn dataset_dir(&self, sub: &str) -> PathBuf {
        Path::new("datasets").join(&self.dataset).join(sub)
    }

    /// `checkpoints/<dataset>`
    pub fn checkpoint_dir(&self) -> PathBuf {
        Path::new("checkpoints").join(&self.dataset)
    }
}

/// Loads and merges the given TOML files in order; keys in later files win.
pub fn load_config(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = toml::Table::new();
    for path in paths {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let table: toml::Table = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        merge_tables(&mut merged, table);
    }
    let config: Config = toml::Value::Table(merged)
        .try_into()
        .context("invalid configuration")?;
    Ok(config)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
