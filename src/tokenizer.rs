use std::path::Path;

use anyhow::{Context, Result, anyhow, ensure};

use crate::config::{Codec, Config};

/// Text <-> token id codec. The model only ever sees the ids.
pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<i64>>;
    fn decode(&self, ids: &[i64]) -> Result<String>;
    /// Number of ids `encode` can produce.
    fn vocab_size(&self) -> i64;
}

/// Builds the configured codec and checks that every id it produces has an
/// embedding row.
pub fn load_tokenizer(config: &Config) -> Result<Box<dyn TextCodec>> {
    let codec: Box<dyn TextCodec> = match config.codec {
        Codec::HuggingFace => Box::new(HfTokenizer::from_file(&config.tokenizer)?),
        Codec::Ascii => Box::new(AsciiTokenizer::new()),
    };
    check_vocab(codec.as_ref(), config.model.vocab_size)?;
    Ok(codec)
}

pub fn check_vocab(codec: &dyn TextCodec, vocab_size: i64) -> Result<()> {
    ensure!(
        codec.vocab_size() <= vocab_size,
        "tokenizer has {} ids but the model vocabulary is {}",
        codec.vocab_size(),
        vocab_size
    );
    Ok(())
}

/// Byte-pair tokenizer read from a serialized `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|err| anyhow!(err.to_string()))
            .with_context(|| format!("failed to load tokenizer {}", path.display()))?;
        Ok(HfTokenizer { inner })
    }
}

impl TextCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|err| anyhow!(err.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| u32::try_from(id).map_err(|_| anyhow!("Invalid token found: {}", id)))
            .collect::<Result<Vec<u32>>>()?;
        self.inner
            .decode(&ids, false)
            .map_err(|err| anyhow!(err.to_string()))
    }

    fn vocab_size(&self) -> i64 {
        self.inner.get_vocab_size(true) as i64
    }
}

/// One token per ASCII character, plus padding and end-of-text.
#[derive(Debug, Clone, Default)]
pub struct AsciiTokenizer {}

pub const PAD_TOKEN: i64 = 128;
pub const EOS_TOKEN: i64 = 129;
/// 128 ASCII + PAD + EOS
pub const ASCII_VOCAB_SIZE: i64 = 130;

impl AsciiTokenizer {
    pub fn new() -> Self {
        AsciiTokenizer {}
    }
}

impl TextCodec for AsciiTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let mut tokens = Vec::with_capacity(text.len());
        for c in text.chars() {
            // Only ASCII characters are supported in this simple tokenizer
            if !c.is_ascii() {
                return Err(anyhow!("Non-ASCII character found: {}", c));
            }
            tokens.push(c as i64);
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut text = String::with_capacity(tokens.len());
        for &token in tokens {
            match token {
                0..=127 => {
                    text.push(token as u8 as char);
                }
                PAD_TOKEN => {}
                EOS_TOKEN => {
                    break;
                }
                _ => return Err(anyhow!("Invalid token found: {}", token)),
            }
        }
        Ok(text)
    }

    fn vocab_size(&self) -> i64 {
        ASCII_VOCAB_SIZE
    }
}
