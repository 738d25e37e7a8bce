use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use tch::{Device, Tensor};
use tracing::{debug, warn};

use crate::tokenizer::TextCodec;

/// Random-access source of examples for the [`DataLoader`](crate::loader::DataLoader).
///
/// `get` must be deterministic and free of side effects: the loader calls it
/// from several worker threads at once, on disjoint indices.
pub trait Dataset: Sync {
    type Item: Send;
    type Batch;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Self::Item;

    /// Stacks per-example items, in order, into one batch.
    fn collate(items: Vec<Self::Item>, pin_memory: bool) -> Result<Self::Batch>;
}

/// One training example: file and offset of its first input token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowIndex {
    pub file: usize,
    pub offset: usize,
}

/// Inputs and shifted targets, both `[batch, sequence]`.
#[derive(Debug)]
pub struct TokenBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

/// Whole-file token ids `[batch, len]` and the relative path of each file.
#[derive(Debug)]
pub struct DocumentBatch {
    pub tokens: Tensor,
    pub paths: Vec<PathBuf>,
}

/// Every regular file under `root`, sorted by path.
pub fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
        if !entry.file_type().is_dir() {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// File contents as text; invalid UTF-8 sequences become U+FFFD.
fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), "not valid UTF-8, replacing invalid bytes");
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    };
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

/// Appends end-of-text, then pads until at least one window fits and the
/// windows land exactly on stride boundaries.
pub fn pad_tokens(
    mut ids: Vec<i64>,
    sequence: usize,
    stride: usize,
    endoftext: i64,
    padding: i64,
) -> Vec<i64> {
    ids.push(endoftext);
    while ids.len() <= sequence {
        ids.push(padding);
    }
    while (ids.len() - sequence - 1) % stride != 0 {
        ids.push(padding);
    }
    ids
}

/// Offsets `0, stride, 2*stride, ...` up to `len - sequence - 1`.
pub fn window_offsets(len: usize, sequence: usize, stride: usize) -> impl Iterator<Item = usize> {
    (0..len.saturating_sub(sequence)).step_by(stride)
}

/// Fixed-length overlapping windows over every file of a corpus directory.
#[derive(Debug, Clone)]
pub struct WindowedDataset {
    texts: Vec<Vec<i64>>,
    windows: Vec<WindowIndex>,
    sequence: usize,
}

impl WindowedDataset {
    pub fn new(
        root: &Path,
        tokenizer: &dyn TextCodec,
        sequence: usize,
        stride: usize,
        endoftext: i64,
        padding: i64,
    ) -> Result<Self> {
        ensure!(sequence > 0, "sequence must be positive");
        ensure!(stride > 0, "stride must be positive");
        let mut texts = Vec::new();
        let mut windows = Vec::new();
        for (file, path) in collect_files(root)?.iter().enumerate() {
            let ids = tokenizer
                .encode(&read_text(path)?)
                .with_context(|| format!("failed to tokenize {}", path.display()))?;
            let ids = pad_tokens(ids, sequence, stride, endoftext, padding);
            windows.extend(
                window_offsets(ids.len(), sequence, stride).map(|offset| WindowIndex { file, offset }),
            );
            texts.push(ids);
        }
        debug!(
            root = %root.display(),
            files = texts.len(),
            windows = windows.len(),
            "tokenized corpus"
        );
        Ok(WindowedDataset {
            texts,
            windows,
            sequence,
        })
    }

    pub fn windows(&self) -> &[WindowIndex] {
        &self.windows
    }

    pub fn texts(&self) -> &[Vec<i64>] {
        &self.texts
    }

    /// Token ids of one example, without building tensors.
    pub fn example(&self, index: usize) -> (&[i64], &[i64]) {
        let WindowIndex { file, offset } = self.windows[index];
        let tokens = &self.texts[file];
        (
            &tokens[offset..offset + self.sequence],
            &tokens[offset + 1..offset + 1 + self.sequence],
        )
    }
}

impl Dataset for WindowedDataset {
    type Item = (Tensor, Tensor);
    type Batch = TokenBatch;

    fn len(&self) -> usize {
        self.windows.len()
    }

    fn get(&self, index: usize) -> Self::Item {
        let (input, target) = self.example(index);
        (Tensor::from_slice(input), Tensor::from_slice(target))
    }

    fn collate(items: Vec<Self::Item>, pin_memory: bool) -> Result<Self::Batch> {
        let (inputs, targets): (Vec<Tensor>, Vec<Tensor>) = items.into_iter().unzip();
        Ok(TokenBatch {
            inputs: stack(&inputs, pin_memory)?,
            targets: stack(&targets, pin_memory)?,
        })
    }
}

/// Each corpus file in full, paired with its path relative to the root.
#[derive(Debug, Clone)]
pub struct WholeFileDataset {
    texts: Vec<Vec<i64>>,
    paths: Vec<PathBuf>,
}

impl WholeFileDataset {
    pub fn new(root: &Path, tokenizer: &dyn TextCodec) -> Result<Self> {
        let mut texts = Vec::new();
        let mut paths = Vec::new();
        for path in collect_files(root)? {
            let ids = tokenizer
                .encode(&read_text(&path)?)
                .with_context(|| format!("failed to tokenize {}", path.display()))?;
            texts.push(ids);
            paths.push(path.strip_prefix(root).unwrap_or(path.as_path()).to_path_buf());
        }
        debug!(root = %root.display(), files = texts.len(), "tokenized documents");
        Ok(WholeFileDataset { texts, paths })
    }
}

impl Dataset for WholeFileDataset {
    type Item = (Tensor, PathBuf);
    type Batch = DocumentBatch;

    fn len(&self) -> usize {
        self.texts.len()
    }

    fn get(&self, index: usize) -> Self::Item {
        (Tensor::from_slice(&self.texts[index]), self.paths[index].clone())
    }

    fn collate(items: Vec<Self::Item>, pin_memory: bool) -> Result<Self::Batch> {
        let (tokens, paths): (Vec<Tensor>, Vec<PathBuf>) = items.into_iter().unzip();
        Ok(DocumentBatch {
            tokens: stack(&tokens, pin_memory)
                .context("documents in one batch must have the same token count")?,
            paths,
        })
    }
}

/// `[len]` tensors -> `[n, len]`, owning fresh storage.
fn stack(items: &[Tensor], pin_memory: bool) -> Result<Tensor> {
    let batch = Tensor::f_stack(items, 0)?.contiguous().detach();
    if pin_memory && tch::Cuda::is_available() {
        return Ok(batch.pin_memory(Device::Cuda(0)));
    }
    Ok(batch)
}
