use anyhow::{Result, ensure};
use tch::{
    Kind::{Bool, Float, Int64},
    Tensor,
    nn::{self, Embedding, LayerNorm, Linear, LinearConfig, Module, ModuleT, Path, embedding, layer_norm, linear},
};

use crate::config::ModelConfig;

/// Modules that own linear projections expose them here so weight
/// initialization can reach every one of them without inspecting types.
pub trait Projections {
    fn projections(&self) -> Vec<&Linear>;
}

/// Draws every projection weight from N(0, 0.02) and zeroes its bias.
pub fn init_projections<M: Projections + ?Sized>(module: &M) {
    tch::no_grad(|| {
        for projection in module.projections() {
            let mut ws = projection.ws.shallow_clone();
            ws.init(nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            });
            if let Some(bs) = &projection.bs {
                let mut bs = bs.shallow_clone();
                bs.init(nn::Init::Const(0.0));
            }
        }
    });
}

#[derive(Debug)]
struct Embeddings {
    token: Embedding,
    position: Embedding,
}

impl Embeddings {
    pub fn new(vs: &Path, vocab_size: i64, sequence: i64, emb_dim: i64) -> Self {
        let token = embedding(vs / "token_emb", vocab_size, emb_dim, Default::default());
        let position = embedding(vs / "pos_emb", sequence, emb_dim, Default::default());
        Embeddings { token, position }
    }

    /// Takes token ids `[batch, seq_len]` and returns `[batch, seq_len, emb_dim]`:
    /// each token's embedding plus the embedding of its position.
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let token_embeds = input.apply(&self.token);
        let seq_length = input.size()[1];
        // [seq_len] -> [1, seq_len, emb_dim], broadcast over the batch
        let position_embeds = Tensor::arange(seq_length, (Int64, input.device()))
            .unsqueeze(0)
            .apply(&self.position);
        token_embeds + position_embeds
    }
}

/// Causal multi-head self-attention over at most `sequence` positions.
///
/// Takes `[batch, seq_len, d_in]` and produces `[batch, seq_len, d_out]`, where
/// position `i` only mixes values from positions `0..=i`.
#[derive(Debug)]
pub struct CausalSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    out_proj: Linear,
    /// `[sequence, sequence]`, true strictly above the diagonal.
    mask: Tensor,
    n_heads: i64,
    head_dim: i64,
    droprate: f64,
}

impl CausalSelfAttention {
    pub fn new(
        vs: &Path,
        d_in: i64,
        d_out: i64,
        sequence: i64,
        droprate: f64,
        n_heads: i64,
        qkv_bias: bool,
    ) -> Result<Self> {
        ensure!(
            n_heads > 0 && d_out % n_heads == 0,
            "d_out ({}) must be divisible by n_heads ({})",
            d_out,
            n_heads
        );
        let qkv = LinearConfig {
            bias: qkv_bias,
            ..Default::default()
        };
        let query = linear(vs / "W_query", d_in, d_out, qkv);
        let key = linear(vs / "W_key", d_in, d_out, qkv);
        let value = linear(vs / "W_value", d_in, d_out, qkv);
        let out_proj = linear(vs / "out_proj", d_out, d_out, Default::default());
        let mask = Tensor::ones([sequence, sequence], (Float, vs.device()))
            .triu(1)
            .to_kind(Bool);
        Ok(CausalSelfAttention {
            query,
            key,
            value,
            out_proj,
            mask,
            n_heads,
            head_dim: d_out / n_heads,
            droprate,
        })
    }

    /// [batch, seq_len, d_out] -> [batch, heads, seq_len, head_dim]
    fn split_heads(&self, xs: Tensor, batch: i64, seq_len: i64) -> Tensor {
        xs.view([batch, seq_len, self.n_heads, self.head_dim])
            .transpose(1, 2)
    }

    /// Post-softmax attention weights `[batch, heads, seq_len, seq_len]`, after dropout.
    pub fn attention_weights(&self, xs: &Tensor, train: bool) -> Tensor {
        let size = xs.size();
        let (batch, seq_len) = (size[0], size[1]);
        let queries = self.split_heads(xs.apply(&self.query), batch, seq_len);
        let keys = self.split_heads(xs.apply(&self.key), batch, seq_len);
        let scores = queries.matmul(&keys.transpose(2, 3)) / (self.head_dim as f64).sqrt();
        let mask = self.mask.narrow(0, 0, seq_len).narrow(1, 0, seq_len);
        scores
            .masked_fill(&mask, f64::NEG_INFINITY)
            .softmax(-1, Float)
            .dropout(self.droprate, train)
    }
}

impl ModuleT for CausalSelfAttention {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let size = xs.size();
        let (batch, seq_len) = (size[0], size[1]);
        let values = self.split_heads(xs.apply(&self.value), batch, seq_len);
        self.attention_weights(xs, train)
            .matmul(&values)
            .transpose(1, 2)
            .contiguous()
            .view([batch, seq_len, -1])
            .apply(&self.out_proj)
    }
}

impl Projections for CausalSelfAttention {
    fn projections(&self) -> Vec<&Linear> {
        vec![&self.query, &self.key, &self.value, &self.out_proj]
    }
}

/// Position-wise MLP: emb_dim -> 4 * emb_dim -> emb_dim.
#[derive(Debug)]
pub struct FeedForward {
    fc: Linear,
    proj: Linear,
}

impl FeedForward {
    pub fn new(vs: &Path, emb_dim: i64) -> Self {
        let fc = linear(vs / "fc", emb_dim, 4 * emb_dim, Default::default());
        let proj = linear(vs / "proj", 4 * emb_dim, emb_dim, Default::default());
        FeedForward { fc, proj }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.fc).gelu("none").apply(&self.proj)
    }
}

impl Projections for FeedForward {
    fn projections(&self) -> Vec<&Linear> {
        vec![&self.fc, &self.proj]
    }
}

/// Pre-norm residual block; one dropout rate serves both shortcuts.
#[derive(Debug)]
pub struct TransformerBlock {
    norm1: LayerNorm,
    attn: CausalSelfAttention,
    norm2: LayerNorm,
    ff: FeedForward,
    droprate: f64,
}

impl TransformerBlock {
    pub fn new(vs: &Path, config: &ModelConfig) -> Result<Self> {
        let emb_dim = config.emb_dim;
        Ok(TransformerBlock {
            norm1: layer_norm(vs / "norm1", vec![emb_dim], Default::default()),
            attn: CausalSelfAttention::new(
                &(vs / "attn"),
                emb_dim,
                emb_dim,
                config.sequence,
                config.droprate,
                config.n_heads,
                config.qkv_bias,
            )?,
            norm2: layer_norm(vs / "norm2", vec![emb_dim], Default::default()),
            ff: FeedForward::new(&(vs / "ff"), emb_dim),
            droprate: config.droprate,
        })
    }
}

impl ModuleT for TransformerBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let attended = self
            .attn
            .forward_t(&xs.apply(&self.norm1), train)
            .dropout(self.droprate, train);
        let xs = xs + attended;
        let fed = self.ff.forward(&xs.apply(&self.norm2)).dropout(self.droprate, train);
        xs + fed
    }
}

impl Projections for TransformerBlock {
    fn projections(&self) -> Vec<&Linear> {
        let mut projections = self.attn.projections();
        projections.extend(self.ff.projections());
        projections
    }
}

/// Decoder-only transformer: ids `[batch, seq_len]` -> logits `[batch, seq_len, vocab_size]`.
#[derive(Debug)]
pub struct Gpt {
    embeddings: Embeddings,
    blocks: Box<[TransformerBlock]>,
    final_norm: LayerNorm,
    out_head: Linear,
    droprate: f64,
    sequence: i64,
}

impl Gpt {
    pub fn new(vs: &Path, config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let embeddings = Embeddings::new(vs, config.vocab_size, config.sequence, config.emb_dim);
        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlock::new(&(vs / "transformer" / i), config))
            .collect::<Result<Box<[_]>>>()?;
        ensure!(
            blocks.len() as i64 == config.n_layers,
            "expected {} transformer blocks, built {}",
            config.n_layers,
            blocks.len()
        );
        let final_norm = layer_norm(vs / "final_norm", vec![config.emb_dim], Default::default());
        let out_head = linear(
            vs / "out_head",
            config.emb_dim,
            config.vocab_size,
            LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        let model = Gpt {
            embeddings,
            blocks,
            final_norm,
            out_head,
            droprate: config.droprate,
            sequence: config.sequence,
        };
        init_projections(&model);
        Ok(model)
    }

    /// Longest context a forward pass accepts.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

}

impl ModuleT for Gpt {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut hidden = self.embeddings.forward(xs).dropout(self.droprate, train);
        for block in self.blocks.iter() {
            hidden = block.forward_t(&hidden, train);
        }
        hidden.apply(&self.final_norm).apply(&self.out_head)
    }
}

impl Projections for Gpt {
    fn projections(&self) -> Vec<&Linear> {
        let mut projections: Vec<&Linear> =
            self.blocks.iter().flat_map(|block| block.projections()).collect();
        projections.push(&self.out_head);
        projections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, nn::VarStore};

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 130,
            sequence: 8,
            emb_dim: 32,
            n_heads: 4,
            n_layers: 2,
            droprate: 0.1,
            qkv_bias: true,
        }
    }

    fn scalar(t: &Tensor) -> f64 {
        f64::try_from(t).unwrap()
    }

    #[test]
    fn test_forward_output_shape() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), &tiny_config())?;
        let input = Tensor::from_slice2(&[&[72i64, 101, 108, 108, 111], &[100, 101, 102, 32, 58]]);
        let output = model.forward_t(&input, false);
        assert_eq!(output.size(), &[2, 5, 130]);
        assert_eq!(model.blocks.len(), 2);
        Ok(())
    }

    #[test]
    fn test_forward_full_sequence() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), &tiny_config())?;
        let input = Tensor::arange(8, (Kind::Int64, Device::Cpu)).unsqueeze(0);
        let output = model.forward_t(&input, true);
        assert_eq!(output.size(), &[1, 8, 130]);
        Ok(())
    }

    #[test]
    fn test_same_token_different_positions() {
        let vs = VarStore::new(Device::Cpu);
        let embeddings = Embeddings::new(&vs.root(), 130, 8, 32);
        // Same token at every position: outputs differ only through position embeddings
        let input = Tensor::ones([1, 4], (Kind::Int64, Device::Cpu)) * 65;
        let output = embeddings.forward(&input);
        let diff = (output.get(0).get(0) - output.get(0).get(1)).abs().sum(Kind::Float);
        assert!(scalar(&diff) > 0.0);
    }

    #[test]
    fn test_attention_weights_are_causal() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let attn = CausalSelfAttention::new(&vs.root(), 32, 32, 8, 0.0, 4, true)?;
        let input = Tensor::randn([3, 6, 32], (Float, Device::Cpu));
        let weights = attn.attention_weights(&input, false);
        assert_eq!(weights.size(), &[3, 4, 6, 6]);
        // Exactly zero above the diagonal, every row a distribution
        assert_eq!(scalar(&weights.triu(1).abs().max()), 0.0);
        let row_sums = weights.sum_dim_intlist(&[-1i64][..], false, Float);
        assert!(scalar(&(row_sums - 1.0).abs().max()) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_future_tokens_do_not_change_past_logits() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), &tiny_config())?;
        let input_a = Tensor::from_slice2(&[&[10i64, 20, 30, 40]]);
        let input_b = Tensor::from_slice2(&[&[10i64, 20, 30, 99]]);
        let output_a = model.forward_t(&input_a, false);
        let output_b = model.forward_t(&input_b, false);
        for pos in 0..3 {
            let diff = (output_a.get(0).get(pos) - output_b.get(0).get(pos))
                .abs()
                .sum(Float);
            assert!(
                scalar(&diff) < 1e-5,
                "Position {} changed when only a future token was modified",
                pos
            );
        }
        let diff3 = (output_a.get(0).get(3) - output_b.get(0).get(3)).abs().sum(Float);
        assert!(scalar(&diff3) > 1e-5, "Position 3 should have changed");
        Ok(())
    }

    #[test]
    fn test_uneven_head_split_is_rejected() {
        let vs = VarStore::new(Device::Cpu);
        assert!(CausalSelfAttention::new(&vs.root(), 30, 30, 8, 0.0, 4, true).is_err());
        let config = ModelConfig {
            emb_dim: 30,
            ..tiny_config()
        };
        assert!(Gpt::new(&vs.root(), &config).is_err());
    }

    #[test]
    fn test_projection_init() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), &tiny_config())?;
        // 4 per attention + 2 per feed-forward, per block, plus the output head
        assert_eq!(model.projections().len(), 2 * 6 + 1);
        for projection in model.projections() {
            let std = scalar(&projection.ws.std(true));
            assert!((0.015..0.025).contains(&std), "weight std {}", std);
            if let Some(bs) = &projection.bs {
                assert_eq!(scalar(&bs.abs().sum(Float)), 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_qkv_bias_flag() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let with_bias = CausalSelfAttention::new(&(vs.root() / "a"), 32, 32, 8, 0.0, 4, true)?;
        let without = CausalSelfAttention::new(&(vs.root() / "b"), 32, 32, 8, 0.0, 4, false)?;
        assert!(with_bias.query.bs.is_some());
        assert!(without.query.bs.is_none());
        assert!(without.key.bs.is_none() && without.value.bs.is_none());
        // the output projection always keeps its bias
        assert!(without.out_proj.bs.is_some());
        Ok(())
    }

    #[test]
    fn test_output_head_has_no_bias() -> Result<()> {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), &tiny_config())?;
        assert!(model.out_head.bs.is_none());
        Ok(())
    }
}
