pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod generate;
pub mod loader;
pub mod loss;
pub mod model;
pub mod predict;
pub mod runtime;
pub mod tokenizer;
pub mod train;

pub use config::{Config, load_config};
pub use dataset::{Dataset, WholeFileDataset, WindowedDataset};
pub use generate::{Generator, Sampler, StopReason};
pub use loader::{DataLoader, LoaderOptions};
pub use loss::CrossEntropy;
pub use model::Gpt;
pub use tokenizer::{TextCodec, load_tokenizer};
