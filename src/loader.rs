use anyhow::{Result, ensure};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

use crate::dataset::Dataset;

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Gather threads; 0 gathers on the calling thread.
    pub num_workers: usize,
    pub pin_memory: bool,
    pub drop_last: bool,
    /// Seeds the permutation shuffle.
    pub seed: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            batch_size: 1,
            shuffle: false,
            num_workers: 0,
            pin_memory: false,
            drop_last: false,
            seed: 0,
        }
    }
}

/// Number of batches one epoch yields.
pub fn batches_per_epoch(size: usize, batch_size: usize, drop_last: bool) -> usize {
    if drop_last {
        let full = size / batch_size;
        if full == 0 && size > 0 { 1 } else { full }
    } else {
        size.div_ceil(batch_size)
    }
}

/// Walks a dataset in batches, one epoch at a time.
///
/// Each epoch ends with exactly one `None`; the following call starts the next
/// epoch (reshuffling first when enabled).
pub struct DataLoader<'a, D: Dataset> {
    dataset: &'a D,
    batch_size: usize,
    shuffle: bool,
    pin_memory: bool,
    pool: Option<rayon::ThreadPool>,
    order: Vec<usize>,
    /// Set when the next epoch start should draw a fresh permutation.
    reshuffle: bool,
    count: usize,
    count_max: usize,
    rng: StdRng,
}

impl<'a, D: Dataset> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, options: LoaderOptions) -> Result<Self> {
        ensure!(options.batch_size > 0, "batch_size must be positive");
        let pool = if options.num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.num_workers)
                    .build()?,
            )
        } else {
            None
        };
        let size = dataset.len();
        Ok(DataLoader {
            dataset,
            batch_size: options.batch_size,
            shuffle: options.shuffle,
            pin_memory: options.pin_memory,
            pool,
            order: (0..size).collect(),
            reshuffle: true,
            count: 0,
            count_max: batches_per_epoch(size, options.batch_size, options.drop_last),
            rng: StdRng::seed_from_u64(options.seed),
        })
    }

    /// Next batch of the current epoch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<D::Batch>> {
        if self.count == self.count_max {
            self.count = 0;
            self.reshuffle = true;
            return Ok(None);
        }
        if self.count == 0 && self.shuffle && self.reshuffle {
            self.order.shuffle(&mut self.rng);
            self.reshuffle = false;
        }

        let start = self.batch_size * self.count;
        let end = (start + self.batch_size).min(self.order.len());
        let positions = &self.order[start..end];
        let dataset = self.dataset;
        // Indexed collect: every task fills only its own slot, in permutation order.
        let items: Vec<D::Item> = match &self.pool {
            Some(pool) => pool.install(|| positions.par_iter().map(|&i| dataset.get(i)).collect()),
            None => positions.iter().map(|&i| dataset.get(i)).collect(),
        };
        let batch = D::collate(items, self.pin_memory)?;

        self.count += 1;
        Ok(Some(batch))
    }

    /// Rewinds to the start of the epoch; the permutation is left as is.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.count_max
    }
}

impl<D: Dataset> Iterator for DataLoader<'_, D> {
    type Item = Result<D::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::WindowedDataset;
    use crate::tokenizer::AsciiTokenizer;
    use std::io::Write;

    /// Dataset whose item is its own index.
    struct Indices(usize);

    impl Dataset for Indices {
        type Item = usize;
        type Batch = Vec<usize>;

        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize) -> usize {
            index
        }

        fn collate(items: Vec<usize>, _pin_memory: bool) -> Result<Vec<usize>> {
            Ok(items)
        }
    }

    fn epoch<D: Dataset>(loader: &mut DataLoader<'_, D>) -> Result<Vec<D::Batch>> {
        loader.by_ref().collect()
    }

    fn options(batch_size: usize, drop_last: bool) -> LoaderOptions {
        LoaderOptions {
            batch_size,
            drop_last,
            ..LoaderOptions::default()
        }
    }

    #[test]
    fn test_batch_sizes_keep_last() -> Result<()> {
        let ds = Indices(7);
        let mut loader = DataLoader::new(&ds, options(3, false))?;
        let batches = epoch(&mut loader)?;
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(loader.batches_per_epoch(), 3);
        Ok(())
    }

    #[test]
    fn test_batch_sizes_drop_last() -> Result<()> {
        let ds = Indices(7);
        let mut loader = DataLoader::new(&ds, options(3, true))?;
        let batches = epoch(&mut loader)?;
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        Ok(())
    }

    #[test]
    fn test_drop_last_keeps_one_short_batch() -> Result<()> {
        let ds = Indices(2);
        let mut loader = DataLoader::new(&ds, options(5, true))?;
        assert_eq!(epoch(&mut loader)?, vec![vec![0, 1]]);
        Ok(())
    }

    #[test]
    fn test_batch_count_formula() {
        for size in 0..30 {
            for batch in 1..8 {
                assert_eq!(batches_per_epoch(size, batch, false), (size + batch - 1) / batch);
                let expected = if size > 0 { (size / batch).max(1) } else { 0 };
                assert_eq!(batches_per_epoch(size, batch, true), expected);
            }
        }
    }

    #[test]
    fn test_empty_dataset_ends_immediately() -> Result<()> {
        let ds = Indices(0);
        let mut loader = DataLoader::new(
            &ds,
            LoaderOptions {
                shuffle: true,
                ..options(4, false)
            },
        )?;
        assert!(loader.next_batch()?.is_none());
        assert!(loader.next_batch()?.is_none());
        Ok(())
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let ds = Indices(3);
        assert!(DataLoader::new(&ds, options(0, false)).is_err());
    }

    #[test]
    fn test_shuffle_is_a_permutation_every_epoch() -> Result<()> {
        let ds = Indices(50);
        let mut loader = DataLoader::new(
            &ds,
            LoaderOptions {
                shuffle: true,
                seed: 7,
                ..options(8, false)
            },
        )?;
        let mut orders = Vec::new();
        for _ in 0..3 {
            let seen: Vec<usize> = epoch(&mut loader)?.into_iter().flatten().collect();
            let mut sorted = seen.clone();
            sorted.sort();
            assert_eq!(sorted, (0..50).collect::<Vec<_>>());
            orders.push(seen);
        }
        assert!(orders[0] != orders[1] || orders[1] != orders[2], "shuffle never changed order");
        Ok(())
    }

    #[test]
    fn test_same_seed_same_order() -> Result<()> {
        let ds = Indices(20);
        let shuffled = || LoaderOptions {
            shuffle: true,
            seed: 42,
            ..options(6, false)
        };
        let a = epoch(&mut DataLoader::new(&ds, shuffled())?)?;
        let b = epoch(&mut DataLoader::new(&ds, shuffled())?)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_workers_preserve_order() -> Result<()> {
        let ds = Indices(37);
        let serial = epoch(&mut DataLoader::new(
            &ds,
            LoaderOptions {
                shuffle: true,
                seed: 3,
                ..options(5, false)
            },
        )?)?;
        let parallel = epoch(&mut DataLoader::new(
            &ds,
            LoaderOptions {
                shuffle: true,
                seed: 3,
                num_workers: 4,
                ..options(5, false)
            },
        )?)?;
        assert_eq!(serial, parallel);
        Ok(())
    }

    #[test]
    fn test_reset_rewinds_without_reshuffling() -> Result<()> {
        let ds = Indices(10);
        let mut loader = DataLoader::new(&ds, options(4, false))?;
        let first = loader.next_batch()?;
        loader.next_batch()?;
        loader.reset();
        assert_eq!(loader.next_batch()?, first);
        Ok(())
    }

    #[test]
    fn test_reset_keeps_shuffled_order() -> Result<()> {
        let ds = Indices(30);
        let mut loader = DataLoader::new(
            &ds,
            LoaderOptions {
                shuffle: true,
                seed: 5,
                ..options(4, false)
            },
        )?;
        let first = loader.next_batch()?;
        let second = loader.next_batch()?;
        loader.reset();
        // back at count 0, but the permutation drawn for this epoch stays
        assert_eq!(loader.next_batch()?, first);
        assert_eq!(loader.next_batch()?, second);
        Ok(())
    }

    #[test]
    fn test_windowed_batches_are_stacked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = std::fs::File::create(dir.path().join("corpus.txt"))?;
        write!(f, "abcdefghij")?;
        let tokenizer = AsciiTokenizer::new();
        // 11 tokens, sequence 2, stride 1 -> 9 windows
        let ds = WindowedDataset::new(dir.path(), &tokenizer, 2, 1, 0, 1)?;
        assert_eq!(ds.len(), 9);
        let mut loader = DataLoader::new(
            &ds,
            LoaderOptions {
                num_workers: 2,
                ..options(4, false)
            },
        )?;
        let shapes: Vec<Vec<i64>> = epoch(&mut loader)?
            .iter()
            .map(|batch| {
                assert_eq!(batch.inputs.size(), batch.targets.size());
                batch.inputs.size()
            })
            .collect();
        assert_eq!(shapes, vec![vec![4, 2], vec![4, 2], vec![1, 2]]);
        Ok(())
    }
}
