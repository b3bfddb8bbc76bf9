//! All-to-all redistribution of rows into a new partitioning.
//!
//! The shuffle is its own stage with its own barrier:
//!
//! 1. Assignment: every input partition computes a target for each row and
//!    materializes the full assignment vector before moving anything. Key
//!    mode hashes the stringified key values with 64-bit FNV-1a, so the same
//!    keys land in the same partitions on every build; random mode draws from a
//!    `StdRng` seeded from `(seed, partition)`, so a retried partition gets
//!    the same assignment.
//! 2. Scatter: the partition is split into one slice per target with `take`.
//! 3. Gather (after all scatters finish): each target concatenates its
//!    slices in input-partition order. Random mode also permutes the rows of
//!    each target with an RNG seeded from `(seed, target)`.
//!
//! The result is an in-memory dataset with exactly `num_partitions`
//! partitions; some may be empty.

use arrow::array::UInt32Array;
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::categorify::stringify;
use crate::dataset::Dataset;
use crate::error::{PrepError, Result};
use crate::executor::Executor;
use crate::schema::column_type;

/// Mixes a seed with a partition index into an RNG seed.
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;
/// Keeps gather-side seeds apart from assignment-side seeds.
const GATHER_SALT: u64 = 0xD1B5_4A32_D192_ED03;

/// Fixed-algorithm 64-bit FNV-1a hash for key assignment.
#[derive(Copy, Clone, Debug)]
pub struct KeyHash(u64);

impl KeyHash {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self(Self::OFFSET_BASIS)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 ^ b as u64).wrapping_mul(Self::PRIME);
        }
    }

    /// Feed one key value; null and the empty string hash differently.
    pub fn update_key(&mut self, value: Option<&str>) {
        match value {
            Some(v) => {
                self.update(&[1]);
                self.update(v.as_bytes());
            }
            None => self.update(&[0]),
        }
        self.update(&[0x1f]);
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

impl Default for KeyHash {
    fn default() -> Self {
        Self::new()
    }
}

/// How rows pick their output partition.
#[derive(Debug, Clone, PartialEq)]
pub enum ShuffleMode {
    /// Hash of the listed key columns; equal keys land together.
    Key(Vec<String>),
    /// Uniform random assignment, reproducible for a given seed.
    Random { seed: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShuffleSpec {
    pub mode: ShuffleMode,
    pub num_partitions: usize,
}

impl ShuffleSpec {
    pub fn random(seed: u64, num_partitions: usize) -> Self {
        Self {
            mode: ShuffleMode::Random { seed },
            num_partitions,
        }
    }

    pub fn by_key(columns: Vec<String>, num_partitions: usize) -> Self {
        Self {
            mode: ShuffleMode::Key(columns),
            num_partitions,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(PrepError::validation(
                "Shuffle needs an explicit partition count > 0",
            ));
        }
        if self.num_partitions > u32::MAX as usize {
            return Err(PrepError::validation(format!(
                "Shuffle partition count {} is too large",
                self.num_partitions
            )));
        }
        if let ShuffleMode::Key(columns) = &self.mode {
            if columns.is_empty() {
                return Err(PrepError::validation("Key shuffle needs at least one column"));
            }
        }
        Ok(())
    }
}

/// What a shuffle did.
#[derive(Debug, Clone)]
pub struct ShuffleReport {
    pub input_partitions: usize,
    pub output_partitions: usize,
    pub total_rows: usize,
    /// Rows whose output partition index differs from their input index.
    pub rows_moved: usize,
    pub rows_per_partition: Vec<usize>,
    pub elapsed: Duration,
}

/// Redistributes a dataset according to a [`ShuffleSpec`].
#[derive(Debug, Clone)]
pub struct ShuffleStage {
    spec: ShuffleSpec,
}

impl ShuffleStage {
    pub fn new(spec: ShuffleSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ShuffleSpec {
        &self.spec
    }

    pub fn run<E: Executor>(
        &self,
        dataset: &Dataset,
        executor: &E,
    ) -> Result<(Dataset, ShuffleReport)> {
        self.spec.validate()?;
        let t_start = Instant::now();
        let schema = dataset.schema();
        let key_indices = match &self.spec.mode {
            ShuffleMode::Key(columns) => columns
                .iter()
                .map(|c| column_type(&schema, c).map(|(idx, _)| idx))
                .collect::<Result<Vec<_>>>()?,
            ShuffleMode::Random { .. } => Vec::new(),
        };
        let targets = self.spec.num_partitions;
        let inputs = dataset.num_partitions();

        log::info!(
            "Shuffle start: {} partition(s) -> {} partition(s), {} rows",
            inputs,
            targets,
            dataset.total_rows()
        );

        // Assignment and scatter, one unit per input partition.
        let scattered = executor.run("shuffle-scatter", inputs, |i| {
            let partition = dataset.read_partition(i)?;
            let batch = partition.batch();
            let assignment = self.assign(batch, i, &key_indices)?;
            let moved = assignment.iter().filter(|&&t| t as usize != i).count();
            Ok((scatter(batch, &assignment, targets)?, moved))
        })?;

        let rows_moved = scattered.iter().map(|(_, moved)| moved).sum();
        let slices: Vec<Vec<RecordBatch>> = scattered.into_iter().map(|(s, _)| s).collect();

        // Barrier: every input has contributed before any gather runs.
        let gathered = executor.run("shuffle-gather", targets, |t| {
            let parts: Vec<&RecordBatch> = slices
                .iter()
                .map(|per_target| &per_target[t])
                .filter(|b| b.num_rows() > 0)
                .collect();
            let batch = gather(&schema, &parts)?;
            match &self.spec.mode {
                ShuffleMode::Random { seed } => permute(&batch, *seed, t),
                ShuffleMode::Key(_) => Ok(batch),
            }
        })?;

        let rows_per_partition: Vec<usize> = gathered.iter().map(|b| b.num_rows()).collect();
        let total_rows = rows_per_partition.iter().sum();
        let shuffled = Dataset::from_schema_and_batches(schema, gathered)?;

        let report = ShuffleReport {
            input_partitions: inputs,
            output_partitions: targets,
            total_rows,
            rows_moved,
            rows_per_partition,
            elapsed: t_start.elapsed(),
        };
        log::info!(
            "Shuffle done: {} rows ({} moved) into {} partition(s) in {:.2?}",
            report.total_rows,
            report.rows_moved,
            report.output_partitions,
            report.elapsed
        );
        Ok((shuffled, report))
    }

    /// Target partition for every row of `batch`.
    fn assign(
        &self,
        batch: &RecordBatch,
        partition: usize,
        key_indices: &[usize],
    ) -> Result<Vec<u32>> {
        let targets = self.spec.num_partitions as u64;
        match &self.spec.mode {
            ShuffleMode::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(mix_seed(*seed, partition as u64));
                Ok((0..batch.num_rows())
                    .map(|_| rng.gen_range(0..targets) as u32)
                    .collect())
            }
            ShuffleMode::Key(_) => {
                let keys: Vec<Vec<Option<String>>> = key_indices
                    .iter()
                    .map(|&idx| stringify(batch.column(idx).as_ref()))
                    .collect::<Result<_>>()?;
                Ok((0..batch.num_rows())
                    .map(|row| {
                        let mut hasher = KeyHash::new();
                        for column in &keys {
                            hasher.update_key(column[row].as_deref());
                        }
                        (hasher.finish() % targets) as u32
                    })
                    .collect())
            }
        }
    }
}

fn mix_seed(seed: u64, index: u64) -> u64 {
    seed ^ index.wrapping_add(1).wrapping_mul(SEED_MIX)
}

/// Split `batch` into one slice per target, keeping row order inside each.
fn scatter(batch: &RecordBatch, assignment: &[u32], targets: usize) -> Result<Vec<RecordBatch>> {
    let mut indices: Vec<Vec<u32>> = vec![Vec::new(); targets];
    for (row, &target) in assignment.iter().enumerate() {
        indices[target as usize].push(row as u32);
    }
    indices
        .into_iter()
        .map(|rows| {
            if rows.is_empty() {
                return Ok(RecordBatch::new_empty(batch.schema()));
            }
            Ok(take_record_batch(batch, &UInt32Array::from(rows))?)
        })
        .collect()
}

fn gather(schema: &SchemaRef, parts: &[&RecordBatch]) -> Result<RecordBatch> {
    match parts {
        [] => Ok(RecordBatch::new_empty(schema.clone())),
        [single] => Ok((*single).clone()),
        _ => Ok(concat_batches(schema, parts.iter().copied())?),
    }
}

/// Reorder rows of an output partition with an RNG seeded by `(seed, target)`.
fn permute(batch: &RecordBatch, seed: u64, target: usize) -> Result<RecordBatch> {
    if batch.num_rows() < 2 {
        return Ok(batch.clone());
    }
    let mut rng = StdRng::seed_from_u64(mix_seed(seed ^ GATHER_SALT, target as u64));
    let mut order: Vec<u32> = (0..batch.num_rows() as u32).collect();
    order.shuffle(&mut rng);
    Ok(take_record_batch(batch, &UInt32Array::from(order))?)
}
