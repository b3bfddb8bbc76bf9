//! Global categorical encoding.
//!
//! [`Categorifier::build_dictionary`] runs one parallel pass that counts
//! every distinct value per column (and per combo column), merges the
//! per-partition counts at the barrier and assigns dense codes:
//!
//! - order is frequency descending, then value ascending (byte order)
//! - codes start at 1; [`UNSEEN_CODE`] (0) stands for null and unseen values
//! - values seen fewer than `freq_threshold` times get no code
//!
//! A combo column encodes several source columns as one key: the stringified
//! source values joined with [`COMBO_KEY_SEPARATOR`]. A null in any source
//! makes the combo value null. The combo column is named by joining the
//! source names with `_`.
//!
//! The dictionary is immutable once built and is shared between partitions
//! through an `Arc`. It can be saved to a directory and loaded back exactly:
//!
//! ```text
//! categories.toml              magic, version, column order, combos,
//!                              and the values file of each column
//! unique.<nnn>.parquet         (code: u32, value: large_utf8, count: u64)
//! ```

use arrow::array::{Array, ArrayRef, LargeStringArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::{WriterProperties, WriterVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::constants::{
    files, COMBO_KEY_SEPARATOR, COMBO_NAME_SEPARATOR, DICTIONARY_MAGIC, FORMAT_VERSION,
    UNSEEN_CODE,
};
use crate::dataset::Dataset;
use crate::error::{PrepError, Result};
use crate::executor::Executor;
use crate::schema::column_type;
use crate::transform::ColumnTransform;

/// A synthetic categorical column built from two or more source columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboColumn {
    pub sources: Vec<String>,
}

impl ComboColumn {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    /// Output column name: source names joined with `_`.
    pub fn name(&self) -> String {
        self.sources.join(COMBO_NAME_SEPARATOR)
    }
}

/// Codes for one encoded column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDictionary {
    /// Value for code `i + 1`.
    values: Vec<String>,
    counts: Vec<u64>,
    codes: HashMap<String, u32>,
}

impl ColumnDictionary {
    /// Build from merged frequencies, dropping values below `freq_threshold`.
    pub fn from_frequencies(frequencies: HashMap<String, u64>, freq_threshold: u64) -> Self {
        let mut entries: Vec<(String, u64)> = frequencies
            .into_iter()
            .filter(|(_, count)| *count >= freq_threshold)
            .collect();
        entries.sort_by(|(va, ca), (vb, cb)| cb.cmp(ca).then_with(|| va.cmp(vb)));
        let (values, counts) = entries.into_iter().unzip();
        Self::from_ordered(values, counts)
    }

    fn from_ordered(values: Vec<String>, counts: Vec<u64>) -> Self {
        let codes = values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32 + 1))
            .collect();
        Self {
            values,
            counts,
            codes,
        }
    }

    /// Code for `value`, or [`UNSEEN_CODE`] when it has none.
    pub fn encode(&self, value: &str) -> u32 {
        self.codes.get(value).copied().unwrap_or(UNSEEN_CODE)
    }

    /// Value for `code`; `None` for the sentinel and out-of-range codes.
    pub fn decode(&self, code: u32) -> Option<&str> {
        if code == UNSEEN_CODE {
            return None;
        }
        self.values.get(code as usize - 1).map(String::as_str)
    }

    /// Frequency observed for `code` when the dictionary was built.
    pub fn count(&self, code: u32) -> Option<u64> {
        if code == UNSEEN_CODE {
            return None;
        }
        self.counts.get(code as usize - 1).copied()
    }

    /// Number of coded values; valid codes are `1..=len()`.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Dictionaries for every plain and combo column of one Categorifier run.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDictionary {
    columns: Vec<String>,
    combos: Vec<ComboColumn>,
    dictionaries: HashMap<String, ColumnDictionary>,
}

impl CategoryDictionary {
    /// Plain categorical columns, in encoding order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn combos(&self) -> &[ComboColumn] {
        &self.combos
    }

    /// Every encoded column name: plain columns, then combo columns.
    pub fn encoded_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .cloned()
            .chain(self.combos.iter().map(ComboColumn::name))
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDictionary> {
        self.dictionaries.get(name)
    }

    fn require(&self, name: &str) -> Result<&ColumnDictionary> {
        self.dictionaries.get(name).ok_or_else(|| {
            PrepError::validation(format!("Column '{}' is not in the category dictionary", name))
        })
    }

    /// Code for `value` in `column`. Unseen values encode as [`UNSEEN_CODE`].
    pub fn encode(&self, column: &str, value: &str) -> Result<u32> {
        Ok(self.require(column)?.encode(value))
    }

    pub fn decode(&self, column: &str, code: u32) -> Result<Option<&str>> {
        Ok(self.require(column)?.decode(code))
    }

    /// Dictionary from already-built parts; `load` checks them afterwards.
    pub(crate) fn from_parts(
        columns: Vec<String>,
        combos: Vec<ComboColumn>,
        dictionaries: HashMap<String, ColumnDictionary>,
    ) -> Self {
        Self {
            columns,
            combos,
            dictionaries,
        }
    }

    /// Write the dictionary to `dir`, replacing whatever was there.
    ///
    /// Files are written into a hidden sibling directory that is renamed to
    /// `dir` only once every file is complete, so `dir` is either absent,
    /// the previous dictionary, or the new one.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let name = dir.file_name().ok_or_else(|| {
            PrepError::validation(format!(
                "Dictionary directory has no name: {}",
                dir.display()
            ))
        })?;
        let staging = dir.with_file_name(files::temp_name(&name.to_string_lossy()));
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| PrepError::io(&staging, "remove stale dictionary dir", e))?;
        }
        fs::create_dir_all(&staging)
            .map_err(|e| PrepError::io(&staging, "create dictionary dir", e))?;

        if let Err(e) = self.write_files(&staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if dir.exists() {
            fs::remove_dir_all(dir)
                .map_err(|e| PrepError::io(dir, "remove previous dictionary", e))?;
        }
        fs::rename(&staging, dir).map_err(|e| PrepError::io(dir, "rename dictionary dir", e))?;

        log::debug!("Saved category dictionary to {}", dir.display());
        Ok(())
    }

    /// Unique-value files are named by position; the header maps columns to files.
    fn write_files(&self, dir: &Path) -> Result<()> {
        let mut entries = Vec::new();
        for (n, name) in self.encoded_columns().into_iter().enumerate() {
            let dictionary = self.require(&name)?;
            let file = files::unique_file(n);
            write_unique_parquet(&dir.join(&file), dictionary)?;
            entries.push(DictionaryEntry {
                column: name,
                file,
                num_values: dictionary.len() as u64,
            });
        }

        let header = DictionaryFile {
            magic: DICTIONARY_MAGIC.to_string(),
            format_version: FORMAT_VERSION,
            columns: self.columns.clone(),
            combos: self.combos.clone(),
            entries,
        };
        let path = dir.join(files::DICTIONARY);
        let toml_str = toml::to_string_pretty(&header)
            .map_err(|e| PrepError::format(&path, format!("serialize: {}", e)))?;
        fs::write(&path, toml_str).map_err(|e| PrepError::io(&path, "write dictionary", e))
    }

    /// Load a dictionary written by [`save`](Self::save).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(files::DICTIONARY);
        let toml_str =
            fs::read_to_string(&path).map_err(|e| PrepError::io(&path, "read dictionary", e))?;
        let header: DictionaryFile = toml::from_str(&toml_str)
            .map_err(|e| PrepError::format(&path, format!("invalid TOML: {}", e)))?;

        if header.magic != DICTIONARY_MAGIC {
            return Err(PrepError::format(
                &path,
                format!(
                    "invalid magic: expected '{}', got '{}'",
                    DICTIONARY_MAGIC, header.magic
                ),
            ));
        }
        if header.format_version > FORMAT_VERSION {
            return Err(PrepError::format(
                &path,
                format!(
                    "unsupported format version {} (max {})",
                    header.format_version, FORMAT_VERSION
                ),
            ));
        }

        let mut dictionaries = HashMap::new();
        for entry in &header.entries {
            if !is_plain_file_name(&entry.file) {
                return Err(PrepError::format(
                    &path,
                    format!("invalid values file name '{}'", entry.file),
                ));
            }
            let dictionary = read_unique_parquet(&dir.join(&entry.file))?;
            if dictionary.len() as u64 != entry.num_values {
                return Err(PrepError::format(
                    dir.join(&entry.file),
                    format!(
                        "expected {} values, found {}",
                        entry.num_values,
                        dictionary.len()
                    ),
                ));
            }
            dictionaries.insert(entry.column.clone(), dictionary);
        }

        let dictionary = Self::from_parts(header.columns, header.combos, dictionaries);
        for name in dictionary.encoded_columns() {
            if !dictionary.dictionaries.contains_key(&name) {
                return Err(PrepError::format(
                    &path,
                    format!("missing values for column '{}'", name),
                ));
            }
        }
        Ok(dictionary)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DictionaryFile {
    magic: String,
    format_version: u32,
    columns: Vec<String>,
    #[serde(default)]
    combos: Vec<ComboColumn>,
    entries: Vec<DictionaryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DictionaryEntry {
    column: String,
    file: String,
    num_values: u64,
}

/// A single path component that stays inside the dictionary directory.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn unique_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("code", DataType::UInt32, false),
        Field::new("value", DataType::LargeUtf8, false),
        Field::new("count", DataType::UInt64, false),
    ]))
}

fn write_unique_parquet(path: &Path, dictionary: &ColumnDictionary) -> Result<()> {
    let schema = unique_schema();
    let codes: ArrayRef = Arc::new(UInt32Array::from_iter_values(
        (1..=dictionary.len()).map(|c| c as u32),
    ));
    let values: ArrayRef = Arc::new(LargeStringArray::from_iter_values(
        dictionary.values.iter(),
    ));
    let counts: ArrayRef = Arc::new(UInt64Array::from(dictionary.counts.clone()));
    let batch = RecordBatch::try_new(schema.clone(), vec![codes, values, counts])?;

    let props = WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::ZSTD(Default::default()))
        .build();
    let file = File::create(path).map_err(|e| PrepError::io(path, "create values file", e))?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn read_unique_parquet(path: &Path) -> Result<ColumnDictionary> {
    let file = File::open(path).map_err(|e| PrepError::io(path, "open values file", e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut values = Vec::new();
    let mut counts = Vec::new();
    for batch in reader {
        let batch = batch?;
        let codes = batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt32Array>()
            .ok_or_else(|| PrepError::format(path, "expected UInt32Array for code"))?;
        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<LargeStringArray>()
            .ok_or_else(|| PrepError::format(path, "expected LargeStringArray for value"))?;
        let freqs = batch
            .column(2)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| PrepError::format(path, "expected UInt64Array for count"))?;

        for i in 0..batch.num_rows() {
            let expected = values.len() as u32 + 1;
            if codes.value(i) != expected {
                return Err(PrepError::format(
                    path,
                    format!("codes not dense: expected {}, got {}", expected, codes.value(i)),
                ));
            }
            values.push(names.value(i).to_string());
            counts.push(freqs.value(i));
        }
    }
    Ok(ColumnDictionary::from_ordered(values, counts))
}

/// Where a built dictionary lives between building and applying it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CategoryCache {
    #[default]
    Memory,
    /// Saved to this directory and reloaded before use.
    Disk(PathBuf),
}

impl CategoryCache {
    /// Pass the dictionary through the cache.
    pub fn persist(&self, dictionary: CategoryDictionary) -> Result<CategoryDictionary> {
        match self {
            CategoryCache::Memory => Ok(dictionary),
            CategoryCache::Disk(dir) => {
                dictionary.save(dir)?;
                CategoryDictionary::load(dir)
            }
        }
    }
}

/// Stringify every value of `array`; nulls stay `None`.
pub(crate) fn stringify(array: &dyn Array) -> Result<Vec<Option<String>>> {
    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(array, &options)?;
    Ok((0..array.len())
        .map(|i| (!array.is_null(i)).then(|| formatter.value(i).to_string()))
        .collect())
}

/// Combo keys for the given source arrays; a null in any source gives `None`.
fn combo_keys(sources: &[&dyn Array]) -> Result<Vec<Option<String>>> {
    let rows = sources.first().map(|a| a.len()).unwrap_or(0);
    let mut keys: Vec<Option<String>> = vec![Some(String::new()); rows];
    for (n, source) in sources.iter().enumerate() {
        for (key, value) in keys.iter_mut().zip(stringify(*source)?) {
            match value {
                Some(v) => {
                    if let Some(k) = key.as_mut() {
                        if n > 0 {
                            k.push(COMBO_KEY_SEPARATOR);
                        }
                        k.push_str(&v);
                    }
                }
                None => *key = None,
            }
        }
    }
    Ok(keys)
}

/// Builds a [`CategoryDictionary`] for plain and combo columns.
#[derive(Debug, Clone)]
pub struct Categorifier {
    columns: Vec<String>,
    combos: Vec<ComboColumn>,
    freq_threshold: u64,
}

impl Categorifier {
    pub fn new(columns: Vec<String>, combos: Vec<ComboColumn>) -> Self {
        Self {
            columns,
            combos,
            freq_threshold: 0,
        }
    }

    /// Leave values seen fewer than `threshold` times out of the dictionary.
    pub fn freq_threshold(mut self, threshold: u64) -> Self {
        self.freq_threshold = threshold;
        self
    }

    /// Resolve plain columns and combo sources to schema indices.
    #[allow(clippy::type_complexity)]
    fn plan(&self, schema: &Schema) -> Result<(Vec<usize>, Vec<Vec<usize>>)> {
        if self.columns.is_empty() && self.combos.is_empty() {
            return Err(PrepError::validation(
                "Categorify needs at least one column or combo",
            ));
        }

        let mut names: Vec<String> = Vec::new();
        let mut plain = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let (idx, _) = column_type(schema, column)?;
            plain.push(idx);
            names.push(column.clone());
        }

        let mut combos = Vec::with_capacity(self.combos.len());
        for combo in &self.combos {
            if combo.sources.len() < 2 {
                return Err(PrepError::validation(format!(
                    "Combo {:?} needs at least two source columns",
                    combo.sources
                )));
            }
            let name = combo.name();
            if schema.column_with_name(&name).is_some() {
                return Err(PrepError::validation(format!(
                    "Combo column '{}' collides with an existing column",
                    name
                )));
            }
            let indices = combo
                .sources
                .iter()
                .map(|s| column_type(schema, s).map(|(idx, _)| idx))
                .collect::<Result<Vec<_>>>()?;
            combos.push(indices);
            names.push(name);
        }

        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(PrepError::validation(format!(
                    "Categorical column '{}' listed twice",
                    name
                )));
            }
        }
        Ok((plain, combos))
    }

    /// Per-column value counts for one batch: plain columns, then combos.
    fn count_batch(
        &self,
        batch: &RecordBatch,
        plain: &[usize],
        combos: &[Vec<usize>],
    ) -> Result<Vec<HashMap<String, u64>>> {
        let mut out = Vec::with_capacity(plain.len() + combos.len());
        for &idx in plain {
            out.push(count_values(stringify(batch.column(idx).as_ref())?));
        }
        for sources in combos {
            let arrays: Vec<&dyn Array> =
                sources.iter().map(|&i| batch.column(i).as_ref()).collect();
            out.push(count_values(combo_keys(&arrays)?));
        }
        Ok(out)
    }

    /// Count every value over the dataset and assign codes.
    pub fn build_dictionary<E: Executor>(
        &self,
        dataset: &Dataset,
        executor: &E,
    ) -> Result<CategoryDictionary> {
        let t_start = Instant::now();
        let (plain, combos) = self.plan(&dataset.schema())?;
        log::info!(
            "Building category dictionary for {} column(s) and {} combo(s)",
            self.columns.len(),
            self.combos.len()
        );

        let partials = executor.run("categorify", dataset.num_partitions(), |i| {
            let partition = dataset.read_partition(i)?;
            self.count_batch(partition.batch(), &plain, &combos)
        })?;

        let mut merged: Vec<HashMap<String, u64>> =
            vec![HashMap::new(); plain.len() + combos.len()];
        for partition_counts in partials {
            for (acc, counts) in merged.iter_mut().zip(partition_counts) {
                for (value, count) in counts {
                    *acc.entry(value).or_insert(0) += count;
                }
            }
        }

        let names = self
            .columns
            .iter()
            .cloned()
            .chain(self.combos.iter().map(ComboColumn::name));
        let dictionaries: HashMap<String, ColumnDictionary> = names
            .zip(merged)
            .map(|(name, counts)| {
                let dictionary = ColumnDictionary::from_frequencies(counts, self.freq_threshold);
                log::info!("  {}: {} distinct value(s)", name, dictionary.len());
                (name, dictionary)
            })
            .collect();

        log::info!("Category dictionary built in {:.2?}", t_start.elapsed());
        Ok(CategoryDictionary {
            columns: self.columns.clone(),
            combos: self.combos.clone(),
            dictionaries,
        })
    }
}

fn count_values(values: Vec<Option<String>>) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for value in values.into_iter().flatten() {
        *counts.entry(value).or_insert(0) += 1;
    }
    counts
}

/// Replaces categorical columns with `uint32` codes and appends combo
/// code columns after the existing ones.
#[derive(Debug, Clone)]
pub struct CategorifyTransform {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    dictionary: Arc<CategoryDictionary>,
    plain: Vec<usize>,
    combos: Vec<Vec<usize>>,
}

impl CategorifyTransform {
    pub fn new(dictionary: Arc<CategoryDictionary>, input_schema: SchemaRef) -> Result<Self> {
        let categorifier =
            Categorifier::new(dictionary.columns.clone(), dictionary.combos.clone());
        let (plain, combos) = categorifier.plan(&input_schema)?;

        let mut fields: Vec<Field> = input_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        for &idx in &plain {
            let name = fields[idx].name().clone();
            fields[idx] = Field::new(name, DataType::UInt32, false);
        }
        for combo in &dictionary.combos {
            fields.push(Field::new(combo.name(), DataType::UInt32, false));
        }

        Ok(Self {
            output_schema: Arc::new(Schema::new(fields)),
            input_schema,
            dictionary,
            plain,
            combos,
        })
    }

    pub fn dictionary(&self) -> &Arc<CategoryDictionary> {
        &self.dictionary
    }

    fn encode_all(&self, column: &str, values: Vec<Option<String>>) -> Result<ArrayRef> {
        let dictionary = self.dictionary.require(column)?;
        let codes = values.iter().map(|v| match v {
            Some(v) => dictionary.encode(v),
            None => UNSEEN_CODE,
        });
        Ok(Arc::new(UInt32Array::from_iter_values(codes)))
    }
}

impl ColumnTransform for CategorifyTransform {
    fn name(&self) -> &'static str {
        "categorify"
    }

    fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        if batch.schema().fields() != self.input_schema.fields() {
            return Err(PrepError::validation(
                "categorify: batch schema does not match the schema the transform was built for",
            ));
        }
        let mut arrays: Vec<ArrayRef> = batch.columns().to_vec();
        for (&idx, column) in self.plain.iter().zip(&self.dictionary.columns) {
            let values = stringify(batch.column(idx).as_ref())?;
            arrays[idx] = self.encode_all(column, values)?;
        }
        for (sources, combo) in self.combos.iter().zip(&self.dictionary.combos) {
            let source_arrays: Vec<&dyn Array> =
                sources.iter().map(|&i| batch.column(i).as_ref()).collect();
            arrays.push(self.encode_all(&combo.name(), combo_keys(&source_arrays)?)?);
        }
        Ok(RecordBatch::try_new(self.output_schema.clone(), arrays)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ParallelExecutor, SequentialExecutor};
    use arrow::array::{Int64Array, StringArray};
    use tempfile::TempDir;

    fn batch(cats: Vec<Option<&str>>, regions: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("cat", DataType::Utf8, true),
            Field::new("region", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(cats)),
                Arc::new(Int64Array::from(regions)),
            ],
        )
        .unwrap()
    }

    fn dataset() -> Dataset {
        Dataset::from_batches(vec![
            batch(
                vec![Some("b"), Some("a"), Some("b"), None],
                vec![Some(1), Some(2), Some(1), Some(1)],
            ),
            batch(
                vec![Some("c"), Some("a"), Some("b")],
                vec![Some(2), None, Some(1)],
            ),
        ])
        .unwrap()
    }

    fn categorifier() -> Categorifier {
        Categorifier::new(
            vec!["cat".to_string()],
            vec![ComboColumn::new(["cat", "region"])],
        )
    }

    #[test]
    fn test_frequency_then_lexical_order() {
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        let cat = dict.column("cat").unwrap();
        // b x3, a x2, c x1
        assert_eq!(cat.values(), &["b", "a", "c"]);
        assert_eq!(dict.encode("cat", "b").unwrap(), 1);
        assert_eq!(dict.encode("cat", "zzz").unwrap(), UNSEEN_CODE);
        assert_eq!(dict.decode("cat", 2).unwrap(), Some("a"));
        assert_eq!(cat.count(1), Some(3));
    }

    #[test]
    fn test_combo_keys_and_nulls() {
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        let combo = dict.column("cat_region").unwrap();
        let b1 = format!("b{}1", COMBO_KEY_SEPARATOR);
        // (b,1) x3 first; (a,2) and (c,2) once each; rows with a null source skipped.
        assert_eq!(combo.values()[0], b1);
        assert_eq!(combo.len(), 3);
        assert_eq!(combo.count(1), Some(3));
    }

    #[test]
    fn test_dictionary_is_deterministic() {
        let ds = dataset();
        let a = categorifier()
            .build_dictionary(&ds, &ParallelExecutor::new())
            .unwrap();
        let b = categorifier()
            .build_dictionary(&ds, &SequentialExecutor::new())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_freq_threshold_drops_rare_values() {
        let dict = categorifier()
            .freq_threshold(2)
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        assert_eq!(dict.column("cat").unwrap().values(), &["b", "a"]);
        assert_eq!(dict.encode("cat", "c").unwrap(), UNSEEN_CODE);
    }

    #[test]
    fn test_transform_codes_in_range() {
        let ds = dataset();
        let dict = Arc::new(
            categorifier()
                .build_dictionary(&ds, &SequentialExecutor::new())
                .unwrap(),
        );
        let transform = CategorifyTransform::new(dict.clone(), ds.schema()).unwrap();
        let out = ds.with_transform(Arc::new(transform)).unwrap();

        let schema = out.schema();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.field(0).data_type(), &DataType::UInt32);
        assert_eq!(schema.field(2).name(), "cat_region");

        for batch in out.collect_batches().unwrap() {
            for (col, name) in [(0, "cat"), (2, "cat_region")] {
                let codes = batch.column(col).as_any().downcast_ref::<UInt32Array>().unwrap();
                assert_eq!(codes.null_count(), 0);
                let max = dict.column(name).unwrap().len() as u32;
                assert!(codes.values().iter().all(|&c| c <= max));
            }
        }

        let first = out.read_partition(0).unwrap();
        let cat = first.batch().column(0).as_any().downcast_ref::<UInt32Array>().unwrap();
        // b, a, b, null
        assert_eq!(cat.values().to_vec(), vec![1, 2, 1, UNSEEN_CODE]);
    }

    #[test]
    fn test_save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("dict");
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        dict.save(&dir).unwrap();
        assert!(dir.join(files::DICTIONARY).exists());
        assert!(dir.join(files::unique_file(0)).exists());
        assert!(dir.join(files::unique_file(1)).exists());
        assert!(!tmp.path().join(files::temp_name("dict")).exists());

        let loaded = CategoryDictionary::load(&dir).unwrap();
        assert_eq!(loaded, dict);

        let cached = CategoryCache::Disk(tmp.path().join("cache"))
            .persist(dict.clone())
            .unwrap();
        assert_eq!(cached, dict);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let tmp = TempDir::new().unwrap();
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        let dir = tmp.path().join("dict");
        dict.save(&dir).unwrap();
        let path = dir.join(files::DICTIONARY);
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace(DICTIONARY_MAGIC, "SOMETHING_ELSE")).unwrap();
        assert!(matches!(
            CategoryDictionary::load(&dir),
            Err(PrepError::Format { .. })
        ));
    }

    #[test]
    fn test_column_names_with_separators_save_inside_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("dict");
        let mut dictionaries = HashMap::new();
        for name in ["a/b", "../x"] {
            let frequencies = HashMap::from([("v".to_string(), 2u64)]);
            dictionaries.insert(
                name.to_string(),
                ColumnDictionary::from_frequencies(frequencies, 1),
            );
        }
        let dict = CategoryDictionary::from_parts(
            vec!["a/b".to_string(), "../x".to_string()],
            vec![],
            dictionaries,
        );

        dict.save(&dir).unwrap();
        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                files::DICTIONARY.to_string(),
                "unique.000.parquet".to_string(),
                "unique.001.parquet".to_string(),
            ]
        );
        assert!(!tmp.path().join("x").exists());
        assert_eq!(CategoryDictionary::load(&dir).unwrap(), dict);
    }

    #[test]
    fn test_save_replaces_previous_dictionary() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("dict");
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        dict.save(&dir).unwrap();
        fs::write(dir.join("stray.txt"), "left over").unwrap();

        dict.save(&dir).unwrap();
        assert!(!dir.join("stray.txt").exists());
        assert_eq!(CategoryDictionary::load(&dir).unwrap(), dict);
    }

    #[test]
    fn test_failed_save_keeps_previous_dictionary() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("dict");
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        dict.save(&dir).unwrap();

        // A column without values fails partway through the write.
        let broken = CategoryDictionary::from_parts(vec!["c".to_string()], vec![], HashMap::new());
        assert!(broken.save(&dir).is_err());
        assert!(!tmp.path().join(files::temp_name("dict")).exists());
        assert_eq!(CategoryDictionary::load(&dir).unwrap(), dict);
    }

    #[test]
    fn test_load_rejects_escaping_file_names() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("dict");
        let dict = categorifier()
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .unwrap();
        dict.save(&dir).unwrap();
        let path = dir.join(files::DICTIONARY);
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("unique.000.parquet", "../unique.000.parquet")).unwrap();
        assert!(matches!(
            CategoryDictionary::load(&dir),
            Err(PrepError::Format { .. })
        ));
    }

    #[test]
    fn test_combo_needs_two_sources() {
        let c = Categorifier::new(vec![], vec![ComboColumn::new(["cat"])]);
        assert!(c
            .build_dictionary(&dataset(), &SequentialExecutor::new())
            .is_err());
    }
}
