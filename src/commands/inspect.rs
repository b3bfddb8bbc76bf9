//! `tabprep inspect`: summarize an output directory.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use tabprep::constants::files;
use tabprep::memory::format_bytes;
use tabprep::{is_output_dir, CategoryDictionary, Manifest};

/// Values listed per encoded column before truncating.
const SHOWN_VALUES: usize = 5;

pub fn inspect_output(dir: &Path) -> Result<()> {
    if !is_output_dir(dir) {
        return Err(anyhow!(
            "{} is not a tabprep output directory (expected {})",
            dir.display(),
            files::MANIFEST
        ));
    }
    let manifest = Manifest::load(dir).context("Failed to load manifest")?;

    println!("Output: {}", dir.display());
    println!("Format version: {}", manifest.format_version);
    println!("Rows: {}", manifest.total_rows);
    println!(
        "Partitions: {} ({} file(s), {})",
        manifest.num_partitions,
        manifest.files.len(),
        format_bytes(manifest.total_bytes() as usize)
    );

    println!("\nSchema ({} columns):", manifest.num_columns);
    for entry in &manifest.schema {
        println!(
            "  {:<20} {:?}{}",
            entry.name,
            entry.column_type,
            if entry.nullable { " (nullable)" } else { "" }
        );
    }

    println!("\nFiles:");
    for f in &manifest.files {
        println!(
            "  {:<28} partition={} rows={} size={}",
            f.path,
            f.partition,
            f.num_rows,
            format_bytes(f.num_bytes as usize)
        );
    }

    let categories = dir.join(files::CATEGORIES_DIR);
    if categories.is_dir() {
        let dictionary =
            CategoryDictionary::load(&categories).context("Failed to load category dictionary")?;
        println!("\nCategories:");
        for column in dictionary.encoded_columns() {
            let Some(dict) = dictionary.column(&column) else {
                continue;
            };
            let shown: Vec<&str> = dict
                .values()
                .iter()
                .take(SHOWN_VALUES)
                .map(String::as_str)
                .collect();
            let more = dict.len().saturating_sub(SHOWN_VALUES);
            println!(
                "  {}: {} value(s) [{}{}]",
                column,
                dict.len(),
                shown.join(", "),
                if more > 0 {
                    format!(", ... {} more", more)
                } else {
                    String::new()
                }
            );
        }
    }
    Ok(())
}
