//! `tabprep generate`: synthetic input data.

use anyhow::{Context, Result};
use std::path::Path;

use tabprep::{generate, GenerateOptions};

pub fn generate_dataset(output: &Path, options: GenerateOptions) -> Result<()> {
    let paths = generate(output, &options)
        .with_context(|| format!("Failed to generate data in {}", output.display()))?;
    println!(
        "Wrote {} rows in {} file(s) to {}",
        options.rows,
        paths.len(),
        output.display()
    );
    Ok(())
}
