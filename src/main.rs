use anyhow::Result;
use clap::Parser;

use tabprep::logging::init_logger;
use tabprep::GenerateOptions;

mod commands;

use commands::{
    generate_dataset, inspect_output, print_statistics, run_pipeline, Cli, Commands,
};

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logger(args.verbose);

    match args.command {
        Commands::Run { config, threads } => run_pipeline(&config, threads)?,

        Commands::Generate {
            output,
            rows,
            files,
            seed,
            null_fraction,
        } => generate_dataset(
            &output,
            GenerateOptions {
                rows,
                files,
                seed,
                null_fraction,
            },
        )?,

        Commands::Stats {
            input,
            column,
            quantile,
            partition_size,
        } => print_statistics(&input, &column, &quantile, partition_size)?,

        Commands::Inspect { manifest } => inspect_output(&manifest)?,
    }
    Ok(())
}
