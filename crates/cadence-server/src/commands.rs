//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Serve,

    /// Load the server and pipeline configuration, report, and exit
    Validate {
        /// Print the resolved scheduler settings as JSON
        #[arg(long)]
        show: bool,
    },

    /// Print one pipeline's stages and jobs
    Describe {
        /// Pipeline name
        pipeline: String,

        /// Pipeline configuration file, overriding the server setting
        #[arg(short, long)]
        pipelines: Option<PathBuf>,
    },
}
