use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "dimgate",
    version,
    about = "Quality-gated incremental merge for versioned dimensions and facts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Run(RunArgs),
    Status(StatusArgs),
    Findings(FindingsArgs),
    Remediations(RemediationsArgs),
    History(HistoryArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = ".cache/dimgate/dimgate.sqlite")]
    pub db_path: PathBuf,

    #[arg(long)]
    pub config_path: PathBuf,

    #[arg(long)]
    pub batch_path: PathBuf,

    #[arg(long)]
    pub reference_path: Option<PathBuf>,

    #[arg(long)]
    pub result_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/dimgate/dimgate.sqlite")]
    pub db_path: PathBuf,

    #[arg(long, default_value_t = 5)]
    pub recent_runs: usize,
}

#[derive(Args, Debug, Clone)]
pub struct FindingsArgs {
    #[arg(long, default_value = ".cache/dimgate/dimgate.sqlite")]
    pub db_path: PathBuf,

    #[arg(long)]
    pub run_id: i64,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RemediationsArgs {
    #[arg(long, default_value = ".cache/dimgate/dimgate.sqlite")]
    pub db_path: PathBuf,

    #[arg(long)]
    pub run_id: i64,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    #[arg(long, default_value = ".cache/dimgate/dimgate.sqlite")]
    pub db_path: PathBuf,

    #[arg(long)]
    pub entity_type: String,

    #[arg(long)]
    pub natural_key: String,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}
