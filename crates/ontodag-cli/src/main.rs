mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ontodag",
    version,
    about = "Ontology extraction pipelines over relational datasources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the engine config YAML file
    #[arg(long, env = "ONTODAG_CONFIG", default_value = "ontodag.yaml", global = true)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an extraction and follow it until it finishes
    Extract {
        #[arg(long)]
        project: String,
        #[arg(long)]
        datasource: String,
        /// Free-text description of the project, seeded as knowledge
        #[arg(long)]
        overview: Option<String>,
    },
    /// Show the latest extraction of a datasource
    Status {
        #[arg(long)]
        datasource: String,
        /// Print the status response as JSON
        #[arg(long)]
        json: bool,
        /// Also verify the persisted DAG's structural invariants
        #[arg(long)]
        check: bool,
    },
    /// Cancel a pending or running extraction
    Cancel {
        #[arg(long)]
        dag: String,
    },
    /// Delete everything extraction produced for a project
    Delete {
        #[arg(long)]
        project: String,
    },
    /// Fail extractions whose executions stopped heartbeating
    Reconcile,
    /// List the relationships recorded for a datasource
    Relationships {
        #[arg(long)]
        project: String,
        #[arg(long)]
        datasource: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Extract {
            project,
            datasource,
            overview,
        } => commands::extract::execute(&cli.config, project, datasource, overview).await,
        Commands::Status {
            datasource,
            json,
            check,
        } => commands::status::execute(&cli.config, datasource, json, check).await,
        Commands::Cancel { dag } => commands::cancel::execute(&cli.config, dag).await,
        Commands::Delete { project } => commands::delete::execute(&cli.config, project).await,
        Commands::Reconcile => commands::reconcile::execute(&cli.config).await,
        Commands::Relationships {
            project,
            datasource,
            json,
        } => commands::relationships::execute(&cli.config, project, datasource, json).await,
    }
}
