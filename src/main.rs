use clap::{Parser, Subcommand};
use docs_rag::commands::{run_interactive, run_query, run_setup, show_status};
use docs_rag::config::{resolve_data_dir, run_interactive_config, show_config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "docs-rag")]
#[command(about = "Answer questions about a documentation corpus with retrieval-augmented generation")]
#[command(version)]
struct Cli {
    /// Data directory holding config.toml, docs/ and the index (default ~/.docs-rag)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, chunk and embed every configured source into the index
    Setup {
        /// Discard the existing index first, required after changing the embedding model
        #[arg(long)]
        rebuild: bool,
    },
    /// Answer a single question
    Query {
        question: String,
        /// Number of chunks to retrieve
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Ask questions in a loop
    Interactive,
    /// Show index and model status
    Status,
    /// Configure models and documentation sources
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir)?;

    match cli.command {
        Commands::Setup { rebuild } => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight work");
                    on_interrupt.cancel();
                }
            });
            run_setup(&data_dir, rebuild, cancel).await?;
        }
        Commands::Query { question, k } => {
            run_query(&data_dir, &question, k).await?;
        }
        Commands::Interactive => {
            run_interactive(&data_dir).await?;
        }
        Commands::Status => {
            show_status(&data_dir).await?;
        }
        Commands::Config { show } => {
            if show {
                show_config(&data_dir)?;
            } else {
                run_interactive_config(&data_dir)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn setup_command() {
        let cli = Cli::try_parse_from(["docs-rag", "setup"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Setup { rebuild: false }));
        assert!(cli.data_dir.is_none());

        let cli = Cli::try_parse_from(["docs-rag", "setup", "--rebuild"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Setup { rebuild: true }));
    }

    #[test]
    fn query_command() {
        let cli = Cli::try_parse_from(["docs-rag", "query", "How do I prime the pump?", "-k", "3"])
            .expect("should parse");

        let Commands::Query { question, k } = cli.command else {
            panic!("expected query command");
        };
        assert_eq!(question, "How do I prime the pump?");
        assert_eq!(k, Some(3));
    }

    #[test]
    fn query_requires_question() {
        let cli = Cli::try_parse_from(["docs-rag", "query"]);
        assert!(matches!(
            cli.map(|_| ()).map_err(|e| e.kind()),
            Err(ErrorKind::MissingRequiredArgument)
        ));
    }

    #[test]
    fn data_dir_is_global() {
        let cli = Cli::try_parse_from(["docs-rag", "status", "--data-dir", "/tmp/rag"])
            .expect("should parse");
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rag")));
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["docs-rag", "config", "--show"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Config { show: true }));
    }

    #[test]
    fn interactive_command() {
        let cli = Cli::try_parse_from(["docs-rag", "interactive"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Interactive));
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["docs-rag", "invalid"]);
        assert!(matches!(
            cli.map(|_| ()).map_err(|e| e.kind()),
            Err(ErrorKind::InvalidSubcommand)
        ));
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["docs-rag", "--help"]);
        assert!(matches!(
            cli.map(|_| ()).map_err(|e| e.kind()),
            Err(ErrorKind::DisplayHelp)
        ));
    }
}
