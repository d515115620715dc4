use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::admin::AdminCommands;
use commands::decisions::SubjectArgs;
use commands::thresholds::{AdaptiveCommands, ThresholdCommands};

#[derive(Parser)]
#[command(name = "tripwire", version, about = "tripwire CLI: query decisions and operate the abuse-detection admin API")]
struct Cli {
    /// API base URL
    #[arg(long, env = "TRIPWIRE_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Print status and response headers alongside the body
    #[arg(long, global = true)]
    include: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Ask for an allow/deny decision for one request
    Check {
        #[command(flatten)]
        subject: SubjectArgs,
    },
    /// Report an enforcement violation (admin)
    Violation {
        #[command(flatten)]
        subject: SubjectArgs,
    },
    /// Violation thresholds (admin)
    Thresholds {
        #[command(subcommand)]
        command: ThresholdCommands,
    },
    /// Adaptive request budgets (admin)
    Adaptive {
        #[command(subcommand)]
        command: AdaptiveCommands,
    },
    /// Block an identity or a remote address (admin)
    Block {
        /// Identity key, e.g. "ip=192.0.2.1,user=anonymous"
        #[arg(long, conflicts_with = "remote_address")]
        identity: Option<String>,
        /// Remote address to geo-block
        #[arg(long)]
        remote_address: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        /// Block length in seconds (server default: 86400)
        #[arg(long)]
        duration: Option<i64>,
    },
    /// Lift an identity block (admin)
    Unblock {
        identity: String,
    },
    /// Show identity and geo block state (admin)
    BlockStatus {
        identity: String,
        /// Geo-block lookup address (derived from the identity when omitted)
        #[arg(long)]
        remote_address: Option<String>,
    },
    /// Current cadence pattern for an identity (admin)
    Pattern {
        identity: String,
        #[arg(long)]
        category: String,
    },
    /// Violation statistics per category (admin)
    Stats {
        /// Restrict to one category (default: all)
        #[arg(long)]
        category: Option<String>,
        /// hourly | daily | weekly
        #[arg(long, default_value = "hourly")]
        period: String,
    },
    /// Recent violations for a category, newest first (admin)
    Violations {
        #[arg(long)]
        category: String,
        #[arg(long, default_value = "hourly")]
        period: String,
        /// Maximum records (server clamps to 1-500)
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Violation summary for one identity (admin)
    Identity {
        identity: String,
    },
    /// List active identity blocks (admin)
    Blocked,
    /// Offline admin utilities
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let api_url = cli.api_url.trim_end_matches('/').to_string();

    let code = match cli.command {
        Commands::Health => commands::health::run(&api_url).await,
        Commands::Check { subject } => {
            commands::decisions::check(&api_url, subject, cli.include).await
        }
        Commands::Violation { subject } => {
            commands::decisions::report_violation(
                &api_url,
                &util::require_admin_key(),
                subject,
                cli.include,
            )
            .await
        }
        Commands::Admin { command } => commands::admin::run(command),
        Commands::Thresholds { command } => {
            commands::thresholds::run(&api_url, &util::require_admin_key(), command).await
        }
        Commands::Adaptive { command } => {
            commands::thresholds::run_adaptive(&api_url, &util::require_admin_key(), command).await
        }
        Commands::Block {
            identity,
            remote_address,
            reason,
            duration,
        } => {
            commands::blocks::block(
                &api_url,
                &util::require_admin_key(),
                identity.as_deref(),
                remote_address.as_deref(),
                reason.as_deref(),
                duration,
            )
            .await
        }
        Commands::Unblock { identity } => {
            commands::blocks::unblock(&api_url, &util::require_admin_key(), &identity).await
        }
        Commands::BlockStatus {
            identity,
            remote_address,
        } => {
            commands::blocks::status(&api_url, &util::require_admin_key(), &identity, remote_address.as_deref())
                .await
        }
        Commands::Blocked => commands::blocks::list(&api_url, &util::require_admin_key()).await,
        Commands::Pattern { identity, category } => {
            commands::insights::pattern(&api_url, &util::require_admin_key(), &identity, &category).await
        }
        Commands::Stats { category, period } => {
            commands::insights::stats(&api_url, &util::require_admin_key(), category.as_deref(), &period).await
        }
        Commands::Violations {
            category,
            period,
            limit,
        } => {
            commands::insights::violations(&api_url, &util::require_admin_key(), &category, &period, limit)
                .await
        }
        Commands::Identity { identity } => {
            commands::insights::identity(&api_url, &util::require_admin_key(), &identity).await
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn block_rejects_both_targets() {
        let parsed = Cli::try_parse_from([
            "tripwire",
            "block",
            "--identity",
            "ip=192.0.2.1,user=anonymous",
            "--remote-address",
            "192.0.2.1",
        ]);
        assert!(parsed.is_err());
    }
}
