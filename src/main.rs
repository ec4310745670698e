// Administrative CLI for the MFA store
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use nexo_mfa::audit::{AuditEvent, AuditFilter};
use nexo_mfa::clock::{Clock, SystemClock};
use nexo_mfa::logging::init_logging;
use nexo_mfa::store::{IpRangeRule, IpRuleKind};
use nexo_mfa::totp::{TotpGenerator, TotpSecret};
use nexo_mfa::{FactorKind, FactorManager, FactorStore, MemorySessionStore, MfaConfig, SqliteFactorStore};

#[derive(Parser)]
#[command(name = "nexo-mfa")]
#[command(version)]
#[command(about = "Administer multi-factor authentication data", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./nexo-mfa.toml when present)
    #[arg(short, long, env = "NEXO_MFA_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a configuration file with every default
    SampleConfig,

    /// Create or update the database schema
    Migrate,

    /// Show a user's factors and last successful login
    Status {
        #[arg(short, long)]
        user: i64,
    },

    /// Clear a factor lock
    Unlock {
        #[arg(short, long)]
        user: i64,
        #[arg(short, long)]
        factor: FactorKind,
    },

    /// Revoke a user's factors, all kinds unless --factor is given
    Revoke {
        #[arg(short, long)]
        user: i64,
        #[arg(short, long)]
        factor: Option<FactorKind>,
    },

    /// Query the audit log, newest first
    Audit {
        #[arg(short, long)]
        user: Option<i64>,
        #[arg(short, long)]
        factor: Option<FactorKind>,
        #[arg(short, long)]
        event: Option<AuditEvent>,
        /// Only successful (true) or failed (false) entries
        #[arg(long)]
        success: Option<bool>,
        /// Only entries at or after this unix time
        #[arg(long)]
        since: Option<i64>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Users per factor and the last week of activity
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Print the current code for a base32 secret
    TotpCode {
        secret: String,
        /// Unix time to compute the code for
        #[arg(long)]
        time: Option<i64>,
    },

    /// Manage IP range rules
    #[command(subcommand)]
    IpRange(IpRangeCommand),

    /// Delete expired one-time codes
    Cleanup {
        /// Also delete every instance of disabled factors
        #[arg(long)]
        purge_disabled: bool,
    },
}

#[derive(Subcommand)]
enum IpRangeCommand {
    /// Add a network rule
    Add {
        network: IpNet,
        #[arg(short, long, default_value = "allow")]
        kind: IpRuleKind,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List rules
    List,
    /// Remove a rule by id
    Remove { id: Uuid },
    /// Re-enable a disabled rule
    Enable { id: Uuid },
    /// Keep a rule but stop matching it
    Disable { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        print!("{}", MfaConfig::sample_toml()?);
        return Ok(());
    }

    let config = MfaConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let mut log_config = config.logging.clone();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _guards = init_logging(&log_config)?;

    let store = SqliteFactorStore::connect(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open {}", config.database.url))?;
    store.run_migrations().await?;

    if let Commands::Migrate = cli.command {
        println!("Schema is up to date");
        return Ok(());
    }

    let totp_config = config.totp.clone();
    let store: Arc<dyn FactorStore> = Arc::new(store);
    let manager = FactorManager::new(config, store.clone(), Arc::new(MemorySessionStore::new()))?;

    match cli.command {
        Commands::SampleConfig | Commands::Migrate => {}
        Commands::Status { user } => {
            let factors = manager.user_factors(user).await?;
            if factors.is_empty() {
                println!("User {} has no factors", user);
            }
            for factor in factors {
                println!(
                    "{}  {:<12} {:<8} failures={:<3} confirmed={} revoked={}  {}",
                    factor.id,
                    factor.kind.name(),
                    factor.state.as_str(),
                    factor.lock_counter,
                    factor.confirmed,
                    factor.revoked,
                    factor.label
                );
            }
            println!("Backup codes left: {}", manager.backup_codes_remaining(user).await?);
            match manager.last_pass(user).await? {
                Some(at) => println!("Last MFA pass: {}", format_time(at)),
                None => println!("Last MFA pass: never"),
            }
        }
        Commands::Unlock { user, factor } => {
            if manager.unlock_factor(user, factor).await? {
                println!("Unlocked {} for user {}", factor, user);
            } else {
                println!("User {} has no active {} factor", user, factor);
            }
        }
        Commands::Revoke { user, factor } => {
            let count = manager.revoke_all_factors(user, factor).await?;
            println!("Revoked {} factor instance(s)", count);
        }
        Commands::Audit {
            user,
            factor,
            event,
            success,
            since,
            limit,
            json,
        } => {
            let filter = AuditFilter {
                user_id: user,
                factor,
                event,
                success,
                since,
                limit: Some(limit),
            };
            for entry in manager.audit_log(&filter).await? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    println!(
                        "{}  user={:<6} {:<10} {:<22} {}  {}",
                        format_time(entry.created_at),
                        entry.user_id,
                        entry.factor.map(|f| f.name()).unwrap_or("-"),
                        entry.event.as_str(),
                        if entry.success { "ok  " } else { "FAIL" },
                        entry.reason.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Stats { json } => {
            let stats = manager.get_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Users with MFA: {}", stats.users_with_mfa);
                for (kind, users) in &stats.users_by_factor {
                    println!("  {:<12} {}", kind.name(), users);
                }
                println!("Activity since {}:", format_time(stats.activity_since));
                for activity in &stats.recent_activity {
                    println!(
                        "  {:<12} {:>6} events, {:>6} successful",
                        activity.factor.map(|f| f.name()).unwrap_or("-"),
                        activity.total,
                        activity.successful
                    );
                }
            }
        }
        Commands::TotpCode { secret, time } => {
            let secret = TotpSecret::from_base32(&secret)?;
            let now = time.unwrap_or_else(|| SystemClock.now());
            let generator = TotpGenerator::new(totp_config);
            let period = generator.config().period as i64;
            println!(
                "{} (valid for {}s)",
                generator.code_for_time(&secret, now)?,
                period - now.rem_euclid(period)
            );
        }
        Commands::IpRange(command) => match command {
            IpRangeCommand::Add {
                network,
                kind,
                description,
            } => {
                let mut rule = IpRangeRule::new(network, kind, description, manager.now());
                rule.created_by = Some("cli".to_string());
                store.add_ip_range(&rule).await?;
                println!("Added {} rule {} ({})", rule.kind, rule.network, rule.id);
            }
            IpRangeCommand::List => {
                for rule in store.ip_ranges().await? {
                    println!(
                        "{}  {:<5} {:<20} {:<8} {}",
                        rule.id,
                        rule.kind.as_str(),
                        rule.network.to_string(),
                        if rule.enabled { "enabled" } else { "disabled" },
                        rule.description
                    );
                }
            }
            IpRangeCommand::Remove { id } => {
                if store.remove_ip_range(id).await? {
                    println!("Removed rule {}", id);
                } else {
                    println!("No rule with id {}", id);
                }
            }
            IpRangeCommand::Enable { id } | IpRangeCommand::Disable { id } => {
                let enabled = matches!(command, IpRangeCommand::Enable { .. });
                if store.set_ip_range_enabled(id, enabled).await? {
                    println!("Rule {} {}", id, if enabled { "enabled" } else { "disabled" });
                } else {
                    println!("No rule with id {}", id);
                }
            }
        },
        Commands::Cleanup { purge_disabled } => {
            let report = manager.cleanup_expired(purge_disabled).await?;
            println!(
                "Deleted {} expired code(s), purged {} factor instance(s)",
                report.expired_codes, report.purged_factors
            );
        }
    }

    Ok(())
}

fn format_time(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| unix.to_string())
}
