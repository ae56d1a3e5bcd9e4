use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

use bastion_config::{BastionConfig, ConfigLoader, WarningSeverity};
use bastion_core::BastionError;

mod permissions;
mod plugins;

/// Bastion: plugin host with validated packages, durable grants and a
/// resource-capped WebAssembly sandbox
#[derive(Parser)]
#[command(name = "bastion", version, about, long_about = None)]
pub struct Cli {
    /// Path to bastion.toml config file
    #[arg(short, long, global = true, env = "BASTION_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plugin package without installing it
    Validate {
        /// Package directory containing plugin.toml
        dir: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Install a plugin package
    Install {
        dir: PathBuf,
        /// Approve every Sensitive and Critical permission without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Fetch a plugin from a local mirror and install it
    Fetch {
        id: String,
        /// Version to fetch (default: highest available)
        #[arg(long)]
        version: Option<String>,
        /// Mirror root laid out as <mirror>/<id>/<version>/
        #[arg(long)]
        mirror: PathBuf,
        #[arg(short, long)]
        yes: bool,
    },
    /// Enable an installed plugin
    Enable { id: String },
    /// Disable an enabled plugin
    Disable { id: String },
    /// Uninstall a disabled plugin and revoke its grants
    Uninstall { id: String },
    /// List installed plugins
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show the lifecycle state and details of one plugin
    State { id: String },
    /// Load a plugin and execute one of its entries in the sandbox
    Run {
        id: String,
        /// Exported function to call
        #[arg(short, long, default_value = "run")]
        entry: String,
        /// Context variables as key=value (values are parsed as JSON when possible)
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
        /// CPU-time ceiling override in seconds
        #[arg(long)]
        cpu_seconds: Option<f64>,
        /// Memory ceiling override in MiB
        #[arg(long)]
        memory_mb: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Grant a permission to an installed plugin
    Grant { id: String, permission: String },
    /// Revoke a permission from a plugin
    Revoke { id: String, permission: String },
    /// Show the permission catalog and the grant table
    Permissions {
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit configuration
    Doctor,
    /// Show version and build info
    Version,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse "key=value" CLI arguments.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

impl Cli {
    pub async fn run(self) -> bastion_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config, log_level);

        match self.command {
            Commands::Validate { dir, json } => plugins::cmd_validate(&dir, json),
            Commands::Install { dir, yes } => plugins::cmd_install(&config, &dir, yes),
            Commands::Fetch {
                id,
                version,
                mirror,
                yes,
            } => plugins::cmd_fetch(&config, &id, version.as_deref(), &mirror, yes),
            Commands::Enable { id } => plugins::cmd_enable(&config, &id),
            Commands::Disable { id } => plugins::cmd_disable(&config, &id),
            Commands::Uninstall { id } => plugins::cmd_uninstall(&config, &id),
            Commands::List { json } => plugins::cmd_list(&config, json),
            Commands::State { id } => plugins::cmd_state(&config, &id),
            Commands::Run {
                id,
                entry,
                vars,
                cpu_seconds,
                memory_mb,
                json,
            } => {
                let run = plugins::RunArgs {
                    entry,
                    vars,
                    cpu_seconds,
                    memory_mb,
                    json,
                };
                plugins::cmd_run(&config, &id, run).await
            }
            Commands::Grant { id, permission } => permissions::cmd_grant(&config, &id, &permission),
            Commands::Revoke { id, permission } => permissions::cmd_revoke(&config, &id, &permission),
            Commands::Permissions { json } => permissions::cmd_permissions(&config, json),
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Doctor => Self::cmd_doctor(&config),
            Commands::Version => Self::cmd_version(),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_config(config: &BastionConfig, json: bool) -> bastion_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| BastionError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_doctor(config: &BastionConfig) -> bastion_core::Result<()> {
        println!("Bastion doctor: configuration audit");
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(());
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        for w in &warnings {
            println!("  {w}");
            match w.severity {
                WarningSeverity::Warning => warn_count += 1,
                WarningSeverity::Info => info_count += 1,
                WarningSeverity::Error => {}
            }
        }

        if !config.permissions.auto_grant_normal {
            println!("  info: permissions.auto_grant_normal: every permission will be prompted at install");
            info_count += 1;
        }
        if config.sandbox.max_violations == 0 {
            println!("  info: sandbox.max_violations: plugins are never disabled for exceeding ceilings");
            info_count += 1;
        }
        for path in [config.install_dir(), config.grants_file(), config.enabled_file()] {
            println!("  path: {}", path.display());
        }

        println!();
        println!("  {warn_count} warnings, {info_count} suggestions");
        Ok(())
    }

    fn cmd_version() -> bastion_core::Result<()> {
        println!("Bastion v{}", env!("CARGO_PKG_VERSION"));
        println!("   Rust edition: 2024");
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> bastion_core::Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "bastion", &mut std::io::stdout());
        Ok(())
    }
}

/// `RUST_LOG` wins over the resolved level; format follows `logging.format`.
fn init_tracing(config: &BastionConfig, log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn key_val_splits_on_first_equals() {
        assert_eq!(
            parse_key_val("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn run_collects_vars() {
        let cli = Cli::try_parse_from([
            "bastion", "run", "com.example.hello", "--var", "name=world", "--var", "n=3", "--cpu-seconds", "0.5",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                id, vars, cpu_seconds, entry, ..
            } => {
                assert_eq!(id, "com.example.hello");
                assert_eq!(entry, "run");
                assert_eq!(vars.len(), 2);
                assert_eq!(cpu_seconds, Some(0.5));
            }
            _ => panic!("expected run"),
        }
    }
}
