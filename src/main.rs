//! homestate CLI: run and control the reconciliation agent.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use homestate::agent::{AgentConfig, AgentSettings, TimeoutSettings, Timeouts, parse_duration};
use homestate::control::{ClientError, ControlClient};
use homestate::engine::{CommandEngine, EngineReconciler};
use homestate::lifecycle::{self, ServiceSpec};
use homestate::paths::AgentPaths;

/// Bound on approve/reject/status round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra transport time a stop request gets beyond the agent's drain deadline.
const STOP_SLACK: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "homestate", version, about = "Workstation configuration reconciliation")]
struct Cli {
    /// Root directory for config, state and runtime files (default: XDG dirs).
    #[arg(long, global = true, hide = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background reconciliation agent.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Start the agent (detached unless --foreground).
    Start {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Run in this process instead of detaching.
        #[arg(long)]
        foreground: bool,

        /// Write the effective settings back to the settings file.
        #[arg(long)]
        save: bool,
    },

    /// Stop the running agent.
    Stop {
        /// Cancel the in-flight cycle instead of waiting for it.
        #[arg(long)]
        force: bool,

        /// How long to wait for the cycle to drain (e.g. "30s").
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Show the agent's state, health and last reconcile.
    Status {
        /// Print the raw status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Approve the pending remediation request.
    Approve {
        /// Request id, as shown by `homestate agent status`.
        id: String,
    },

    /// Reject the pending remediation request.
    Reject {
        /// Request id, as shown by `homestate agent status`.
        id: String,
    },

    /// Register the agent with launchd or systemd.
    Install {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Remove the launchd or systemd registration.
    Uninstall,
}

/// Flags layered over `agent.toml`.
#[derive(Args)]
struct SettingsArgs {
    /// Settings file (default: $XDG_CONFIG_HOME/homestate/agent.toml).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Declared workstation configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target within the configuration.
    #[arg(long)]
    target: Option<String>,

    /// Reconcile interval: a duration ("30m", "1h30m") or cron expression.
    #[arg(long)]
    interval: Option<String>,

    /// Remediation policy: notify, auto, approved or safe.
    #[arg(long)]
    policy: Option<String>,

    /// Engine executable.
    #[arg(long)]
    engine: Option<String>,

    #[arg(long)]
    shutdown_timeout: Option<String>,

    #[arg(long)]
    force_timeout: Option<String>,

    #[arg(long)]
    health_timeout: Option<String>,

    /// Expire pending approval requests after this long.
    #[arg(long)]
    approval_ttl: Option<String>,

    /// Reconcile immediately instead of waiting one interval.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    reconcile_on_start: Option<bool>,

    /// Plan and report without changing anything.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    dry_run: Option<bool>,
}

impl SettingsArgs {
    fn overrides(&self) -> AgentSettings {
        AgentSettings {
            config_path: self.config.clone(),
            target: self.target.clone(),
            schedule: self.interval.clone(),
            policy: self.policy.clone(),
            engine: self.engine.clone(),
            reconcile_on_start: self.reconcile_on_start,
            dry_run: self.dry_run,
            timeouts: TimeoutSettings {
                shutdown: self.shutdown_timeout.clone(),
                force_shutdown: self.force_timeout.clone(),
                health_check: self.health_timeout.clone(),
                approval_ttl: self.approval_ttl.clone(),
            },
        }
    }

    fn settings_file(&self, paths: &AgentPaths) -> PathBuf {
        self.settings.clone().unwrap_or_else(|| paths.settings_file())
    }

    /// Defaults, then the settings file, then flags; validated once.
    fn resolve(&self, paths: &AgentPaths) -> Result<(AgentSettings, AgentConfig)> {
        let file = AgentSettings::load_or_default(&self.settings_file(paths))?;
        let merged = file.merge(self.overrides());
        let config = merged.clone().into_config()?;
        Ok((merged, config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let paths = match &cli.root {
        Some(root) => AgentPaths::under(root),
        None => AgentPaths::resolve()?,
    };

    match cli.command {
        Commands::Agent { action } => run_agent(action, &paths).await,
    }
}

async fn run_agent(action: AgentAction, paths: &AgentPaths) -> Result<()> {
    match action {
        AgentAction::Start {
            settings,
            foreground,
            save,
        } => {
            let (effective, config) = settings.resolve(paths)?;
            if save {
                effective.save(&settings.settings_file(paths))?;
            }

            if foreground {
                let engine = CommandEngine::new(&config.engine);
                let handler = EngineReconciler::for_config(engine, &config);
                lifecycle::run_foreground(config, paths, handler).await?;
                return Ok(());
            }

            paths.ensure_dirs()?;
            lifecycle::ensure_not_running(&paths.pid_file())?;
            let pid = lifecycle::daemonize_agent(&config, paths, &settings.settings_file(paths))?;
            println!("Agent started (PID {pid})");
            println!("  policy:   {}", config.policy);
            println!("  schedule: {}", config.schedule);
            println!("  log:      {}", paths.log_file().display());
        }

        AgentAction::Stop { force, timeout } => {
            let drain = timeout
                .as_deref()
                .map(parse_duration)
                .transpose()
                .map_err(|reason| miette::miette!("invalid --timeout: {reason}"))?;
            let client = match ControlClient::discover(paths) {
                Ok(client) => client,
                Err(ClientError::NotRunning) => {
                    println!("Agent not running");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let defaults = Timeouts::default();
            let budget = drain.unwrap_or(defaults.shutdown) + defaults.force_shutdown + STOP_SLACK;
            let reply = client.stop(force, drain, budget).await?;
            if !reply.success {
                miette::bail!(
                    help = "Retry with `homestate agent stop --force` to cancel the running cycle.",
                    "stop failed: {}",
                    reply.message
                );
            }
            println!("{}", reply.message);
        }

        AgentAction::Status { json } => {
            let client = match ControlClient::discover(paths) {
                Ok(client) => client,
                Err(ClientError::NotRunning) => {
                    if json {
                        println!("{}", serde_json::json!({ "running": false }));
                    } else {
                        println!("Agent not running");
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let status = client.status(REQUEST_TIMEOUT).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status).into_diagnostic()?);
            } else {
                println!("Agent running (PID {}, version {})", status.pid, status.version);
                print!("{}", status.status.render(chrono::Utc::now()));
                if let Some(request) = &status.approval {
                    println!("\nPending approval {}:", request.id);
                    println!("  {}", request.description);
                    println!("  approve with `homestate agent approve {}`", request.id);
                }
            }
        }

        AgentAction::Approve { id } => {
            let reply = ControlClient::discover(paths)?
                .approve(&id, REQUEST_TIMEOUT)
                .await?;
            println!("{}", reply.message);
        }

        AgentAction::Reject { id } => {
            let reply = ControlClient::discover(paths)?
                .reject(&id, REQUEST_TIMEOUT)
                .await?;
            println!("{}", reply.message);
        }

        AgentAction::Install { settings } => {
            let (_, config) = settings.resolve(paths)?;
            let program = std::env::current_exe().into_diagnostic()?;
            let spec =
                ServiceSpec::for_agent(program, &config, paths, &settings.settings_file(paths));
            let installer = lifecycle::detect()?;
            let unit = installer.install(&spec)?;
            println!("Installed {} unit: {}", installer.name(), unit.display());
        }

        AgentAction::Uninstall => {
            let installer = lifecycle::detect()?;
            if installer.uninstall()? {
                println!("Removed {} unit", installer.name());
            } else {
                println!("No {} unit installed", installer.name());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: impl IntoIterator<Item = String>) -> (AgentPaths, SettingsArgs) {
        let cli = Cli::try_parse_from(std::iter::once("homestate".to_string()).chain(args)).unwrap();
        let root = cli.root.expect("--root given");
        match cli.command {
            Commands::Agent {
                action: AgentAction::Start { settings, .. },
            } => (AgentPaths::under(&root), settings),
            _ => panic!("expected `agent start`"),
        }
    }

    #[test]
    fn detached_child_resolves_the_same_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        std::fs::create_dir_all(&paths.config_dir).unwrap();
        // The default settings file disagrees with everything the parent chose.
        std::fs::write(
            paths.settings_file(),
            "dry_run = true\nreconcile_on_start = true\npolicy = \"auto\"\n\n[timeouts]\napproval_ttl = \"1d\"\n",
        )
        .unwrap();
        let other = dir.path().join("other.toml");
        std::fs::write(
            &other,
            "config_path = \"/etc/homestate/host.toml\"\npolicy = \"approved\"\nschedule = \"45m\"\n",
        )
        .unwrap();

        let root = dir.path().display().to_string();
        let other_arg = other.display().to_string();
        let (parent_paths, parent) = parse(
            ["--root", root.as_str(), "agent", "start", "--settings", other_arg.as_str(), "--target", "laptop"]
                .map(String::from),
        );
        let (_, config) = parent.resolve(&parent_paths).unwrap();
        assert!(!config.dry_run);

        let args = lifecycle::agent_args(&config, &parent_paths, &parent.settings_file(&parent_paths));
        let (child_paths, child) = parse(args);
        assert_eq!(child_paths, parent_paths);
        assert_eq!(child.settings_file(&child_paths), other);

        let (_, child_config) = child.resolve(&child_paths).unwrap();
        assert_eq!(child_config, config);
        assert!(!child_config.dry_run);
        assert!(!child_config.reconcile_on_start);
        assert_eq!(child_config.timeouts.approval_ttl, None);
    }

    #[test]
    fn boolean_flags_take_an_optional_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().display().to_string();
        let (_, bare) = parse(["--root", root.as_str(), "agent", "start", "--dry-run"].map(String::from));
        assert_eq!(bare.dry_run, Some(true));
        let (_, off) = parse(
            ["--root", root.as_str(), "agent", "start", "--dry-run=false", "--reconcile-on-start=true"]
                .map(String::from),
        );
        assert_eq!(off.dry_run, Some(false));
        assert_eq!(off.reconcile_on_start, Some(true));
        let (_, unset) = parse(["--root", root.as_str(), "agent", "start"].map(String::from));
        assert_eq!(unset.dry_run, None);
    }
}
