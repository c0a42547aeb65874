//! fleetcache - device compliance snapshots from the command line.
//!
//! Loads the tenant's managed devices (from cache when fresh), prints a
//! compliance summary and runs remediation actions after confirmation.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetcache_core::api::RemediationAction;
use fleetcache_core::auth::{DeviceCodeChallenge, DeviceCodePrompt};
use fleetcache_core::{
    Config, Confirmer, DataSource, LoadOutcome, RemediationOutcome, ServiceContext,
    SyncOrchestrator,
};

// ============================================================================
// Constants
// ============================================================================

const USAGE: &str = "\
Usage: fleetcache [COMMAND]

Commands:
  (none)                                   Load devices and print quick stats
  --refresh                                Ignore the cache and fetch fresh data
  --clear-cache                            Delete all cached datasets
  --policies                               List non-compliant devices by policy
  --locations                              Device counts by owner country
  --profiles <device-id>                   Configuration profile states
  --action <sync|reboot|wipe|notify> <device-id> [message]
                                           Run a remediation action
  --sign-out                               Forget the stored sign-in
  --help                                   Show this message";

/// Notification body used when `--action notify` has no message.
const DEFAULT_NOTIFY_BODY: &str = "Your device needs attention. Please contact IT support.";

const NOTIFY_TITLE: &str = "Message from IT";

/// Log file prefix inside the cache directory's `logs` folder
const LOG_FILE_PREFIX: &str = "fleetcache.log";

/// Initialize the tracing subscriber for logging.
/// Returns the guard of the file writer, which must live until exit.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Load { refresh: bool },
    ClearCache,
    Policies,
    Locations,
    Profiles(String),
    Action {
        action: RemediationAction,
        device_id: String,
    },
    SignOut,
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self, String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            [] => Ok(Command::Load { refresh: false }),
            ["--refresh"] => Ok(Command::Load { refresh: true }),
            ["--clear-cache"] => Ok(Command::ClearCache),
            ["--policies"] => Ok(Command::Policies),
            ["--locations"] => Ok(Command::Locations),
            ["--profiles", device_id] => Ok(Command::Profiles(device_id.to_string())),
            ["--action", kind, device_id, message @ ..] => {
                let action = match *kind {
                    "sync" => RemediationAction::Sync,
                    "reboot" => RemediationAction::Reboot,
                    "wipe" => RemediationAction::Wipe {
                        keep_enrollment_data: false,
                        keep_user_data: false,
                    },
                    "notify" => RemediationAction::Notify {
                        title: NOTIFY_TITLE.to_string(),
                        body: if message.is_empty() {
                            DEFAULT_NOTIFY_BODY.to_string()
                        } else {
                            message.join(" ")
                        },
                    },
                    other => return Err(format!("Unknown action '{}'", other)),
                };
                if !message.is_empty() && !matches!(action, RemediationAction::Notify { .. }) {
                    return Err(format!("'{}' does not take a message", kind));
                }
                Ok(Command::Action {
                    action,
                    device_id: device_id.to_string(),
                })
            }
            ["--sign-out"] => Ok(Command::SignOut),
            ["--help"] | ["-h"] => Ok(Command::Help),
            _ => Err(format!("Unrecognized arguments: {}", args.join(" "))),
        }
    }
}

// ============================================================================
// Terminal capabilities
// ============================================================================

struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            eprint!("{} [y/N] ", prompt);
            let _ = io::stderr().flush();
            let mut answer = String::new();
            if io::stdin().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

struct TerminalDeviceCodePrompt;

#[async_trait]
impl DeviceCodePrompt for TerminalDeviceCodePrompt {
    async fn show(&self, challenge: &DeviceCodeChallenge) {
        eprintln!();
        eprintln!("{}", challenge.message);
        eprintln!(
            "(code {} expires in {} minutes)",
            challenge.user_code,
            challenge.expires_in.as_secs() / 60
        );
        eprintln!();
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_status(status: &str, in_progress: bool) {
    if in_progress {
        eprintln!("{} (sync in progress)", status);
    } else {
        eprintln!("{}", status);
    }
}

fn print_counts(title: &str, counts: &std::collections::BTreeMap<String, usize>) {
    println!("{}:", title);
    for (name, count) in counts {
        println!("  {:<24} {:>6}", name, count);
    }
}

fn print_outcome(outcome: &LoadOutcome) {
    print_status(&outcome.status, outcome.in_progress);
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    if let Some(err) = &outcome.error {
        eprintln!("error: {}", err);
    }
    if outcome.source == DataSource::Empty {
        return;
    }

    let stats = &outcome.stats;
    println!();
    println!("Devices:        {}", stats.total_devices);
    println!("Compliant:      {}", stats.compliant_devices);
    println!("Non-compliant:  {}", stats.non_compliant_devices);
    println!("Compliance:     {:.1}%", stats.compliance_rate());
    println!();
    print_counts("By type", &stats.by_device_type);
    print_counts("By ownership", &stats.by_ownership);
    print_counts("By operating system", &stats.by_operating_system);

    let failing: Vec<_> = outcome.devices.iter().filter(|d| !d.is_compliant()).collect();
    if !failing.is_empty() {
        println!();
        println!("Non-compliant devices:");
        for device in failing {
            println!(
                "  {} ({}) - {}",
                device.display_name(),
                device.owner.as_deref().unwrap_or("no owner"),
                device.compliance_issues.join("; ")
            );
        }
    }
}

// ============================================================================
// Main
// ============================================================================

async fn run(command: Command, orchestrator: &SyncOrchestrator) -> Result<()> {
    match command {
        Command::Load { refresh } => {
            let outcome = orchestrator.load_data(refresh).await;
            print_outcome(&outcome);
            if let Some(err) = outcome.error {
                if outcome.devices.is_empty() {
                    return Err(err.into());
                }
            }
        }
        Command::ClearCache => {
            orchestrator.clear_cache().await?;
            println!("Cache cleared.");
        }
        Command::Policies => {
            let view = orchestrator.get_devices_grouped_by_policy().await;
            print_status(&view.status, view.in_progress);
            if view.data.is_empty() {
                println!("No failing policies.");
            }
            for (policy, members) in &view.data {
                println!("{} ({})", policy, members.len());
                for member in members {
                    println!(
                        "  - {} ({})",
                        member.device_name,
                        member.owner.as_deref().unwrap_or("no owner")
                    );
                }
            }
        }
        Command::Locations => {
            let view = orchestrator.get_device_locations().await;
            print_status(&view.status, view.in_progress);
            print_counts("Devices by country", &view.data.by_country);
            println!("  {:<24} {:>6}", "(unknown)", view.data.unresolved);
        }
        Command::Profiles(device_id) => {
            let profiles = orchestrator.configuration_profiles(&device_id).await?;
            if profiles.is_empty() {
                println!("No configuration profiles reported for {}.", device_id);
            }
            for profile in profiles {
                let marker = if profile.is_failing() { "!" } else { " " };
                println!("{} {:<40} {}", marker, profile.display_name, profile.state);
            }
        }
        Command::Action { action, device_id } => {
            let name = action.name();
            match orchestrator.remediate(&device_id, action).await? {
                RemediationOutcome::Completed => println!("Sent {} to {}.", name, device_id),
                RemediationOutcome::Declined => println!("Cancelled."),
            }
        }
        Command::SignOut => {
            orchestrator.sign_out().await?;
            println!("Signed out.");
        }
        Command::Help => println!("{}", USAGE),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{}\n\n{}", msg, USAGE);
            std::process::exit(2);
        }
    };
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let _log_guard = init_tracing(&config);
    info!("fleetcache starting");

    let ctx = ServiceContext::from_config(
        &config,
        Arc::new(TerminalDeviceCodePrompt),
        Arc::new(TerminalConfirmer),
    )?;
    let orchestrator = SyncOrchestrator::new(ctx);

    let result = run(command, &orchestrator).await;
    info!("fleetcache exiting");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Command::parse(&args)
    }

    #[test]
    fn test_parse_load_commands() {
        assert_eq!(parse(&[]), Ok(Command::Load { refresh: false }));
        assert_eq!(parse(&["--refresh"]), Ok(Command::Load { refresh: true }));
        assert_eq!(parse(&["--clear-cache"]), Ok(Command::ClearCache));
        assert_eq!(
            parse(&["--profiles", "dev-1"]),
            Ok(Command::Profiles("dev-1".to_string()))
        );
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            parse(&["--action", "reboot", "dev-1"]),
            Ok(Command::Action {
                action: RemediationAction::Reboot,
                device_id: "dev-1".to_string()
            })
        );
        assert_eq!(
            parse(&["--action", "notify", "dev-2", "Update", "today"]),
            Ok(Command::Action {
                action: RemediationAction::Notify {
                    title: NOTIFY_TITLE.to_string(),
                    body: "Update today".to_string()
                },
                device_id: "dev-2".to_string()
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&["--action", "format", "dev-1"]).is_err());
        assert!(parse(&["--action", "wipe", "dev-1", "now"]).is_err());
        assert!(parse(&["--profiles"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
