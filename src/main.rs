use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use dialoguer::Select;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use usbguard_applet::config::BusKind;
use usbguard_applet::decision::{Answer, Decision, DecisionQueue, Prompt};
use usbguard_applet::lifecycle::{self, ServiceConfig};
use usbguard_applet::monitor::{NoticeLevel, mask_serial};
use usbguard_applet::{Config, DbusTransport, Notice, NoticeKind, PolicyMonitor, Rule, Target};

/// USBGuard applet - watch and decide on USB device authorization
#[derive(Parser)]
#[command(name = "usbguard-applet", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Look for the daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror the daemon's device policy and report changes until Ctrl-C
    Watch {
        /// Prompt for a decision when a device is blocked by the implicit policy
        #[arg(short, long)]
        interactive: bool,
    },
    /// Print the device tree once
    List {
        /// Daemon rule query
        #[arg(short, long, default_value = usbguard_applet::monitor::DEVICE_QUERY)]
        query: String,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Authorize a device
    Allow(DecisionArgs),
    /// Deauthorize a device
    Block(DecisionArgs),
    /// Deauthorize and remove a device
    Reject(DecisionArgs),
    /// Install the watcher as a systemd user service
    Install,
    /// Uninstall the systemd user service
    Uninstall,
    /// Show service status
    Status,
}

#[derive(Args)]
struct DecisionArgs {
    /// Device id
    id: u32,
    /// Store the decision as a permanent rule
    #[arg(short, long)]
    permanent: bool,
}

#[derive(Serialize)]
struct ListedDevice<'a> {
    id: u32,
    depth: usize,
    parent: Option<u32>,
    rule: &'a Rule,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,usbguard_applet=info",
        1 => "info,usbguard_applet=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if cli.session_bus {
        config.bridge.bus = BusKind::Session;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Watch { interactive } => cmd_watch(&config, interactive).await,
        Command::List { query, json } => cmd_list(&config, &query, json).await,
        Command::Allow(args) => cmd_apply(&config, Target::Allow, &args).await,
        Command::Block(args) => cmd_apply(&config, Target::Block, &args).await,
        Command::Reject(args) => cmd_apply(&config, Target::Reject, &args).await,
        Command::Install => cmd_install(&config, cli.verbose),
        Command::Uninstall => cmd_uninstall(),
        Command::Status => cmd_status(),
    }
}

/// Run the monitor until interrupted
async fn cmd_watch(config: &Config, interactive: bool) -> anyhow::Result<()> {
    let (mut monitor, mut notices) = PolicyMonitor::new(DbusTransport::new(&config.bridge), config);
    let mut decisions = interactive.then(|| DecisionQueue::new(config.decision, show_prompt));

    tracing::info!(bus = %config.bridge.bus, service = %config.bridge.service, "watching USBGuard");
    if let Err(e) = monitor.start().await {
        tracing::warn!(error = %e, "initial connection attempt failed, retrying");
    }

    loop {
        tokio::select! {
            event = monitor.next_event() => monitor.process(event).await,
            decision = next_decision(decisions.as_mut()) => {
                apply_decision(&mut monitor, decision, config.decision.permanent).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }

        while let Ok(notice) = notices.try_recv() {
            report(&notice);

            if let (Some(queue), NoticeKind::DecisionRequired { id, rule, serial }) = (decisions.as_mut(), &notice.kind) {
                queue.push(*id, rule, serial);
            }
        }
    }
}

fn report(notice: &Notice) {
    match notice.level {
        NoticeLevel::Info => tracing::info!(notify = notice.notify, "{notice}"),
        NoticeLevel::Warning => tracing::warn!(notify = notice.notify, "{notice}"),
    }
}

/// Ask on the terminal from a thread of its own
fn show_prompt(prompt: Prompt) -> Answer {
    let (tx, rx) = oneshot::channel();

    // Detached so a prompt still open after its deadline never holds up exit
    std::thread::spawn(move || {
        let labels: Vec<&'static str> = prompt.choices.iter().map(|t| t.as_str()).collect();
        let picked = Select::new()
            .with_prompt(format!(
                "{} (default {} in {}s)",
                prompt.text,
                prompt.default_target,
                prompt.remaining.as_secs()
            ))
            .items(&labels)
            .default(prompt.default)
            .interact_opt();

        let answer = match picked {
            Ok(choice) => choice.and_then(|index| prompt.choices.get(index).copied()),
            Err(e) => {
                tracing::warn!(id = prompt.id, error = %e, "decision prompt failed");
                None
            }
        };
        let _ = tx.send(answer);
    });

    rx
}

async fn next_decision<P: FnMut(Prompt) -> Answer>(queue: Option<&mut DecisionQueue<P>>) -> Decision {
    match queue {
        Some(queue) => queue.next().await,
        None => std::future::pending().await,
    }
}

async fn apply_decision(monitor: &mut PolicyMonitor<DbusTransport>, decision: Decision, permanent: bool) {
    let Decision { id, target, timed_out } = decision;
    match monitor.apply(id, target, permanent).await {
        Ok(rule_id) => tracing::info!(id, %target, rule_id, timed_out, "decision applied"),
        Err(e) => tracing::warn!(id, %target, error = %e, "failed to apply decision"),
    }
}

/// Connect once, failing if the daemon is not up
async fn connect(config: &Config) -> anyhow::Result<PolicyMonitor<DbusTransport>> {
    let (mut monitor, _notices) = PolicyMonitor::new(DbusTransport::new(&config.bridge), config);
    if !monitor.start().await? || !monitor.bridge().is_connected() {
        anyhow::bail!("USBGuard service {} is not available", config.bridge.service);
    }
    Ok(monitor)
}

/// Print the device tree
async fn cmd_list(config: &Config, query: &str, json: bool) -> anyhow::Result<()> {
    let mut monitor = connect(config).await?;
    monitor.load_devices(query).await?;
    let registry = monitor.registry();

    if json {
        let devices: Vec<ListedDevice<'_>> = registry
            .walk()
            .map(|(depth, node)| ListedDevice {
                id: node.rule_id(),
                depth,
                parent: node
                    .parent()
                    .and_then(|p| registry.get(p))
                    .map(usbguard_applet::PolicyNode::rule_id),
                rule: node.rule(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    for (depth, node) in registry.walk() {
        let rule = node.rule();
        let serial = if config.decision.mask_serial {
            mask_serial(rule.serial())
        } else {
            rule.serial().to_string()
        };
        println!(
            "{indent}{id:>4}  {target:<7} {usb_id:<9}  {name}  serial={serial}  port={port}",
            indent = "  ".repeat(depth),
            id = node.rule_id(),
            target = node.target(),
            usb_id = rule.device_id().map(ToString::to_string).unwrap_or_default(),
            name = rule.name(),
            port = rule.via_port(),
        );
    }
    Ok(())
}

/// Apply a target to one device
async fn cmd_apply(config: &Config, target: Target, args: &DecisionArgs) -> anyhow::Result<()> {
    let mut monitor = connect(config).await?;
    let rule_id = monitor.apply(args.id, target, args.permanent).await?;
    println!("Device {}: {target} (rule {rule_id})", args.id);
    Ok(())
}

/// Install the watcher as a user service
fn cmd_install(config: &Config, verbose: u8) -> anyhow::Result<()> {
    let binary = std::env::current_exe()?;
    let extra_args = if verbose > 0 {
        vec![format!("-{}", "v".repeat(usize::from(verbose)))]
    } else {
        Vec::new()
    };
    let service = ServiceConfig {
        binary_path: binary,
        bus: config.bridge.bus,
        extra_args,
    };

    lifecycle::install_service(&service)?;
    println!("usbguard-applet installed as user service");
    Ok(())
}

/// Uninstall the user service
fn cmd_uninstall() -> anyhow::Result<()> {
    lifecycle::uninstall_service()?;
    println!("usbguard-applet user service removed");
    Ok(())
}

/// Show service status
fn cmd_status() -> anyhow::Result<()> {
    let status = lifecycle::service_status()?;
    println!("usbguard-applet service: {status}");
    Ok(())
}
