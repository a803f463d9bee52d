//
// Purpose:
//
// This binary is the alert-action side of the FortiGate alerting app: the
// Splunk scheduler execs one subcommand per firing with a JSON document on
// stdin and (usually) a gzipped CSV of result rows on disk. Each subcommand
// is one pipeline:
//
// - `slack-alert`: format the firing as a Block Kit message and deliver it
//   to Slack (bot token preferred, incoming webhook fallback), recording the
//   message for the acknowledgment workflow.
// - `track`: run the observed entity states through the CSV state tracker
//   and alert only on transitions (down→up, fail→restored, ...).
// - `auto-block`: guarded FortiGate blocking from correlation results, or a
//   manual `--action block|unblock --ip ...` invocation.
// - `unblock-sweep`: release blocks whose scheduled unblock time passed.
// - `respond`: alert-name-keyed automated responses (brute force, traffic
//   spike, admin lockout).
// - `callback-server`: the long-lived HTTP endpoint Slack posts signed
//   button interactions to.
//
// Configuration comes from the environment (dotenv honored) and is then
// overridden by the `configuration` map Splunk passes on stdin. Stdout is
// reserved by the alert-action protocol; all diagnostics go to stderr, and
// the exit code is the only success signal Splunk sees.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;

use fortigate_alert_bridge::alert_state::AlertStateStore;
use fortigate_alert_bridge::audit::AuditLog;
use fortigate_alert_bridge::autoblock::AutoBlockEngine;
use fortigate_alert_bridge::config::AppConfig;
use fortigate_alert_bridge::dispatch;
use fortigate_alert_bridge::fortigate::FortiGateClient;
use fortigate_alert_bridge::respond::{AutoResponseEngine, ResponseOutcome};
use fortigate_alert_bridge::slack::callback::{self, CallbackState};
use fortigate_alert_bridge::slack::client::SlackClient;
use fortigate_alert_bridge::splunk::{self, AlertPayload};
use fortigate_alert_bridge::tracker::{observed_from_results, StateTracker};

#[derive(Parser, Debug)]
#[command(name = "fortigate-alert-bridge")]
#[command(about = "FortiGate alerting bridge: Slack delivery, state tracking, auto-block")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send an alert firing to Slack as a Block Kit message
    SlackAlert {
        /// Gzipped CSV results file; defaults to the payload's results_file
        results_file: Option<PathBuf>,
    },
    /// Detect state transitions and alert only on changes
    Track {
        /// Entity class, names the tracker table (e.g. vpn, interface, ha)
        #[arg(long)]
        tracker: String,
        #[arg(long, default_value = "device")]
        device_field: String,
        #[arg(long, default_value = "entity_key")]
        key_field: String,
        #[arg(long, default_value = "state")]
        state_field: String,
        /// Gzipped CSV results file; defaults to the payload's results_file
        results_file: Option<PathBuf>,
    },
    /// Block IPs from correlation results, or manually with --ip
    AutoBlock {
        #[arg(long, value_enum, default_value = "block")]
        action: BlockAction,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long, default_value = "Malicious activity detected")]
        reason: String,
    },
    /// Release blocks whose unblock time has passed
    UnblockSweep,
    /// Execute the alert-keyed automated response
    Respond,
    /// Serve the Slack interaction callback endpoint
    CallbackServer {
        #[arg(long, default_value = "0.0.0.0:8404")]
        bind: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BlockAction {
    Block,
    Unblock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenv().ok();
    let config = AppConfig::from_env()?;

    match cli.command {
        Command::SlackAlert { results_file } => run_slack_alert(config, results_file).await,
        Command::Track {
            tracker,
            device_field,
            key_field,
            state_field,
            results_file,
        } => {
            run_track(
                config,
                &tracker,
                &device_field,
                &key_field,
                &state_field,
                results_file,
            )
            .await
        }
        Command::AutoBlock { action, ip, reason } => {
            run_auto_block(config, action, ip, &reason).await
        }
        Command::UnblockSweep => run_unblock_sweep(config).await,
        Command::Respond => run_respond(config).await,
        Command::CallbackServer { bind } => run_callback_server(config, &bind).await,
    }
}

/// Read the stdin document and fold its configuration into the app config.
fn read_payload(config: &mut AppConfig) -> anyhow::Result<AlertPayload> {
    let payload = AlertPayload::from_reader(std::io::stdin())?;
    config.apply_splunk_overrides(&payload.configuration);
    Ok(payload)
}

/// Result rows for a firing: the gzipped results file when one exists,
/// otherwise the single inline `result` object.
fn load_results(
    payload: &AlertPayload,
    results_file: Option<PathBuf>,
) -> Vec<HashMap<String, String>> {
    let path = results_file.or_else(|| payload.results_file.as_deref().map(PathBuf::from));
    match path {
        Some(path) => splunk::parse_results_file(&path),
        None => payload
            .result
            .as_ref()
            .map(splunk::result_to_row)
            .filter(|row| !row.is_empty())
            .map(|row| vec![row])
            .unwrap_or_default(),
    }
}

async fn run_slack_alert(
    mut config: AppConfig,
    results_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let payload = read_payload(&mut config)?;
    if !config.slack.has_credentials() {
        bail!("Neither SLACK_WEBHOOK_URL nor SLACK_BOT_TOKEN configured");
    }

    let results = load_results(&payload, results_file);
    if results.is_empty() {
        tracing::warn!("No results to send");
        return Ok(());
    }

    let slack = SlackClient::new(config.slack.clone());
    let outcome = dispatch::dispatch_alert(&config, &slack, &payload, &results, Utc::now()).await;
    if !outcome.delivered {
        bail!("Alert delivery to Slack failed");
    }
    Ok(())
}

async fn run_track(
    mut config: AppConfig,
    tracker_name: &str,
    device_field: &str,
    key_field: &str,
    state_field: &str,
    results_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let payload = read_payload(&mut config)?;
    let results = load_results(&payload, results_file);
    let observed = observed_from_results(&results, device_field, key_field, state_field);

    let tracker = StateTracker::new(config.lookups.tracker(tracker_name));
    let now = Utc::now();
    let transitions = tracker.evaluate(&observed, now)?;

    if transitions.is_empty() {
        tracing::info!(tracker = %tracker_name, "No state transitions detected");
        return Ok(());
    }
    tracing::info!(
        tracker = %tracker_name,
        count = transitions.len(),
        "State transitions detected"
    );

    if !config.slack.has_credentials() {
        bail!("Transitions detected but no Slack credentials configured");
    }
    let slack = SlackClient::new(config.slack.clone());
    let rows = dispatch::transition_rows(&transitions, key_field, state_field);
    let outcome = dispatch::dispatch_alert(&config, &slack, &payload, &rows, now).await;
    if !outcome.delivered {
        bail!("Transition alert delivery to Slack failed");
    }
    Ok(())
}

async fn run_auto_block(
    mut config: AppConfig,
    action: BlockAction,
    ip: Option<String>,
    reason: &str,
) -> anyhow::Result<()> {
    // Manual invocations skip the stdin protocol entirely.
    let rows = match &ip {
        Some(_) => Vec::new(),
        None => {
            let payload = read_payload(&mut config)?;
            load_results(&payload, None)
        }
    };

    let fortigate = FortiGateClient::new(&config.fortigate);
    let slack = SlackClient::new(config.slack.clone());
    let audit = AuditLog::new(&config.lookups.audit_log);
    let engine = AutoBlockEngine::new(&config, &fortigate, &slack, &audit);

    match ip {
        Some(ip) => match action {
            BlockAction::Block => engine
                .block_manual(&ip, reason)
                .await
                .with_context(|| format!("manual block of {} failed", ip)),
            BlockAction::Unblock => engine
                .unblock_manual(&ip)
                .await
                .with_context(|| format!("manual unblock of {} failed", ip)),
        },
        None => {
            if rows.is_empty() {
                tracing::warn!("No correlation results received");
                return Ok(());
            }
            let summary = engine.process_results(&rows).await?;
            tracing::info!(
                blocked = summary.blocked.len(),
                review = summary.review_requested.len(),
                failed = summary.failed.len(),
                skipped = summary.skipped,
                "Auto-block run complete"
            );
            if !summary.failed.is_empty() {
                bail!("Auto-block failed for: {}", summary.failed.join(", "));
            }
            Ok(())
        }
    }
}

async fn run_unblock_sweep(config: AppConfig) -> anyhow::Result<()> {
    let fortigate = FortiGateClient::new(&config.fortigate);
    let slack = SlackClient::new(config.slack.clone());
    let audit = AuditLog::new(&config.lookups.audit_log);
    let engine = AutoBlockEngine::new(&config, &fortigate, &slack, &audit);

    let released = engine.unblock_sweep(Utc::now()).await?;
    tracing::info!(count = released.len(), "Unblock sweep complete");
    Ok(())
}

async fn run_respond(mut config: AppConfig) -> anyhow::Result<()> {
    let payload = read_payload(&mut config)?;
    let rows = load_results(&payload, None);
    let data = rows.into_iter().next().unwrap_or_default();

    let fortigate = FortiGateClient::new(&config.fortigate);
    let slack = SlackClient::new(config.slack.clone());
    let audit = AuditLog::new(&config.lookups.audit_log);
    let blocker = AutoBlockEngine::new(&config, &fortigate, &slack, &audit);
    let responder = AutoResponseEngine::new(&fortigate, &slack, &audit, &blocker);

    let outcome = responder.execute(&payload.search_name, &data).await;
    match outcome {
        ResponseOutcome::Failed { message } => bail!("Automated response failed: {}", message),
        _ => Ok(()),
    }
}

async fn run_callback_server(config: AppConfig, bind: &str) -> anyhow::Result<()> {
    let state = Arc::new(CallbackState {
        signing_secret: config.slack.signing_secret.clone(),
        store: AlertStateStore::new(&config.lookups.alert_state),
        slack: SlackClient::new(config.slack.clone()),
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    callback::serve(listener, state)
        .await
        .context("callback server terminated")
}
