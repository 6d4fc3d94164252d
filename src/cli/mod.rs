//! Command-line surface: `run` (default), `collect`, `notify`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::notify::{MetadataValue, Notification, NotificationBus, NotificationType};
use crate::types::Priority;

#[derive(Parser, Debug)]
#[command(name = "avian-os")]
#[command(about = "AVIAN-OS bird detection daemon")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the detection daemon (default).
    Run,
    /// Produce a scrubbed diagnostics archive.
    Collect(CollectArgs),
    /// Emit a test notification through the bus.
    Notify(NotifyArgs),
}

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Directory the archive is written to.
    #[arg(long, default_value = ".")]
    pub output: PathBuf,

    /// Log files to excerpt into the archive (repeatable).
    #[arg(long = "log")]
    pub logs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    #[arg(long = "type", value_parser = parse_type, default_value = "info")]
    pub kind: NotificationType,

    #[arg(long, value_parser = parse_priority, default_value = "medium")]
    pub priority: Priority,

    #[arg(long, default_value = "Test notification")]
    pub title: String,

    #[arg(long, default_value = "Notification system test")]
    pub message: String,

    #[arg(long, default_value = "cli")]
    pub component: String,

    /// How long to wait for delivery, e.g. "500ms", "2s", "1m".
    #[arg(long, value_parser = parse_wait, default_value = "1s")]
    pub wait: Duration,

    /// Repeated key=value pairs; values coerce number, then bool, then
    /// string.
    #[arg(long = "metadata", value_parser = parse_metadata)]
    pub metadata: Vec<(String, MetadataValue)>,
}

fn parse_type(s: &str) -> Result<NotificationType, String> {
    s.parse()
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    s.parse()
}

/// Parse "250ms", "30s", "5m", "1h", or bare seconds.
pub fn parse_wait(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit): (String, String) = s
        .chars()
        .partition(|c| c.is_ascii_digit() || *c == '.');
    let value: f64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    let duration = match unit.trim() {
        "ms" => Duration::from_secs_f64(value / 1000.0),
        "" | "s" => Duration::from_secs_f64(value),
        "m" => Duration::from_secs_f64(value * 60.0),
        "h" => Duration::from_secs_f64(value * 3600.0),
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(duration)
}

/// Parse one `key=value` metadata pair with scalar coercion.
pub fn parse_metadata(s: &str) -> Result<(String, MetadataValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("metadata must be key=value, got {s}"))?;
    if key.is_empty() {
        return Err("metadata key must be non-empty".to_string());
    }
    Ok((key.to_string(), MetadataValue::coerce(value)))
}

/// Execute the `notify` subcommand: publish through a local bus and wait
/// for the subscriber to observe delivery.
pub async fn run_notify(args: NotifyArgs) -> anyhow::Result<()> {
    let bus = NotificationBus::new(Duration::ZERO, 8);
    let mut rx = bus.subscribe("cli");

    let mut notification =
        Notification::new(args.kind, args.priority, args.title, args.message)
            .with_component(args.component);
    for (key, value) in args.metadata {
        notification = notification.with_metadata(key, value);
    }
    bus.publish(notification);

    match tokio::time::timeout(args.wait.max(Duration::from_millis(100)), rx.recv()).await {
        Ok(Some(delivered)) => {
            println!("{}", serde_json::to_string_pretty(&delivered)?);
            Ok(())
        }
        _ => anyhow::bail!("notification was not delivered"),
    }
}

/// Execute the `collect` subcommand.
pub fn run_collect(args: CollectArgs, settings: &crate::config::Settings) -> anyhow::Result<()> {
    let request = crate::support::DumpRequest {
        system_id: crate::mqtt::sanitize_id(&settings.station.node_id),
        timestamp: chrono::Utc::now(),
        output_dir: args.output,
        log_paths: args.logs,
    };
    let path = crate::support::collect(&request, settings)?;
    println!("support archive written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_parser_accepts_common_forms() {
        assert_eq!(parse_wait("250ms").expect("ms"), Duration::from_millis(250));
        assert_eq!(parse_wait("30s").expect("s"), Duration::from_secs(30));
        assert_eq!(parse_wait("5m").expect("m"), Duration::from_secs(300));
        assert_eq!(parse_wait("2").expect("bare"), Duration::from_secs(2));
        assert!(parse_wait("5 fortnights").is_err());
    }

    #[test]
    fn metadata_parser_coerces_scalars() {
        assert_eq!(
            parse_metadata("count=3").expect("pair"),
            ("count".to_string(), MetadataValue::Number(3.0))
        );
        assert_eq!(
            parse_metadata("armed=true").expect("pair"),
            ("armed".to_string(), MetadataValue::Bool(true))
        );
        assert_eq!(
            parse_metadata("room=kitchen").expect("pair"),
            ("room".to_string(), MetadataValue::Str("kitchen".to_string()))
        );
        assert!(parse_metadata("no-equals").is_err());
        assert!(parse_metadata("=value").is_err());
    }

    #[test]
    fn cli_parses_notify_flags() {
        let cli = Cli::parse_from([
            "avian-os",
            "notify",
            "--type",
            "detection",
            "--priority",
            "high",
            "--title",
            "t",
            "--message",
            "m",
            "--metadata",
            "confidence=0.9",
            "--metadata",
            "flagged=false",
        ]);
        match cli.command {
            Some(Command::Notify(args)) => {
                assert_eq!(args.kind, NotificationType::Detection);
                assert_eq!(args.priority, Priority::High);
                assert_eq!(args.metadata.len(), 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
