use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;

use davmirrord::config::ServiceConfig;
use davmirrord::service::{ServiceEvent, SyncService};

const DEFAULT_BUNDLE_IDENTIFIER: &str = "org.davmirror.daemon";
const DEFAULT_REFRESH_SECS: u64 = 30;
const DIRTY_BUDGET_PER_TICK: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run(RunOptions),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunOptions {
    directory: PathBuf,
    bundle_identifier: String,
    shared_container: Option<String>,
    refresh: Duration,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut directory = None;
    let mut bundle_identifier = DEFAULT_BUNDLE_IDENTIFIER.to_string();
    let mut shared_container = None;
    let mut refresh = Duration::from_secs(DEFAULT_REFRESH_SECS);
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliMode::Help),
            "--directory" => {
                directory = Some(PathBuf::from(
                    args.next().context("--directory needs a path")?,
                ));
            }
            "--bundle-id" => {
                bundle_identifier = args.next().context("--bundle-id needs a value")?;
            }
            "--shared-container" => {
                shared_container = Some(args.next().context("--shared-container needs a value")?);
            }
            "--refresh-secs" => {
                let value = args.next().context("--refresh-secs needs a value")?;
                refresh = Duration::from_secs(
                    value.parse().context("--refresh-secs must be a number")?,
                );
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    let directory = directory.context("--directory is required")?;
    Ok(CliMode::Run(RunOptions {
        directory,
        bundle_identifier,
        shared_container,
        refresh,
    }))
}

fn print_usage() {
    println!("Usage: davmirrord --directory <path> [options]");
    println!("  --directory <path>          Root for all persisted state (required)");
    println!("  --bundle-id <id>            Namespace for transfer sessions");
    println!("  --shared-container <id>     Shared container passed to the transfer session");
    println!("  --refresh-secs <n>          Background refresh interval");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let options = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            return Ok(());
        }
        CliMode::Run(options) => options,
    };

    let mut config = ServiceConfig::new(&options.directory, &options.bundle_identifier);
    if let Some(container) = &options.shared_container {
        config = config.with_shared_container(container);
    }
    let service = SyncService::open(config)
        .await
        .context("failed to open the sync service")?;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::ResourcesChanged(changes)) => tracing::info!(
                    written = changes.inserted_or_updated.len(),
                    deleted = changes.deleted.len(),
                    "resources changed"
                ),
                Ok(event) => tracing::info!(?event, "account event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(
        directory = %options.directory.display(),
        refresh = ?options.refresh,
        "davmirrord started"
    );

    let mut ticker = tokio::time::interval(options.refresh);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => refresh_all(&service).await,
        }
    }
    tracing::info!("davmirrord stopped");
    Ok(())
}

async fn refresh_all(service: &SyncService) {
    let accounts = match service.accounts().await {
        Ok(accounts) => accounts,
        Err(err) => {
            tracing::warn!(error = %err, "failed to list accounts");
            return;
        }
    };
    for account in accounts {
        match service
            .refresh_account(&account.id, DIRTY_BUDGET_PER_TICK)
            .await
        {
            Ok(reconciled) => {
                tracing::debug!(account = %account.id, reconciled, "refresh round done");
            }
            Err(err) => {
                // Remote errors are not retried here; the next tick is the
                // retry policy.
                tracing::warn!(account = %account.id, error = %err, "refresh failed");
            }
        }
    }
}
