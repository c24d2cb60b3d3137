mod cli;
mod confirm;
mod output;

use anyhow::{Context as _, Result};
use clap::Parser;
use cli::{Cli, Commands, GatewayRef};
use confirm::PromptConfirm;
use futures::TryStreamExt as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use unrelated_gateway_reconciler::{
    AlwaysConfirm, Confirm, Deployment, McpToolClient, Overrides, Settings, SystemClock,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            ExitCode::from(1)
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Exit code for a multi-item result: 2 only when every item failed.
fn outcome_code(all_failed: bool) -> ExitCode {
    if all_failed {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let overrides = Overrides {
        profile: cli.profile.clone(),
        region: cli.region.clone(),
    };
    let settings = Settings::load(&cli.config_file, &overrides)?;
    tracing::debug!(
        region = %settings.region,
        endpoint = %settings.control_plane_endpoint,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("build HTTP client")?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping after the current request");
                cancel.cancel();
            }
        });
    }
    let deployment = Deployment::new(settings, http, Arc::new(SystemClock), cancel);
    let format = cli.output;

    match cli.command {
        Commands::Create => {
            let spec = deployment.settings().require_gateway()?.clone();
            let reg = deployment.registrar().create_gateway(&spec).await?;
            output::registration(&reg, format)?;
            Ok(outcome_code(reg.all_failed()))
        }
        Commands::List(args) => {
            let reconciler = deployment.reconciler(Arc::new(AlwaysConfirm));
            let stream = if args.all {
                reconciler.list_all()
            } else {
                reconciler.list()
            };
            let gateways: Vec<_> = stream.try_collect().await?;
            output::gateways(&gateways, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info(args) => {
            let details = deployment
                .reconciler(Arc::new(AlwaysConfirm))
                .info(&args.gateway_id)
                .await?;
            output::details(&details, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CleanupGateways(args) => {
            let reconciler = deployment.reconciler(confirmer(args.force.force));
            let ids = if args.gateway_ids.is_empty() {
                reconciler
                    .list()
                    .map_ok(|gw| gw.id)
                    .try_collect::<Vec<_>>()
                    .await?
            } else {
                args.gateway_ids
            };
            let report = reconciler.cleanup(&ids, args.force.force).await?;
            output::cleanup(&report, format)?;
            Ok(outcome_code(report.all_failed()))
        }
        Commands::CleanupAll(args) => {
            let report = deployment
                .reconciler(confirmer(args.force))
                .cleanup_owned(args.force)
                .await?;
            output::cleanup(&report, format)?;
            Ok(outcome_code(report.all_failed()))
        }
        Commands::Tools(gateway) => {
            let client = connect(&deployment, &gateway).await?;
            let tools = client.list_tools().await?;
            output::tools(&tools, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CallTool(args) => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args.args).context("--args is not valid JSON")?;
            if !arguments.is_object() {
                anyhow::bail!("--args must be a JSON object");
            }
            let client = connect(&deployment, &args.gateway).await?;
            let result = client.call_tool(&args.name, arguments).await?;
            output::tool_result(&result, format)?;
            Ok(outcome_code(result.is_error))
        }
        Commands::SearchTools(args) => {
            let client = connect(&deployment, &args.gateway).await?;
            let found = client.search_tools(&args.query).await;
            output::search_results(&found, format)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn confirmer(force: bool) -> Arc<dyn Confirm> {
    if force {
        Arc::new(AlwaysConfirm)
    } else {
        Arc::new(PromptConfirm)
    }
}

async fn connect(deployment: &Deployment, gateway: &GatewayRef) -> Result<McpToolClient> {
    let url = match (&gateway.gateway_url, &gateway.gateway_id) {
        (Some(url), _) => url.clone(),
        (None, Some(id)) => {
            let details = deployment
                .reconciler(Arc::new(AlwaysConfirm))
                .info(id)
                .await?;
            let status = details.gateway.status;
            details
                .gateway
                .gateway_url
                .with_context(|| format!("gateway {id} has no URL yet (status {status})"))?
        }
        (None, None) => anyhow::bail!("either --gateway-url or --gateway-id is required"),
    };
    let client = deployment
        .mcp_client(&url)
        .await
        .with_context(|| format!("connect to MCP endpoint of {url}"))?;
    Ok(client)
}
