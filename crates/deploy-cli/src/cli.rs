use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "unrelated-gateway-deploy")]
#[command(about = "Register, inspect and tear down MCP gateways behind OAuth client credentials")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Deployment configuration (JSON or YAML)
    #[arg(
        short,
        long,
        global = true,
        env = "UNRELATED_DEPLOY_CONFIG",
        default_value = "gateway-deploy.yaml"
    )]
    pub config_file: PathBuf,

    /// Region override (applied after the profile)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Named override block from the config's `profiles` section
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format for command results
    #[arg(short, long, global = true, default_value = "table")]
    pub output: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    #[default]
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the configured gateway (or adopt an existing one) and attach its targets
    Create,
    /// List gateways owned by this tool
    List(ListArgs),
    /// Show one gateway and its targets
    Info(InfoArgs),
    /// Delete the given gateways, or every owned gateway when none are given
    CleanupGateways(CleanupArgs),
    /// Delete every owned gateway after a single confirmation
    CleanupAll(ForceArgs),
    /// List MCP tools exposed through a gateway
    Tools(GatewayRef),
    /// Invoke one MCP tool through a gateway
    CallTool(CallToolArgs),
    /// Semantic tool search (gateways with search enabled)
    SearchTools(SearchArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Include gateways not owned by this tool
    #[arg(long)]
    pub all: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    #[arg(long)]
    pub gateway_id: String,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Gateway id to delete (repeatable)
    #[arg(long = "gateway-id")]
    pub gateway_ids: Vec<String>,
    #[command(flatten)]
    pub force: ForceArgs,
}

#[derive(Args)]
pub struct ForceArgs {
    /// Do not ask for confirmation
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct GatewayRef {
    /// Gateway URL (the `/mcp` suffix is optional)
    #[arg(long)]
    pub gateway_url: Option<String>,
    /// Gateway id; its URL is looked up on the control plane
    #[arg(long)]
    pub gateway_id: Option<String>,
}

#[derive(Args)]
pub struct CallToolArgs {
    #[command(flatten)]
    pub gateway: GatewayRef,
    /// Tool name as listed by `tools`
    #[arg(long)]
    pub name: String,
    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,
}

#[derive(Args)]
pub struct SearchArgs {
    #[command(flatten)]
    pub gateway: GatewayRef,
    /// Natural-language query
    #[arg(long)]
    pub query: String,
}
