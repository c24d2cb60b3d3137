use crate::cli::OutputFormat;
use anyhow::Context as _;
use owo_colors::{OwoColorize as _, Stream, Style};
use serde::Serialize;
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style as TableStyle;
use unrelated_gateway_reconciler::mcp::{ToolCallResult, ToolInfo};
use unrelated_gateway_reconciler::model::{GatewayResource, GatewayStatus};
use unrelated_gateway_reconciler::{
    CleanupOutcome, CleanupReport, GatewayDetails, Registration, TargetOutcome,
};

/// Style `text` for stdout; plain when stdout is not a color terminal.
fn paint(text: &str, style: Style) -> String {
    text.if_supports_color(Stream::Stdout, |t| t.style(style))
        .to_string()
}

fn label(text: &str) -> String {
    paint(text, Style::new().cyan())
}

pub fn print_error(msg: &str) {
    let prefix = "error:".if_supports_color(Stream::Stderr, |t| t.style(Style::new().red().bold()));
    eprintln!("{prefix} {msg}");
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output as json")?;
    println!("{text}");
    Ok(())
}

/// Rounded table; cells may already carry color codes.
fn table<R>(header: &[&str], rows: R) -> String
where
    R: IntoIterator<Item = Vec<String>>,
{
    let mut builder = Builder::default();
    builder.push_record(header.iter().map(|h| paint(h, Style::new().bold())));
    for row in rows {
        builder.push_record(row);
    }
    builder.build().with(TableStyle::rounded()).to_string()
}

fn status_style(status: GatewayStatus) -> Style {
    match status {
        GatewayStatus::Active => Style::new().green(),
        s if s.is_failed() => Style::new().red(),
        s if s.is_going_away() => Style::new().yellow(),
        _ => Style::new(),
    }
}

pub fn gateways(list: &[GatewayResource], format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(list);
    }
    if list.is_empty() {
        println!("No gateways found.");
        return Ok(());
    }
    let rows = list.iter().map(|gw| {
        vec![
            gw.id.clone(),
            gw.name.clone(),
            paint(&gw.status.to_string(), status_style(gw.status)),
            gw.created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            gw.gateway_url.clone().unwrap_or_else(|| "-".to_string()),
        ]
    });
    let header = ["GATEWAY ID", "NAME", "STATUS", "CREATED", "URL"];
    println!("{}", table(&header, rows));
    Ok(())
}

pub fn details(d: &GatewayDetails, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(d);
    }
    let gw = &d.gateway;
    println!(
        "{} {}",
        label("Gateway:"),
        paint(&gw.name, Style::new().bold())
    );
    println!("{} {}", label("ID:"), gw.id);
    println!(
        "{} {}",
        label("Status:"),
        paint(&gw.status.to_string(), status_style(gw.status))
    );
    if let Some(url) = &gw.gateway_url {
        println!("{} {url}", label("URL:"));
    }
    for reason in &gw.status_reasons {
        println!("{} {reason}", label("Reason:"));
    }
    if !gw.tags.is_empty() {
        let tags: Vec<String> = gw.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!("{} {}", label("Tags:"), tags.join(", "));
    }
    if d.targets.is_empty() {
        println!("No targets attached.");
        return Ok(());
    }
    let rows = d
        .targets
        .iter()
        .map(|t| vec![t.id.clone(), t.name.clone(), t.status.to_string()]);
    println!("\n{}", table(&["TARGET ID", "NAME", "STATUS"], rows));
    Ok(())
}

pub fn registration(reg: &Registration, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(reg);
    }
    let verb = if reg.reused_existing {
        "Reused existing gateway"
    } else {
        "Created gateway"
    };
    println!(
        "{} {verb} {} ({})",
        paint("✓", Style::new().green()),
        paint(&reg.gateway.name, Style::new().bold()),
        reg.gateway.id
    );
    if let Some(url) = &reg.gateway.gateway_url {
        println!("{} {url}", label("URL:"));
    }
    if reg.targets.is_empty() {
        return Ok(());
    }
    let rows = reg.targets.iter().map(|t| {
        let (outcome, detail) = match &t.outcome {
            TargetOutcome::Attached { target_id } => {
                (paint("attached", Style::new().green()), target_id)
            }
            TargetOutcome::AlreadyAttached { target_id } => {
                ("already attached".to_string(), target_id)
            }
            TargetOutcome::Failed { error } => (paint("failed", Style::new().red()), error),
        };
        vec![t.target_name.clone(), outcome, detail.clone()]
    });
    println!("\n{}", table(&["TARGET", "OUTCOME", "DETAIL"], rows));
    Ok(())
}

pub fn cleanup(report: &CleanupReport, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    if report.items.is_empty() {
        println!("Nothing to clean up.");
        return Ok(());
    }
    let rows = report.items.iter().map(|item| {
        let (outcome, detail) = match &item.outcome {
            CleanupOutcome::Deleted { detached_targets } => (
                paint("deleted", Style::new().green()),
                format!("{detached_targets} target(s) detached"),
            ),
            CleanupOutcome::AlreadyAbsent => ("absent".to_string(), String::new()),
            CleanupOutcome::Skipped => (paint("skipped", Style::new().yellow()), String::new()),
            CleanupOutcome::Failed { state, error } => (
                paint("failed", Style::new().red()),
                format!("{state:?}: {error}"),
            ),
        };
        vec![
            item.gateway_id.clone(),
            item.name.clone().unwrap_or_else(|| "-".to_string()),
            outcome,
            detail,
        ]
    });
    let header = ["GATEWAY ID", "NAME", "OUTCOME", "DETAIL"];
    println!("{}", table(&header, rows));
    Ok(())
}

pub fn tools(list: &[ToolInfo], format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(list);
    }
    if list.is_empty() {
        println!("No tools exposed.");
        return Ok(());
    }
    let rows = list.iter().map(|t| {
        let first_line = t
            .description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("-");
        vec![t.name.clone(), first_line.to_string()]
    });
    println!("{}", table(&["TOOL", "DESCRIPTION"], rows));
    Ok(())
}

pub fn tool_result(result: &ToolCallResult, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(result);
    }
    let marker = if result.is_error {
        paint("✗", Style::new().red())
    } else {
        paint("✓", Style::new().green())
    };
    println!("{marker} {}", paint(&result.tool_name, Style::new().bold()));
    for item in &result.content {
        match item {
            Value::String(s) => println!("{s}"),
            other => println!(
                "{}",
                serde_json::to_string_pretty(other).context("serialize tool content")?
            ),
        }
    }
    Ok(())
}

pub fn search_results(found: &[Value], format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(found);
    }
    if found.is_empty() {
        println!("No matching tools.");
        return Ok(());
    }
    let field = |v: &Value, k: &str| v.get(k).and_then(Value::as_str).unwrap_or("-").to_string();
    let rows = found
        .iter()
        .map(|v| vec![field(v, "name"), field(v, "description")]);
    println!("{}", table(&["TOOL", "DESCRIPTION"], rows));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizes_columns_to_the_widest_cell() {
        owo_colors::set_override(false);
        let out = table(
            &["ID", "NAME", "STATUS"],
            vec![
                vec![
                    "gw-1".to_string(),
                    "mcp-demo".to_string(),
                    paint("ACTIVE", Style::new().green()),
                ],
                vec!["gw-10".to_string(), "x".to_string(), "DELETING".to_string()],
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 6, "{out}");
        assert_eq!(lines[1], "│ ID    │ NAME     │ STATUS   │");
        assert_eq!(lines[3], "│ gw-1  │ mcp-demo │ ACTIVE   │");
        assert_eq!(lines[4], "│ gw-10 │ x        │ DELETING │");
        assert!(!out.contains('\u{1b}'));
    }
}
