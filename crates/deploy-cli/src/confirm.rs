use async_trait::async_trait;
use owo_colors::{OwoColorize as _, Stream};
use std::io::{BufRead as _, Write as _};
use unrelated_gateway_reconciler::Confirm;
use unrelated_gateway_reconciler::model::{GatewayResource, TargetResource};

/// Interactive y/N prompt on stderr, answered on stdin.
pub struct PromptConfirm;

#[async_trait]
impl Confirm for PromptConfirm {
    async fn confirm_gateway(&self, gateway: &GatewayResource, targets: &[TargetResource]) -> bool {
        let mut text = format!(
            "Delete gateway {} ({}, {})",
            gateway.name.if_supports_color(Stream::Stderr, |t| t.bold()),
            gateway.id,
            gateway.status
        );
        if !targets.is_empty() {
            let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
            text.push_str(&format!(
                " and detach {} target(s): {}",
                targets.len(),
                names.join(", ")
            ));
        }
        ask(text).await
    }

    async fn confirm_batch(&self, gateways: &[GatewayResource]) -> bool {
        let mut text = format!("About to delete {} gateway(s):", gateways.len());
        for gw in gateways {
            text.push_str(&format!("\n  - {} ({})", gw.name, gw.id));
        }
        text.push_str(&format!(
            "\n{}",
            "Delete all of them".if_supports_color(Stream::Stderr, |t| t.red())
        ));
        ask(text).await
    }
}

async fn ask(question: String) -> bool {
    let answer = tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "{question}? [y/N] ");
        let _ = stderr.flush();
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await;
    match answer {
        Ok(Ok(line)) => is_yes(&line),
        // EOF or a closed stdin counts as "no".
        _ => false,
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
