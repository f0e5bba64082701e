// Pipeline stats dashboard

use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::shops::list_shops;
use crate::client::Client;
use crate::output::OutputFormat;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShopStats {
    pub shop_id: Uuid,
    pub depth: u64,
    pub backpressure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptCounts {
    pub total: u64,
    pub success: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub success: u64,
    pub dead: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub average_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub attempts: AttemptCounts,
    pub deliveries: DeliveryCounts,
    pub latency: LatencyStats,
}

/// Stats response from API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub global_depth: u64,
    pub global_backpressure: bool,
    pub shops: Vec<ShopStats>,
    pub metrics: MetricsSnapshot,
}

fn flag(active: bool) -> &'static str {
    if active {
        "ACTIVE"
    } else {
        "-"
    }
}

/// Text dashboard for one snapshot
pub fn render(stats: &PipelineStats, names: &HashMap<Uuid, String>) -> String {
    let mut out = String::new();
    let m = &stats.metrics;

    let _ = writeln!(out, "QUEUES");
    let _ = writeln!(out, "  global depth   {}", stats.global_depth);
    let _ = writeln!(out, "  backpressure   {}", flag(stats.global_backpressure));
    let _ = writeln!(out);

    if stats.shops.is_empty() {
        let _ = writeln!(out, "  no active shops");
    } else {
        let _ = writeln!(out, "  {:<20}  {:>8}  {}", "SHOP", "DEPTH", "BACKPRESSURE");
        for shop in &stats.shops {
            let id = shop.shop_id.to_string();
            let name = names.get(&shop.shop_id).map(String::as_str).unwrap_or(id.as_str());
            let _ = writeln!(
                out,
                "  {:<20}  {:>8}  {}",
                name,
                shop.depth,
                flag(shop.backpressure)
            );
        }
    }
    let _ = writeln!(out);

    let success_rate = if m.attempts.total == 0 {
        0.0
    } else {
        m.attempts.success as f64 * 100.0 / m.attempts.total as f64
    };
    let _ = writeln!(out, "DELIVERIES");
    let _ = writeln!(
        out,
        "  attempts       {} ({} ok, {:.1}%)",
        m.attempts.total, m.attempts.success, success_rate
    );
    let _ = writeln!(out, "  delivered      {}", m.deliveries.success);
    let _ = writeln!(out, "  dead           {}", m.deliveries.dead);
    let _ = writeln!(
        out,
        "  e2e latency    avg {:.0} ms, max {} ms ({} samples)",
        m.latency.average_ms, m.latency.max_ms, m.latency.samples
    );
    out
}

async fn show(client: &Client, output: OutputFormat, watching: bool) -> Result<()> {
    let stats: PipelineStats = client.get("/v1/stats").await?;

    if !output.is_text() {
        return output.print_value(&stats);
    }

    let names: HashMap<Uuid, String> = list_shops(client)
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    if watching {
        // Clear screen, cursor home
        print!("\x1B[2J\x1B[H");
    }
    print!("{}", render(&stats, &names));
    Ok(())
}

pub async fn run(
    client: &Client,
    output: OutputFormat,
    watch: Option<u64>,
    clear: bool,
) -> Result<()> {
    if clear {
        client.delete("/v1/stats/metrics").await?;
    }

    let Some(secs) = watch else {
        return show(client, output, false).await;
    };

    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => show(client, output, true).await?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let shop_id = Uuid::now_v7();
        let unnamed = Uuid::now_v7();
        let stats = PipelineStats {
            global_depth: 42,
            global_backpressure: false,
            shops: vec![
                ShopStats {
                    shop_id,
                    depth: 40,
                    backpressure: true,
                },
                ShopStats {
                    shop_id: unnamed,
                    depth: 2,
                    backpressure: false,
                },
            ],
            metrics: MetricsSnapshot {
                attempts: AttemptCounts {
                    total: 4,
                    success: 3,
                },
                deliveries: DeliveryCounts {
                    success: 3,
                    dead: 1,
                },
                latency: LatencyStats {
                    samples: 3,
                    average_ms: 120.4,
                    max_ms: 300,
                },
            },
        };
        let names = HashMap::from([(shop_id, "Acme Corp".to_string())]);

        let text = render(&stats, &names);
        assert!(text.contains("global depth   42"));
        assert!(text.contains("Acme Corp"));
        assert!(text.contains(&unnamed.to_string()));
        assert!(text.contains("ACTIVE"));
        assert!(text.contains("4 (3 ok, 75.0%)"));
        assert!(text.contains("avg 120 ms, max 300 ms"));
    }

    #[test]
    fn test_render_empty() {
        let text = render(&PipelineStats::default(), &HashMap::new());
        assert!(text.contains("no active shops"));
        assert!(text.contains("0 (0 ok, 0.0%)"));
    }
}
