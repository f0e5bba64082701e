// Event producing commands
//
// `produce` admits each event immediately. `flood` bulk-inserts and admits
// only while the server reports no backpressure, or with `--db-only` leaves
// everything for the drain.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::client::{Client, ClientError};
use crate::output::{print_field, OutputFormat};

/// Events sent per request
pub const BATCH_SIZE: usize = 1000;

/// Ingestion reply from API
#[derive(Debug, Deserialize)]
struct IngestResponse {
    event_ids: Vec<Uuid>,
    admitted: usize,
    skipped: usize,
    jobs: usize,
}

/// Totals across all batches
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub mode: &'static str,
    pub inserted: usize,
    pub admitted: usize,
    pub skipped: usize,
    pub jobs: usize,
}

impl IngestSummary {
    fn add(&mut self, response: IngestResponse) {
        self.inserted += response.event_ids.len();
        self.admitted += response.admitted;
        self.skipped += response.skipped;
        self.jobs += response.jobs;
    }
}

/// Order payload with a couple of random line items
pub fn fake_order(rng: &mut impl Rng) -> Value {
    json!({
        "orderId": Uuid::now_v7(),
        "items": [
            {"sku": "WIDGET-1", "quantity": rng.gen_range(1..=5), "price": 29.99},
            {"sku": "GADGET-2", "quantity": rng.gen_range(1..=3), "price": 49.99},
        ],
        "total": rng.gen_range(50..550),
        "currency": "USD",
        "createdAt": Utc::now().to_rfc3339(),
    })
}

/// Minimal single-item order used for floods
pub fn flood_order() -> Value {
    json!({
        "orderId": Uuid::now_v7(),
        "items": [{"sku": "WIDGET-1", "quantity": 1, "price": 29.99}],
        "total": 100,
        "currency": "USD",
        "createdAt": Utc::now().to_rfc3339(),
    })
}

async fn ingest(
    client: &Client,
    shop_id: Uuid,
    mode: &'static str,
    event_type: &str,
    payloads: Vec<Value>,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary {
        mode,
        ..Default::default()
    };

    for batch in payloads.chunks(BATCH_SIZE) {
        let events: Vec<Value> = batch
            .iter()
            .map(|payload| json!({"event_type": event_type, "payload": payload}))
            .collect();
        let response: IngestResponse = client
            .post(
                &format!("/v1/shops/{shop_id}/events"),
                &json!({"mode": mode, "events": events}),
            )
            .await
            .map_err(|e| match e {
                ClientError::NotFound(_) => anyhow::anyhow!("Shop not found: {}", shop_id),
                e => e.into(),
            })?;
        summary.add(response);
    }

    Ok(summary)
}

fn print_summary(output: OutputFormat, quiet: bool, summary: &IngestSummary) -> Result<()> {
    if !output.is_text() {
        return output.print_value(summary);
    }
    if quiet {
        println!("{}", summary.inserted);
        return Ok(());
    }

    print_field("Mode", summary.mode);
    print_field("Inserted", &summary.inserted.to_string());
    print_field("Admitted", &summary.admitted.to_string());
    if summary.skipped > 0 {
        print_field("Skipped", &format!("{} (backpressure)", summary.skipped));
    }
    print_field("Jobs", &summary.jobs.to_string());
    Ok(())
}

pub async fn produce(
    client: &Client,
    output: OutputFormat,
    quiet: bool,
    shop_id: Uuid,
    count: usize,
    event_type: &str,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    let payloads = (0..count).map(|_| fake_order(&mut rng)).collect();

    let summary = ingest(client, shop_id, "direct", event_type, payloads)
        .await
        .context("Failed to produce events")?;
    print_summary(output, quiet, &summary)
}

pub async fn flood(
    client: &Client,
    output: OutputFormat,
    quiet: bool,
    shop_id: Uuid,
    count: usize,
    db_only: bool,
) -> Result<()> {
    let mode = if db_only { "deferred" } else { "gated" };
    if output.is_text() && !quiet {
        println!("Flooding {} events for shop {} ({} mode)...", count, shop_id, mode);
    }

    let payloads = (0..count).map(|_| flood_order()).collect();
    let summary = ingest(client, shop_id, mode, "order.created", payloads)
        .await
        .context("Failed to flood events")?;
    print_summary(output, quiet, &summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_fake_order_shape() {
        let order = fake_order(&mut rand::thread_rng());
        let items = order["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        let quantity = items[0]["quantity"].as_u64().unwrap();
        assert!((1..=5).contains(&quantity));
        let total = order["total"].as_u64().unwrap();
        assert!((50..550).contains(&total));
        assert_eq!(order["currency"], "USD");
    }

    #[tokio::test]
    async fn test_flood_is_batched_and_summed() {
        let server = MockServer::start().await;
        let shop_id = Uuid::now_v7();
        Mock::given(method("POST"))
            .and(path(format!("/v1/shops/{shop_id}/events")))
            .respond_with(|request: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&request.body).unwrap();
                let n = body["events"].as_array().unwrap().len();
                ResponseTemplate::new(202).set_body_json(json!({
                    "mode": body["mode"],
                    "event_ids": (0..n).map(|_| Uuid::now_v7()).collect::<Vec<_>>(),
                    "admitted": 1,
                    "skipped": n - 1,
                    "jobs": 2,
                }))
            })
            .expect(3)
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let payloads = (0..2500).map(|_| flood_order()).collect();
        let summary = ingest(&client, shop_id, "gated", "order.created", payloads)
            .await
            .unwrap();

        assert_eq!(
            summary,
            IngestSummary {
                mode: "gated",
                inserted: 2500,
                admitted: 3,
                skipped: 2497,
                jobs: 6,
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_shop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "shop not found"})))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let err = ingest(&client, Uuid::now_v7(), "direct", "order.created", vec![json!({})])
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Shop not found"));
    }
}
