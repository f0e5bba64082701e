// Shop listing command

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ListResponse;
use crate::client::Client;
use crate::output::{print_table_header, print_table_row, OutputFormat};

/// Shop response from API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shop {
    pub id: Uuid,
    pub name: String,
    pub created_at: String,
}

/// Registration response from API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub target_url: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    pub active: bool,
}

/// Shop with its registrations, as printed by `shops`
#[derive(Debug, Serialize)]
struct ShopListing {
    #[serde(flatten)]
    shop: Shop,
    registrations: Vec<Registration>,
}

pub async fn list_shops(client: &Client) -> Result<Vec<Shop>> {
    let response: ListResponse<Shop> = client.get("/v1/shops").await?;
    Ok(response.data)
}

pub async fn run(client: &Client, output: OutputFormat) -> Result<()> {
    let shops = list_shops(client).await?;

    let mut listings = Vec::with_capacity(shops.len());
    for shop in shops {
        let registrations: ListResponse<Registration> = client
            .get(&format!("/v1/shops/{}/registrations", shop.id))
            .await?;
        listings.push(ShopListing {
            shop,
            registrations: registrations.data,
        });
    }

    if !output.is_text() {
        return output.print_value(&serde_json::json!({ "data": listings }));
    }

    if listings.is_empty() {
        println!("No shops found. Run `courier seed` first.");
        return Ok(());
    }

    print_table_header(&[("ID", 36), ("NAME", 20), ("REGISTRATIONS", 13)]);
    for listing in &listings {
        print_table_row(&[
            (&listing.shop.id.to_string(), 36),
            (&listing.shop.name, 20),
            (&listing.registrations.len().to_string(), 13),
        ]);
    }

    Ok(())
}
