// Seed demo shops and registrations
//
// Three shops with registrations pointing at the test receiver; one target
// asks the receiver to fail half of its deliveries.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use super::shops::{Registration, Shop};
use crate::client::Client;
use crate::output::{print_field, OutputFormat};

struct SeedRegistration {
    name: &'static str,
    query: &'static str,
    event_types: &'static [&'static str],
}

struct SeedShop {
    name: &'static str,
    registrations: &'static [SeedRegistration],
}

const SEED: &[SeedShop] = &[
    SeedShop {
        name: "Acme Corp",
        registrations: &[
            SeedRegistration {
                name: "acme-primary",
                query: "",
                event_types: &["order.created", "order.updated"],
            },
            SeedRegistration {
                name: "acme-secondary",
                query: "",
                event_types: &["order.created", "order.updated"],
            },
        ],
    },
    SeedShop {
        name: "Widget World",
        registrations: &[SeedRegistration {
            name: "widget",
            query: "",
            event_types: &["order.created"],
        }],
    },
    SeedShop {
        name: "Gadget Galaxy",
        registrations: &[
            SeedRegistration {
                name: "gadget-good",
                query: "",
                event_types: &["order.created", "order.cancelled"],
            },
            SeedRegistration {
                name: "gadget-flaky",
                query: "&fail_rate=0.5",
                event_types: &["order.created"],
            },
        ],
    },
];

#[derive(Debug, Serialize)]
struct Seeded {
    shop: Shop,
    registrations: Vec<Registration>,
}

fn target_url(receiver_url: &str, registration: &SeedRegistration) -> String {
    let separator = if receiver_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}name={}{}",
        receiver_url, separator, registration.name, registration.query
    )
}

pub async fn run(client: &Client, output: OutputFormat, quiet: bool, receiver_url: &str) -> Result<()> {
    let mut seeded = Vec::with_capacity(SEED.len());

    for seed_shop in SEED {
        let shop: Shop = client
            .post("/v1/shops", &json!({ "name": seed_shop.name }))
            .await?;

        let mut registrations = Vec::with_capacity(seed_shop.registrations.len());
        for registration in seed_shop.registrations {
            let created: Registration = client
                .post(
                    &format!("/v1/shops/{}/registrations", shop.id),
                    &json!({
                        "target_url": target_url(receiver_url, registration),
                        "event_types": registration.event_types,
                    }),
                )
                .await?;
            registrations.push(created);
        }
        seeded.push(Seeded {
            shop,
            registrations,
        });
    }

    if !output.is_text() {
        return output.print_value(&serde_json::json!({ "data": seeded }));
    }

    for entry in &seeded {
        if quiet {
            println!("{}", entry.shop.id);
            continue;
        }
        println!();
        print_field("Shop", &format!("{} ({})", entry.shop.name, entry.shop.id));
        for registration in &entry.registrations {
            print_field(
                "Registration",
                &format!(
                    "{} [{}]",
                    registration.target_url,
                    registration.event_types.join(", ")
                ),
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        let flaky = &SEED[2].registrations[1];
        assert_eq!(
            target_url("http://localhost:3001/webhook", flaky),
            "http://localhost:3001/webhook?name=gadget-flaky&fail_rate=0.5"
        );
        assert_eq!(
            target_url("http://localhost:3001/webhook?x=1", &SEED[1].registrations[0]),
            "http://localhost:3001/webhook?x=1&name=widget"
        );
    }
}
