// CLI subcommands

pub mod events;
pub mod seed;
pub mod shops;
pub mod stats;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}
