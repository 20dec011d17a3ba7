use serde::{Deserialize, Serialize};
use utoipa::IntoParams;

/// Pagination parameters for list operations
#[derive(Debug, Deserialize, Serialize, IntoParams)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}
