use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        product::{self, Entity as ProductEntity},
        product_size::{self, Entity as ProductSizeEntity},
    },
    errors::ServiceError,
};

/// Parses a product reference that tolerates the composite
/// `"{productId}_{size}"` encoding used by cart snapshots.
pub fn parse_product_ref(raw: &str) -> Result<(Uuid, Option<String>), ServiceError> {
    if let Ok(id) = Uuid::parse_str(raw) {
        return Ok((id, None));
    }
    if let Some((head, tail)) = raw.split_once('_') {
        if !tail.is_empty() {
            if let Ok(id) = Uuid::parse_str(head) {
                return Ok((id, Some(tail.to_string())));
            }
        }
    }
    Err(ServiceError::InvalidInput(format!(
        "'{}' is not a product id or product_size reference",
        raw
    )))
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct SizeInput {
    #[validate(length(min = 1, message = "Size label is required"))]
    pub label: String,
    #[validate(range(min = 0))]
    pub qty: i32,
    pub price: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub discount_percent: Decimal,
    #[serde(default)]
    pub is_best_seller: bool,
    #[serde(default)]
    pub is_featured: bool,
    #[validate(length(min = 1, message = "At least one size is required"))]
    pub sizes: Vec<SizeInput>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProductSizeResponse {
    pub id: Uuid,
    pub label: String,
    pub qty: i32,
    pub price: Decimal,
    pub sold: i32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProductResponse {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub discount_percent: Decimal,
    pub is_best_seller: bool,
    pub is_featured: bool,
    pub sold: i32,
    pub sizes: Vec<ProductSizeResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductListResponse {
    pub products: Vec<ProductResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Catalog reads and admin writes for products and their size variants.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(title = %request.title))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<ProductResponse, ServiceError> {
        request.validate()?;
        for size in &request.sizes {
            size.validate()?;
            if size.price <= Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "Price for size '{}' must be greater than zero",
                    size.label
                )));
            }
        }

        let now = Utc::now();
        let product_id = Uuid::new_v4();

        let txn = self.db.begin().await?;

        let model = product::ActiveModel {
            id: Set(product_id),
            title: Set(request.title.clone()),
            description: Set(request.description),
            image: Set(request.image),
            discount_percent: Set(request.discount_percent),
            is_best_seller: Set(request.is_best_seller),
            is_featured: Set(request.is_featured),
            sold: Set(0),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };
        let product = model.insert(&txn).await?;

        let mut sizes = Vec::with_capacity(request.sizes.len());
        for size in request.sizes {
            let size_model = product_size::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(product_id),
                label: Set(size.label),
                qty: Set(size.qty),
                price: Set(size.price),
                sold: Set(0),
            };
            sizes.push(size_model.insert(&txn).await?);
        }

        txn.commit().await?;

        info!(product_id = %product_id, "Product created");
        Ok(Self::to_response(product, sizes))
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn get_product(&self, product_id: Uuid) -> Result<ProductResponse, ServiceError> {
        let product = ProductEntity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", product_id))
            })?;

        let sizes = ProductSizeEntity::find()
            .filter(product_size::Column::ProductId.eq(product_id))
            .all(&*self.db)
            .await?;

        Ok(Self::to_response(product, sizes))
    }

    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<ProductListResponse, ServiceError> {
        let paginator = ProductEntity::find()
            .order_by_desc(product::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let products = paginator.fetch_page(page.saturating_sub(1)).await?;

        let mut responses = Vec::with_capacity(products.len());
        for product in products {
            let sizes = ProductSizeEntity::find()
                .filter(product_size::Column::ProductId.eq(product.id))
                .all(&*self.db)
                .await?;
            responses.push(Self::to_response(product, sizes));
        }

        Ok(ProductListResponse {
            products: responses,
            total,
            page,
            per_page,
        })
    }

    fn to_response(product: product::Model, sizes: Vec<product_size::Model>) -> ProductResponse {
        ProductResponse {
            id: product.id,
            title: product.title,
            description: product.description,
            image: product.image,
            discount_percent: product.discount_percent,
            is_best_seller: product.is_best_seller,
            is_featured: product.is_featured,
            sold: product.sold,
            sizes: sizes
                .into_iter()
                .map(|size| ProductSizeResponse {
                    id: size.id,
                    label: size.label,
                    qty: size.qty,
                    price: size.price,
                    sold: size.sold,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn plain_uuid_parses_without_size() {
        let id = Uuid::new_v4();
        let (parsed, size) = parse_product_ref(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(size, None);
    }

    #[test]
    fn composite_ref_parses_id_and_size() {
        let id = Uuid::new_v4();
        let raw = format!("{}_100ml", id);
        let (parsed, size) = parse_product_ref(&raw).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(size.as_deref(), Some("100ml"));
    }

    #[test]
    fn size_suffix_may_itself_contain_underscores() {
        let id = Uuid::new_v4();
        let raw = format!("{}_extra_large", id);
        let (parsed, size) = parse_product_ref(&raw).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(size.as_deref(), Some("extra_large"));
    }

    #[test]
    fn garbage_reference_is_rejected() {
        assert_matches!(
            parse_product_ref("not-a-uuid_100ml"),
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(
            parse_product_ref("plaintext"),
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(parse_product_ref(""), Err(ServiceError::InvalidInput(_)));
    }
}
