use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        coupon::{self, Entity as CouponEntity, Model as CouponModel},
        coupon_usage::{self, Entity as CouponUsageEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Typed rejection reasons, checked in this order; the first failing check
/// wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponRejection {
    InvalidCoupon,
    Expired,
    CapReached,
    AlreadyUsed,
    BelowMinimum,
}

impl CouponRejection {
    pub fn user_message(&self) -> &'static str {
        match self {
            CouponRejection::InvalidCoupon => "Invalid coupon code",
            CouponRejection::Expired => "Coupon has expired or not yet valid",
            CouponRejection::CapReached => {
                "Maximum number of users have already used this coupon"
            }
            CouponRejection::AlreadyUsed => "You have already used this coupon",
            CouponRejection::BelowMinimum => "Order value is below the minimum for this coupon",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount_percent: Decimal,
}

/// Outcome of a validation or redemption attempt. Rejections are values,
/// never errors, so callers map them to user-facing messages.
#[derive(Debug, Clone)]
pub enum CouponDecision {
    Approved(ApprovedCoupon),
    Rejected(CouponRejection),
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateCouponRequest {
    #[validate(length(min = 1, max = 50, message = "Code must be 1-50 characters"))]
    pub code: String,
    pub discount_percent: Decimal,
    pub start_date: chrono::DateTime<Utc>,
    pub end_date: chrono::DateTime<Utc>,
    pub minimum_order_value: Option<Decimal>,
    #[validate(range(min = 1))]
    pub max_users: Option<i32>,
    #[serde(default)]
    pub per_user_limit: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CouponResponse {
    pub id: Uuid,
    pub code: String,
    pub discount_percent: Decimal,
    pub start_date: chrono::DateTime<Utc>,
    pub end_date: chrono::DateTime<Utc>,
    pub minimum_order_value: Option<Decimal>,
    pub max_users: Option<i32>,
    pub per_user_limit: bool,
    pub current_user_count: i32,
}

fn is_unique_violation(err: &DbErr) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("unique") || message.contains("duplicate key")
}

/// Coupon ledger: validates codes against their time window and usage caps,
/// and performs the atomic redemption bookkeeping.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Admin creation of a coupon.
    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create_coupon(
        &self,
        request: CreateCouponRequest,
    ) -> Result<CouponResponse, ServiceError> {
        request.validate()?;
        if request.discount_percent <= Decimal::ZERO
            || request.discount_percent > Decimal::from(100)
        {
            return Err(ServiceError::ValidationError(
                "Discount percent must be between 0 and 100".to_string(),
            ));
        }
        if request.end_date <= request.start_date {
            return Err(ServiceError::ValidationError(
                "Coupon end date must be after its start date".to_string(),
            ));
        }

        let now = Utc::now();
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(request.code.trim().to_string()),
            discount_percent: Set(request.discount_percent),
            start_date: Set(request.start_date),
            end_date: Set(request.end_date),
            minimum_order_value: Set(request.minimum_order_value),
            max_users: Set(request.max_users),
            per_user_limit: Set(request.per_user_limit),
            current_user_count: Set(0),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };

        let created = model.insert(&*self.db).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict(format!("Coupon code '{}' already exists", request.code))
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;

        info!(coupon_id = %created.id, code = %created.code, "Coupon created");
        Ok(Self::to_response(created))
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<CouponModel>, ServiceError> {
        let found = CouponEntity::find()
            .filter(coupon::Column::Code.eq(code))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Read-only validation; backs the public coupon-validation endpoint.
    #[instrument(skip(self), fields(code = %code))]
    pub async fn validate_coupon(
        &self,
        code: &str,
        user_id: Option<Uuid>,
        order_value: Decimal,
    ) -> Result<CouponDecision, ServiceError> {
        match self.check(&*self.db, code, user_id, order_value).await? {
            Ok(coupon) => Ok(CouponDecision::Approved(ApprovedCoupon {
                coupon_id: coupon.id,
                code: coupon.code,
                discount_percent: coupon.discount_percent,
            })),
            Err(rejection) => Ok(CouponDecision::Rejected(rejection)),
        }
    }

    /// Redeems a coupon in its own transaction. The order assembler uses
    /// [`CouponService::redeem_in`] instead so redemption and order creation
    /// commit together.
    #[instrument(skip(self), fields(code = %code, user_id = %user_id))]
    pub async fn redeem(
        &self,
        code: &str,
        user_id: Uuid,
        order_value: Decimal,
    ) -> Result<CouponDecision, ServiceError> {
        let txn = self.db.begin().await?;
        let decision = match self.redeem_in(&txn, code, user_id, order_value).await {
            Ok(decision) => decision,
            Err(err) => {
                txn.rollback().await.ok();
                return Err(err);
            }
        };

        match &decision {
            CouponDecision::Approved(approved) => {
                txn.commit().await?;
                let _ = self
                    .event_sender
                    .send(Event::CouponRedeemed {
                        coupon_id: approved.coupon_id,
                        user_id,
                        code: approved.code.clone(),
                    })
                    .await;
            }
            CouponDecision::Rejected(_) => {
                txn.rollback().await.ok();
            }
        }

        Ok(decision)
    }

    /// Redemption against a caller-owned connection/transaction.
    ///
    /// The usage-cap counter is advanced with a conditional atomic increment
    /// (`current_user_count < max_users` as a write predicate), and the
    /// per-user usage row insert is backstopped by the unique index on
    /// (coupon_id, user_id); concurrent duplicate redemption surfaces as a
    /// rejection, not a double spend.
    pub async fn redeem_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        user_id: Uuid,
        order_value: Decimal,
    ) -> Result<CouponDecision, ServiceError> {
        let coupon = match self.check(conn, code, Some(user_id), order_value).await? {
            Ok(coupon) => coupon,
            Err(rejection) => return Ok(CouponDecision::Rejected(rejection)),
        };

        let now = Utc::now();
        let incremented = CouponEntity::update_many()
            .col_expr(
                coupon::Column::CurrentUserCount,
                Expr::col(coupon::Column::CurrentUserCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Some(now)))
            .filter(coupon::Column::Id.eq(coupon.id))
            .filter(
                Condition::any()
                    .add(coupon::Column::MaxUsers.is_null())
                    .add(
                        Expr::col(coupon::Column::CurrentUserCount)
                            .lt(Expr::col(coupon::Column::MaxUsers)),
                    ),
            )
            .exec(conn)
            .await?;

        if incremented.rows_affected == 0 {
            // Lost the race for the last redemption slot.
            return Ok(CouponDecision::Rejected(CouponRejection::CapReached));
        }

        if coupon.per_user_limit {
            let usage = coupon_usage::ActiveModel {
                id: Set(Uuid::new_v4()),
                coupon_id: Set(coupon.id),
                user_id: Set(user_id),
                created_at: Set(now),
            };
            if let Err(err) = usage.insert(conn).await {
                if is_unique_violation(&err) {
                    warn!(
                        coupon_id = %coupon.id,
                        user_id = %user_id,
                        "Concurrent duplicate redemption blocked by usage index"
                    );
                    return Ok(CouponDecision::Rejected(CouponRejection::AlreadyUsed));
                }
                return Err(ServiceError::DatabaseError(err));
            }
        }

        Ok(CouponDecision::Approved(ApprovedCoupon {
            coupon_id: coupon.id,
            code: coupon.code,
            discount_percent: coupon.discount_percent,
        }))
    }

    /// Validation checks, first failing check wins: existence, window, cap,
    /// per-user usage, minimum order value.
    async fn check<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        user_id: Option<Uuid>,
        order_value: Decimal,
    ) -> Result<Result<CouponModel, CouponRejection>, ServiceError> {
        let Some(coupon) = CouponEntity::find()
            .filter(coupon::Column::Code.eq(code))
            .one(conn)
            .await?
        else {
            return Ok(Err(CouponRejection::InvalidCoupon));
        };

        let now = Utc::now();
        if now < coupon.start_date || now > coupon.end_date {
            return Ok(Err(CouponRejection::Expired));
        }

        if let Some(max_users) = coupon.max_users {
            if coupon.current_user_count >= max_users {
                return Ok(Err(CouponRejection::CapReached));
            }
        }

        if coupon.per_user_limit {
            if let Some(user_id) = user_id {
                let used = CouponUsageEntity::find()
                    .filter(coupon_usage::Column::CouponId.eq(coupon.id))
                    .filter(coupon_usage::Column::UserId.eq(user_id))
                    .one(conn)
                    .await?;
                if used.is_some() {
                    return Ok(Err(CouponRejection::AlreadyUsed));
                }
            }
        }

        if let Some(minimum) = coupon.minimum_order_value {
            if order_value < minimum {
                return Ok(Err(CouponRejection::BelowMinimum));
            }
        }

        Ok(Ok(coupon))
    }

    fn to_response(model: CouponModel) -> CouponResponse {
        CouponResponse {
            id: model.id,
            code: model.code,
            discount_percent: model.discount_percent,
            start_date: model.start_date,
            end_date: model.end_date,
            minimum_order_value: model.minimum_order_value,
            max_users: model.max_users,
            per_user_limit: model.per_user_limit,
            current_user_count: model.current_user_count,
        }
    }
}
