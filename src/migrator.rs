use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_products_table::Migration),
            Box::new(m20240101_000002_create_product_sizes_table::Migration),
            Box::new(m20240101_000003_create_coupons_table::Migration),
            Box::new(m20240101_000004_create_coupon_usages_table::Migration),
            Box::new(m20240101_000005_create_orders_table::Migration),
            Box::new(m20240101_000006_create_order_items_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::Title).string().not_null())
                        .col(ColumnDef::new(Products::Description).text())
                        .col(ColumnDef::new(Products::Image).string())
                        .col(
                            ColumnDef::new(Products::DiscountPercent)
                                .decimal_len(19, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::IsBestSeller)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Products::IsFeatured)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Products::Sold).integer().not_null().default(0))
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Products::UpdatedAt).timestamp_with_time_zone())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Products {
        Table,
        Id,
        Title,
        Description,
        Image,
        DiscountPercent,
        IsBestSeller,
        IsFeatured,
        Sold,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000002_create_product_sizes_table {
    use sea_orm_migration::prelude::*;

    use super::m20240101_000001_create_products_table::Products;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_product_sizes_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProductSizes::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductSizes::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductSizes::ProductId).uuid().not_null())
                        .col(ColumnDef::new(ProductSizes::Label).string().not_null())
                        .col(ColumnDef::new(ProductSizes::Qty).integer().not_null().default(0))
                        .col(
                            ColumnDef::new(ProductSizes::Price)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductSizes::Sold)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_product_sizes_product")
                                .from(ProductSizes::Table, ProductSizes::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_product_sizes_product_label")
                        .table(ProductSizes::Table)
                        .col(ProductSizes::ProductId)
                        .col(ProductSizes::Label)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductSizes::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum ProductSizes {
        Table,
        Id,
        ProductId,
        Label,
        Qty,
        Price,
        Sold,
    }
}

mod m20240101_000003_create_coupons_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_coupons_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Coupons::Code).string().not_null())
                        .col(
                            ColumnDef::new(Coupons::DiscountPercent)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::StartDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::EndDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Coupons::MinimumOrderValue).decimal_len(19, 4))
                        .col(ColumnDef::new(Coupons::MaxUsers).integer())
                        .col(
                            ColumnDef::new(Coupons::PerUserLimit)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Coupons::CurrentUserCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Coupons::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Coupons::UpdatedAt).timestamp_with_time_zone())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Coupons {
        Table,
        Id,
        Code,
        DiscountPercent,
        StartDate,
        EndDate,
        MinimumOrderValue,
        MaxUsers,
        PerUserLimit,
        CurrentUserCount,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000004_create_coupon_usages_table {
    use sea_orm_migration::prelude::*;

    use super::m20240101_000003_create_coupons_table::Coupons;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_coupon_usages_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CouponUsages::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CouponUsages::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CouponUsages::CouponId).uuid().not_null())
                        .col(ColumnDef::new(CouponUsages::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(CouponUsages::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_coupon_usages_coupon")
                                .from(CouponUsages::Table, CouponUsages::CouponId)
                                .to(Coupons::Table, Coupons::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // The per-user redemption gate: existence of a row is the signal,
            // the unique index is the concurrent-redemption backstop.
            manager
                .create_index(
                    Index::create()
                        .name("idx_coupon_usages_coupon_user")
                        .table(CouponUsages::Table)
                        .col(CouponUsages::CouponId)
                        .col(CouponUsages::UserId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CouponUsages::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum CouponUsages {
        Table,
        Id,
        CouponId,
        UserId,
        CreatedAt,
    }
}

mod m20240101_000005_create_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::OrderNumber).string().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string().not_null())
                        .col(ColumnDef::new(Orders::Total).decimal_len(19, 4).not_null())
                        .col(
                            ColumnDef::new(Orders::TotalBeforeDiscount)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalSaved)
                                .decimal_len(19, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::CouponCode).string())
                        .col(ColumnDef::new(Orders::ShippingAddress).json().not_null())
                        .col(
                            ColumnDef::new(Orders::IsPaid)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Orders::PaidAt).timestamp_with_time_zone())
                        .col(ColumnDef::new(Orders::RazorpayOrderId).string())
                        .col(ColumnDef::new(Orders::RazorpayPaymentId).string())
                        .col(ColumnDef::new(Orders::PaymentResult).json())
                        .col(ColumnDef::new(Orders::PaymentDetails).json())
                        .col(ColumnDef::new(Orders::RefundDetails).json())
                        .col(
                            ColumnDef::new(Orders::InventoryCommitted)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::UpdatedAt).timestamp_with_time_zone())
                        .col(ColumnDef::new(Orders::Version).integer().not_null().default(1))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_orders_order_number")
                        .table(Orders::Table)
                        .col(Orders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_orders_razorpay_order_id")
                        .table(Orders::Table)
                        .col(Orders::RazorpayOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_orders_razorpay_payment_id")
                        .table(Orders::Table)
                        .col(Orders::RazorpayPaymentId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Orders {
        Table,
        Id,
        OrderNumber,
        UserId,
        Status,
        PaymentMethod,
        Total,
        TotalBeforeDiscount,
        TotalSaved,
        CouponCode,
        ShippingAddress,
        IsPaid,
        PaidAt,
        RazorpayOrderId,
        RazorpayPaymentId,
        PaymentResult,
        PaymentDetails,
        RefundDetails,
        InventoryCommitted,
        CreatedAt,
        UpdatedAt,
        Version,
    }
}

mod m20240101_000006_create_order_items_table {
    use sea_orm_migration::prelude::*;

    use super::m20240101_000005_create_orders_table::Orders;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::SizeLabel).string().not_null())
                        .col(ColumnDef::new(OrderItems::Name).string().not_null())
                        .col(ColumnDef::new(OrderItems::Image).string())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::LineTotal)
                                .decimal_len(19, 4)
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        SizeLabel,
        Name,
        Image,
        Quantity,
        UnitPrice,
        LineTotal,
    }
}
