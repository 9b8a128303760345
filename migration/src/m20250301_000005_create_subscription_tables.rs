use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 订阅套餐
        manager
            .create_table(
                Table::create()
                    .table(SubscriptionPlans::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SubscriptionPlans::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::Title)
                            .string_len(100)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::TotalAmount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::DurationUnit)
                            .string_len(16)
                            .not_null()
                            .default("month"),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::DurationValue)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::CustomSeconds)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::QuotaResetPeriod)
                            .string_len(16)
                            .not_null()
                            .default("never"),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::QuotaResetCustomSeconds)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::UpgradeGroup)
                            .string_len(64)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::MaxPurchasePerUser)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // 用户订阅
        manager
            .create_table(
                Table::create()
                    .table(UserSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserSubscriptions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UserSubscriptions::UserId).integer().not_null())
                    .col(ColumnDef::new(UserSubscriptions::PlanId).integer().not_null())
                    .col(
                        ColumnDef::new(UserSubscriptions::AmountTotal)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::AmountUsed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::StartTime)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UserSubscriptions::EndTime).big_integer().not_null())
                    .col(
                        ColumnDef::new(UserSubscriptions::Status)
                            .string_len(20)
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::Source)
                            .string_len(20)
                            .not_null()
                            .default("order"),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::LastResetTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::NextResetTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::UpgradeGroup)
                            .string_len(64)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::PrevUserGroup)
                            .string_len(64)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_subscriptions_user_id")
                            .from(UserSubscriptions::Table, UserSubscriptions::UserId)
                            .to(Users::Table, Users::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_subscriptions_plan_id")
                            .from(UserSubscriptions::Table, UserSubscriptions::PlanId)
                            .to(SubscriptionPlans::Table, SubscriptionPlans::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_subscriptions_user_status_end")
                    .table(UserSubscriptions::Table)
                    .col(UserSubscriptions::UserId)
                    .col(UserSubscriptions::Status)
                    .col(UserSubscriptions::EndTime)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_subscriptions_next_reset")
                    .table(UserSubscriptions::Table)
                    .col(UserSubscriptions::Status)
                    .col(UserSubscriptions::NextResetTime)
                    .to_owned(),
            )
            .await?;

        // 预扣记录
        manager
            .create_table(
                Table::create()
                    .table(SubscriptionPreConsumeRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::RequestId)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::UserId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::UserSubscriptionId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::PreConsumed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::Status)
                            .string_len(16)
                            .not_null()
                            .default("consumed"),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPreConsumeRecords::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_pre_consume_records_subscription_id")
                            .from(
                                SubscriptionPreConsumeRecords::Table,
                                SubscriptionPreConsumeRecords::UserSubscriptionId,
                            )
                            .to(UserSubscriptions::Table, UserSubscriptions::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_pre_consume_records_created_at")
                    .table(SubscriptionPreConsumeRecords::Table)
                    .col(SubscriptionPreConsumeRecords::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(SubscriptionPreConsumeRecords::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(UserSubscriptions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SubscriptionPlans::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SubscriptionPlans {
    Table,
    Id,
    Title,
    Enabled,
    TotalAmount,
    DurationUnit,
    DurationValue,
    CustomSeconds,
    QuotaResetPeriod,
    QuotaResetCustomSeconds,
    UpgradeGroup,
    MaxPurchasePerUser,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum UserSubscriptions {
    Table,
    Id,
    UserId,
    PlanId,
    AmountTotal,
    AmountUsed,
    StartTime,
    EndTime,
    Status,
    Source,
    LastResetTime,
    NextResetTime,
    UpgradeGroup,
    PrevUserGroup,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SubscriptionPreConsumeRecords {
    Table,
    Id,
    RequestId,
    UserId,
    UserSubscriptionId,
    PreConsumed,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}
