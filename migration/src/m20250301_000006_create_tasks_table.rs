use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tasks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tasks::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Tasks::TaskId)
                            .string_len(128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Tasks::Platform).string_len(32).not_null())
                    .col(ColumnDef::new(Tasks::UserId).integer().not_null())
                    .col(
                        ColumnDef::new(Tasks::Group)
                            .string_len(64)
                            .not_null()
                            .default("default"),
                    )
                    .col(ColumnDef::new(Tasks::ChannelId).integer().not_null())
                    .col(
                        ColumnDef::new(Tasks::Quota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tasks::Action)
                            .string_len(40)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Tasks::Status)
                            .string_len(20)
                            .not_null()
                            .default("not_start"),
                    )
                    .col(ColumnDef::new(Tasks::FailReason).text().null())
                    .col(
                        ColumnDef::new(Tasks::SubmitTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tasks::StartTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tasks::FinishTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tasks::Progress)
                            .string_len(20)
                            .not_null()
                            .default("0%"),
                    )
                    .col(ColumnDef::new(Tasks::Properties).text().null())
                    .col(ColumnDef::new(Tasks::PrivateData).text().null())
                    .col(
                        ColumnDef::new(Tasks::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Tasks::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tasks_status_submit_time")
                    .table(Tasks::Table)
                    .col(Tasks::Status)
                    .col(Tasks::SubmitTime)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tasks_user_id")
                    .table(Tasks::Table)
                    .col(Tasks::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tasks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tasks {
    Table,
    Id,
    TaskId,
    Platform,
    UserId,
    Group,
    ChannelId,
    Quota,
    Action,
    Status,
    FailReason,
    SubmitTime,
    StartTime,
    FinishTime,
    Progress,
    Properties,
    PrivateData,
    CreatedAt,
    UpdatedAt,
}
