use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Logs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Logs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Logs::UserId).integer().not_null())
                    .col(ColumnDef::new(Logs::Type).string_len(16).not_null())
                    .col(ColumnDef::new(Logs::Content).text().not_null())
                    .col(
                        ColumnDef::new(Logs::Username)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Logs::TokenName)
                            .string_len(100)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Logs::TokenId).integer().null())
                    .col(
                        ColumnDef::new(Logs::ModelName)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Logs::Quota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Logs::PromptTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Logs::CompletionTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Logs::ChannelId).integer().null())
                    .col(
                        ColumnDef::new(Logs::Group)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Logs::RequestId).string_len(64).null())
                    .col(ColumnDef::new(Logs::Other).text().null())
                    .col(
                        ColumnDef::new(Logs::CreatedAt)
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
                    .name("idx_logs_user_type")
                    .table(Logs::Table)
                    .col(Logs::UserId)
                    .col(Logs::Type)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_logs_request_id")
                    .table(Logs::Table)
                    .col(Logs::RequestId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Logs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Logs {
    Table,
    Id,
    UserId,
    Type,
    Content,
    Username,
    TokenName,
    TokenId,
    ModelName,
    Quota,
    PromptTokens,
    CompletionTokens,
    ChannelId,
    Group,
    RequestId,
    Other,
    CreatedAt,
}
