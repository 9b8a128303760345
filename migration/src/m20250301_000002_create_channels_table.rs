use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Channels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Channels::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Channels::Type)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Channels::Name).string_len(100).not_null())
                    .col(ColumnDef::new(Channels::Key).text().not_null())
                    .col(
                        ColumnDef::new(Channels::Status)
                            .string_len(20)
                            .not_null()
                            .default("enabled"),
                    )
                    .col(
                        ColumnDef::new(Channels::Priority)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Channels::Weight)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Channels::Group)
                            .string_len(255)
                            .not_null()
                            .default("default"),
                    )
                    .col(ColumnDef::new(Channels::Models).text().not_null())
                    .col(ColumnDef::new(Channels::Tag).string_len(64).null())
                    .col(ColumnDef::new(Channels::BaseUrl).string_len(255).null())
                    .col(ColumnDef::new(Channels::ModelMapping).text().null())
                    .col(ColumnDef::new(Channels::Organization).string_len(128).null())
                    .col(
                        ColumnDef::new(Channels::AutoBan)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Channels::UsedQuota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Channels::ChannelInfo).text().null())
                    .col(
                        ColumnDef::new(Channels::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Channels::UpdatedAt)
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
                    .name("idx_channels_status")
                    .table(Channels::Table)
                    .col(Channels::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_channels_tag")
                    .table(Channels::Table)
                    .col(Channels::Tag)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Channels::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Channels {
    Table,
    Id,
    Type,
    Name,
    Key,
    Status,
    Priority,
    Weight,
    Group,
    Models,
    Tag,
    BaseUrl,
    ModelMapping,
    Organization,
    AutoBan,
    UsedQuota,
    ChannelInfo,
    CreatedAt,
    UpdatedAt,
}
