use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Assets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Assets::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Assets::UserId).string().not_null())
                    .col(ColumnDef::new(Assets::Symbol).string_len(100).not_null()) // CoinGecko id, e.g. "bitcoin"
                    .col(ColumnDef::new(Assets::Ticker).string_len(10).not_null()) // e.g. "BTC"
                    .col(ColumnDef::new(Assets::Quantity).double().not_null())
                    .col(ColumnDef::new(Assets::BuyPrice).double().not_null())
                    .col(
                        ColumnDef::new(Assets::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Listing is always scoped to one owner
        manager
            .create_index(
                Index::create()
                    .name("idx_user_assets")
                    .table(Assets::Table)
                    .col(Assets::UserId)
                    .col(Assets::Symbol)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Assets::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Assets {
    Table,
    Id,
    UserId,
    Symbol,
    Ticker,
    Quantity,
    BuyPrice,
    CreatedAt,
}
