//! Asset persistence, always scoped to the owning user.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

use crate::entities::assets::{self, Entity as Assets};
use crate::models::asset::{AssetUpdate, NewAsset};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Missing, or owned by someone else
    #[error("asset not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(Clone)]
pub struct AssetStore {
    db: DatabaseConnection,
}

impl AssetStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// All assets of `owner`, newest first
    pub async fn list_assets(&self, owner: &str) -> Result<Vec<assets::Model>, StoreError> {
        let rows = Assets::find()
            .filter(assets::Column::UserId.eq(owner))
            .order_by_desc(assets::Column::CreatedAt)
            .order_by_desc(assets::Column::Id)
            .all(&self.db)
            .await?;

        Ok(rows)
    }

    pub async fn create_asset(&self, owner: &str, new: NewAsset) -> Result<assets::Model, StoreError> {
        tracing::info!("Creating asset {} for user {}...", new.ticker, short_id(owner));

        let asset = assets::ActiveModel {
            user_id: Set(owner.to_string()),
            symbol: Set(new.symbol),
            ticker: Set(new.ticker),
            quantity: Set(new.quantity),
            buy_price: Set(new.buy_price),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        Ok(asset.insert(&self.db).await?)
    }

    pub async fn update_asset(
        &self,
        owner: &str,
        id: i32,
        changes: AssetUpdate,
    ) -> Result<assets::Model, StoreError> {
        let existing = self.find_owned(owner, id).await?;

        if changes.is_empty() {
            return Ok(existing);
        }

        let mut asset: assets::ActiveModel = existing.into();
        if let Some(quantity) = changes.quantity {
            asset.quantity = Set(quantity);
        }
        if let Some(buy_price) = changes.buy_price {
            asset.buy_price = Set(buy_price);
        }

        Ok(asset.update(&self.db).await?)
    }

    pub async fn delete_asset(&self, owner: &str, id: i32) -> Result<(), StoreError> {
        let result = Assets::delete_many()
            .filter(assets::Column::Id.eq(id))
            .filter(assets::Column::UserId.eq(owner))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound);
        }

        tracing::info!("Deleted asset {} for user {}...", id, short_id(owner));
        Ok(())
    }

    async fn find_owned(&self, owner: &str, id: i32) -> Result<assets::Model, StoreError> {
        Assets::find_by_id(id)
            .filter(assets::Column::UserId.eq(owner))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
    }
}

/// Leading characters of a user id, enough to correlate log lines
fn short_id(user_id: &str) -> &str {
    match user_id.char_indices().nth(8) {
        Some((end, _)) => &user_id[..end],
        None => user_id,
    }
}
