//! PostgreSQL store implementation using SeaORM.
//!
//! All mutations run as single statements or explicit transactions under
//! read-committed isolation; uniqueness constraints carry the correctness
//! guarantees, not row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set, TransactionTrait,
};

use super::{SaleStats, SaleStore, StoreError};
use crate::entity::{
    checkout::{self, CheckoutStatus},
    item, purchase,
    sale::{self, SaleStatus},
    user,
};

/// Rows per INSERT statement for the bulk item load. Five columns per row
/// keeps this far below the Postgres bind-parameter ceiling.
const ITEM_INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone)]
pub struct PostgresSaleStore {
    db: DatabaseConnection,
}

impl PostgresSaleStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn sale_active_model(sale: sale::Model) -> sale::ActiveModel {
    sale::ActiveModel {
        sale_id: Set(sale.sale_id),
        window_start: Set(sale.window_start),
        window_end: Set(sale.window_end),
        total_items: Set(sale.total_items),
        status: Set(sale.status),
        created_at: Set(sale.created_at),
    }
}

fn item_active_model(item: item::Model) -> item::ActiveModel {
    item::ActiveModel {
        sale_id: Set(item.sale_id),
        item_id: Set(item.item_id),
        name: Set(item.name),
        image_ref: Set(item.image_ref),
        created_at: Set(item.created_at),
    }
}

#[async_trait]
impl SaleStore for PostgresSaleStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.db.ping().await.map_err(StoreError::from)
    }

    async fn create_sale(&self, sale: sale::Model) -> Result<(), StoreError> {
        sale_active_model(sale).insert(&self.db).await?;
        Ok(())
    }

    async fn create_items(&self, items: Vec<item::Model>) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin().await?;
        for chunk in items.chunks(ITEM_INSERT_CHUNK) {
            let models = chunk.iter().cloned().map(item_active_model);
            item::Entity::insert_many(models).exec(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn get_sale(&self, sale_id: &str) -> Result<sale::Model, StoreError> {
        sale::Entity::find_by_id(sale_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn get_active_sale(&self, now: DateTime<Utc>) -> Result<sale::Model, StoreError> {
        sale::Entity::find()
            .filter(sale::Column::Status.eq(SaleStatus::Active))
            .filter(sale::Column::WindowStart.lte(now))
            .filter(sale::Column::WindowEnd.gt(now))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn find_sale_by_window_start(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<sale::Model, StoreError> {
        sale::Entity::find()
            .filter(sale::Column::WindowStart.eq(window_start))
            .filter(sale::Column::Status.ne(SaleStatus::Cancelled))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn activate_sale(&self, sale_id: &str) -> Result<(), StoreError> {
        sale::Entity::update_many()
            .col_expr(sale::Column::Status, Expr::value(SaleStatus::Active))
            .filter(sale::Column::SaleId.eq(sale_id))
            .filter(sale::Column::Status.eq(SaleStatus::Scheduled))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_sale_completed(&self, sale_id: &str) -> Result<(), StoreError> {
        sale::Entity::update_many()
            .col_expr(
                sale::Column::Status,
                Expr::value(SaleStatus::Completed),
            )
            .filter(sale::Column::SaleId.eq(sale_id))
            .filter(sale::Column::Status.eq(SaleStatus::Active))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_sale_cancelled(&self, sale_id: &str) -> Result<(), StoreError> {
        sale::Entity::update_many()
            .col_expr(
                sale::Column::Status,
                Expr::value(SaleStatus::Cancelled),
            )
            .filter(sale::Column::SaleId.eq(sale_id))
            .filter(sale::Column::Status.ne(SaleStatus::Cancelled))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn item_exists(&self, sale_id: &str, item_id: &str) -> Result<bool, StoreError> {
        let found = item::Entity::find_by_id((sale_id.to_string(), item_id.to_string()))
            .one(&self.db)
            .await?;
        Ok(found.is_some())
    }

    async fn ensure_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let row = user::ActiveModel {
            user_id: Set(user_id.to_string()),
            created_at: Set(now),
        };
        user::Entity::insert(row)
            .on_conflict(
                OnConflict::column(user::Column::UserId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_checkout(&self, row: checkout::Model) -> Result<(), StoreError> {
        let model = checkout::ActiveModel {
            code: Set(row.code),
            user_id: Set(row.user_id),
            item_id: Set(row.item_id),
            sale_id: Set(row.sale_id),
            status: Set(row.status),
            created_at: Set(row.created_at),
            expires_at: Set(row.expires_at),
        };
        model.insert(&self.db).await?;
        Ok(())
    }

    async fn mark_checkout_redeemed(&self, code: &str) -> Result<(), StoreError> {
        checkout::Entity::update_many()
            .col_expr(
                checkout::Column::Status,
                Expr::value(CheckoutStatus::Redeemed),
            )
            .filter(checkout::Column::Code.eq(code))
            .filter(checkout::Column::Status.eq(CheckoutStatus::Pending))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn expire_stale_checkouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = checkout::Entity::update_many()
            .col_expr(
                checkout::Column::Status,
                Expr::value(CheckoutStatus::Expired),
            )
            .filter(checkout::Column::Status.eq(CheckoutStatus::Pending))
            .filter(checkout::Column::ExpiresAt.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn complete_finished_sales(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let ended: Vec<sale::Model> = sale::Entity::find()
            .filter(sale::Column::Status.eq(SaleStatus::Active))
            .filter(sale::Column::WindowEnd.lte(now))
            .all(&self.db)
            .await?;
        let ids: Vec<String> = ended.into_iter().map(|s| s.sale_id).collect();
        if !ids.is_empty() {
            sale::Entity::update_many()
                .col_expr(
                    sale::Column::Status,
                    Expr::value(SaleStatus::Completed),
                )
                .filter(sale::Column::SaleId.is_in(ids.clone()))
                .filter(sale::Column::Status.eq(SaleStatus::Active))
                .exec(&self.db)
                .await?;
        }
        Ok(ids)
    }

    async fn insert_purchase(&self, row: purchase::Model) -> Result<(), StoreError> {
        let model = purchase::ActiveModel {
            purchase_id: Set(row.purchase_id),
            user_id: Set(row.user_id),
            item_id: Set(row.item_id),
            sale_id: Set(row.sale_id),
            checkout_code: Set(row.checkout_code),
            created_at: Set(row.created_at),
        };
        model.insert(&self.db).await?;
        Ok(())
    }

    async fn get_sale_stats(&self, sale_id: &str) -> Result<SaleStats, StoreError> {
        let sale = self.get_sale(sale_id).await?;
        let sold = purchase::Entity::find()
            .filter(purchase::Column::SaleId.eq(sale_id))
            .count(&self.db)
            .await?;
        Ok(SaleStats {
            total_items: sale.total_items,
            items_sold: sold as i64,
        })
    }
}
