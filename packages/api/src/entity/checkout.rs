//! Checkout entity: the durable mirror of a coordinator checkout session.
//!
//! The coordinator owns the live session (with TTL); this row records it for
//! audit and for the sweeper, which flips stale `pending` rows to `expired`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "redeemed")]
    Redeemed,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl CheckoutStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkouts")]
pub struct Model {
    /// High-entropy opaque checkout code, globally unique.
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub code: String,

    #[sea_orm(column_type = "Text")]
    pub user_id: String,

    #[sea_orm(column_type = "Text")]
    pub item_id: String,

    #[sea_orm(column_type = "Text")]
    pub sale_id: String,

    pub status: CheckoutStatus,

    pub created_at: DateTimeUtc,

    /// `created_at + T_session`.
    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::UserId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
