//! Purchase entity: the durable record backing a consumed inventory slot.
//!
//! The unique index on (sale_id, item_id) is the last-line guard against
//! double-spend: even if the coordinator and the store disagree, an item can
//! appear at most once here.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchases")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub purchase_id: String,

    #[sea_orm(column_type = "Text")]
    pub user_id: String,

    #[sea_orm(column_type = "Text")]
    pub item_id: String,

    #[sea_orm(column_type = "Text")]
    pub sale_id: String,

    /// The checkout code this purchase was redeemed from.
    #[sea_orm(column_type = "Text")]
    pub checkout_code: String,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sale::Entity",
        from = "Column::SaleId",
        to = "super::sale::Column::SaleId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Sale,
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::UserId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::sale::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sale.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
