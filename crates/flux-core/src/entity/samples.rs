use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 原始精度样本
///
/// 主键 `(metric, ts, labels_key)` 保证同一时刻同一序列只有一条记录。
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "samples")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub metric: String,
    /// Unix 毫秒
    #[sea_orm(primary_key, auto_increment = false)]
    pub ts: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub labels_key: String,
    #[sea_orm(column_type = "Json")]
    pub labels: Json,
    #[sea_orm(column_type = "Double")]
    pub value: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
