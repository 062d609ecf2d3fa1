use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 小时级降采样数据
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rollups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub metric: String,
    /// 桶起始时间（Unix 毫秒，按小时对齐）
    #[sea_orm(primary_key, auto_increment = false)]
    pub bucket: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub labels_key: String,
    #[sea_orm(column_type = "Json")]
    pub labels: Json,
    #[sea_orm(column_type = "Double")]
    pub avg: f64,
    #[sea_orm(column_type = "Double")]
    pub min: f64,
    #[sea_orm(column_type = "Double")]
    pub max: f64,
    #[sea_orm(column_type = "Double")]
    pub sum: f64,
    pub count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
