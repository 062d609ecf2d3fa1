use super::{alert_rules, alerts, metric_definitions, notifications, rollups, samples};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};
use tracing::info;

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}

/// 创建所有表（已存在则跳过）
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, samples::Entity).await?;
    create_table(db, rollups::Entity).await?;
    create_table(db, metric_definitions::Entity).await?;
    create_table(db, alert_rules::Entity).await?;
    create_table(db, alerts::Entity).await?;
    create_table(db, notifications::Entity).await?;

    info!("Database schema ready");
    Ok(())
}
