//! Session log schema migrations

use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(CreateSessions)]
    }
}

#[derive(DeriveMigrationName)]
pub struct CreateSessions;

#[async_trait::async_trait]
impl MigrationTrait for CreateSessions {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sessions::BackendId).string().not_null())
                    .col(ColumnDef::new(Sessions::ChargerTxId).string())
                    .col(
                        ColumnDef::new(Sessions::StartMeterWh)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Sessions::StopMeterWh).big_integer())
                    .col(ColumnDef::new(Sessions::LastMeterWh).big_integer())
                    .col(
                        ColumnDef::new(Sessions::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Sessions::StoppedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Sessions::StopReason).string())
                    .col(ColumnDef::new(Sessions::EnergyWh).big_integer())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sessions_started_at")
                    .table(Sessions::Table)
                    .col(Sessions::StartedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sessions_backend_id")
                    .table(Sessions::Table)
                    .col(Sessions::BackendId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Sessions {
    Table,
    Id,
    BackendId,
    ChargerTxId,
    StartMeterWh,
    StopMeterWh,
    LastMeterWh,
    StartedAt,
    StoppedAt,
    StopReason,
    EnergyWh,
}
