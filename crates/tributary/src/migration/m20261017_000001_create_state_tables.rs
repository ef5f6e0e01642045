//! Create the collector and subtask state tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_collector_state(manager).await?;
        self.create_subtask_state(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SubtaskState::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CollectorLatestState::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    async fn create_collector_state(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CollectorLatestState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CollectorLatestState::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CollectorLatestState::RawDataTable)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CollectorLatestState::RawDataParams)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CollectorLatestState::LatestSuccessStart)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CollectorLatestState::CreatedDateAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CollectorLatestState::TimeAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CollectorLatestState::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Upserts conflict on (raw_data_table, raw_data_params)
        manager
            .create_index(
                Index::create()
                    .name("idx_collector_state_table_params")
                    .table(CollectorLatestState::Table)
                    .col(CollectorLatestState::RawDataTable)
                    .col(CollectorLatestState::RawDataParams)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_subtask_state(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SubtaskState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SubtaskState::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SubtaskState::Plugin).string().not_null())
                    .col(ColumnDef::new(SubtaskState::Subtask).string().not_null())
                    .col(ColumnDef::new(SubtaskState::Params).text().not_null())
                    .col(
                        ColumnDef::new(SubtaskState::TimeAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SubtaskState::PrevStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SubtaskState::PrevConfig)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(SubtaskState::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_subtask_state_plugin_subtask_params")
                    .table(SubtaskState::Table)
                    .col(SubtaskState::Plugin)
                    .col(SubtaskState::Subtask)
                    .col(SubtaskState::Params)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum CollectorLatestState {
    #[sea_orm(iden = "_collector_latest_state")]
    Table,
    Id,
    RawDataTable,
    RawDataParams,
    LatestSuccessStart,
    CreatedDateAfter,
    TimeAfter,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SubtaskState {
    #[sea_orm(iden = "_subtask_state")]
    Table,
    Id,
    Plugin,
    Subtask,
    Params,
    TimeAfter,
    PrevStartedAt,
    PrevConfig,
    UpdatedAt,
}
