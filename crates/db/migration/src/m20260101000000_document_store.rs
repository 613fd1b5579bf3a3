use sea_orm_migration::{prelude::*, sea_orm::DatabaseBackend};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(Documents::Table)
                    .col(pk_id_col(manager, Documents::Id))
                    .col(name_col(Documents::Collection))
                    .col(name_col(Documents::DocId))
                    .col(ColumnDef::new(Documents::Body).json().not_null())
                    .col(timestamp_col(Documents::CreatedAt))
                    .col(timestamp_col(Documents::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_documents_collection_doc_id")
                    .table(Documents::Table)
                    .col(Documents::Collection)
                    .col(Documents::DocId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(DocumentIndexes::Table)
                    .col(pk_id_col(manager, DocumentIndexes::Id))
                    .col(name_col(DocumentIndexes::Collection))
                    .col(name_col(DocumentIndexes::Name))
                    .col(ColumnDef::new(DocumentIndexes::Fields).json().not_null())
                    .col(timestamp_col(DocumentIndexes::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_document_indexes_collection_name")
                    .table(DocumentIndexes::Table)
                    .col(DocumentIndexes::Collection)
                    .col(DocumentIndexes::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(DocumentUniqueKeys::Table)
                    .col(pk_id_col(manager, DocumentUniqueKeys::Id))
                    .col(name_col(DocumentUniqueKeys::Collection))
                    .col(name_col(DocumentUniqueKeys::IndexName))
                    .col(ColumnDef::new(DocumentUniqueKeys::KeyValue).text().not_null())
                    .col(name_col(DocumentUniqueKeys::DocId))
                    .col(timestamp_col(DocumentUniqueKeys::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // The storage-level guarantee behind every unique document index.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_document_unique_keys_value")
                    .table(DocumentUniqueKeys::Table)
                    .col(DocumentUniqueKeys::Collection)
                    .col(DocumentUniqueKeys::IndexName)
                    .col(DocumentUniqueKeys::KeyValue)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_document_unique_keys_doc")
                    .table(DocumentUniqueKeys::Table)
                    .col(DocumentUniqueKeys::Collection)
                    .col(DocumentUniqueKeys::DocId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DocumentUniqueKeys::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DocumentIndexes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Documents::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn name_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col).string_len(128).not_null().to_owned()
}

fn timestamp_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum Documents {
    Table,
    Id,
    Collection,
    DocId,
    Body,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum DocumentIndexes {
    Table,
    Id,
    Collection,
    Name,
    Fields,
    CreatedAt,
}

#[derive(Iden)]
enum DocumentUniqueKeys {
    Table,
    Id,
    Collection,
    IndexName,
    KeyValue,
    DocId,
    CreatedAt,
}
