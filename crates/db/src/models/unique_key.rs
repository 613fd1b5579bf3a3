use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, Set,
};

use crate::entities::document_unique_key;

pub struct UniqueKey;

impl UniqueKey {
    /// Fails with a unique-constraint violation when another document already
    /// holds `key_value` under the same index.
    pub async fn claim<C: ConnectionTrait>(
        db: &C,
        collection: &str,
        index_name: &str,
        key_value: &str,
        doc_id: &str,
    ) -> Result<(), DbErr> {
        let active = document_unique_key::ActiveModel {
            collection: Set(collection.to_string()),
            index_name: Set(index_name.to_string()),
            key_value: Set(key_value.to_string()),
            doc_id: Set(doc_id.to_string()),
            created_at: Set(Utc::now().into()),
            ..Default::default()
        };
        active.insert(db).await?;
        Ok(())
    }

    pub async fn release_all<C: ConnectionTrait>(
        db: &C,
        collection: &str,
        doc_id: &str,
    ) -> Result<u64, DbErr> {
        let result = document_unique_key::Entity::delete_many()
            .filter(document_unique_key::Column::Collection.eq(collection))
            .filter(document_unique_key::Column::DocId.eq(doc_id))
            .exec(db)
            .await?;
        Ok(result.rows_affected)
    }
}
