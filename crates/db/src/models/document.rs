use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, JsonValue, QueryFilter,
    QueryOrder, Set,
};

use crate::entities::document;

pub struct StoredDocument;

impl StoredDocument {
    /// Rows of a collection in insertion order, optionally pinned to one `_id`.
    pub async fn find_in_collection<C: ConnectionTrait>(
        db: &C,
        collection: &str,
        doc_id: Option<&str>,
    ) -> Result<Vec<document::Model>, DbErr> {
        let mut query =
            document::Entity::find().filter(document::Column::Collection.eq(collection));
        if let Some(doc_id) = doc_id {
            query = query.filter(document::Column::DocId.eq(doc_id));
        }
        query.order_by_asc(document::Column::Id).all(db).await
    }

    pub async fn insert<C: ConnectionTrait>(
        db: &C,
        collection: &str,
        doc_id: &str,
        body: JsonValue,
    ) -> Result<document::Model, DbErr> {
        let now = Utc::now();
        let active = document::ActiveModel {
            collection: Set(collection.to_string()),
            doc_id: Set(doc_id.to_string()),
            body: Set(body),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        };
        active.insert(db).await
    }

    pub async fn replace_body<C: ConnectionTrait>(
        db: &C,
        record: document::Model,
        body: JsonValue,
    ) -> Result<document::Model, DbErr> {
        let mut active: document::ActiveModel = record.into();
        active.body = Set(body);
        active.updated_at = Set(Utc::now().into());
        active.update(db).await
    }
}
