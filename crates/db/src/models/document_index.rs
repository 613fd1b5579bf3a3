use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};

use crate::{entities::document_index, store::UniqueIndex};

pub struct DocumentIndex;

impl DocumentIndex {
    fn from_model(model: document_index::Model) -> Result<UniqueIndex, DbErr> {
        let fields: Vec<String> = serde_json::from_value(model.fields).map_err(|err| {
            DbErr::Custom(format!(
                "invalid field list for index '{}' on '{}': {err}",
                model.name, model.collection
            ))
        })?;
        Ok(UniqueIndex {
            name: model.name,
            fields,
        })
    }

    pub async fn find_for_collection<C: ConnectionTrait>(
        db: &C,
        collection: &str,
    ) -> Result<Vec<UniqueIndex>, DbErr> {
        document_index::Entity::find()
            .filter(document_index::Column::Collection.eq(collection))
            .order_by_asc(document_index::Column::Id)
            .all(db)
            .await?
            .into_iter()
            .map(Self::from_model)
            .collect()
    }

    pub async fn create<C: ConnectionTrait>(
        db: &C,
        collection: &str,
        index: &UniqueIndex,
    ) -> Result<(), DbErr> {
        let active = document_index::ActiveModel {
            collection: Set(collection.to_string()),
            name: Set(index.name.clone()),
            fields: Set(serde_json::json!(index.fields)),
            created_at: Set(Utc::now().into()),
            ..Default::default()
        };
        active.insert(db).await?;
        Ok(())
    }
}
