use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionSession, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::{label, task_label},
    models::{
        ids,
        ordering::{self, LabelScope, OrderError},
    },
};

#[derive(Debug, Error)]
pub enum LabelError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Ordering(OrderError),
    #[error("Label not found")]
    LabelNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("{0}")]
    Validation(String),
}

impl From<OrderError> for LabelError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Database(err) => Self::Database(err),
            other => Self::Ordering(other),
        }
    }
}

/// A per-user label. Labels never cross user boundaries, so every
/// operation is keyed by the owning user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: Uuid,
    pub title: String,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Label {
    pub(crate) fn from_model(model: label::Model) -> Self {
        Self {
            id: model.uuid,
            title: model.title,
            sort_order: model.sort_order,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }

    pub async fn find_all<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Vec<Label>, LabelError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };
        let records = label::Entity::find()
            .filter(label::Column::UserId.eq(user_row_id))
            .order_by_asc(label::Column::SortOrder)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        label_id: Uuid,
    ) -> Result<Option<Label>, LabelError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(None);
        };
        let record = label::Entity::find()
            .filter(label::Column::Uuid.eq(label_id))
            .filter(label::Column::UserId.eq(user_row_id))
            .one(db)
            .await?;
        Ok(record.map(Self::from_model))
    }

    async fn require<C: ConnectionTrait>(
        db: &C,
        user_row_id: i64,
        label_id: Uuid,
    ) -> Result<label::Model, LabelError> {
        label::Entity::find()
            .filter(label::Column::Uuid.eq(label_id))
            .filter(label::Column::UserId.eq(user_row_id))
            .one(db)
            .await?
            .ok_or(LabelError::LabelNotFound)
    }

    /// New labels land at the end of the user's label list.
    pub async fn create<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        title: &str,
    ) -> Result<Label, LabelError> {
        if title.trim().is_empty() {
            return Err(LabelError::Validation(
                "label title cannot be empty".to_string(),
            ));
        }
        let user_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(LabelError::UserNotFound)?;

        let scope = LabelScope {
            user_id: user_row_id,
        };
        let sort_order = ordering::append(db, &scope).await?;

        let now = Utc::now();
        let model = label::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            user_id: Set(user_row_id),
            title: Set(title.to_string()),
            sort_order: Set(sort_order),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Ok(Self::from_model(model))
    }

    pub async fn rename<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        label_id: Uuid,
        title: &str,
    ) -> Result<Label, LabelError> {
        if title.trim().is_empty() {
            return Err(LabelError::Validation(
                "label title cannot be empty".to_string(),
            ));
        }
        let user_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(LabelError::UserNotFound)?;
        let model = Self::require(db, user_row_id, label_id).await?;

        let mut active: label::ActiveModel = model.into();
        active.title = Set(title.to_string());
        active.updated_at = Set(Utc::now().into());
        let updated = active.update(db).await?;
        Ok(Self::from_model(updated))
    }

    /// Removes the label and all of its task attachments together.
    pub async fn delete<C>(db: &C, user_id: Uuid, label_id: Uuid) -> Result<(), LabelError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let user_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(LabelError::UserNotFound)?;
        let model = Self::require(db, user_row_id, label_id).await?;

        let txn = db.begin().await?;
        task_label::Entity::delete_many()
            .filter(task_label::Column::LabelId.eq(model.id))
            .exec(&txn)
            .await?;
        label::Entity::delete_by_id(model.id).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn search<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        text: &str,
    ) -> Result<Vec<Label>, LabelError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };
        let records = label::Entity::find()
            .filter(label::Column::UserId.eq(user_row_id))
            .filter(label::Column::Title.contains(text))
            .order_by_asc(label::Column::SortOrder)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    /// Exchanges the positions of two labels in the user's list.
    pub async fn swap_order<C>(
        db: &C,
        user_id: Uuid,
        label_id: Uuid,
        target_label_id: Uuid,
    ) -> Result<(Label, Label), LabelError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let user_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(LabelError::UserNotFound)?;
        let row_a = Self::require(db, user_row_id, label_id).await?.id;
        let row_b = Self::require(db, user_row_id, target_label_id).await?.id;

        let txn = db.begin().await?;
        let scope = LabelScope {
            user_id: user_row_id,
        };
        ordering::swap(&txn, &scope, row_a, row_b).await?;
        txn.commit().await?;

        let a = Self::require(db, user_row_id, label_id).await?;
        let b = Self::require(db, user_row_id, target_label_id).await?;
        Ok((Self::from_model(a), Self::from_model(b)))
    }
}
