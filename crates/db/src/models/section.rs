use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionSession, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::{section, task, task_link},
    models::{
        guard::{self, GuardError},
        ids,
        ordering::{self, Insert, OrderError, SectionScope},
    },
};

#[derive(Debug, Error)]
pub enum SectionError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Ordering(OrderError),
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Section not found")]
    SectionNotFound,
    #[error("{0}")]
    Validation(String),
}

impl From<GuardError> for SectionError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Database(err) => Self::Database(err),
            GuardError::ProjectNotFound => Self::ProjectNotFound,
        }
    }
}

impl From<OrderError> for SectionError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Database(err) => Self::Database(err),
            other => Self::Ordering(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub sort_order: i32,
    pub open: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSection {
    pub name: String,
    pub above_section_id: Option<Uuid>,
    pub below_section_id: Option<Uuid>,
}

impl CreateSection {
    pub fn with_name(name: String) -> Self {
        Self {
            name,
            above_section_id: None,
            below_section_id: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSection {
    pub name: Option<String>,
    pub open: Option<bool>,
    /// A direct position write; `swap_order` is the guarded alternative.
    pub order: Option<i32>,
    /// Moving the section re-homes its tasks to the new project as well.
    pub project_id: Option<Uuid>,
}

impl Section {
    async fn from_model<C: ConnectionTrait>(
        db: &C,
        model: section::Model,
    ) -> Result<Section, SectionError> {
        let project_id = ids::project_uuid_by_id(db, model.project_id)
            .await?
            .ok_or(SectionError::ProjectNotFound)?;
        Ok(Section {
            id: model.uuid,
            project_id,
            name: model.name,
            sort_order: model.sort_order,
            open: model.open,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        })
    }

    /// Sections of a project the caller collaborates on; an inaccessible
    /// project yields an empty list.
    pub async fn list<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Section>, SectionError> {
        let Some(project_row_id) = ids::project_id_by_uuid(db, project_id).await? else {
            return Ok(Vec::new());
        };
        if guard::find_member(db, user_id, project_row_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let records = section::Entity::find()
            .filter(section::Column::ProjectId.eq(project_row_id))
            .order_by_asc(section::Column::SortOrder)
            .all(db)
            .await?;
        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        section_id: Uuid,
    ) -> Result<Option<Section>, SectionError> {
        let Some(model) = section::Entity::find()
            .filter(section::Column::Uuid.eq(section_id))
            .one(db)
            .await?
        else {
            return Ok(None);
        };
        if guard::find_member(db, user_id, model.project_id).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(Self::from_model(db, model).await?))
    }

    async fn require<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        section_id: Uuid,
    ) -> Result<section::Model, SectionError> {
        let model = section::Entity::find()
            .filter(section::Column::Uuid.eq(section_id))
            .one(db)
            .await?
            .ok_or(SectionError::SectionNotFound)?;
        guard::require_member(db, user_id, model.project_id)
            .await
            .map_err(|err| match err {
                GuardError::Database(err) => SectionError::Database(err),
                // Hidden projects and missing sections look the same.
                GuardError::ProjectNotFound => SectionError::SectionNotFound,
            })?;
        Ok(model)
    }

    pub async fn create<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        data: &CreateSection,
    ) -> Result<Section, SectionError> {
        if data.name.trim().is_empty() {
            return Err(SectionError::Validation(
                "section name cannot be empty".to_string(),
            ));
        }
        let project_row_id = ids::project_id_by_uuid(db, project_id)
            .await?
            .ok_or(SectionError::ProjectNotFound)?;
        guard::require_member(db, user_id, project_row_id).await?;

        let scope = SectionScope {
            project_id: project_row_id,
        };
        let position = if let Some(anchor) = data.above_section_id {
            let anchor_row_id = ids::section_id_by_uuid(db, anchor)
                .await?
                .ok_or(SectionError::SectionNotFound)?;
            Insert::Above(anchor_row_id)
        } else if let Some(anchor) = data.below_section_id {
            let anchor_row_id = ids::section_id_by_uuid(db, anchor)
                .await?
                .ok_or(SectionError::SectionNotFound)?;
            Insert::Below(anchor_row_id)
        } else {
            Insert::Append
        };
        let sort_order = ordering::resolve(db, &scope, position).await?;

        let now = Utc::now();
        let model = section::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            project_id: Set(project_row_id),
            name: Set(data.name.clone()),
            sort_order: Set(sort_order),
            open: Set(true),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Self::from_model(db, model).await
    }

    /// Partial update. A project change moves the section and every task
    /// in it to the target project in one transaction; the section lands
    /// at the end of the target's section list.
    pub async fn update<C>(
        db: &C,
        user_id: Uuid,
        section_id: Uuid,
        data: &UpdateSection,
    ) -> Result<Section, SectionError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let model = Self::require(db, user_id, section_id).await?;

        let txn = db.begin().await?;

        let mut active: section::ActiveModel = model.clone().into();
        if let Some(name) = data.name.clone() {
            if name.trim().is_empty() {
                return Err(SectionError::Validation(
                    "section name cannot be empty".to_string(),
                ));
            }
            active.name = Set(name);
        }
        if let Some(open) = data.open {
            active.open = Set(open);
        }
        if let Some(order) = data.order {
            active.sort_order = Set(order);
        }
        if let Some(target_project) = data.project_id {
            let target_row_id = ids::project_id_by_uuid(&txn, target_project)
                .await?
                .ok_or(SectionError::ProjectNotFound)?;
            guard::require_member(&txn, user_id, target_row_id).await?;

            if target_row_id != model.project_id {
                let scope = SectionScope {
                    project_id: target_row_id,
                };
                active.project_id = Set(target_row_id);
                active.sort_order = Set(ordering::append(&txn, &scope).await?);

                task::Entity::update_many()
                    .col_expr(task::Column::ProjectId, Expr::value(target_row_id))
                    .filter(task::Column::SectionId.eq(model.id))
                    .exec(&txn)
                    .await?;
            }
        }
        active.updated_at = Set(Utc::now().into());
        let updated = active.update(&txn).await?;

        txn.commit().await?;
        Self::from_model(db, updated).await
    }

    pub async fn move_to_project<C>(
        db: &C,
        user_id: Uuid,
        section_id: Uuid,
        target_project_id: Uuid,
    ) -> Result<Section, SectionError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        Self::update(
            db,
            user_id,
            section_id,
            &UpdateSection {
                project_id: Some(target_project_id),
                ..Default::default()
            },
        )
        .await
    }

    /// Deleting a section keeps its tasks; they fall back to the project
    /// root with their section reference cleared.
    pub async fn delete<C>(db: &C, user_id: Uuid, section_id: Uuid) -> Result<(), SectionError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let model = Self::require(db, user_id, section_id).await?;

        let txn = db.begin().await?;
        task::Entity::update_many()
            .col_expr(task::Column::SectionId, Expr::value(None::<i64>))
            .filter(task::Column::SectionId.eq(model.id))
            .exec(&txn)
            .await?;
        section::Entity::delete_by_id(model.id).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Exchanges the positions of two sections of the same project.
    pub async fn swap_order<C>(
        db: &C,
        user_id: Uuid,
        section_id: Uuid,
        target_section_id: Uuid,
    ) -> Result<(Section, Section), SectionError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let a = Self::require(db, user_id, section_id).await?;
        let b = Self::require(db, user_id, target_section_id).await?;
        if a.project_id != b.project_id {
            return Err(SectionError::Validation(
                "sections belong to different projects".to_string(),
            ));
        }

        let txn = db.begin().await?;
        let scope = SectionScope {
            project_id: a.project_id,
        };
        ordering::swap(&txn, &scope, a.id, b.id).await?;
        txn.commit().await?;

        let a = Self::require(db, user_id, section_id).await?;
        let b = Self::require(db, user_id, target_section_id).await?;
        Ok((
            Self::from_model(db, a).await?,
            Self::from_model(db, b).await?,
        ))
    }

    /// Clones the section at the end of the project's section list under
    /// the same name, together with its tasks. Task positions are kept and
    /// parent links between tasks of the section are rebuilt between the
    /// clones; links reaching outside the section are not carried over.
    pub async fn duplicate<C>(
        db: &C,
        user_id: Uuid,
        section_id: Uuid,
    ) -> Result<Section, SectionError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let model = Self::require(db, user_id, section_id).await?;

        let txn = db.begin().await?;

        let scope = SectionScope {
            project_id: model.project_id,
        };
        let sort_order = ordering::append(&txn, &scope).await?;
        let now = Utc::now();
        let clone = section::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            project_id: Set(model.project_id),
            name: Set(model.name.clone()),
            sort_order: Set(sort_order),
            open: Set(model.open),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let tasks = task::Entity::find()
            .filter(task::Column::SectionId.eq(model.id))
            .order_by_asc(task::Column::SortOrder)
            .all(&txn)
            .await?;
        let mut task_map: HashMap<i64, i64> = HashMap::new();
        for t in &tasks {
            let cloned = task::ActiveModel {
                uuid: Set(Uuid::new_v4()),
                project_id: Set(t.project_id),
                section_id: Set(Some(clone.id)),
                title: Set(t.title.clone()),
                description: Set(t.description.clone()),
                due_date: Set(t.due_date),
                priority: Set(t.priority),
                assignee_id: Set(t.assignee_id),
                completed: Set(t.completed),
                sort_order: Set(t.sort_order),
                created_at: Set(now.into()),
                updated_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            task_map.insert(t.id, cloned.id);
        }

        let old_task_ids: Vec<i64> = task_map.keys().copied().collect();
        let links = task_link::Entity::find()
            .filter(task_link::Column::ParentTaskId.is_in(old_task_ids))
            .all(&txn)
            .await?;
        for link in links {
            let (Some(parent), Some(child)) = (
                task_map.get(&link.parent_task_id),
                task_map.get(&link.child_task_id),
            ) else {
                continue;
            };
            task_link::ActiveModel {
                parent_task_id: Set(*parent),
                child_task_id: Set(*child),
                created_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Self::from_model(db, clone).await
    }
}
