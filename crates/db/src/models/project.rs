use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Condition;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionSession, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::{comment, project, project_member, section, task, task_label, task_link},
    models::{
        guard::{self, GuardError},
        ids,
        ordering::{self, Insert, MemberScope, OrderError},
    },
    types::ProjectView,
};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Ordering(OrderError),
    #[error("Project not found")]
    ProjectNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("The default inbox cannot be deleted")]
    DefaultInboxProtected,
    #[error("Cannot leave a project without other collaborators")]
    SoleCollaborator,
    #[error("{0}")]
    Validation(String),
}

impl From<GuardError> for ProjectError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Database(err) => Self::Database(err),
            GuardError::ProjectNotFound => Self::ProjectNotFound,
        }
    }
}

impl From<OrderError> for ProjectError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Database(err) => Self::Database(err),
            other => Self::Ordering(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub view: ProjectView,
    pub archived: bool,
    pub default_inbox: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A project annotated with the requesting user's membership row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectWithMember {
    #[serde(flatten)]
    pub project: Project,
    pub owner: bool,
    pub favorite: bool,
    pub sort_order: i32,
}

impl std::ops::Deref for ProjectWithMember {
    type Target = Project;
    fn deref(&self) -> &Self::Target {
        &self.project
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub view: Option<ProjectView>,
    pub archived: Option<bool>,
    pub default_inbox: Option<bool>,
    pub above_project_id: Option<Uuid>,
    pub below_project_id: Option<Uuid>,
}

impl CreateProject {
    pub fn with_name(name: String) -> Self {
        Self {
            name,
            view: None,
            archived: None,
            default_inbox: None,
            above_project_id: None,
            below_project_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub archived: Option<bool>,
}

impl Project {
    fn from_model(model: project::Model) -> Self {
        Self {
            id: model.uuid,
            name: model.name,
            view: model.view,
            archived: model.archived,
            default_inbox: model.default_inbox,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }

    fn with_member(model: project::Model, member: project_member::Model) -> ProjectWithMember {
        ProjectWithMember {
            project: Self::from_model(model),
            owner: member.owner,
            favorite: member.favorite,
            sort_order: member.sort_order,
        }
    }

    /// Looks the project up through the caller's membership; a missing
    /// project and a missing membership are both `None`.
    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<Option<ProjectWithMember>, ProjectError> {
        let Some(project_row_id) = ids::project_id_by_uuid(db, project_id).await? else {
            return Ok(None);
        };
        let Some(member) = guard::find_member(db, user_id, project_row_id).await? else {
            return Ok(None);
        };
        let record = project::Entity::find_by_id(project_row_id).one(db).await?;
        Ok(record.map(|model| Self::with_member(model, member)))
    }

    async fn require<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<(project::Model, project_member::Model), ProjectError> {
        let project_row_id = ids::project_id_by_uuid(db, project_id)
            .await?
            .ok_or(ProjectError::ProjectNotFound)?;
        let member = guard::require_member(db, user_id, project_row_id).await?;
        let model = project::Entity::find_by_id(project_row_id)
            .one(db)
            .await?
            .ok_or(ProjectError::ProjectNotFound)?;
        Ok((model, member))
    }

    pub async fn find_active<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Vec<ProjectWithMember>, ProjectError> {
        Self::find_by_archived(db, user_id, false).await
    }

    pub async fn find_archived<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Vec<ProjectWithMember>, ProjectError> {
        Self::find_by_archived(db, user_id, true).await
    }

    async fn find_by_archived<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        archived: bool,
    ) -> Result<Vec<ProjectWithMember>, ProjectError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };

        let memberships = project_member::Entity::find()
            .filter(project_member::Column::UserId.eq(user_row_id))
            .order_by_asc(project_member::Column::SortOrder)
            .all(db)
            .await?;

        let project_ids: Vec<i64> = memberships.iter().map(|m| m.project_id).collect();
        let mut projects: HashMap<i64, project::Model> = project::Entity::find()
            .filter(project::Column::Id.is_in(project_ids))
            .filter(project::Column::Archived.eq(archived))
            .all(db)
            .await?
            .into_iter()
            .map(|model| (model.id, model))
            .collect();

        let mut result = Vec::with_capacity(memberships.len());
        for member in memberships {
            if let Some(model) = projects.remove(&member.project_id) {
                result.push(Self::with_member(model, member));
            }
        }
        Ok(result)
    }

    /// Substring search over the caller's own project list.
    pub async fn search<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        text: &str,
    ) -> Result<Vec<ProjectWithMember>, ProjectError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };

        let memberships = project_member::Entity::find()
            .filter(project_member::Column::UserId.eq(user_row_id))
            .order_by_asc(project_member::Column::SortOrder)
            .all(db)
            .await?;

        let project_ids: Vec<i64> = memberships.iter().map(|m| m.project_id).collect();
        let mut projects: HashMap<i64, project::Model> = project::Entity::find()
            .filter(project::Column::Id.is_in(project_ids))
            .filter(project::Column::Name.contains(text))
            .all(db)
            .await?
            .into_iter()
            .map(|model| (model.id, model))
            .collect();

        let mut result = Vec::new();
        for member in memberships {
            if let Some(model) = projects.remove(&member.project_id) {
                result.push(Self::with_member(model, member));
            }
        }
        Ok(result)
    }

    /// Creates the project and the creator's owner membership in one
    /// transaction; the membership order honors the optional anchors.
    pub async fn create<C>(
        db: &C,
        user_id: Uuid,
        data: &CreateProject,
    ) -> Result<ProjectWithMember, ProjectError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if data.name.trim().is_empty() {
            return Err(ProjectError::Validation(
                "project name cannot be empty".to_string(),
            ));
        }

        let txn = db.begin().await?;
        let created = Self::create_in_txn(&txn, user_id, data).await?;
        txn.commit().await?;
        Ok(created)
    }

    pub(crate) async fn create_in_txn<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        data: &CreateProject,
    ) -> Result<ProjectWithMember, ProjectError> {
        let user_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(ProjectError::UserNotFound)?;

        let now = Utc::now();
        let model = project::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            name: Set(data.name.clone()),
            view: Set(data.view.unwrap_or_default()),
            archived: Set(data.archived.unwrap_or(false)),
            default_inbox: Set(data.default_inbox.unwrap_or(false)),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await?;

        let scope = MemberScope {
            user_id: user_row_id,
        };
        let position = if let Some(anchor) = data.above_project_id {
            let anchor_row_id = ids::project_id_by_uuid(db, anchor)
                .await?
                .ok_or(ProjectError::ProjectNotFound)?;
            Insert::Above(anchor_row_id)
        } else if let Some(anchor) = data.below_project_id {
            let anchor_row_id = ids::project_id_by_uuid(db, anchor)
                .await?
                .ok_or(ProjectError::ProjectNotFound)?;
            Insert::Below(anchor_row_id)
        } else {
            Insert::Append
        };
        let sort_order = ordering::resolve(db, &scope, position).await?;

        let member = project_member::ActiveModel {
            project_id: Set(model.id),
            user_id: Set(user_row_id),
            owner: Set(true),
            sort_order: Set(sort_order),
            favorite: Set(false),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await?;

        Ok(Self::with_member(model, member))
    }

    /// Partial update; only the provided fields are touched.
    pub async fn update<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        data: &UpdateProject,
    ) -> Result<ProjectWithMember, ProjectError> {
        let (model, member) = Self::require(db, user_id, project_id).await?;

        let mut active: project::ActiveModel = model.into();
        if let Some(name) = data.name.clone() {
            if name.trim().is_empty() {
                return Err(ProjectError::Validation(
                    "project name cannot be empty".to_string(),
                ));
            }
            active.name = Set(name);
        }
        if let Some(archived) = data.archived {
            active.archived = Set(archived);
        }
        active.updated_at = Set(Utc::now().into());

        let updated = active.update(db).await?;
        Ok(Self::with_member(updated, member))
    }

    /// Only the creator may delete, and never the default inbox. Everything
    /// under the project goes with it in one transaction.
    pub async fn delete<C>(db: &C, user_id: Uuid, project_id: Uuid) -> Result<(), ProjectError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let (model, member) = Self::require(db, user_id, project_id).await?;
        if !member.owner {
            // Reported exactly like a missing project.
            return Err(ProjectError::ProjectNotFound);
        }
        if model.default_inbox {
            return Err(ProjectError::DefaultInboxProtected);
        }

        let txn = db.begin().await?;

        let task_ids: Vec<i64> = task::Entity::find()
            .select_only()
            .column(task::Column::Id)
            .filter(task::Column::ProjectId.eq(model.id))
            .into_tuple()
            .all(&txn)
            .await?;

        comment::Entity::delete_many()
            .filter(
                Condition::any()
                    .add(comment::Column::ProjectId.eq(model.id))
                    .add(comment::Column::TaskId.is_in(task_ids.clone())),
            )
            .exec(&txn)
            .await?;
        task_label::Entity::delete_many()
            .filter(task_label::Column::TaskId.is_in(task_ids.clone()))
            .exec(&txn)
            .await?;
        task_link::Entity::delete_many()
            .filter(
                Condition::any()
                    .add(task_link::Column::ParentTaskId.is_in(task_ids.clone()))
                    .add(task_link::Column::ChildTaskId.is_in(task_ids)),
            )
            .exec(&txn)
            .await?;
        task::Entity::delete_many()
            .filter(task::Column::ProjectId.eq(model.id))
            .exec(&txn)
            .await?;
        section::Entity::delete_many()
            .filter(section::Column::ProjectId.eq(model.id))
            .exec(&txn)
            .await?;
        project_member::Entity::delete_many()
            .filter(project_member::Column::ProjectId.eq(model.id))
            .exec(&txn)
            .await?;
        project::Entity::delete_by_id(model.id).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    /// Adds memberships for the targets, appending to each target's own
    /// project ordering. Targets that already collaborate are skipped, so
    /// sharing is idempotent.
    pub async fn share<C>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        target_user_ids: &[Uuid],
    ) -> Result<(), ProjectError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let (model, _) = Self::require(db, user_id, project_id).await?;

        let txn = db.begin().await?;
        for target in target_user_ids {
            let target_row_id = ids::user_id_by_uuid(&txn, *target)
                .await?
                .ok_or(ProjectError::UserNotFound)?;

            let existing = project_member::Entity::find()
                .filter(project_member::Column::ProjectId.eq(model.id))
                .filter(project_member::Column::UserId.eq(target_row_id))
                .one(&txn)
                .await?;
            if existing.is_some() {
                continue;
            }

            let scope = MemberScope {
                user_id: target_row_id,
            };
            let sort_order = ordering::append(&txn, &scope).await?;
            let now = Utc::now();
            project_member::ActiveModel {
                project_id: Set(model.id),
                user_id: Set(target_row_id),
                owner: Set(false),
                sort_order: Set(sort_order),
                favorite: Set(false),
                created_at: Set(now.into()),
                updated_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Exchanges the positions of two projects in the caller's list.
    pub async fn swap_order<C>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        target_project_id: Uuid,
    ) -> Result<(ProjectWithMember, ProjectWithMember), ProjectError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let user_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(ProjectError::UserNotFound)?;
        // Membership is checked up front so a hidden project reads exactly
        // like a missing one.
        let (a, _) = Self::require(db, user_id, project_id).await?;
        let (b, _) = Self::require(db, user_id, target_project_id).await?;
        let (row_a, row_b) = (a.id, b.id);

        let txn = db.begin().await?;
        let scope = MemberScope {
            user_id: user_row_id,
        };
        ordering::swap(&txn, &scope, row_a, row_b).await?;
        txn.commit().await?;

        let (model_a, member_a) = Self::require(db, user_id, project_id).await?;
        let (model_b, member_b) = Self::require(db, user_id, target_project_id).await?;
        Ok((
            Self::with_member(model_a, member_a),
            Self::with_member(model_b, member_b),
        ))
    }

    pub async fn set_favorite<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        favorite: bool,
    ) -> Result<ProjectWithMember, ProjectError> {
        let (model, member) = Self::require(db, user_id, project_id).await?;

        let mut active: project_member::ActiveModel = member.into();
        active.favorite = Set(favorite);
        active.updated_at = Set(Utc::now().into());
        let member = active.update(db).await?;

        Ok(Self::with_member(model, member))
    }

    /// Removes the caller's own membership. The last collaborator cannot
    /// leave; the project must be deleted instead. The member count and
    /// the removal share one transaction.
    pub async fn leave<C>(db: &C, user_id: Uuid, project_id: Uuid) -> Result<(), ProjectError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let (model, member) = Self::require(db, user_id, project_id).await?;

        let txn = db.begin().await?;
        let members = project_member::Entity::find()
            .filter(project_member::Column::ProjectId.eq(model.id))
            .count(&txn)
            .await?;
        if members < 2 {
            return Err(ProjectError::SoleCollaborator);
        }

        project_member::Entity::delete_by_id(member.id)
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Deep clone: project, sections, tasks (labels included), and the
    /// parent/child edges rebuilt through the old-to-new task map. All or
    /// nothing.
    pub async fn duplicate<C>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<ProjectWithMember, ProjectError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let (model, _) = Self::require(db, user_id, project_id).await?;

        let txn = db.begin().await?;

        let copy = Self::create_in_txn(
            &txn,
            user_id,
            &CreateProject {
                name: format!("Copy of {}", model.name),
                view: Some(model.view),
                archived: Some(model.archived),
                default_inbox: Some(false),
                above_project_id: None,
                below_project_id: None,
            },
        )
        .await?;
        let copy_row_id = ids::project_id_by_uuid(&txn, copy.id)
            .await?
            .ok_or(ProjectError::ProjectNotFound)?;

        let now = Utc::now();
        let mut section_map: HashMap<i64, i64> = HashMap::new();
        let sections = section::Entity::find()
            .filter(section::Column::ProjectId.eq(model.id))
            .order_by_asc(section::Column::SortOrder)
            .all(&txn)
            .await?;
        for sect in sections {
            let clone = section::ActiveModel {
                uuid: Set(Uuid::new_v4()),
                project_id: Set(copy_row_id),
                name: Set(sect.name.clone()),
                sort_order: Set(sect.sort_order),
                open: Set(sect.open),
                created_at: Set(now.into()),
                updated_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            section_map.insert(sect.id, clone.id);
        }

        let mut task_map: HashMap<i64, i64> = HashMap::new();
        let tasks = task::Entity::find()
            .filter(task::Column::ProjectId.eq(model.id))
            .order_by_asc(task::Column::SortOrder)
            .all(&txn)
            .await?;
        for t in &tasks {
            let clone = task::ActiveModel {
                uuid: Set(Uuid::new_v4()),
                project_id: Set(copy_row_id),
                section_id: Set(t.section_id.and_then(|id| section_map.get(&id).copied())),
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
            task_map.insert(t.id, clone.id);
        }

        let old_task_ids: Vec<i64> = task_map.keys().copied().collect();
        let label_links = task_label::Entity::find()
            .filter(task_label::Column::TaskId.is_in(old_task_ids.clone()))
            .all(&txn)
            .await?;
        let label_clones: Vec<task_label::ActiveModel> = label_links
            .into_iter()
            .filter_map(|link| {
                task_map.get(&link.task_id).map(|new_task_id| task_label::ActiveModel {
                    task_id: Set(*new_task_id),
                    label_id: Set(link.label_id),
                    created_at: Set(now.into()),
                    ..Default::default()
                })
            })
            .collect();
        if !label_clones.is_empty() {
            task_label::Entity::insert_many(label_clones).exec(&txn).await?;
        }

        let links = task_link::Entity::find()
            .filter(task_link::Column::ParentTaskId.is_in(old_task_ids))
            .all(&txn)
            .await?;
        let link_clones: Vec<task_link::ActiveModel> = links
            .into_iter()
            .filter_map(|link| {
                let parent = task_map.get(&link.parent_task_id)?;
                let child = task_map.get(&link.child_task_id)?;
                Some(task_link::ActiveModel {
                    parent_task_id: Set(*parent),
                    child_task_id: Set(*child),
                    created_at: Set(now.into()),
                    ..Default::default()
                })
            })
            .collect();
        if !link_clones.is_empty() {
            task_link::Entity::insert_many(link_clones).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(copy)
    }
}
