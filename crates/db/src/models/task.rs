use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Days, NaiveTime, Utc};
use sea_orm::sea_query::{Condition, Expr, ExprTrait, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionSession, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::{comment, label, project_member, section, task, task_label, task_link},
    models::{
        comment::{Comment, CommentTarget},
        guard::{self, GuardError},
        ids,
        label::Label,
        ordering::{self, Insert, OrderError, TaskScope},
    },
    types::TaskPriority,
};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Ordering(OrderError),
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Section not found")]
    SectionNotFound,
    #[error("Task not found")]
    TaskNotFound,
    #[error("Label not found")]
    LabelNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("{0}")]
    Validation(String),
}

impl From<GuardError> for TaskError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Database(err) => Self::Database(err),
            GuardError::ProjectNotFound => Self::ProjectNotFound,
        }
    }
}

impl From<OrderError> for TaskError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Database(err) => Self::Database(err),
            other => Self::Ordering(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub section_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<TaskPriority>,
    pub assignee_id: Option<Uuid>,
    pub completed: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The shape every read path returns: the task plus its labels and the
/// parent link, if the task is someone's subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWithLabels {
    #[serde(flatten)]
    pub task: Task,
    pub labels: Vec<Label>,
    pub parent_task_id: Option<Uuid>,
}

impl std::ops::Deref for TaskWithLabels {
    type Target = Task;
    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetails {
    #[serde(flatten)]
    pub task: TaskWithLabels,
    pub comments: Vec<Comment>,
    pub subtasks: Vec<TaskWithLabels>,
}

impl std::ops::Deref for TaskDetails {
    type Target = TaskWithLabels;
    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
    pub section_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub priority: Option<TaskPriority>,
    pub due_date: Option<DateTime<Utc>>,
    pub labels: Option<Vec<Uuid>>,
    pub above_task_id: Option<Uuid>,
    pub below_task_id: Option<Uuid>,
}

impl CreateTask {
    pub fn with_title(title: String) -> Self {
        Self {
            title,
            ..Default::default()
        }
    }
}

/// Partial update; absent fields stay untouched. `labels` is the full
/// desired set and gets diffed against the current attachments.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<TaskPriority>,
    pub assignee_id: Option<Uuid>,
    pub completed: Option<bool>,
    pub labels: Option<Vec<Uuid>>,
}

impl Task {
    async fn from_model<C: ConnectionTrait>(
        db: &C,
        model: task::Model,
    ) -> Result<TaskWithLabels, TaskError> {
        let project_id = ids::project_uuid_by_id(db, model.project_id)
            .await?
            .ok_or(TaskError::ProjectNotFound)?;
        let section_id = match model.section_id {
            Some(row_id) => ids::section_uuid_by_id(db, row_id).await?,
            None => None,
        };
        let assignee_id = match model.assignee_id {
            Some(row_id) => ids::user_uuid_by_id(db, row_id).await?,
            None => None,
        };

        let labels = Self::load_labels(db, model.id).await?;

        let parent_link = task_link::Entity::find()
            .filter(task_link::Column::ChildTaskId.eq(model.id))
            .one(db)
            .await?;
        let parent_task_id = match parent_link {
            Some(link) => ids::task_uuid_by_id(db, link.parent_task_id).await?,
            None => None,
        };

        Ok(TaskWithLabels {
            task: Task {
                id: model.uuid,
                project_id,
                section_id,
                title: model.title,
                description: model.description,
                due_date: model.due_date.map(Into::into),
                priority: model.priority,
                assignee_id,
                completed: model.completed,
                sort_order: model.sort_order,
                created_at: model.created_at.into(),
                updated_at: model.updated_at.into(),
            },
            labels,
            parent_task_id,
        })
    }

    async fn load_labels<C: ConnectionTrait>(
        db: &C,
        task_row_id: i64,
    ) -> Result<Vec<Label>, TaskError> {
        let label_ids: Vec<i64> = task_label::Entity::find()
            .select_only()
            .column(task_label::Column::LabelId)
            .filter(task_label::Column::TaskId.eq(task_row_id))
            .into_tuple()
            .all(db)
            .await?;
        if label_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = label::Entity::find()
            .filter(label::Column::Id.is_in(label_ids))
            .order_by_asc(label::Column::SortOrder)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Label::from_model).collect())
    }

    /// Tasks of a project, optionally narrowed to one section, in list
    /// order. An inaccessible project yields an empty list.
    pub async fn list<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        section_id: Option<Uuid>,
    ) -> Result<Vec<TaskWithLabels>, TaskError> {
        let Some(project_row_id) = ids::project_id_by_uuid(db, project_id).await? else {
            return Ok(Vec::new());
        };
        if guard::find_member(db, user_id, project_row_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let mut query = task::Entity::find().filter(task::Column::ProjectId.eq(project_row_id));
        if let Some(section_uuid) = section_id {
            let section_row_id = ids::section_id_by_uuid(db, section_uuid)
                .await?
                .ok_or(TaskError::SectionNotFound)?;
            query = query.filter(task::Column::SectionId.eq(section_row_id));
        }
        let records = query
            .order_by_asc(task::Column::SortOrder)
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
        task_id: Uuid,
    ) -> Result<Option<TaskWithLabels>, TaskError> {
        let Some(model) = task::Entity::find()
            .filter(task::Column::Uuid.eq(task_id))
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

    /// The full drill-down view: the task, its comment thread, and its
    /// direct subtasks.
    pub async fn details<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<TaskDetails>, TaskError> {
        let Some(model) = task::Entity::find()
            .filter(task::Column::Uuid.eq(task_id))
            .one(db)
            .await?
        else {
            return Ok(None);
        };
        if guard::find_member(db, user_id, model.project_id).await?.is_none() {
            return Ok(None);
        }

        let child_ids: Vec<i64> = task_link::Entity::find()
            .select_only()
            .column(task_link::Column::ChildTaskId)
            .filter(task_link::Column::ParentTaskId.eq(model.id))
            .into_tuple()
            .all(db)
            .await?;
        let children = task::Entity::find()
            .filter(task::Column::Id.is_in(child_ids))
            .order_by_asc(task::Column::SortOrder)
            .all(db)
            .await?;
        let mut subtasks = Vec::with_capacity(children.len());
        for child in children {
            subtasks.push(Self::from_model(db, child).await?);
        }

        let comments = Comment::list(db, user_id, CommentTarget::Task(model.uuid))
            .await
            .map_err(|err| match err {
                crate::models::comment::CommentError::Database(err) => TaskError::Database(err),
                other => TaskError::Validation(other.to_string()),
            })?;

        let task = Self::from_model(db, model).await?;
        Ok(Some(TaskDetails {
            task,
            comments,
            subtasks,
        }))
    }

    async fn require<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<task::Model, TaskError> {
        let model = task::Entity::find()
            .filter(task::Column::Uuid.eq(task_id))
            .one(db)
            .await?
            .ok_or(TaskError::TaskNotFound)?;
        guard::require_member(db, user_id, model.project_id)
            .await
            .map_err(|err| match err {
                GuardError::Database(err) => TaskError::Database(err),
                // Hidden projects and missing tasks look the same.
                GuardError::ProjectNotFound => TaskError::TaskNotFound,
            })?;
        Ok(model)
    }

    pub async fn create<C>(
        db: &C,
        user_id: Uuid,
        project_id: Uuid,
        data: &CreateTask,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if data.title.trim().is_empty() {
            return Err(TaskError::Validation("task title cannot be empty".to_string()));
        }
        let project_row_id = ids::project_id_by_uuid(db, project_id)
            .await?
            .ok_or(TaskError::ProjectNotFound)?;
        guard::require_member(db, user_id, project_row_id).await?;

        let txn = db.begin().await?;

        let section_row_id = match data.section_id {
            Some(section_uuid) => {
                let model = section::Entity::find()
                    .filter(section::Column::Uuid.eq(section_uuid))
                    .one(&txn)
                    .await?
                    .ok_or(TaskError::SectionNotFound)?;
                if model.project_id != project_row_id {
                    return Err(TaskError::SectionNotFound);
                }
                Some(model.id)
            }
            None => None,
        };

        let assignee_row_id = match data.assignee_id {
            Some(assignee_uuid) => Some(
                ids::user_id_by_uuid(&txn, assignee_uuid)
                    .await?
                    .ok_or(TaskError::UserNotFound)?,
            ),
            None => None,
        };

        let scope = TaskScope {
            project_id: project_row_id,
            section_id: section_row_id,
        };
        let position = if let Some(anchor) = data.above_task_id {
            let anchor_row_id = ids::task_id_by_uuid(&txn, anchor)
                .await?
                .ok_or(TaskError::TaskNotFound)?;
            Insert::Above(anchor_row_id)
        } else if let Some(anchor) = data.below_task_id {
            let anchor_row_id = ids::task_id_by_uuid(&txn, anchor)
                .await?
                .ok_or(TaskError::TaskNotFound)?;
            Insert::Below(anchor_row_id)
        } else {
            Insert::Append
        };
        let sort_order = ordering::resolve(&txn, &scope, position).await?;

        let now = Utc::now();
        let model = task::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            project_id: Set(project_row_id),
            section_id: Set(section_row_id),
            title: Set(data.title.clone()),
            description: Set(data.description.clone()),
            due_date: Set(data.due_date.map(Into::into)),
            priority: Set(data.priority),
            assignee_id: Set(assignee_row_id),
            completed: Set(false),
            sort_order: Set(sort_order),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        if let Some(parent_uuid) = data.parent_task_id {
            let parent = task::Entity::find()
                .filter(task::Column::Uuid.eq(parent_uuid))
                .one(&txn)
                .await?
                .ok_or(TaskError::TaskNotFound)?;
            guard::require_member(&txn, user_id, parent.project_id)
                .await
                .map_err(|err| match err {
                    GuardError::Database(err) => TaskError::Database(err),
                    GuardError::ProjectNotFound => TaskError::TaskNotFound,
                })?;
            task_link::ActiveModel {
                parent_task_id: Set(parent.id),
                child_task_id: Set(model.id),
                created_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        if let Some(label_uuids) = &data.labels {
            let user_row_id = ids::user_id_by_uuid(&txn, user_id)
                .await?
                .ok_or(TaskError::UserNotFound)?;
            for label_uuid in label_uuids {
                let label_row_id = Self::own_label(&txn, user_row_id, *label_uuid).await?;
                task_label::ActiveModel {
                    task_id: Set(model.id),
                    label_id: Set(label_row_id),
                    created_at: Set(now.into()),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Self::from_model(db, model).await
    }

    async fn own_label<C: ConnectionTrait>(
        db: &C,
        user_row_id: i64,
        label_uuid: Uuid,
    ) -> Result<i64, TaskError> {
        label::Entity::find()
            .select_only()
            .column(label::Column::Id)
            .filter(label::Column::Uuid.eq(label_uuid))
            .filter(label::Column::UserId.eq(user_row_id))
            .into_tuple()
            .one(db)
            .await?
            .ok_or(TaskError::LabelNotFound)
    }

    pub async fn update<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
        data: &UpdateTask,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let model = Self::require(db, user_id, task_id).await?;

        let txn = db.begin().await?;

        let row_id = model.id;
        let mut active: task::ActiveModel = model.into();
        if let Some(title) = data.title.clone() {
            if title.trim().is_empty() {
                return Err(TaskError::Validation("task title cannot be empty".to_string()));
            }
            active.title = Set(title);
        }
        if let Some(description) = data.description.clone() {
            active.description = Set(Some(description));
        }
        if let Some(due_date) = data.due_date {
            active.due_date = Set(Some(due_date.into()));
        }
        if let Some(priority) = data.priority {
            active.priority = Set(Some(priority));
        }
        if let Some(assignee_uuid) = data.assignee_id {
            let assignee_row_id = ids::user_id_by_uuid(&txn, assignee_uuid)
                .await?
                .ok_or(TaskError::UserNotFound)?;
            active.assignee_id = Set(Some(assignee_row_id));
        }
        if let Some(completed) = data.completed {
            active.completed = Set(completed);
        }
        active.updated_at = Set(Utc::now().into());
        let updated = active.update(&txn).await?;

        if let Some(label_uuids) = &data.labels {
            let user_row_id = ids::user_id_by_uuid(&txn, user_id)
                .await?
                .ok_or(TaskError::UserNotFound)?;
            let mut desired = HashSet::new();
            for label_uuid in label_uuids {
                desired.insert(Self::own_label(&txn, user_row_id, *label_uuid).await?);
            }
            let current: Vec<i64> = task_label::Entity::find()
                .select_only()
                .column(task_label::Column::LabelId)
                .filter(task_label::Column::TaskId.eq(row_id))
                .into_tuple()
                .all(&txn)
                .await?;
            let current: HashSet<i64> = current.into_iter().collect();

            let stale: Vec<i64> = current.difference(&desired).copied().collect();
            if !stale.is_empty() {
                task_label::Entity::delete_many()
                    .filter(task_label::Column::TaskId.eq(row_id))
                    .filter(task_label::Column::LabelId.is_in(stale))
                    .exec(&txn)
                    .await?;
            }
            let now = Utc::now();
            for label_row_id in desired.difference(&current) {
                task_label::ActiveModel {
                    task_id: Set(row_id),
                    label_id: Set(*label_row_id),
                    created_at: Set(now.into()),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Self::from_model(db, updated).await
    }

    /// Deletes the task and its whole subtask tree, with labels, links,
    /// and comments, in one transaction.
    pub async fn delete<C>(db: &C, user_id: Uuid, task_id: Uuid) -> Result<(), TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let model = Self::require(db, user_id, task_id).await?;

        let txn = db.begin().await?;

        let mut doomed = vec![model.id];
        let mut seen: HashSet<i64> = doomed.iter().copied().collect();
        let mut frontier = doomed.clone();
        while !frontier.is_empty() {
            let children: Vec<i64> = task_link::Entity::find()
                .select_only()
                .column(task_link::Column::ChildTaskId)
                .filter(task_link::Column::ParentTaskId.is_in(frontier))
                .into_tuple()
                .all(&txn)
                .await?;
            frontier = children.into_iter().filter(|id| seen.insert(*id)).collect();
            doomed.extend(frontier.iter().copied());
        }

        comment::Entity::delete_many()
            .filter(comment::Column::TaskId.is_in(doomed.clone()))
            .exec(&txn)
            .await?;
        task_label::Entity::delete_many()
            .filter(task_label::Column::TaskId.is_in(doomed.clone()))
            .exec(&txn)
            .await?;
        task_link::Entity::delete_many()
            .filter(
                Condition::any()
                    .add(task_link::Column::ParentTaskId.is_in(doomed.clone()))
                    .add(task_link::Column::ChildTaskId.is_in(doomed.clone())),
            )
            .exec(&txn)
            .await?;
        task::Entity::delete_many()
            .filter(task::Column::Id.is_in(doomed))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Exchanges the positions of two tasks. The tasks may live in
    /// different sections or projects; each keeps its home and takes the
    /// other's slot.
    pub async fn swap_order<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
        target_task_id: Uuid,
    ) -> Result<(TaskWithLabels, TaskWithLabels), TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let a = Self::require(db, user_id, task_id).await?;
        let b = Self::require(db, user_id, target_task_id).await?;
        let (order_a, order_b) = (a.sort_order, b.sort_order);

        let txn = db.begin().await?;
        let now = Utc::now();
        let mut active_a: task::ActiveModel = a.into();
        active_a.sort_order = Set(order_b);
        active_a.updated_at = Set(now.into());
        let a = active_a.update(&txn).await?;
        let mut active_b: task::ActiveModel = b.into();
        active_b.sort_order = Set(order_a);
        active_b.updated_at = Set(now.into());
        let b = active_b.update(&txn).await?;
        txn.commit().await?;

        Ok((Self::from_model(db, a).await?, Self::from_model(db, b).await?))
    }

    /// Bulk move into a project, optionally into one of its sections.
    /// Every task is re-ordered at the end of the target scope; with no
    /// target section the tasks land at the project root.
    pub async fn move_tasks<C>(
        db: &C,
        user_id: Uuid,
        task_ids: &[Uuid],
        target_project_id: Uuid,
        target_section_id: Option<Uuid>,
    ) -> Result<(), TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let project_row_id = ids::project_id_by_uuid(db, target_project_id)
            .await?
            .ok_or(TaskError::ProjectNotFound)?;
        guard::require_member(db, user_id, project_row_id).await?;

        let txn = db.begin().await?;

        let section_row_id = match target_section_id {
            Some(section_uuid) => {
                let model = section::Entity::find()
                    .filter(section::Column::Uuid.eq(section_uuid))
                    .one(&txn)
                    .await?
                    .ok_or(TaskError::SectionNotFound)?;
                if model.project_id != project_row_id {
                    return Err(TaskError::SectionNotFound);
                }
                Some(model.id)
            }
            None => None,
        };

        let scope = TaskScope {
            project_id: project_row_id,
            section_id: section_row_id,
        };
        for task_uuid in task_ids {
            let model = Self::require(&txn, user_id, *task_uuid).await?;
            let sort_order = ordering::append(&txn, &scope).await?;
            let mut active: task::ActiveModel = model.into();
            active.project_id = Set(project_row_id);
            active.section_id = Set(section_row_id);
            active.sort_order = Set(sort_order);
            active.updated_at = Set(Utc::now().into());
            active.update(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    /// Moves every task of the source project into the target project,
    /// optionally into one of its sections, in list order.
    pub async fn move_all<C>(
        db: &C,
        user_id: Uuid,
        source_project_id: Uuid,
        target_project_id: Uuid,
        target_section_id: Option<Uuid>,
    ) -> Result<(), TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let source_row_id = ids::project_id_by_uuid(db, source_project_id)
            .await?
            .ok_or(TaskError::ProjectNotFound)?;
        guard::require_member(db, user_id, source_row_id).await?;

        let task_ids: Vec<Uuid> = task::Entity::find()
            .select_only()
            .column(task::Column::Uuid)
            .filter(task::Column::ProjectId.eq(source_row_id))
            .order_by_asc(task::Column::SortOrder)
            .into_tuple()
            .all(db)
            .await?;
        Self::move_tasks(db, user_id, &task_ids, target_project_id, target_section_id).await
    }

    pub async fn assign<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
        assignee_id: Uuid,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        Self::update(
            db,
            user_id,
            task_id,
            &UpdateTask {
                assignee_id: Some(assignee_id),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_priority<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
        priority: TaskPriority,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        Self::update(
            db,
            user_id,
            task_id,
            &UpdateTask {
                priority: Some(priority),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn complete<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
        completed: bool,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        Self::update(
            db,
            user_id,
            task_id,
            &UpdateTask {
                completed: Some(completed),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_due_date<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
        due_date: DateTime<Utc>,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        Self::update(
            db,
            user_id,
            task_id,
            &UpdateTask {
                due_date: Some(due_date),
                ..Default::default()
            },
        )
        .await
    }

    /// Deep copy of the task and its subtask tree. Every clone is titled
    /// "Copy of ..." and appended to its scope; labels are not carried
    /// over. The root clone hangs off the same parent as the original,
    /// child clones hang off their cloned parents.
    pub async fn duplicate<C>(
        db: &C,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<TaskWithLabels, TaskError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let root = Self::require(db, user_id, task_id).await?;

        let txn = db.begin().await?;
        let now = Utc::now();

        let mut clone_map: HashMap<i64, i64> = HashMap::new();
        let mut seen: HashSet<i64> = HashSet::new();
        seen.insert(root.id);
        let mut worklist = vec![root.clone()];
        let mut root_clone_id = None;

        while let Some(original) = worklist.pop() {
            let scope = TaskScope {
                project_id: original.project_id,
                section_id: original.section_id,
            };
            let sort_order = ordering::append(&txn, &scope).await?;
            let clone = task::ActiveModel {
                uuid: Set(Uuid::new_v4()),
                project_id: Set(original.project_id),
                section_id: Set(original.section_id),
                title: Set(format!("Copy of {}", original.title)),
                description: Set(original.description.clone()),
                due_date: Set(original.due_date),
                priority: Set(original.priority),
                assignee_id: Set(original.assignee_id),
                completed: Set(original.completed),
                sort_order: Set(sort_order),
                created_at: Set(now.into()),
                updated_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            clone_map.insert(original.id, clone.id);
            if original.id == root.id {
                root_clone_id = Some(clone.id);
            }

            let child_ids: Vec<i64> = task_link::Entity::find()
                .select_only()
                .column(task_link::Column::ChildTaskId)
                .filter(task_link::Column::ParentTaskId.eq(original.id))
                .into_tuple()
                .all(&txn)
                .await?;
            let fresh: Vec<i64> = child_ids.into_iter().filter(|id| seen.insert(*id)).collect();
            let children = task::Entity::find()
                .filter(task::Column::Id.is_in(fresh))
                .all(&txn)
                .await?;
            worklist.extend(children);
        }

        // The root clone keeps the original's parent, if any.
        let root_parent = task_link::Entity::find()
            .filter(task_link::Column::ChildTaskId.eq(root.id))
            .one(&txn)
            .await?;
        let root_clone_id = root_clone_id.ok_or(TaskError::TaskNotFound)?;
        if let Some(link) = root_parent {
            task_link::ActiveModel {
                parent_task_id: Set(link.parent_task_id),
                child_task_id: Set(root_clone_id),
                created_at: Set(now.into()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        let old_ids: Vec<i64> = clone_map.keys().copied().collect();
        let links = task_link::Entity::find()
            .filter(task_link::Column::ParentTaskId.is_in(old_ids))
            .all(&txn)
            .await?;
        for link in links {
            let (Some(parent), Some(child)) = (
                clone_map.get(&link.parent_task_id),
                clone_map.get(&link.child_task_id),
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

        let clone = task::Entity::find_by_id(root_clone_id)
            .one(&txn)
            .await?
            .ok_or(TaskError::TaskNotFound)?;
        txn.commit().await?;
        Self::from_model(db, clone).await
    }

    fn member_projects(user_row_id: i64) -> sea_orm::sea_query::SelectStatement {
        Query::select()
            .column(project_member::Column::ProjectId)
            .from(project_member::Entity)
            .and_where(Expr::col(project_member::Column::UserId).eq(user_row_id))
            .to_owned()
    }

    /// Open tasks due today or overdue, across every project the user
    /// collaborates on.
    pub async fn find_due_today<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Vec<TaskWithLabels>, TaskError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };
        let start_tomorrow = (Utc::now().date_naive() + Days::new(1))
            .and_time(NaiveTime::MIN)
            .and_utc();

        let records = task::Entity::find()
            .filter(task::Column::ProjectId.in_subquery(Self::member_projects(user_row_id)))
            .filter(task::Column::Completed.eq(false))
            .filter(task::Column::DueDate.lt(start_tomorrow))
            .order_by_asc(task::Column::DueDate)
            .all(db)
            .await?;
        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }

    /// Open dated tasks outside today's window.
    pub async fn find_upcoming<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Vec<TaskWithLabels>, TaskError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };
        let today = Utc::now().date_naive();
        let start_today = today.and_time(NaiveTime::MIN).and_utc();
        let start_tomorrow = (today + Days::new(1)).and_time(NaiveTime::MIN).and_utc();

        let records = task::Entity::find()
            .filter(task::Column::ProjectId.in_subquery(Self::member_projects(user_row_id)))
            .filter(task::Column::Completed.eq(false))
            .filter(
                Condition::any()
                    .add(task::Column::DueDate.lt(start_today))
                    .add(task::Column::DueDate.gte(start_tomorrow)),
            )
            .order_by_asc(task::Column::DueDate)
            .all(db)
            .await?;
        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }

    pub async fn find_by_label<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        label_id: Uuid,
    ) -> Result<Vec<TaskWithLabels>, TaskError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };
        let Some(label_row_id) = label::Entity::find()
            .select_only()
            .column(label::Column::Id)
            .filter(label::Column::Uuid.eq(label_id))
            .filter(label::Column::UserId.eq(user_row_id))
            .into_tuple::<i64>()
            .one(db)
            .await?
        else {
            return Ok(Vec::new());
        };

        let tagged = Query::select()
            .column(task_label::Column::TaskId)
            .from(task_label::Entity)
            .and_where(Expr::col(task_label::Column::LabelId).eq(label_row_id))
            .to_owned();
        let records = task::Entity::find()
            .filter(task::Column::Id.in_subquery(tagged))
            .filter(task::Column::ProjectId.in_subquery(Self::member_projects(user_row_id)))
            .order_by_asc(task::Column::SortOrder)
            .all(db)
            .await?;
        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }

    /// Substring search over titles and descriptions within the user's
    /// projects.
    pub async fn search<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        text: &str,
    ) -> Result<Vec<TaskWithLabels>, TaskError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };
        let records = task::Entity::find()
            .filter(task::Column::ProjectId.in_subquery(Self::member_projects(user_row_id)))
            .filter(
                Condition::any()
                    .add(task::Column::Title.contains(text))
                    .add(task::Column::Description.contains(text)),
            )
            .order_by_asc(task::Column::SortOrder)
            .all(db)
            .await?;
        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;

    use crate::models::label::Label;
    use crate::models::project::{CreateProject, Project};
    use crate::models::section::{CreateSection, Section};
    use crate::models::user::{CreateUser, User};

    use super::*;

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn mk_user(db: &DatabaseConnection, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        User::ensure(
            db,
            &CreateUser {
                id,
                display_name: name.to_string(),
                email: None,
                photo: None,
            },
        )
        .await
        .unwrap();
        id
    }

    async fn mk_project(db: &DatabaseConnection, user: Uuid, name: &str) -> Uuid {
        Project::create(db, user, &CreateProject::with_name(name.to_string()))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn orders_count_per_section_scope() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;
        let backlog = Section::create(&db, user, project, &CreateSection::with_name("Backlog".to_string()))
            .await
            .unwrap();

        let in_root = Task::create(&db, user, project, &CreateTask::with_title("Root task".to_string()))
            .await
            .unwrap();
        let first = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                section_id: Some(backlog.id),
                ..CreateTask::with_title("First".to_string())
            },
        )
        .await
        .unwrap();
        let second = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                section_id: Some(backlog.id),
                ..CreateTask::with_title("Second".to_string())
            },
        )
        .await
        .unwrap();

        // The section scope counts independently of the project root.
        assert_eq!(in_root.sort_order, 1);
        assert_eq!(first.sort_order, 1);
        assert_eq!(second.sort_order, 2);
    }

    #[tokio::test]
    async fn anchored_create_wedges_between_siblings() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;

        let a = Task::create(&db, user, project, &CreateTask::with_title("A".to_string()))
            .await
            .unwrap();
        let b = Task::create(&db, user, project, &CreateTask::with_title("B".to_string()))
            .await
            .unwrap();

        let wedged = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                below_task_id: Some(a.id),
                ..CreateTask::with_title("Wedged".to_string())
            },
        )
        .await
        .unwrap();

        let listed = Task::list(&db, user, project, None).await.unwrap();
        let titles: Vec<&str> = listed.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "Wedged", "B"]);
        assert_eq!(wedged.sort_order, a.sort_order + 1);
        // B was pushed down to make room.
        let b = Task::find_by_id(&db, user, b.id).await.unwrap().unwrap();
        assert_eq!(b.sort_order, 3);
    }

    #[tokio::test]
    async fn update_diffs_the_label_set() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;
        let a = Label::create(&db, user, "alpha").await.unwrap();
        let b = Label::create(&db, user, "beta").await.unwrap();
        let c = Label::create(&db, user, "gamma").await.unwrap();

        let task = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                labels: Some(vec![a.id, b.id]),
                ..CreateTask::with_title("Tagged".to_string())
            },
        )
        .await
        .unwrap();
        let mut ids: Vec<Uuid> = task.labels.iter().map(|l| l.id).collect();
        ids.sort();
        let mut want = vec![a.id, b.id];
        want.sort();
        assert_eq!(ids, want);

        let updated = Task::update(
            &db,
            user,
            task.id,
            &UpdateTask {
                labels: Some(vec![b.id, c.id]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut ids: Vec<Uuid> = updated.labels.iter().map(|l| l.id).collect();
        ids.sort();
        let mut want = vec![b.id, c.id];
        want.sort();
        assert_eq!(ids, want);
    }

    #[tokio::test]
    async fn foreign_labels_are_rejected() {
        let db = setup_db().await;
        let ada = mk_user(&db, "Ada").await;
        let grace = mk_user(&db, "Grace").await;
        let project = mk_project(&db, ada, "Work").await;
        let foreign = Label::create(&db, grace, "hers").await.unwrap();

        let err = Task::create(
            &db,
            ada,
            project,
            &CreateTask {
                labels: Some(vec![foreign.id]),
                ..CreateTask::with_title("Tagged".to_string())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::LabelNotFound));
    }

    #[tokio::test]
    async fn delete_takes_the_subtree_with_it() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;

        let root = Task::create(&db, user, project, &CreateTask::with_title("Root".to_string()))
            .await
            .unwrap();
        let child = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                parent_task_id: Some(root.id),
                ..CreateTask::with_title("Child".to_string())
            },
        )
        .await
        .unwrap();
        let grandchild = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                parent_task_id: Some(child.id),
                ..CreateTask::with_title("Grandchild".to_string())
            },
        )
        .await
        .unwrap();
        let bystander = Task::create(&db, user, project, &CreateTask::with_title("Bystander".to_string()))
            .await
            .unwrap();

        Task::delete(&db, user, root.id).await.unwrap();

        assert!(Task::find_by_id(&db, user, root.id).await.unwrap().is_none());
        assert!(Task::find_by_id(&db, user, child.id).await.unwrap().is_none());
        assert!(Task::find_by_id(&db, user, grandchild.id).await.unwrap().is_none());
        assert!(Task::find_by_id(&db, user, bystander.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn swap_exchanges_slots_and_flags_unknown_tasks() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;

        let a = Task::create(&db, user, project, &CreateTask::with_title("A".to_string()))
            .await
            .unwrap();
        let b = Task::create(&db, user, project, &CreateTask::with_title("B".to_string()))
            .await
            .unwrap();

        let (a2, b2) = Task::swap_order(&db, user, a.id, b.id).await.unwrap();
        assert_eq!(a2.sort_order, b.sort_order);
        assert_eq!(b2.sort_order, a.sort_order);

        let err = Task::swap_order(&db, user, a.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TaskError::TaskNotFound));
    }

    #[tokio::test]
    async fn move_tasks_reorders_at_the_target() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let source = mk_project(&db, user, "Source").await;
        let target = mk_project(&db, user, "Target").await;
        let landing = Section::create(&db, user, target, &CreateSection::with_name("Landing".to_string()))
            .await
            .unwrap();

        let existing = Task::create(
            &db,
            user,
            target,
            &CreateTask {
                section_id: Some(landing.id),
                ..CreateTask::with_title("Existing".to_string())
            },
        )
        .await
        .unwrap();
        let a = Task::create(&db, user, source, &CreateTask::with_title("A".to_string()))
            .await
            .unwrap();
        let b = Task::create(&db, user, source, &CreateTask::with_title("B".to_string()))
            .await
            .unwrap();

        Task::move_tasks(&db, user, &[a.id, b.id], target, Some(landing.id))
            .await
            .unwrap();

        let moved = Task::list(&db, user, target, Some(landing.id)).await.unwrap();
        let titles: Vec<&str> = moved.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Existing", "A", "B"]);
        assert_eq!(existing.sort_order, 1);
        assert!(Task::list(&db, user, source, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_all_empties_the_source_project() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let source = mk_project(&db, user, "Source").await;
        let target = mk_project(&db, user, "Target").await;
        let landing = Section::create(&db, user, target, &CreateSection::with_name("Landing".to_string()))
            .await
            .unwrap();

        for title in ["One", "Two", "Three"] {
            Task::create(&db, user, source, &CreateTask::with_title(title.to_string()))
                .await
                .unwrap();
        }

        Task::move_all(&db, user, source, target, Some(landing.id)).await.unwrap();

        assert!(Task::list(&db, user, source, None).await.unwrap().is_empty());
        let moved = Task::list(&db, user, target, Some(landing.id)).await.unwrap();
        let titles: Vec<&str> = moved.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Two", "Three"]);
    }

    #[tokio::test]
    async fn moving_without_a_section_lands_at_the_project_root() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;
        let pen = Section::create(&db, user, project, &CreateSection::with_name("Pen".to_string()))
            .await
            .unwrap();
        let task = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                section_id: Some(pen.id),
                ..CreateTask::with_title("Escapee".to_string())
            },
        )
        .await
        .unwrap();

        Task::move_tasks(&db, user, &[task.id], project, None).await.unwrap();

        let freed = Task::find_by_id(&db, user, task.id).await.unwrap().unwrap();
        assert_eq!(freed.section_id, None);
    }

    #[tokio::test]
    async fn duplicate_clones_the_subtree_without_labels() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;
        let tag = Label::create(&db, user, "keep").await.unwrap();

        let root = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                labels: Some(vec![tag.id]),
                ..CreateTask::with_title("Plan".to_string())
            },
        )
        .await
        .unwrap();
        let _child = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                parent_task_id: Some(root.id),
                ..CreateTask::with_title("Step one".to_string())
            },
        )
        .await
        .unwrap();

        let copy = Task::duplicate(&db, user, root.id).await.unwrap();
        assert_eq!(copy.title, "Copy of Plan");
        assert!(copy.labels.is_empty());
        assert_eq!(copy.parent_task_id, None);

        let details = Task::details(&db, user, copy.id).await.unwrap().unwrap();
        assert_eq!(details.subtasks.len(), 1);
        assert_eq!(details.subtasks[0].title, "Copy of Step one");
        // The cloned child hangs off the clone, not the original.
        let original = Task::details(&db, user, root.id).await.unwrap().unwrap();
        assert_eq!(original.subtasks.len(), 1);
        assert_eq!(original.subtasks[0].title, "Step one");
    }

    #[tokio::test]
    async fn duplicating_a_subtask_keeps_the_original_parent() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;

        let parent = Task::create(&db, user, project, &CreateTask::with_title("Parent".to_string()))
            .await
            .unwrap();
        let child = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                parent_task_id: Some(parent.id),
                ..CreateTask::with_title("Child".to_string())
            },
        )
        .await
        .unwrap();

        let copy = Task::duplicate(&db, user, child.id).await.unwrap();
        assert_eq!(copy.parent_task_id, Some(parent.id));
    }

    #[tokio::test]
    async fn due_views_split_today_from_the_rest() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = mk_project(&db, user, "Work").await;

        let today = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                due_date: Some(Utc::now()),
                ..CreateTask::with_title("Today".to_string())
            },
        )
        .await
        .unwrap();
        let overdue = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                due_date: Some(Utc::now() - chrono::Duration::days(3)),
                ..CreateTask::with_title("Overdue".to_string())
            },
        )
        .await
        .unwrap();
        let next_week = Task::create(
            &db,
            user,
            project,
            &CreateTask {
                due_date: Some(Utc::now() + chrono::Duration::days(7)),
                ..CreateTask::with_title("Next week".to_string())
            },
        )
        .await
        .unwrap();
        Task::create(&db, user, project, &CreateTask::with_title("Undated".to_string()))
            .await
            .unwrap();

        let due = Task::find_due_today(&db, user).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|t| t.id).collect();
        assert!(ids.contains(&today.id));
        assert!(ids.contains(&overdue.id));
        assert!(!ids.contains(&next_week.id));

        let upcoming = Task::find_upcoming(&db, user).await.unwrap();
        let ids: Vec<Uuid> = upcoming.iter().map(|t| t.id).collect();
        assert!(ids.contains(&next_week.id));
        assert!(ids.contains(&overdue.id));
        assert!(!ids.contains(&today.id));

        // Completed tasks drop out of both views.
        Task::complete(&db, user, overdue.id, true).await.unwrap();
        let due = Task::find_due_today(&db, user).await.unwrap();
        assert!(due.iter().all(|t| t.id != overdue.id));
    }

    #[tokio::test]
    async fn search_and_label_lookups_stay_within_membership() {
        let db = setup_db().await;
        let ada = mk_user(&db, "Ada").await;
        let grace = mk_user(&db, "Grace").await;
        let adas_project = mk_project(&db, ada, "Ada's").await;
        let graces_project = mk_project(&db, grace, "Grace's").await;

        Task::create(&db, ada, adas_project, &CreateTask::with_title("quarterly report".to_string()))
            .await
            .unwrap();
        Task::create(
            &db,
            grace,
            graces_project,
            &CreateTask::with_title("quarterly review".to_string()),
        )
        .await
        .unwrap();

        let hits = Task::search(&db, ada, "quarterly").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "quarterly report");

        let tag = Label::create(&db, ada, "finance").await.unwrap();
        let tagged = Task::search(&db, ada, "report").await.unwrap();
        Task::update(
            &db,
            ada,
            tagged[0].id,
            &UpdateTask {
                labels: Some(vec![tag.id]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let by_label = Task::find_by_label(&db, ada, tag.id).await.unwrap();
        assert_eq!(by_label.len(), 1);
        assert!(Task::find_by_label(&db, grace, tag.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outsiders_see_tasks_as_missing() {
        let db = setup_db().await;
        let owner = mk_user(&db, "Ada").await;
        let outsider = mk_user(&db, "Eve").await;
        let project = mk_project(&db, owner, "Secret").await;
        let task = Task::create(&db, owner, project, &CreateTask::with_title("Hidden".to_string()))
            .await
            .unwrap();

        assert!(Task::find_by_id(&db, outsider, task.id).await.unwrap().is_none());
        assert!(Task::list(&db, outsider, project, None).await.unwrap().is_empty());

        let err = Task::update(
            &db,
            outsider,
            task.id,
            &UpdateTask {
                title: Some("Hijacked".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::TaskNotFound));

        let err = Task::create(&db, outsider, project, &CreateTask::with_title("Sneak".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ProjectNotFound));
    }
}
