use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Condition, Expr, ExprTrait, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::{comment, project_member, task},
    models::{
        guard::{self, GuardError},
        ids,
    },
};

#[derive(Debug, Error)]
pub enum CommentError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("Comment not found")]
    CommentNotFound,
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Task not found")]
    TaskNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("{0}")]
    Validation(String),
}

impl From<GuardError> for CommentError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Database(err) => Self::Database(err),
            GuardError::ProjectNotFound => Self::ProjectNotFound,
        }
    }
}

/// A comment hangs off exactly one project or one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum CommentTarget {
    Project(Uuid),
    Task(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub target: CommentTarget,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    async fn from_model<C: ConnectionTrait>(
        db: &C,
        model: comment::Model,
    ) -> Result<Comment, CommentError> {
        let author_id = ids::user_uuid_by_id(db, model.author_id)
            .await?
            .ok_or(CommentError::UserNotFound)?;
        let target = match (model.project_id, model.task_id) {
            (Some(project_row_id), None) => {
                let uuid = ids::project_uuid_by_id(db, project_row_id)
                    .await?
                    .ok_or(CommentError::ProjectNotFound)?;
                CommentTarget::Project(uuid)
            }
            (None, Some(task_row_id)) => {
                let uuid = ids::task_uuid_by_id(db, task_row_id)
                    .await?
                    .ok_or(CommentError::TaskNotFound)?;
                CommentTarget::Task(uuid)
            }
            _ => return Err(CommentError::CommentNotFound),
        };
        Ok(Comment {
            id: model.uuid,
            author_id,
            body: model.body,
            target,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        })
    }

    /// Resolves a target to its backing rows and the project row that
    /// controls access to it.
    async fn resolve_target<C: ConnectionTrait>(
        db: &C,
        target: CommentTarget,
    ) -> Result<(Option<i64>, Option<i64>, i64), CommentError> {
        match target {
            CommentTarget::Project(project_id) => {
                let project_row_id = ids::project_id_by_uuid(db, project_id)
                    .await?
                    .ok_or(CommentError::ProjectNotFound)?;
                Ok((Some(project_row_id), None, project_row_id))
            }
            CommentTarget::Task(task_id) => {
                let model = task::Entity::find()
                    .filter(task::Column::Uuid.eq(task_id))
                    .one(db)
                    .await?
                    .ok_or(CommentError::TaskNotFound)?;
                Ok((None, Some(model.id), model.project_id))
            }
        }
    }

    pub async fn add<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        target: CommentTarget,
        body: &str,
    ) -> Result<Comment, CommentError> {
        if body.trim().is_empty() {
            return Err(CommentError::Validation(
                "comment body cannot be empty".to_string(),
            ));
        }
        let (project_ref, task_ref, guard_project) = Self::resolve_target(db, target).await?;
        guard::require_member(db, user_id, guard_project)
            .await
            .map_err(|err| Self::opaque(err, target))?;
        let author_row_id = ids::user_id_by_uuid(db, user_id)
            .await?
            .ok_or(CommentError::UserNotFound)?;

        let now = Utc::now();
        let model = comment::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            author_id: Set(author_row_id),
            body: Set(body.to_string()),
            project_id: Set(project_ref),
            task_id: Set(task_ref),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Self::from_model(db, model).await
    }

    /// Comments on a target, oldest first. An inaccessible target yields
    /// an empty list.
    pub async fn list<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        target: CommentTarget,
    ) -> Result<Vec<Comment>, CommentError> {
        let (project_ref, task_ref, guard_project) = match Self::resolve_target(db, target).await {
            Ok(resolved) => resolved,
            Err(CommentError::Database(err)) => return Err(CommentError::Database(err)),
            Err(_) => return Ok(Vec::new()),
        };
        if guard::find_member(db, user_id, guard_project).await?.is_none() {
            return Ok(Vec::new());
        }

        let mut query = comment::Entity::find();
        if let Some(project_row_id) = project_ref {
            query = query.filter(comment::Column::ProjectId.eq(project_row_id));
        }
        if let Some(task_row_id) = task_ref {
            query = query.filter(comment::Column::TaskId.eq(task_row_id));
        }
        let records = query
            .order_by_asc(comment::Column::CreatedAt)
            .order_by_asc(comment::Column::Id)
            .all(db)
            .await?;

        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }

    /// Substring search over comment bodies, bounded to threads the
    /// caller can see.
    pub async fn search<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        text: &str,
    ) -> Result<Vec<Comment>, CommentError> {
        let Some(user_row_id) = ids::user_id_by_uuid(db, user_id).await? else {
            return Ok(Vec::new());
        };

        let member_projects = Query::select()
            .column(project_member::Column::ProjectId)
            .from(project_member::Entity)
            .and_where(Expr::col(project_member::Column::UserId).eq(user_row_id))
            .to_owned();
        let visible_tasks = Query::select()
            .column(task::Column::Id)
            .from(task::Entity)
            .and_where(Expr::col(task::Column::ProjectId).in_subquery(member_projects.clone()))
            .to_owned();

        let records = comment::Entity::find()
            .filter(comment::Column::Body.contains(text))
            .filter(
                Condition::any()
                    .add(comment::Column::ProjectId.in_subquery(member_projects))
                    .add(comment::Column::TaskId.in_subquery(visible_tasks)),
            )
            .order_by_asc(comment::Column::CreatedAt)
            .order_by_asc(comment::Column::Id)
            .all(db)
            .await?;

        let mut result = Vec::with_capacity(records.len());
        for model in records {
            result.push(Self::from_model(db, model).await?);
        }
        Ok(result)
    }

    pub async fn update_body<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        comment_id: Uuid,
        body: &str,
    ) -> Result<Comment, CommentError> {
        if body.trim().is_empty() {
            return Err(CommentError::Validation(
                "comment body cannot be empty".to_string(),
            ));
        }
        let model = Self::require(db, user_id, comment_id).await?;

        let mut active: comment::ActiveModel = model.into();
        active.body = Set(body.to_string());
        active.updated_at = Set(Utc::now().into());
        let updated = active.update(db).await?;
        Self::from_model(db, updated).await
    }

    pub async fn remove<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        comment_id: Uuid,
    ) -> Result<(), CommentError> {
        let model = Self::require(db, user_id, comment_id).await?;
        comment::Entity::delete_by_id(model.id).exec(db).await?;
        Ok(())
    }

    async fn require<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        comment_id: Uuid,
    ) -> Result<comment::Model, CommentError> {
        let model = comment::Entity::find()
            .filter(comment::Column::Uuid.eq(comment_id))
            .one(db)
            .await?
            .ok_or(CommentError::CommentNotFound)?;

        let guard_project = match (model.project_id, model.task_id) {
            (Some(project_row_id), None) => project_row_id,
            (None, Some(task_row_id)) => {
                task::Entity::find_by_id(task_row_id)
                    .one(db)
                    .await?
                    .ok_or(CommentError::CommentNotFound)?
                    .project_id
            }
            _ => return Err(CommentError::CommentNotFound),
        };
        guard::require_member(db, user_id, guard_project)
            .await
            .map_err(|err| match err {
                GuardError::Database(err) => CommentError::Database(err),
                GuardError::ProjectNotFound => CommentError::CommentNotFound,
            })?;
        Ok(model)
    }

    fn opaque(err: GuardError, target: CommentTarget) -> CommentError {
        match (err, target) {
            (GuardError::Database(err), _) => CommentError::Database(err),
            // A project the caller cannot see reads as absent.
            (GuardError::ProjectNotFound, CommentTarget::Project(_)) => {
                CommentError::ProjectNotFound
            }
            (GuardError::ProjectNotFound, CommentTarget::Task(_)) => CommentError::TaskNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;

    use crate::models::project::{CreateProject, Project};
    use crate::models::task::{CreateTask, Task};
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

    #[tokio::test]
    async fn comments_attach_to_projects_and_tasks() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = Project::create(&db, user, &CreateProject::with_name("Work".to_string()))
            .await
            .unwrap();
        let task = Task::create(&db, user, project.id, &CreateTask::with_title("Ship".to_string()))
            .await
            .unwrap();

        let on_project = Comment::add(&db, user, CommentTarget::Project(project.id), "kickoff notes")
            .await
            .unwrap();
        assert_eq!(on_project.target, CommentTarget::Project(project.id));
        assert_eq!(on_project.author_id, user);

        Comment::add(&db, user, CommentTarget::Task(task.id), "first pass done")
            .await
            .unwrap();
        Comment::add(&db, user, CommentTarget::Task(task.id), "needs review")
            .await
            .unwrap();

        let on_task = Comment::list(&db, user, CommentTarget::Task(task.id)).await.unwrap();
        let bodies: Vec<&str> = on_task.iter().map(|c| c.body.as_str()).collect();
        assert_eq!(bodies, vec!["first pass done", "needs review"]);

        // The project thread does not include task comments.
        let thread = Comment::list(&db, user, CommentTarget::Project(project.id)).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, on_project.id);
    }

    #[tokio::test]
    async fn outsiders_cannot_read_or_write_threads() {
        let db = setup_db().await;
        let owner = mk_user(&db, "Ada").await;
        let outsider = mk_user(&db, "Eve").await;
        let project = Project::create(&db, owner, &CreateProject::with_name("Secret".to_string()))
            .await
            .unwrap();
        let comment = Comment::add(&db, owner, CommentTarget::Project(project.id), "internal")
            .await
            .unwrap();

        let err = Comment::add(&db, outsider, CommentTarget::Project(project.id), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CommentError::ProjectNotFound));

        assert!(
            Comment::list(&db, outsider, CommentTarget::Project(project.id))
                .await
                .unwrap()
                .is_empty()
        );

        let err = Comment::remove(&db, outsider, comment.id).await.unwrap_err();
        assert!(matches!(err, CommentError::CommentNotFound));
    }

    #[tokio::test]
    async fn edit_and_remove_round_out_the_thread() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = Project::create(&db, user, &CreateProject::with_name("Work".to_string()))
            .await
            .unwrap();

        let comment = Comment::add(&db, user, CommentTarget::Project(project.id), "draft")
            .await
            .unwrap();
        let edited = Comment::update_body(&db, user, comment.id, "final").await.unwrap();
        assert_eq!(edited.body, "final");

        Comment::remove(&db, user, comment.id).await.unwrap();
        assert!(
            Comment::list(&db, user, CommentTarget::Project(project.id))
                .await
                .unwrap()
                .is_empty()
        );
        let err = Comment::remove(&db, user, comment.id).await.unwrap_err();
        assert!(matches!(err, CommentError::CommentNotFound));
    }

    #[tokio::test]
    async fn search_spans_both_targets_but_stays_within_membership() {
        let db = setup_db().await;
        let ada = mk_user(&db, "Ada").await;
        let grace = mk_user(&db, "Grace").await;
        let adas = Project::create(&db, ada, &CreateProject::with_name("Ada's".to_string()))
            .await
            .unwrap();
        let graces = Project::create(&db, grace, &CreateProject::with_name("Grace's".to_string()))
            .await
            .unwrap();
        let task = Task::create(&db, ada, adas.id, &CreateTask::with_title("Ship".to_string()))
            .await
            .unwrap();

        Comment::add(&db, ada, CommentTarget::Project(adas.id), "kickoff review notes")
            .await
            .unwrap();
        Comment::add(&db, ada, CommentTarget::Task(task.id), "review finished")
            .await
            .unwrap();
        Comment::add(&db, grace, CommentTarget::Project(graces.id), "her own review")
            .await
            .unwrap();

        let hits = Comment::search(&db, ada, "review").await.unwrap();
        let bodies: Vec<&str> = hits.iter().map(|c| c.body.as_str()).collect();
        assert_eq!(bodies, vec!["kickoff review notes", "review finished"]);

        assert!(Comment::search(&db, ada, "nothing here").await.unwrap().is_empty());
        let graces_hits = Comment::search(&db, grace, "review").await.unwrap();
        assert_eq!(graces_hits.len(), 1);
        assert_eq!(graces_hits[0].body, "her own review");
    }

    #[tokio::test]
    async fn empty_bodies_are_rejected() {
        let db = setup_db().await;
        let user = mk_user(&db, "Ada").await;
        let project = Project::create(&db, user, &CreateProject::with_name("Work".to_string()))
            .await
            .unwrap();

        let err = Comment::add(&db, user, CommentTarget::Project(project.id), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, CommentError::Validation(_)));
    }
}
