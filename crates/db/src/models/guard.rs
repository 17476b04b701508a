use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter};
use thiserror::Error;
use uuid::Uuid;

use crate::{entities::project_member, models::ids};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Database(#[from] DbErr),
    /// Covers both "no such project" and "caller is not a collaborator";
    /// the two are deliberately indistinguishable to the caller.
    #[error("Project not found")]
    ProjectNotFound,
}

/// Every mutation on a project or anything under it starts here: the acting
/// user must hold a membership row on the owning project.
pub async fn require_member<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
    project_row_id: i64,
) -> Result<project_member::Model, GuardError> {
    let user_row_id = ids::user_id_by_uuid(db, user_id)
        .await?
        .ok_or(GuardError::ProjectNotFound)?;

    project_member::Entity::find()
        .filter(project_member::Column::ProjectId.eq(project_row_id))
        .filter(project_member::Column::UserId.eq(user_row_id))
        .one(db)
        .await?
        .ok_or(GuardError::ProjectNotFound)
}

/// Non-erroring variant for read paths that report "nothing" instead.
pub async fn find_member<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
    project_row_id: i64,
) -> Result<Option<project_member::Model>, DbErr> {
    match require_member(db, user_id, project_row_id).await {
        Ok(member) => Ok(Some(member)),
        Err(GuardError::ProjectNotFound) => Ok(None),
        Err(GuardError::Database(err)) => Err(err),
    }
}
