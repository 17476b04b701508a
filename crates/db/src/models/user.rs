use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionSession, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::user,
    models::project::{CreateProject, Project, ProjectError},
};

#[derive(Debug, Error)]
pub enum UserError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("User not found")]
    UserNotFound,
    #[error("{0}")]
    Validation(String),
}

impl From<ProjectError> for UserError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::Database(err) => Self::Database(err),
            ProjectError::UserNotFound => Self::UserNotFound,
            other => Self::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub email: Option<String>,
    pub photo: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identity payload from the authentication layer. The id is supplied by the
/// caller, not generated here.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub id: Uuid,
    pub display_name: String,
    pub email: Option<String>,
    pub photo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserProfile {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo: Option<String>,
}

impl User {
    fn from_model(model: user::Model) -> Self {
        Self {
            id: model.uuid,
            display_name: model.display_name,
            email: model.email,
            photo: model.photo,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }

    /// First sign-in provisioning. Creates the user together with their
    /// default "Inbox" project in one transaction; a returning user is
    /// handed back unchanged.
    pub async fn ensure<C>(db: &C, data: &CreateUser) -> Result<User, UserError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if let Some(existing) = user::Entity::find()
            .filter(user::Column::Uuid.eq(data.id))
            .one(db)
            .await?
        {
            return Ok(Self::from_model(existing));
        }

        if data.display_name.trim().is_empty() {
            return Err(UserError::Validation(
                "display name cannot be empty".to_string(),
            ));
        }

        let txn = db.begin().await?;

        let now = Utc::now();
        let model = user::ActiveModel {
            uuid: Set(data.id),
            display_name: Set(data.display_name.clone()),
            email: Set(data.email.clone()),
            photo: Set(data.photo.clone()),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        Project::create_in_txn(
            &txn,
            model.uuid,
            &CreateProject {
                name: "Inbox".to_string(),
                view: None,
                archived: None,
                default_inbox: Some(true),
                above_project_id: None,
                below_project_id: None,
            },
        )
        .await?;

        txn.commit().await?;
        tracing::debug!(user_id = %model.uuid, "provisioned user with default inbox");
        Ok(Self::from_model(model))
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Option<User>, UserError> {
        let record = user::Entity::find()
            .filter(user::Column::Uuid.eq(user_id))
            .one(db)
            .await?;
        Ok(record.map(Self::from_model))
    }

    pub async fn find_all<C: ConnectionTrait>(db: &C) -> Result<Vec<User>, UserError> {
        let records = user::Entity::find()
            .order_by_asc(user::Column::DisplayName)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    /// Substring match on display name or email.
    pub async fn search<C: ConnectionTrait>(db: &C, text: &str) -> Result<Vec<User>, UserError> {
        let records = user::Entity::find()
            .filter(
                sea_orm::sea_query::Condition::any()
                    .add(user::Column::DisplayName.contains(text))
                    .add(user::Column::Email.contains(text)),
            )
            .order_by_asc(user::Column::DisplayName)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    pub async fn update_profile<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        data: &UpdateUserProfile,
    ) -> Result<User, UserError> {
        let model = user::Entity::find()
            .filter(user::Column::Uuid.eq(user_id))
            .one(db)
            .await?
            .ok_or(UserError::UserNotFound)?;

        let mut active: user::ActiveModel = model.into();
        if let Some(display_name) = data.display_name.clone() {
            if display_name.trim().is_empty() {
                return Err(UserError::Validation(
                    "display name cannot be empty".to_string(),
                ));
            }
            active.display_name = Set(display_name);
        }
        if let Some(email) = data.email.clone() {
            active.email = Set(Some(email));
        }
        if let Some(photo) = data.photo.clone() {
            active.photo = Set(Some(photo));
        }
        active.updated_at = Set(Utc::now().into());

        let updated = active.update(db).await?;
        Ok(Self::from_model(updated))
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;

    use super::*;

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    #[tokio::test]
    async fn ensure_provisions_inbox_once() {
        let db = setup_db().await;
        let id = Uuid::new_v4();
        let data = CreateUser {
            id,
            display_name: "Ada".to_string(),
            email: Some("ada@example.com".to_string()),
            photo: None,
        };

        let created = User::ensure(&db, &data).await.unwrap();
        assert_eq!(created.id, id);

        let projects = Project::find_active(&db, id).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "Inbox");
        assert!(projects[0].default_inbox);
        assert!(projects[0].owner);

        // A second sign-in neither duplicates the user nor the inbox.
        let again = User::ensure(&db, &data).await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(Project::find_active(&db, id).await.unwrap().len(), 1);
        assert_eq!(User::find_all(&db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_matches_name_and_email() {
        let db = setup_db().await;
        for (name, email) in [("Ada Lovelace", "ada@example.com"), ("Grace Hopper", "grace@example.com")] {
            User::ensure(
                &db,
                &CreateUser {
                    id: Uuid::new_v4(),
                    display_name: name.to_string(),
                    email: Some(email.to_string()),
                    photo: None,
                },
            )
            .await
            .unwrap();
        }

        let by_name = User::search(&db, "Lovelace").await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].display_name, "Ada Lovelace");

        let by_email = User::search(&db, "grace@").await.unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].display_name, "Grace Hopper");
    }

    #[tokio::test]
    async fn profile_updates_leave_untouched_fields_alone() {
        let db = setup_db().await;
        let id = Uuid::new_v4();
        User::ensure(
            &db,
            &CreateUser {
                id,
                display_name: "Ada".to_string(),
                email: Some("ada@example.com".to_string()),
                photo: None,
            },
        )
        .await
        .unwrap();

        let updated = User::update_profile(
            &db,
            id,
            &UpdateUserProfile {
                display_name: Some("Ada L.".to_string()),
                email: None,
                photo: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.display_name, "Ada L.");
        assert_eq!(updated.email.as_deref(), Some("ada@example.com"));

        let err = User::update_profile(
            &db,
            Uuid::new_v4(),
            &UpdateUserProfile {
                display_name: Some("Ghost".to_string()),
                email: None,
                photo: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UserError::UserNotFound));
    }
}
