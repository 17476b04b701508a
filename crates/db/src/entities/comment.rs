use sea_orm::entity::prelude::*;

/// Exactly one of `project_id` / `task_id` is set per row; the model layer
/// exposes the pair as a `CommentTarget` variant.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "comments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uuid: Uuid,
    pub author_id: i64,
    pub body: String,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
