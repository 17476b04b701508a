use sea_orm::entity::prelude::*;

use crate::types::TaskPriority;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uuid: Uuid,
    pub project_id: i64,
    pub section_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<DateTimeUtc>,
    pub priority: Option<TaskPriority>,
    pub assignee_id: Option<i64>,
    pub completed: bool,
    pub sort_order: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
