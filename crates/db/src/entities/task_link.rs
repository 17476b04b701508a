use sea_orm::entity::prelude::*;

/// Parent/child edge between tasks. `child_task_id` is unique, so the
/// relation always forms a forest.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "task_links")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub parent_task_id: i64,
    pub child_task_id: i64,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
