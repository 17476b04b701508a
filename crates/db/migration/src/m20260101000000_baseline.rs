use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Users::Table)
                    .col(pk_id_col(manager, Users::Id))
                    .col(uuid_col(Users::Uuid))
                    .col(ColumnDef::new(Users::DisplayName).string().not_null())
                    .col(ColumnDef::new(Users::Email).string())
                    .col(ColumnDef::new(Users::Photo).string())
                    .col(timestamp_col(Users::CreatedAt))
                    .col(timestamp_col(Users::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_users_uuid")
                    .table(Users::Table)
                    .col(Users::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Projects::Table)
                    .col(pk_id_col(manager, Projects::Id))
                    .col(uuid_col(Projects::Uuid))
                    .col(ColumnDef::new(Projects::Name).string().not_null())
                    .col(
                        ColumnDef::new(Projects::View)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("list")),
                    )
                    .col(
                        ColumnDef::new(Projects::Archived)
                            .boolean()
                            .not_null()
                            .default(Expr::val(false)),
                    )
                    .col(
                        ColumnDef::new(Projects::DefaultInbox)
                            .boolean()
                            .not_null()
                            .default(Expr::val(false)),
                    )
                    .col(timestamp_col(Projects::CreatedAt))
                    .col(timestamp_col(Projects::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_projects_uuid")
                    .table(Projects::Table)
                    .col(Projects::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_projects_name")
                    .table(Projects::Table)
                    .col(Projects::Name)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(ProjectMembers::Table)
                    .col(pk_id_col(manager, ProjectMembers::Id))
                    .col(fk_id_col(manager, ProjectMembers::ProjectId))
                    .col(fk_id_col(manager, ProjectMembers::UserId))
                    .col(
                        ColumnDef::new(ProjectMembers::Owner)
                            .boolean()
                            .not_null()
                            .default(Expr::val(false)),
                    )
                    .col(
                        ColumnDef::new(ProjectMembers::SortOrder)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProjectMembers::Favorite)
                            .boolean()
                            .not_null()
                            .default(Expr::val(false)),
                    )
                    .col(timestamp_col(ProjectMembers::CreatedAt))
                    .col(timestamp_col(ProjectMembers::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_project_members_project_id")
                            .from(ProjectMembers::Table, ProjectMembers::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_project_members_user_id")
                            .from(ProjectMembers::Table, ProjectMembers::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_project_members_project_user")
                    .table(ProjectMembers::Table)
                    .col(ProjectMembers::ProjectId)
                    .col(ProjectMembers::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_project_members_user_id")
                    .table(ProjectMembers::Table)
                    .col(ProjectMembers::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Sections::Table)
                    .col(pk_id_col(manager, Sections::Id))
                    .col(uuid_col(Sections::Uuid))
                    .col(fk_id_col(manager, Sections::ProjectId))
                    .col(ColumnDef::new(Sections::Name).string().not_null())
                    .col(ColumnDef::new(Sections::SortOrder).integer().not_null())
                    .col(
                        ColumnDef::new(Sections::Open)
                            .boolean()
                            .not_null()
                            .default(Expr::val(true)),
                    )
                    .col(timestamp_col(Sections::CreatedAt))
                    .col(timestamp_col(Sections::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sections_project_id")
                            .from(Sections::Table, Sections::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_sections_uuid")
                    .table(Sections::Table)
                    .col(Sections::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_sections_project_id")
                    .table(Sections::Table)
                    .col(Sections::ProjectId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Tasks::Table)
                    .col(pk_id_col(manager, Tasks::Id))
                    .col(uuid_col(Tasks::Uuid))
                    .col(fk_id_col(manager, Tasks::ProjectId))
                    .col(fk_id_nullable_col(manager, Tasks::SectionId))
                    .col(ColumnDef::new(Tasks::Title).string().not_null())
                    .col(ColumnDef::new(Tasks::Description).text())
                    .col(ColumnDef::new(Tasks::DueDate).timestamp())
                    .col(ColumnDef::new(Tasks::Priority).integer())
                    .col(fk_id_nullable_col(manager, Tasks::AssigneeId))
                    .col(
                        ColumnDef::new(Tasks::Completed)
                            .boolean()
                            .not_null()
                            .default(Expr::val(false)),
                    )
                    .col(ColumnDef::new(Tasks::SortOrder).integer().not_null())
                    .col(timestamp_col(Tasks::CreatedAt))
                    .col(timestamp_col(Tasks::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tasks_project_id")
                            .from(Tasks::Table, Tasks::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tasks_section_id")
                            .from(Tasks::Table, Tasks::SectionId)
                            .to(Sections::Table, Sections::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tasks_assignee_id")
                            .from(Tasks::Table, Tasks::AssigneeId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_tasks_uuid")
                    .table(Tasks::Table)
                    .col(Tasks::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_tasks_project_id")
                    .table(Tasks::Table)
                    .col(Tasks::ProjectId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_tasks_section_id")
                    .table(Tasks::Table)
                    .col(Tasks::SectionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_tasks_due_date")
                    .table(Tasks::Table)
                    .col(Tasks::DueDate)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(TaskLinks::Table)
                    .col(pk_id_col(manager, TaskLinks::Id))
                    .col(fk_id_col(manager, TaskLinks::ParentTaskId))
                    .col(fk_id_col(manager, TaskLinks::ChildTaskId))
                    .col(timestamp_col(TaskLinks::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_task_links_parent_task_id")
                            .from(TaskLinks::Table, TaskLinks::ParentTaskId)
                            .to(Tasks::Table, Tasks::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_task_links_child_task_id")
                            .from(TaskLinks::Table, TaskLinks::ChildTaskId)
                            .to(Tasks::Table, Tasks::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // A task has at most one parent; the edge table stays a forest.
        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_task_links_child_task_id")
                    .table(TaskLinks::Table)
                    .col(TaskLinks::ChildTaskId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_task_links_parent_task_id")
                    .table(TaskLinks::Table)
                    .col(TaskLinks::ParentTaskId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Labels::Table)
                    .col(pk_id_col(manager, Labels::Id))
                    .col(uuid_col(Labels::Uuid))
                    .col(fk_id_col(manager, Labels::UserId))
                    .col(ColumnDef::new(Labels::Title).string().not_null())
                    .col(ColumnDef::new(Labels::SortOrder).integer().not_null())
                    .col(timestamp_col(Labels::CreatedAt))
                    .col(timestamp_col(Labels::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_labels_user_id")
                            .from(Labels::Table, Labels::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_labels_uuid")
                    .table(Labels::Table)
                    .col(Labels::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_labels_user_id")
                    .table(Labels::Table)
                    .col(Labels::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(TaskLabels::Table)
                    .col(pk_id_col(manager, TaskLabels::Id))
                    .col(fk_id_col(manager, TaskLabels::TaskId))
                    .col(fk_id_col(manager, TaskLabels::LabelId))
                    .col(timestamp_col(TaskLabels::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_task_labels_task_id")
                            .from(TaskLabels::Table, TaskLabels::TaskId)
                            .to(Tasks::Table, Tasks::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_task_labels_label_id")
                            .from(TaskLabels::Table, TaskLabels::LabelId)
                            .to(Labels::Table, Labels::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_task_labels_task_label")
                    .table(TaskLabels::Table)
                    .col(TaskLabels::TaskId)
                    .col(TaskLabels::LabelId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_task_labels_label_id")
                    .table(TaskLabels::Table)
                    .col(TaskLabels::LabelId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Comments::Table)
                    .col(pk_id_col(manager, Comments::Id))
                    .col(uuid_col(Comments::Uuid))
                    .col(fk_id_col(manager, Comments::AuthorId))
                    .col(ColumnDef::new(Comments::Body).text().not_null())
                    .col(fk_id_nullable_col(manager, Comments::ProjectId))
                    .col(fk_id_nullable_col(manager, Comments::TaskId))
                    .col(timestamp_col(Comments::CreatedAt))
                    .col(timestamp_col(Comments::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_comments_author_id")
                            .from(Comments::Table, Comments::AuthorId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_comments_project_id")
                            .from(Comments::Table, Comments::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_comments_task_id")
                            .from(Comments::Table, Comments::TaskId)
                            .to(Tasks::Table, Tasks::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_comments_uuid")
                    .table(Comments::Table)
                    .col(Comments::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_comments_project_id")
                    .table(Comments::Table)
                    .col(Comments::ProjectId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_comments_task_id")
                    .table(Comments::Table)
                    .col(Comments::TaskId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Comments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TaskLabels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Labels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TaskLinks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tasks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sections::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProjectMembers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Projects::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn fk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().to_owned()
}

fn fk_id_nullable_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.to_owned()
}

fn uuid_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().not_null().to_owned()
}

fn timestamp_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum Users {
    Table,
    Id,
    Uuid,
    DisplayName,
    Email,
    Photo,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Projects {
    Table,
    Id,
    Uuid,
    Name,
    View,
    Archived,
    DefaultInbox,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ProjectMembers {
    Table,
    Id,
    ProjectId,
    UserId,
    Owner,
    SortOrder,
    Favorite,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Sections {
    Table,
    Id,
    Uuid,
    ProjectId,
    Name,
    SortOrder,
    Open,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Tasks {
    Table,
    Id,
    Uuid,
    ProjectId,
    SectionId,
    Title,
    Description,
    DueDate,
    Priority,
    AssigneeId,
    Completed,
    SortOrder,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum TaskLinks {
    Table,
    Id,
    ParentTaskId,
    ChildTaskId,
    CreatedAt,
}

#[derive(Iden)]
enum Labels {
    Table,
    Id,
    Uuid,
    UserId,
    Title,
    SortOrder,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum TaskLabels {
    Table,
    Id,
    TaskId,
    LabelId,
    CreatedAt,
}

#[derive(Iden)]
enum Comments {
    Table,
    Id,
    Uuid,
    AuthorId,
    Body,
    ProjectId,
    TaskId,
    CreatedAt,
    UpdatedAt,
}
