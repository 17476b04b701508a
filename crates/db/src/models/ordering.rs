//! Dense ordering over scoped sibling sets (a user's project memberships, a
//! project's sections, a task scope, a user's labels). Inserts shift the
//! colliding side of the scope by one so sibling orders stay consecutive;
//! swaps exchange exactly two rows.

use sea_orm::sea_query::{Condition, Expr, ExprTrait};
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QuerySelect};
use thiserror::Error;

use crate::entities::{label, project_member, section, task};

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("Anchor not found in ordering scope")]
    AnchorNotFound,
    #[error("Sibling not found in ordering scope")]
    SiblingNotFound,
}

/// A set of sibling rows whose order column must stay dense.
pub trait OrderScope {
    type Entity: EntityTrait;

    /// Filter selecting exactly the siblings of this scope.
    fn condition(&self) -> Condition;

    fn order_column() -> <Self::Entity as EntityTrait>::Column;

    /// Column holding the i64 key a row is addressed by within the scope
    /// (the row id, or the project row id for membership scopes).
    fn key_column() -> <Self::Entity as EntityTrait>::Column;
}

/// Where a new row lands relative to its siblings.
#[derive(Debug, Clone, Copy)]
pub enum Insert {
    Append,
    Above(i64),
    Below(i64),
}

pub async fn resolve<C, S>(db: &C, scope: &S, position: Insert) -> Result<i32, OrderError>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    match position {
        Insert::Append => append(db, scope).await,
        Insert::Above(anchor) => insert_above(db, scope, anchor).await,
        Insert::Below(anchor) => insert_below(db, scope, anchor).await,
    }
}

/// `max(order) + 1`, or `1` for an empty scope.
pub async fn append<C, S>(db: &C, scope: &S) -> Result<i32, OrderError>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    let max: Option<Option<i32>> = <S::Entity as EntityTrait>::find()
        .select_only()
        .column_as(S::order_column().max(), "max_order")
        .filter(scope.condition())
        .into_tuple()
        .one(db)
        .await?;
    Ok(max.flatten().map_or(1, |m| m + 1))
}

/// Makes room immediately before the anchor: every sibling ordered below the
/// anchor moves down by one and the freed slot (`anchor - 1`) is returned for
/// the new row.
pub async fn insert_above<C, S>(db: &C, scope: &S, anchor: i64) -> Result<i32, OrderError>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    let anchor_order = order_of::<C, S>(db, scope, anchor)
        .await?
        .ok_or(OrderError::AnchorNotFound)?;

    <S::Entity as EntityTrait>::update_many()
        .filter(scope.condition())
        .filter(S::order_column().lt(anchor_order))
        .col_expr(S::order_column(), Expr::col(S::order_column()).sub(1))
        .exec(db)
        .await?;

    Ok(anchor_order - 1)
}

/// Symmetric to [`insert_above`]: siblings ordered past the anchor move up by
/// one and the new row takes `anchor + 1`.
pub async fn insert_below<C, S>(db: &C, scope: &S, anchor: i64) -> Result<i32, OrderError>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    let anchor_order = order_of::<C, S>(db, scope, anchor)
        .await?
        .ok_or(OrderError::AnchorNotFound)?;

    <S::Entity as EntityTrait>::update_many()
        .filter(scope.condition())
        .filter(S::order_column().gt(anchor_order))
        .col_expr(S::order_column(), Expr::col(S::order_column()).add(1))
        .exec(db)
        .await?;

    Ok(anchor_order + 1)
}

/// Exchanges the order values of two siblings; no other row is touched.
/// A missing sibling is a hard error and leaves both rows as they were.
pub async fn swap<C, S>(db: &C, scope: &S, key_a: i64, key_b: i64) -> Result<(i32, i32), OrderError>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    let order_a = order_of::<C, S>(db, scope, key_a)
        .await?
        .ok_or(OrderError::SiblingNotFound)?;
    let order_b = order_of::<C, S>(db, scope, key_b)
        .await?
        .ok_or(OrderError::SiblingNotFound)?;

    set_order::<C, S>(db, scope, key_a, order_b).await?;
    set_order::<C, S>(db, scope, key_b, order_a).await?;

    Ok((order_b, order_a))
}

async fn order_of<C, S>(db: &C, scope: &S, key: i64) -> Result<Option<i32>, DbErr>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    <S::Entity as EntityTrait>::find()
        .select_only()
        .column(S::order_column())
        .filter(scope.condition())
        .filter(S::key_column().eq(key))
        .into_tuple()
        .one(db)
        .await
}

async fn set_order<C, S>(db: &C, scope: &S, key: i64, value: i32) -> Result<(), DbErr>
where
    C: ConnectionTrait,
    S: OrderScope,
{
    <S::Entity as EntityTrait>::update_many()
        .filter(scope.condition())
        .filter(S::key_column().eq(key))
        .col_expr(S::order_column(), Expr::value(value))
        .exec(db)
        .await?;
    Ok(())
}

/// One user's project memberships, keyed by project row id.
pub struct MemberScope {
    pub user_id: i64,
}

impl OrderScope for MemberScope {
    type Entity = project_member::Entity;

    fn condition(&self) -> Condition {
        Condition::all().add(project_member::Column::UserId.eq(self.user_id))
    }

    fn order_column() -> project_member::Column {
        project_member::Column::SortOrder
    }

    fn key_column() -> project_member::Column {
        project_member::Column::ProjectId
    }
}

/// One project's sections.
pub struct SectionScope {
    pub project_id: i64,
}

impl OrderScope for SectionScope {
    type Entity = section::Entity;

    fn condition(&self) -> Condition {
        Condition::all().add(section::Column::ProjectId.eq(self.project_id))
    }

    fn order_column() -> section::Column {
        section::Column::SortOrder
    }

    fn key_column() -> section::Column {
        section::Column::Id
    }
}

/// Tasks of one section, or the whole project for unsectioned tasks.
pub struct TaskScope {
    pub project_id: i64,
    pub section_id: Option<i64>,
}

impl OrderScope for TaskScope {
    type Entity = task::Entity;

    fn condition(&self) -> Condition {
        let cond = Condition::all().add(task::Column::ProjectId.eq(self.project_id));
        match self.section_id {
            // Root tasks and each section count as separate sibling lists.
            Some(section_id) => cond.add(task::Column::SectionId.eq(section_id)),
            None => cond.add(task::Column::SectionId.is_null()),
        }
    }

    fn order_column() -> task::Column {
        task::Column::SortOrder
    }

    fn key_column() -> task::Column {
        task::Column::Id
    }
}

/// One user's labels.
pub struct LabelScope {
    pub user_id: i64,
}

impl OrderScope for LabelScope {
    type Entity = label::Entity;

    fn condition(&self) -> Condition {
        Condition::all().add(label::Column::UserId.eq(self.user_id))
    }

    fn order_column() -> label::Column {
        label::Column::SortOrder
    }

    fn key_column() -> label::Column {
        label::Column::Id
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
    use sea_orm_migration::MigratorTrait;
    use uuid::Uuid;

    use crate::entities::user;

    use super::*;

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn mk_user(db: &DatabaseConnection) -> i64 {
        let now = Utc::now();
        let model = user::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            display_name: Set("Ada".to_string()),
            email: Set(None),
            photo: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
        model.id
    }

    async fn mk_label(db: &DatabaseConnection, user_id: i64, sort_order: i32) -> i64 {
        let now = Utc::now();
        let model = label::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            title: Set(format!("label-{sort_order}")),
            sort_order: Set(sort_order),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
        model.id
    }

    async fn orders(db: &DatabaseConnection, user_id: i64) -> Vec<(i64, i32)> {
        let mut rows: Vec<(i64, i32)> = label::Entity::find()
            .filter(label::Column::UserId.eq(user_id))
            .all(db)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.sort_order))
            .collect();
        rows.sort_by_key(|(_, order)| *order);
        rows
    }

    #[tokio::test]
    async fn append_counts_up_from_one() {
        let db = setup_db().await;
        let user_id = mk_user(&db).await;
        let scope = LabelScope { user_id };

        for expected in 1..=3 {
            let order = append(&db, &scope).await.unwrap();
            assert_eq!(order, expected);
            mk_label(&db, user_id, order).await;
        }

        let orders: Vec<i32> = orders(&db, user_id).await.into_iter().map(|(_, o)| o).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn insert_above_shifts_lower_siblings_down() {
        let db = setup_db().await;
        let user_id = mk_user(&db).await;
        let scope = LabelScope { user_id };

        let a = mk_label(&db, user_id, 1).await;
        let b = mk_label(&db, user_id, 2).await;
        let c = mk_label(&db, user_id, 3).await;

        let new_order = insert_above(&db, &scope, b).await.unwrap();
        assert_eq!(new_order, 1);
        let d = mk_label(&db, user_id, new_order).await;

        // A dropped below the freed slot; B and C are untouched.
        let rows = orders(&db, user_id).await;
        assert_eq!(rows, vec![(a, 0), (d, 1), (b, 2), (c, 3)]);
    }

    #[tokio::test]
    async fn insert_below_shifts_higher_siblings_up() {
        let db = setup_db().await;
        let user_id = mk_user(&db).await;
        let scope = LabelScope { user_id };

        let a = mk_label(&db, user_id, 1).await;
        let b = mk_label(&db, user_id, 2).await;
        let c = mk_label(&db, user_id, 3).await;

        let new_order = insert_below(&db, &scope, a).await.unwrap();
        assert_eq!(new_order, 2);
        let d = mk_label(&db, user_id, new_order).await;

        let rows = orders(&db, user_id).await;
        assert_eq!(rows, vec![(a, 1), (d, 2), (b, 3), (c, 4)]);
    }

    #[tokio::test]
    async fn insert_with_missing_anchor_shifts_nothing() {
        let db = setup_db().await;
        let user_id = mk_user(&db).await;
        let scope = LabelScope { user_id };

        let a = mk_label(&db, user_id, 1).await;

        let err = insert_above(&db, &scope, a + 42).await.unwrap_err();
        assert!(matches!(err, OrderError::AnchorNotFound));
        assert_eq!(orders(&db, user_id).await, vec![(a, 1)]);
    }

    #[tokio::test]
    async fn swap_exchanges_exactly_two_rows() {
        let db = setup_db().await;
        let user_id = mk_user(&db).await;
        let scope = LabelScope { user_id };

        let a = mk_label(&db, user_id, 1).await;
        let b = mk_label(&db, user_id, 2).await;
        let c = mk_label(&db, user_id, 3).await;

        let (order_a, order_c) = swap(&db, &scope, a, c).await.unwrap();
        assert_eq!((order_a, order_c), (3, 1));
        assert_eq!(orders(&db, user_id).await, vec![(c, 1), (b, 2), (a, 3)]);

        // Swapping back restores the original arrangement.
        swap(&db, &scope, a, c).await.unwrap();
        assert_eq!(orders(&db, user_id).await, vec![(a, 1), (b, 2), (c, 3)]);
    }

    #[tokio::test]
    async fn swap_with_missing_sibling_leaves_rows_untouched() {
        let db = setup_db().await;
        let user_id = mk_user(&db).await;
        let scope = LabelScope { user_id };

        let a = mk_label(&db, user_id, 1).await;
        let b = mk_label(&db, user_id, 2).await;

        let err = swap(&db, &scope, a, b + 42).await.unwrap_err();
        assert!(matches!(err, OrderError::SiblingNotFound));
        assert_eq!(orders(&db, user_id).await, vec![(a, 1), (b, 2)]);
    }

    #[tokio::test]
    async fn scopes_do_not_leak_into_each_other() {
        let db = setup_db().await;
        let user_a = mk_user(&db).await;
        let user_b = mk_user(&db).await;

        mk_label(&db, user_a, 1).await;
        mk_label(&db, user_a, 2).await;
        let other = mk_label(&db, user_b, 1).await;

        let scope_a = LabelScope { user_id: user_a };
        assert_eq!(append(&db, &scope_a).await.unwrap(), 3);

        // Sibling lookups are scoped; user B's label is invisible here.
        let err = insert_above(&db, &scope_a, other).await.unwrap_err();
        assert!(matches!(err, OrderError::AnchorNotFound));
    }
}
