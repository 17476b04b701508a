use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProjectView {
    #[default]
    #[sea_orm(string_value = "list")]
    List,
    #[sea_orm(string_value = "dashboard")]
    Dashboard,
}

/// Four priority levels, stored as 0-3.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    #[sea_orm(num_value = 0)]
    P1,
    #[sea_orm(num_value = 1)]
    P2,
    #[sea_orm(num_value = 2)]
    P3,
    #[sea_orm(num_value = 3)]
    P4,
}
