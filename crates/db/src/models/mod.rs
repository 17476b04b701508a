#![allow(clippy::useless_conversion)]

pub mod comment;
pub mod guard;
pub mod ids;
pub mod label;
pub mod ordering;
pub mod project;
pub mod section;
pub mod task;
pub mod user;
