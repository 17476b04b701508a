pub mod comment;
pub mod label;
pub mod project;
pub mod project_member;
pub mod section;
pub mod task;
pub mod task_label;
pub mod task_link;
pub mod user;
