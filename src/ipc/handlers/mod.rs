pub mod core;
pub mod courses;
pub mod parents;
pub mod planner;
pub mod posts;
pub mod students;
pub mod teachers;
