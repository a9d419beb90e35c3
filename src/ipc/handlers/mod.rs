pub mod admins;
pub mod auth;
pub mod batches;
pub mod branches;
pub mod certificates;
pub mod core;
pub mod faculty;
pub mod marks;
pub mod semesters;
pub mod students;
pub mod subjects;
