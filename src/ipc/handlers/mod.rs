pub mod classes;
pub mod core;
pub mod exercises;
pub mod grades;
pub mod students;
pub mod subjects;
pub mod suggestions;
