pub mod hours;
pub mod orders;
pub mod tables;
pub mod users;
