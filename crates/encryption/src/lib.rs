pub mod logic;
pub mod repository;
