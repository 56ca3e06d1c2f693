pub mod health;
pub mod rollup;
pub mod traces;
pub mod verify;
