pub mod analyze;
pub mod datasets;
pub mod health;
pub mod kpis;
pub mod panel;
pub mod schema;
