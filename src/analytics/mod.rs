pub mod alerting;
pub mod retention;
