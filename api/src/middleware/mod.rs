pub mod cors;
pub mod trace_log;
