pub mod backpressure;
pub mod bandwidth;
pub mod counters;
