pub mod admission;
pub mod brute_force;
pub mod geoip;
pub mod rules;
