pub mod forward;
pub mod location;
pub mod notify;
pub mod protocol;
pub mod record;
pub mod rule;
pub mod status;
