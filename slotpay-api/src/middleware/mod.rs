pub mod cron_auth;
pub mod rate_limit;

pub use cron_auth::require_cron_secret;
pub use rate_limit::rate_limit;
