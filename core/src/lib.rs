pub mod alerts;
pub mod auth;
pub mod decision;
pub mod error;
pub mod identity;
pub mod thresholds;
pub mod violations;
