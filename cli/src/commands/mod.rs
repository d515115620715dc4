pub mod admin;
pub mod blocks;
pub mod decisions;
pub mod health;
pub mod insights;
pub mod thresholds;
