use tripwire_core::identity::Category;
use tripwire_core::thresholds::Period;

pub const VIOLATIONS_PREFIX: &str = "ratelimit:violations:";
pub const BLOCKED_PREFIX: &str = "ratelimit:blocked:";

pub fn violations(category: Category) -> String {
    format!("{VIOLATIONS_PREFIX}{category}")
}

pub fn violation_counter(period: Period, category: Category, identity: &str) -> String {
    format!("ratelimit:counter:{period}:{category}:{identity}")
}

pub fn request_counter(category: Category, identity: &str) -> String {
    format!("ratelimit:requests:hourly:{category}:{identity}")
}

/// Set on the first adaptive-limit denial of the hour; later denials stay quiet.
pub fn rate_alert(category: Category, identity: &str) -> String {
    format!("ratelimit:alerted:hourly:{category}:{identity}")
}

pub fn blocked(identity: &str) -> String {
    format!("{BLOCKED_PREFIX}{identity}")
}

pub fn geo_block(remote_address: &str) -> String {
    format!("geo:block:{remote_address}")
}

pub fn pattern(identity: &str, category: Category) -> String {
    format!("pattern:{identity}:{category}")
}
