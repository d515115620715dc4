use std::num::NonZeroU32;

use axum::Router;
use tripwire_core::identity::Category;

use crate::auth::InjectAdminLayer;
use crate::middleware::abuse_guard::AbuseGuardLayer;
use crate::middleware::rate_limit::{StrictRouteLimitLayer, admin_layer};
use crate::state::AppState;

pub mod admin;
pub mod check;
pub mod health;

/// Admin mutations allowed per identity per minute before violations are recorded.
const ADMIN_WRITES_PER_MINUTE: u32 = 30;

/// All API routes with their per-group middleware. Admin routes are guarded
/// by the abuse engine themselves (category `admin`); the per-IP governor
/// layer only applies where a real client address is available.
pub fn router(state: &AppState, per_ip_limit: bool) -> Router<AppState> {
    let guard = AbuseGuardLayer::new(state.engine.clone(), state.trust_forwarded_for)
        .with_category(Category::Admin);
    let strict = StrictRouteLimitLayer::per_minute(
        state.engine.clone(),
        Category::Admin,
        NonZeroU32::new(ADMIN_WRITES_PER_MINUTE).unwrap_or(NonZeroU32::MIN),
        state.trust_forwarded_for,
    );

    let mut admin = Router::new()
        .merge(admin::read_router())
        .merge(admin::write_router().layer(strict))
        .layer(guard);
    if per_ip_limit {
        admin = admin.layer(admin_layer());
    }

    Router::new()
        .merge(health::router())
        .merge(check::router())
        .merge(admin)
        .layer(InjectAdminLayer::new(state.admin_key_hashes.clone()))
}
