pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/events", get(get_events))
        .route("/admin/incidents", get(list_incidents).post(create_incident))
        .route("/admin/incidents/{id}", get(get_incident))
        .route("/admin/incidents/{id}/respond", post(respond_to_incident))
        .route("/admin/incidents/{id}/resolve", post(resolve_incident))
        .route("/admin/blocks", post(create_block))
        .route("/admin/blocks/{identity}", get(get_block).delete(delete_block))
        .route("/admin/devices/{identity}", get(get_device))
        .route("/admin/devices/{identity}/reset", post(reset_device))
        .route("/admin/devices/{identity}/block", delete(unblock_device))
        .route("/admin/limits/{identity}", get(get_limit))
        .route("/admin/limits/{identity}/reset", post(reset_limit))
        .route("/admin/sessions", post(create_session))
        .route("/admin/sessions/{id}", get(get_session).delete(invalidate_session))
        .route("/admin/sessions/{id}/touch", post(touch_session))
        .route(
            "/admin/users/{user_id}/sessions",
            get(list_user_sessions).delete(invalidate_user_sessions),
        )
        .route("/admin/tokens/revoke", post(revoke_token))
        .route("/admin/tokens/validate", post(validate_token))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}
