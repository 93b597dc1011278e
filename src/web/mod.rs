// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Backend API for Drive Organizer
//!
//! JSON endpoints for health, user identity and tag store retrieval. Every
//! tag store route requires a bearer token; tokens are checked by a
//! [`TokenVerifier`].

use async_trait::async_trait;
use axum::{
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::tagstore::{CategoryCount, ImageRecord, TagCount, TagStore, TagStoreStats};
use crate::OrganizerError;

/// Shared application state
pub struct AppState {
    pub tag_store: TagStore,
    pub config: AppConfig,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub fn new(config: AppConfig, tag_store: TagStore) -> Self {
        Self {
            tag_store,
            config,
            verifier: Arc::new(DevelopmentVerifier),
        }
    }
}

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub picture: String,
}

/// Resolves bearer tokens to users
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> crate::Result<User>;
}

/// Accepts any token as a fixed local user
pub struct DevelopmentVerifier;

#[async_trait]
impl TokenVerifier for DevelopmentVerifier {
    async fn verify(&self, _token: &str) -> crate::Result<User> {
        Ok(User {
            id: "mock-user-id".to_string(),
            email: "user@example.com".to_string(),
            name: "Test User".to_string(),
            picture: String::new(),
        })
    }
}

/// Error rendered as `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl From<OrganizerError> for ApiError {
    fn from(err: OrganizerError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match err {
            OrganizerError::Authentication(msg) | OrganizerError::NotFound(msg) | OrganizerError::Validation(msg) => msg,
            other => other.to_string(),
        };
        Self::new(status, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.detail }));
        if self.status == StatusCode::UNAUTHORIZED {
            let challenge = [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))];
            (self.status, challenge, body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// JSON body whose rejections use the `{"detail"}` envelope
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> ApiResult<Self> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        Ok(ApiJson(value))
    }
}

/// Query string whose rejections use the `{"detail"}` envelope
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> ApiResult<Self> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        Ok(ApiQuery(value))
    }
}

/// Extractor for the bearer-authenticated user
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> ApiResult<Self> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))?;

        Ok(CurrentUser(state.verifier.verify(token).await?))
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let prefix = state.config.web.api_prefix.trim_end_matches('/').to_string();
    let api = |path: &str| format!("{}{}", prefix, path);

    Router::new()
        .route("/", get(health))
        .route(&prefix, get(api_root))
        .route(&api("/auth/token"), post(login))
        .route(&api("/auth/refresh-token"), post(refresh_token))
        .route(&api("/auth/me"), get(me))
        .route(&api("/images"), post(store_image))
        .route(&api("/images/:id"), get(get_image))
        .route(&api("/images/:id/tags/:tag"), delete(remove_tag))
        .route(&api("/tags"), get(list_tags))
        .route(&api("/tags/:tag/images"), get(tag_images))
        .route(&api("/categories"), get(list_categories))
        .route(&api("/categories/:name/images"), get(category_images))
        .route(&api("/stats"), get(stats))
        .route(&api("/search"), get(search))
        .layer(cors_layer(&state.config.web.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    // Browsers refuse credentials with a wildcard origin
    if origins.iter().any(|o| o.trim() == "*") {
        warn!("CORS allows any origin; credentialed requests are disabled");
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins)).allow_credentials(true)
}

// === Service ===

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "message": "Drive Organizer API is running"
    }))
}

async fn api_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Drive Organizer API",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": format!("{}/docs", state.config.web.api_prefix.trim_end_matches('/')),
    }))
}

// === Auth ===

async fn login() -> ApiError {
    ApiError::new(
        StatusCode::BAD_REQUEST,
        "Direct password authentication not supported. Sign in with Google on the client.",
    )
}

async fn refresh_token() -> ApiError {
    ApiError::new(
        StatusCode::BAD_REQUEST,
        "Token refresh should be handled by the client sign-in SDK.",
    )
}

async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

// === Tag store ===

async fn get_image(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ImageRecord>> {
    state
        .tag_store
        .get_image_metadata(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Image {} not found", id)))
}

async fn store_image(
    CurrentUser(user): CurrentUser,
    State(state): State<Arc<AppState>>,
    ApiJson(mut record): ApiJson<ImageRecord>,
) -> ApiResult<(StatusCode, Json<ImageRecord>)> {
    if record.user_id.is_none() {
        record.user_id = Some(user.id);
    }
    state.tag_store.store_image_metadata(&record)?;
    info!("Stored image {} ({} tags)", record.id, record.tags.len());

    let stored = state
        .tag_store
        .get_image_metadata(&record.id)?
        .ok_or_else(|| ApiError::not_found(format!("Image {} not found", record.id)))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn remove_tag(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state.tag_store.get_image_metadata(&id)?.is_none() {
        return Err(ApiError::not_found(format!("Image {} not found", id)));
    }
    if !state.tag_store.remove_tag(&id, &tag)? {
        return Err(ApiError::not_found(format!("Tag '{}' not found on image {}", tag, id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tags(_user: CurrentUser, State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<TagCount>>> {
    Ok(Json(state.tag_store.all_tags()?))
}

async fn tag_images(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(tag): Path<String>,
) -> ApiResult<Json<Vec<ImageRecord>>> {
    let ids = state.tag_store.images_with_tag(&tag)?;
    Ok(Json(state.tag_store.get_many(&ids)?))
}

async fn list_categories(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<CategoryCount>>> {
    Ok(Json(state.tag_store.categories()?))
}

async fn category_images(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ImageRecord>>> {
    let ids = state.tag_store.images_in_category(&name)?;
    Ok(Json(state.tag_store.get_many(&ids)?))
}

async fn stats(_user: CurrentUser, State(state): State<Arc<AppState>>) -> ApiResult<Json<TagStoreStats>> {
    Ok(Json(state.tag_store.stats()?))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<usize>,
}

async fn search(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> ApiResult<Json<Vec<ImageRecord>>> {
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(state.tag_store.search(&query.q, limit)?))
}

/// Start the API server
pub async fn start_server(config: AppConfig, tag_store: TagStore) -> crate::Result<()> {
    let addr = format!("{}:{}", config.web.host, config.web.port);
    let state = Arc::new(AppState::new(config, tag_store));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API available at http://{}", addr);

    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| OrganizerError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::new(AppConfig::default(), TagStore::in_memory().unwrap());
        create_router(Arc::new(state))
    }

    async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Response) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_root() {
        let app = app();
        let (status, response) = send(&app, Method::GET, "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"status": "healthy", "message": "Drive Organizer API is running"})
        );

        let (status, response) = send(&app, Method::GET, "/api", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["name"], "Drive Organizer API");
        assert_eq!(body["docs"], "/api/docs");
    }

    #[tokio::test]
    async fn test_me_requires_bearer_token() {
        let app = app();
        let (status, response) = send(&app, Method::GET, "/api/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(json_body(response).await["detail"], "Not authenticated");

        let (status, response) = send(&app, Method::GET, "/api/auth/me", Some("abc"), None).await;
        assert_eq!(status, StatusCode::OK);
        let user = json_body(response).await;
        assert_eq!(user["id"], "mock-user-id");
        assert_eq!(user["email"], "user@example.com");
        assert_eq!(user["picture"], "");
    }

    #[tokio::test]
    async fn test_password_login_is_rejected() {
        let app = app();
        let (status, response) = send(&app, Method::POST, "/api/auth/token", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["detail"].as_str().unwrap().contains("not supported"));

        let (status, _) = send(&app, Method::POST, "/api/auth/refresh-token", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_tag_routes_require_auth() {
        let app = app();
        for uri in ["/api/tags", "/api/stats", "/api/categories", "/api/search?q=x", "/api/images/a"] {
            let (status, _) = send(&app, Method::GET, uri, None, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_store_and_retrieve_image() {
        let app = app();
        let record = json!({
            "id": "img-1",
            "name": "beach.jpg",
            "category": "Landscapes",
            "tags": ["Beach", "sea"],
            "metadata": {"width": 640}
        });

        let (status, response) = send(&app, Method::POST, "/api/images", Some("t"), Some(record)).await;
        assert_eq!(status, StatusCode::CREATED);
        let stored = json_body(response).await;
        assert_eq!(stored["user_id"], "mock-user-id");
        assert_eq!(stored["tags"], json!(["beach", "sea"]));

        let (status, response) = send(&app, Method::GET, "/api/images/img-1", Some("t"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await["category"], "Landscapes");

        let (_, response) = send(&app, Method::GET, "/api/tags/beach/images", Some("t"), None).await;
        assert_eq!(json_body(response).await[0]["id"], "img-1");

        let (_, response) = send(&app, Method::GET, "/api/categories/Landscapes/images", Some("t"), None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let (_, response) = send(&app, Method::GET, "/api/tags", Some("t"), None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

        let (_, response) = send(&app, Method::GET, "/api/categories", Some("t"), None).await;
        assert_eq!(json_body(response).await, json!([{"category": "Landscapes", "count": 1}]));

        let (_, response) = send(&app, Method::GET, "/api/stats", Some("t"), None).await;
        assert_eq!(json_body(response).await["image_count"], 1);

        let (_, response) = send(&app, Method::GET, "/api/search?q=sea&limit=5", Some("t"), None).await;
        assert_eq!(json_body(response).await[0]["name"], "beach.jpg");
    }

    #[tokio::test]
    async fn test_remove_tag() {
        let app = app();
        let record = json!({"id": "img-2", "name": "dog.jpg", "category": "Animals", "tags": ["dog"]});
        send(&app, Method::POST, "/api/images", Some("t"), Some(record)).await;

        let (status, _) = send(&app, Method::DELETE, "/api/images/img-2/tags/dog", Some("t"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, response) = send(&app, Method::DELETE, "/api/images/img-2/tags/dog", Some("t"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json_body(response).await["detail"].as_str().unwrap().contains("dog"));

        let (status, _) = send(&app, Method::DELETE, "/api/images/nope/tags/dog", Some("t"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_input_uses_detail_envelope() {
        let app = app();
        let (status, response) = send(&app, Method::GET, "/api/search", Some("abc"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["detail"].as_str().unwrap().contains("missing field `q`"));

        let (status, response) = send(&app, Method::POST, "/api/images", Some("abc"), Some(json!({"id": "x"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json_body(response).await["detail"].as_str().unwrap().contains("missing field"));
    }

    #[tokio::test]
    async fn test_wildcard_cors_origin() {
        let mut config = AppConfig::default();
        config.web.cors_origins = vec!["*".to_string()];
        let app = create_router(Arc::new(AppState::new(config, TagStore::in_memory().unwrap())));

        let request = Request::builder()
            .uri("/")
            .header(header::ORIGIN, "http://elsewhere.test")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[tokio::test]
    async fn test_missing_image_is_404() {
        let app = app();
        let (status, response) = send(&app, Method::GET, "/api/images/missing", Some("t"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["detail"], "Image missing not found");
    }

    #[test]
    fn test_error_mapping() {
        let err = ApiError::from(OrganizerError::Validation("bad tag".into()));
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.detail, "bad tag");
        let err = ApiError::from(OrganizerError::GoogleApi("down".into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }
}
