//! User accounts: model, store, and the signup/signin/profile endpoints.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::api::{AppState, ErrorBody, MessageResponse};
use crate::config::DatabaseConfig;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// Shared email validity rule: non-empty, at most 200 chars, one `@`
/// with a dotted domain, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 200 && EMAIL_RE.is_match(email)
}

/// A stored user account.
///
/// The password hash is deserialized from the database but never
/// serialized into a response.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pincode: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Optional profile attributes accepted at signup and profile update.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFields {
    pub username: Option<String>,
    pub phone_code: Option<String>,
    pub phone: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub image: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub pincode: Option<String>,
}

/// Everything needed to insert a new account.
#[derive(Debug)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub profile: ProfileFields,
}

/// Account persistence in PostgreSQL.
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    /// Create a new user store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a new account and return the stored row.
    #[instrument(skip(self, user), fields(email = %user.email))]
    pub async fn create(&self, user: NewUser) -> Result<User> {
        let id = Uuid::new_v4().to_string();

        let created = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                id, username, email, password, phone_code, phone,
                state, country, image, address, city, pincode
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, COALESCE($9, ''), $10, $11, $12
            )
            RETURNING id, username, email, password, phone_code, phone,
                      state, country, image, address, city, pincode,
                      active, created_at
            "#,
        )
        .bind(&id)
        .bind(&user.profile.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.profile.phone_code)
        .bind(&user.profile.phone)
        .bind(&user.profile.state)
        .bind(&user.profile.country)
        .bind(&user.profile.image)
        .bind(&user.profile.address)
        .bind(&user.profile.city)
        .bind(&user.profile.pincode)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert user")?;

        metrics::counter!("api.users.created").increment(1);

        Ok(created)
    }

    /// Look up an account by email.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password, phone_code, phone,
                   state, country, image, address, city, pincode,
                   active, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query user by email")?;

        Ok(user)
    }

    /// List every account, newest first.
    pub async fn list(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password, phone_code, phone,
                   state, country, image, address, city, pincode,
                   active, created_at
            FROM users
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        Ok(users)
    }

    /// Update the provided profile fields for the account with this email.
    /// Null binds leave their columns untouched. Returns affected row count.
    #[instrument(skip(self, fields), fields(email = %email))]
    pub async fn update_profile(&self, email: &str, fields: &ProfileFields) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                image      = COALESCE($2, image),
                username   = COALESCE($3, username),
                country    = COALESCE($4, country),
                state      = COALESCE($5, state),
                city       = COALESCE($6, city),
                phone_code = COALESCE($7, phone_code),
                phone      = COALESCE($8, phone),
                address    = COALESCE($9, address),
                pincode    = COALESCE($10, pincode)
            WHERE email = $1
            "#,
        )
        .bind(email)
        .bind(&fields.image)
        .bind(&fields.username)
        .bind(&fields.country)
        .bind(&fields.state)
        .bind(&fields.city)
        .bind(&fields.phone_code)
        .bind(&fields.phone)
        .bind(&fields.address)
        .bind(&fields.pincode)
        .execute(&self.pool)
        .await
        .context("Failed to update profile")?;

        Ok(result.rows_affected())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Hash a password on a blocking thread with the given bcrypt cost.
pub async fn hash_password(password: String, cost: u32) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("password hashing task panicked")?
        .context("Failed to hash password")
}

/// Check a password against a stored bcrypt hash on a blocking thread.
pub async fn verify_password(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .context("password verification task panicked")?
        .context("Failed to verify password")
}

// ---- HTTP endpoints ----

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(flatten)]
    pub profile: ProfileFields,
}

#[derive(Debug, Serialize)]
struct SignupUserInfo {
    token: String,
    email: String,
}

#[derive(Debug, Serialize)]
struct SignupResponse {
    success: bool,
    #[serde(rename = "userInfo")]
    user_info: SignupUserInfo,
}

#[derive(Debug, Serialize)]
struct UserListResponse {
    success: bool,
    count: usize,
    data: Vec<User>,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// Signin payload: the account's own id doubles as the returned token.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInUserInfo {
    token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pincode: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<User> for SignInUserInfo {
    fn from(user: User) -> Self {
        Self {
            token: user.id,
            username: user.username,
            email: user.email,
            phone_code: user.phone_code,
            phone: user.phone,
            state: user.state,
            country: user.country,
            image: user.image,
            address: user.address,
            city: user.city,
            pincode: user.pincode,
            active: user.active,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct SignInResponse {
    success: bool,
    message: String,
    #[serde(rename = "userInfo")]
    user_info: SignInUserInfo,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub email: Option<String>,
    #[serde(flatten)]
    pub fields: ProfileFields,
}

/// Account routes, mounted under the service root.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/user/signup", post(signup).get(list_users))
        .route("/v1/user/signin", post(sign_in))
        .route("/v1/user/update-profile", patch(update_profile))
}

#[instrument(skip(state, request))]
async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), (StatusCode, Json<ErrorBody>)> {
    let (email, password) = match (request.email, request.password) {
        (Some(email), Some(password)) if !email.is_empty() && password.len() >= 6 => {
            (email, password)
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(
                    "Invalid email or password (minimum 6 characters)",
                )),
            ))
        }
    };

    let existing = state.users.find_by_email(&email).await.map_err(|e| {
        error!(error = %e, "Signup lookup failed");
        server_problem(&e)
    })?;
    if existing.is_some() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("Email already exists")),
        ));
    }

    let password_hash = hash_password(password, state.bcrypt_cost).await.map_err(|e| {
        error!(error = %e, "Password hashing failed");
        server_problem(&e)
    })?;

    let user = state
        .users
        .create(NewUser {
            email,
            password_hash,
            profile: request.profile,
        })
        .await
        .map_err(|e| {
            error!(error = %e, "User insert failed");
            server_problem(&e)
        })?;

    info!(user_id = %user.id, "User account created");

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            success: true,
            user_info: SignupUserInfo {
                token: user.id,
                email: user.email,
            },
        }),
    ))
}

async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<UserListResponse>, (StatusCode, Json<ErrorBody>)> {
    let users = state.users.list().await.map_err(|e| {
        error!(error = %e, "User listing failed");
        server_problem(&e)
    })?;

    Ok(Json(UserListResponse {
        success: true,
        count: users.len(),
        data: users,
    }))
}

#[instrument(skip(state, request))]
async fn sign_in(
    State(state): State<AppState>,
    Json(request): Json<SignInRequest>,
) -> Result<Json<SignInResponse>, (StatusCode, Json<ErrorBody>)> {
    let (Some(email), Some(password)) = (request.email, request.password) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("Email and password are required")),
        ));
    };

    let user = state
        .users
        .find_by_email(&email)
        .await
        .map_err(|e| {
            error!(error = %e, "Signin lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("Server technical problem")),
            )
        })?
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("Email not found")),
            )
        })?;

    if !user.active {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorBody::new("Your account is inactive or blocked")),
        ));
    }

    let password_matches = verify_password(password, user.password.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Password verification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("Server technical problem")),
            )
        })?;
    if !password_matches {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("Wrong password")),
        ));
    }

    info!(user_id = %user.id, "User signed in");

    Ok(Json(SignInResponse {
        success: true,
        message: "Sign-in successful".to_string(),
        user_info: user.into(),
    }))
}

#[instrument(skip(state, request))]
async fn update_profile(
    State(state): State<AppState>,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<ErrorBody>)> {
    let Some(email) = request.email else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("Email is required to update profile")),
        ));
    };

    let updated = state
        .users
        .update_profile(&email, &request.fields)
        .await
        .map_err(|e| {
            error!(error = %e, "Profile update failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("Server encountered a technical problem")),
            )
        })?;

    if updated > 0 {
        Ok(Json(MessageResponse::new("Profile updated successfully")))
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("No changes made or update failed")),
        ))
    }
}

/// The signup flow's 500 envelope carries the underlying error text.
fn server_problem(error: &anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::with_detail(
            "Server technical problem",
            error.to_string(),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: "5f8b3c2e-0000-4000-8000-000000000000".to_string(),
            username: Some("nadia".to_string()),
            email: "nadia@example.com".to_string(),
            password: "$2b$10$abcdefghijklmnopqrstuv".to_string(),
            phone_code: Some("+49".to_string()),
            phone: None,
            state: None,
            country: Some("DE".to_string()),
            image: String::new(),
            address: None,
            city: None,
            pincode: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("a.b+c@mail.example.co"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign.example.com"));
        assert!(!is_valid_email("spaces in@example.com"));
        assert!(!is_valid_email("user@nodot"));
        assert!(!is_valid_email("user@@example.com"));
        let oversized = format!("{}@example.com", "x".repeat(200));
        assert!(!is_valid_email(&oversized));
    }

    #[test]
    fn test_user_serialization_hides_password() {
        let value = serde_json::to_value(sample_user()).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("password"));
        assert_eq!(object["phoneCode"], "+49");
        assert_eq!(object["email"], "nadia@example.com");
        // unset optional fields are omitted entirely
        assert!(!object.contains_key("phone"));
        assert!(object.contains_key("createdAt"));
    }

    #[test]
    fn test_signin_user_info_uses_id_as_token() {
        let user = sample_user();
        let id = user.id.clone();
        let info: SignInUserInfo = user.into();
        assert_eq!(info.token, id);

        let value = serde_json::to_value(&info).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("password"));
        assert!(!object.contains_key("id"));
        assert_eq!(object["token"], id);
    }

    #[test]
    fn test_signup_request_accepts_profile_fields() {
        let request: SignupRequest = serde_json::from_str(
            r#"{
                "email": "k@example.com",
                "password": "secret1",
                "username": "kei",
                "phoneCode": "+81",
                "pincode": "100-0001"
            }"#,
        )
        .unwrap();
        assert_eq!(request.email.as_deref(), Some("k@example.com"));
        assert_eq!(request.profile.username.as_deref(), Some("kei"));
        assert_eq!(request.profile.phone_code.as_deref(), Some("+81"));
        assert_eq!(request.profile.pincode.as_deref(), Some("100-0001"));
        assert!(request.profile.image.is_none());
    }

    #[tokio::test]
    async fn test_password_hash_roundtrip() {
        // minimal cost keeps the test fast
        let hash = hash_password("hunter22".to_string(), 4).await.unwrap();
        assert!(verify_password("hunter22".to_string(), hash.clone())
            .await
            .unwrap());
        assert!(!verify_password("hunter23".to_string(), hash).await.unwrap());
    }
}
