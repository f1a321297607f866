use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use itrack_core::{NewUser, Preferences, User, UserId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{hash_password, issue_token, verify_password, AuthUser};
use crate::error::{ApiError, ApiResult, FieldError};
use crate::AppState;

/// Public view of a user; never carries the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: UserId,
    pub name: Option<String>,
    pub email: String,
    pub roles: Vec<String>,
    pub preferences: Preferences,
    pub saved_count: usize,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
            preferences: user.preferences.clone(),
            saved_count: user.saved.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: UserView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreferencesRequest {
    pub domains: Vec<String>,
    pub locations: Vec<String>,
    pub email_reminders: Option<bool>,
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn password_problem(password: &str) -> Option<&'static str> {
    if password.chars().count() < 8 {
        return Some("password must be at least 8 characters");
    }
    let lower = password.chars().any(|c| c.is_ascii_lowercase());
    let upper = password.chars().any(|c| c.is_ascii_uppercase());
    let digit = password.chars().any(|c| c.is_ascii_digit());
    if !(lower && upper && digit) {
        return Some("password must contain uppercase, lowercase and numbers");
    }
    None
}

fn trimmed_set(values: Vec<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let Json(request) = payload?;
    let mut problems = Vec::new();

    let name = request
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    if let Some(name) = &name {
        let len = name.chars().count();
        if !(2..=120).contains(&len) {
            problems.push(FieldError::new("name", "name must be between 2 and 120 characters"));
        }
    }
    let email = request.email.unwrap_or_default().trim().to_lowercase();
    if !is_valid_email(&email) {
        problems.push(FieldError::new("email", "valid email required"));
    }
    let password = request.password.unwrap_or_default();
    if let Some(problem) = password_problem(&password) {
        problems.push(FieldError::new("password", problem));
    }
    if !problems.is_empty() {
        return Err(ApiError::Validation(problems));
    }

    if state.store.find_user_by_email(&email).await?.is_some() {
        return Err(ApiError::Conflict("email already registered".to_string()));
    }
    let password_hash = hash_password(password).await?;
    let user = state
        .store
        .create_user(NewUser {
            name,
            email,
            password_hash,
            roles: vec!["student".to_string()],
            preferences: Preferences::default(),
        })
        .await
        .map_err(|err| match ApiError::from(err) {
            ApiError::Conflict(_) => ApiError::Conflict("email already registered".to_string()),
            other => other,
        })?;
    let token = issue_token(&user, &state.auth)?;
    info!(user_id = %user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token,
            user: UserView::from(&user),
        }),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<SessionResponse>> {
    let Json(request) = payload?;
    let email = request.email.unwrap_or_default().trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(ApiError::invalid("email", "valid email required"));
    }
    let Some(password) = request.password else {
        return Err(ApiError::invalid("password", "password is required"));
    };

    let invalid = || ApiError::Unauthorized("invalid email or password".to_string());
    let user = state
        .store
        .find_user_by_email(&email)
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(password, user.password_hash.clone()).await? {
        return Err(invalid());
    }
    let token = issue_token(&user, &state.auth)?;
    Ok(Json(SessionResponse {
        token,
        user: UserView::from(&user),
    }))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .store
        .find_user_by_id(auth.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    Ok(Json(serde_json::json!({ "user": UserView::from(&user) })))
}

pub async fn update_preferences(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    payload: Result<Json<PreferencesRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(request) = payload?;
    let preferences = Preferences {
        domains: trimmed_set(request.domains),
        locations: trimmed_set(request.locations),
        email_reminders: request.email_reminders.unwrap_or(true),
    };
    state
        .store
        .update_preferences(auth.id, preferences.clone())
        .await?;
    Ok(Json(serde_json::json!({ "preferences": preferences })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape_checks() {
        assert!(is_valid_email("asha@example.test"));
        assert!(!is_valid_email("asha@localhost"));
        assert!(!is_valid_email("asha example.test"));
        assert!(!is_valid_email("@example.test"));
        assert!(!is_valid_email("a@b@example.test"));
    }

    #[test]
    fn password_rules() {
        assert_eq!(password_problem("Sh0rt"), Some("password must be at least 8 characters"));
        assert!(password_problem("alllowercase1").is_some());
        assert_eq!(password_problem("Sup3rSecret"), None);
    }
}
