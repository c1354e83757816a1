use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::{
    auth::{
        jwt::JwtKeys,
        password::Passwords,
        repo::UserStore,
        repo_types::{NewUser, Role, User},
    },
    error::AppError,
};

/// Column widths of `users.name` / `users.email`, counted in characters.
const NAME_MAX_CHARS: usize = 50;
const EMAIL_MAX_CHARS: usize = 100;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Credential checks and token issuance over a `UserStore`.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    keys: JwtKeys,
    passwords: Passwords,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, keys: JwtKeys) -> Self {
        Self {
            users,
            keys,
            passwords: Passwords::default(),
        }
    }

    pub fn users(&self) -> &dyn UserStore {
        self.users.as_ref()
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        let name = name.trim();
        let email = normalize_email(email);

        if name.is_empty() {
            return Err(AppError::validation("name", "Name is required"));
        }
        if email.is_empty() {
            return Err(AppError::validation("email", "Email is required"));
        }
        if password.trim().is_empty() {
            return Err(AppError::validation("password", "Password is required"));
        }
        if name.chars().count() > NAME_MAX_CHARS {
            return Err(AppError::validation(
                "name",
                format!("Name must be at most {NAME_MAX_CHARS} characters"),
            ));
        }
        if email.chars().count() > EMAIL_MAX_CHARS {
            return Err(AppError::validation(
                "email",
                format!("Email must be at most {EMAIL_MAX_CHARS} characters"),
            ));
        }
        if !is_valid_email(&email) {
            return Err(AppError::validation("email", "Invalid email"));
        }

        if self.users.find_by_email(&email).await?.is_some() {
            warn!(%email, "email already registered");
            return Err(AppError::Conflict("Email already registered".into()));
        }

        let hash = self.passwords.hash(password)?;
        // the store enforces uniqueness again for concurrent registrations
        let user = self
            .users
            .create(NewUser {
                name,
                email: &email,
                password_hash: &hash,
            })
            .await?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(user)
    }

    /// Returns the user and a freshly signed bearer token.
    pub async fn login(&self, email: &str, password: &str) -> Result<(User, String), AppError> {
        let email = normalize_email(email);

        let Some(user) = self.users.find_by_email(&email).await? else {
            warn!(%email, "login unknown email");
            return Err(AppError::unauthorized("Invalid credentials"));
        };

        if !self.passwords.verify(password, &user.password_hash)? {
            warn!(%email, user_id = %user.id, "login invalid password");
            return Err(AppError::unauthorized("Invalid credentials"));
        }

        if !user.is_active {
            warn!(%email, user_id = %user.id, "login inactive user");
            return Err(AppError::unauthorized("Inactive user"));
        }

        let token = self.keys.sign(&user.email)?;
        info!(user_id = %user.id, email = %user.email, "user logged in");
        Ok((user, token))
    }

    pub async fn authenticate(&self, token: &str) -> Result<User, AppError> {
        let claims = self.keys.verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            AppError::unauthorized("Could not validate credentials")
        })?;

        let user = self
            .users
            .find_by_email(&claims.sub)
            .await?
            .ok_or_else(|| {
                warn!(sub = %claims.sub, "token subject unknown");
                AppError::unauthorized("Could not validate credentials")
            })?;

        if !user.is_active {
            return Err(AppError::unauthorized("Inactive user"));
        }
        Ok(user)
    }
}

pub fn authorize<'a>(user: &'a User, allowed: &[Role]) -> Result<&'a User, AppError> {
    if allowed.contains(&user.role) {
        Ok(user)
    } else {
        warn!(user_id = %user.id, role = %user.role, "role not permitted");
        Err(AppError::Forbidden("Insufficient permissions".into()))
    }
}
