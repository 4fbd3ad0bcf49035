//! Request identity.
//!
//! Authentication happens in front of this service; the proxy forwards the
//! authenticated account id in `x-user-id`. Handlers take [`ActingUser`] (or
//! [`AdminUser`]) and never see requests without a known account.

use crate::{
    errors::AppError,
    models::user::User,
    services::{drive_service::DriveService, error::DriveError},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The account a request acts on behalf of.
#[derive(Debug, Clone)]
pub struct ActingUser(pub User);

impl ActingUser {
    pub fn id(&self) -> Uuid {
        self.0.id
    }
}

impl FromRequestParts<DriveService> for ActingUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &DriveService,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| AppError::unauthorized("missing or invalid x-user-id header"))?;

        match service.users().get(user_id).await {
            Ok(user) => Ok(ActingUser(user)),
            Err(DriveError::NotFound(_)) => Err(AppError::unauthorized("unknown user")),
            Err(err) => Err(err.into()),
        }
    }
}

/// An acting user with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

impl FromRequestParts<DriveService> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &DriveService,
    ) -> Result<Self, Self::Rejection> {
        let ActingUser(user) = ActingUser::from_request_parts(parts, service).await?;
        if !user.is_admin() {
            return Err(AppError::forbidden("administrator role required"));
        }
        Ok(AdminUser(user))
    }
}
