use serde::Serialize;
use serde_json::Value;

use super::{endpoints, ApiError, HttpGateway};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

/// Profile endpoints for the logged-in user.
///
/// Expects a gateway from `SessionManager::protected_gateway`, so each call
/// gets the pre-flight check and the 401 refresh-and-replay.
#[derive(Clone)]
pub struct UserApi {
    gateway: HttpGateway,
}

impl UserApi {
    pub fn new(gateway: HttpGateway) -> Self {
        Self { gateway }
    }

    pub async fn profile(&self) -> Result<Value, ApiError> {
        self.gateway.get(endpoints::USER_PROFILE, &[]).await
    }

    pub async fn update_profile(&self, profile: &Value) -> Result<Value, ApiError> {
        self.gateway.put(endpoints::USER_PROFILE, profile).await
    }

    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<Value, ApiError> {
        let request = ChangePasswordRequest {
            current_password,
            new_password,
        };
        self.gateway.post(endpoints::CHANGE_PASSWORD, &request).await
    }
}
