//! The provider boundary used by the pairing orchestrator.

use crate::types::{CallbackRegistration, CallbackStatus, PairingCode, SessionCreated};
use crate::ProviderResult;
use async_trait::async_trait;

/// Remote operations offered by a messaging-channel provider.
///
/// Every method is exactly one request. Authentication failures surface as
/// [`ProviderError::Unauthorized`](crate::ProviderError::Unauthorized) from
/// all of them.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Create the channel session, or recover it if the provider already has one.
    async fn create_or_recover_session(
        &self,
        channel_id: &str,
        callback_hint: Option<&str>,
        event_types: &[String],
    ) -> ProviderResult<SessionCreated>;

    /// Fetch the pairing code for a session. `None` is a valid outcome.
    async fn fetch_pairing_code(&self, channel_id: &str) -> ProviderResult<Option<PairingCode>>;

    /// Fetch the provider's raw session status token (e.g. `connecting`, `open`).
    async fn fetch_session_state(&self, channel_id: &str) -> ProviderResult<String>;

    /// Register the callback endpoint that receives channel events.
    async fn register_callback(
        &self,
        channel_id: &str,
        callback_url: &str,
        event_types: &[String],
    ) -> ProviderResult<CallbackRegistration>;

    /// Read back the callback currently registered for a session.
    async fn fetch_callback(&self, channel_id: &str) -> ProviderResult<Option<CallbackStatus>>;

    /// Log the channel out at the provider.
    async fn logout_session(&self, channel_id: &str) -> ProviderResult<()>;

    /// Cheap request proving the provider is reachable and the credential works.
    async fn health_check(&self) -> ProviderResult<()>;
}
