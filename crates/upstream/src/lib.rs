//! HTTP clients for the provider's v2 REST API and its OAuth2 endpoints.
pub mod api;
pub mod oauth;

pub use api::{ApiReply, UserProfile, XApiClient, XApiError};
pub use oauth::{AuthorizeUrlParams, OAuthError, TokenResponse, XOAuthClient};
