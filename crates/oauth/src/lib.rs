//! OpenAI OAuth client library
//!
//! Provides PKCE generation, authorization URL construction, code exchange,
//! token refresh, the device-code flow, and the local browser callback
//! listener. It knows nothing about accounts or storage; callers persist the
//! resulting [`OAuthTokens`] wherever they keep secrets.
//!
//! Browser login:
//! 1. [`PkcePair::generate`] and [`generate_state`]
//! 2. [`CallbackServer::start`] binds the local redirect listener
//! 3. the user opens [`build_authorization_url`]
//! 4. [`CallbackServer::wait_for_code`] yields the authorization code
//! 5. [`TokenEndpoint::exchange_code`] trades it for tokens
//!
//! Later, [`TokenEndpoint::refresh`] renews the access token. A rejected
//! refresh token surfaces as [`Error::InvalidGrant`] so callers ask for a new
//! login instead of retrying.

pub mod callback;
pub mod claims;
pub mod constants;
pub mod device;
pub mod error;
pub mod http;
pub mod pkce;
pub mod token;
pub mod tokens;

pub use callback::CallbackServer;
pub use claims::TokenClaims;
pub use constants::*;
pub use device::{DeviceCode, DeviceFlow, DevicePollRequest};
pub use error::{Error, Result};
pub use pkce::{AuthorizationRequest, PkcePair, build_authorization_url, generate_state};
pub use token::{TokenEndpoint, TokenResponse};
pub use tokens::OAuthTokens;
