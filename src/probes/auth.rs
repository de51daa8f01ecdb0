//! Outbound authentication.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::OutboundRequest;
use crate::model::{ApiKeyLocation, AuthConfig};

/// Apply an auth variant to an outbound request. `None` leaves it untouched.
pub fn apply(request: &mut OutboundRequest, auth: &AuthConfig) {
    match auth {
        AuthConfig::None => {}
        AuthConfig::Bearer { token } => {
            set_authorization(request, format!("Bearer {}", token));
        }
        AuthConfig::Basic { username, password } => {
            let encoded = STANDARD.encode(format!("{}:{}", username, password));
            set_authorization(request, format!("Basic {}", encoded));
        }
        AuthConfig::ApiKey {
            key,
            value,
            location,
        } => match location {
            ApiKeyLocation::Header => {
                request.headers.insert(key.clone(), value.clone());
            }
            ApiKeyLocation::Query => {
                request.query.push((key.clone(), value.clone()));
            }
        },
    }
}

fn set_authorization(request: &mut OutboundRequest, value: String) {
    request
        .headers
        .retain(|name, _| !name.eq_ignore_ascii_case("authorization"));
    request.headers.insert("Authorization".to_string(), value);
}
