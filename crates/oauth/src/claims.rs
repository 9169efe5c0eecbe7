//! Claims read from an id token's payload. The signature is not verified;
//! the values only label accounts and route usage requests.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

const AUTH_NAMESPACE: &str = "https://api.openai.com/auth";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub email: Option<String>,
    pub chatgpt_account_id: Option<String>,
    pub plan_type: Option<String>,
}

impl TokenClaims {
    /// Decode the payload segment of a JWT. Returns `None` for anything that
    /// is not a three-part token with a JSON object payload.
    pub fn parse(jwt: &str) -> Option<Self> {
        let mut parts = jwt.split('.');
        let (Some(_header), Some(payload), Some(_sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let value: Value = serde_json::from_slice(&bytes).ok()?;
        let root = value.as_object()?;
        let namespaced = root.get(AUTH_NAMESPACE).and_then(Value::as_object);

        let string_at = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        Some(Self {
            email: string_at(root.get("email")),
            chatgpt_account_id: string_at(root.get("chatgpt_account_id"))
                .or_else(|| string_at(namespaced.and_then(|ns| ns.get("chatgpt_account_id")))),
            plan_type: string_at(namespaced.and_then(|ns| ns.get("chatgpt_plan_type"))),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Unsigned JWT with the given JSON payload.
    pub(crate) fn fake_jwt(payload: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        )
    }

    #[test]
    fn reads_namespaced_claims() {
        let jwt = fake_jwt(
            r#"{"email":"dev@example.com","https://api.openai.com/auth":{"chatgpt_account_id":"org-123","chatgpt_plan_type":"team"}}"#,
        );
        let claims = TokenClaims::parse(&jwt).unwrap();
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert_eq!(claims.chatgpt_account_id.as_deref(), Some("org-123"));
        assert_eq!(claims.plan_type.as_deref(), Some("team"));
    }

    #[test]
    fn top_level_account_id_wins() {
        let jwt = fake_jwt(
            r#"{"chatgpt_account_id":"top","https://api.openai.com/auth":{"chatgpt_account_id":"nested"}}"#,
        );
        assert_eq!(
            TokenClaims::parse(&jwt).unwrap().chatgpt_account_id.as_deref(),
            Some("top")
        );
    }

    #[test]
    fn rejects_non_jwt_input() {
        assert!(TokenClaims::parse("").is_none());
        assert!(TokenClaims::parse("a.b").is_none());
        assert!(TokenClaims::parse("a.!!!.c").is_none());
        assert!(TokenClaims::parse("a.b.c.d").is_none());
    }
}
