//! Gateway URL construction
//!
//! Router url templates use `%(name)s` placeholders. The built-in names are
//! `backend`, `recipient` (comma-joined identities) and `text`; any store
//! `params` are available too and take precedence. `%%` renders a literal
//! `%`. Every substituted value is form-encoded (space becomes `+`).

use std::collections::BTreeMap;

use relay_common::RouterUrl;

use crate::error::RoutingError;

/// Routing settings for one store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    pub router_url: RouterUrl,
    pub params: BTreeMap<String, String>,
}

impl Routing {
    pub fn new(router_url: RouterUrl) -> Self {
        Self {
            router_url,
            params: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn build_url(
        &self,
        backend: &str,
        recipients: &str,
        text: &str,
    ) -> Result<String, RoutingError> {
        build_send_url(&self.router_url, backend, recipients, text, &self.params)
    }
}

/// Encode a value the way an HTML form would
pub fn encode_param(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

pub fn build_send_url(
    router_url: &RouterUrl,
    backend: &str,
    recipients: &str,
    text: &str,
    extra: &BTreeMap<String, String>,
) -> Result<String, RoutingError> {
    let template = router_url
        .template_for(backend)
        .ok_or_else(|| RoutingError::NoRoute(backend.to_string()))?;

    let mut params: BTreeMap<&str, String> = BTreeMap::new();
    params.insert("backend", encode_param(backend));
    params.insert("recipient", encode_param(recipients));
    params.insert("text", encode_param(text));
    for (key, value) in extra {
        params.insert(key.as_str(), encode_param(value));
    }

    render(template, &params)
}

fn render(template: &str, params: &BTreeMap<&str, String>) -> Result<String, RoutingError> {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    let mut offset = 0;

    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let position = offset + idx;
        let after = &rest[idx + 1..];

        let consumed = if after.starts_with('%') {
            out.push('%');
            idx + 2
        } else if let Some(tail) = after.strip_prefix('(') {
            let close = tail.find(')').ok_or(RoutingError::MalformedTemplate {
                position,
                reason: "unterminated placeholder",
            })?;
            if !tail[close + 1..].starts_with('s') {
                return Err(RoutingError::MalformedTemplate {
                    position,
                    reason: "placeholder must end with 's'",
                });
            }
            let name = &tail[..close];
            let value = params
                .get(name)
                .ok_or_else(|| RoutingError::UnknownPlaceholder(name.to_string()))?;
            out.push_str(value);
            // '%' '(' name ')' 's'
            idx + close + 4
        } else {
            return Err(RoutingError::MalformedTemplate {
                position,
                reason: "'%' must start a placeholder or be doubled",
            });
        };

        rest = &rest[consumed..];
        offset += consumed;
    }

    out.push_str(rest);
    Ok(out)
}
