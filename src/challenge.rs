//! Typed `WWW-Authenticate: Bearer` challenge, as sent by registries that
//! delegate authentication to a token service.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// key=value or key="value", separated by commas
static PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|([^",\s]*))"#).expect("valid challenge regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

impl BearerChallenge {
    /// Parses a `WWW-Authenticate` header value.
    ///
    /// Returns `Ok(None)` when the header carries another scheme (e.g. Basic),
    /// and an `AuthChallenge` error when a Bearer challenge lacks `realm`,
    /// `service` or `scope`.
    pub fn parse(header: &str) -> Result<Option<Self>> {
        let header = header.trim();
        let Some(scheme) = header.split_whitespace().next() else {
            return Ok(None);
        };
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Ok(None);
        }
        let parameters = &header[scheme.len()..];

        let mut values: HashMap<String, String> = PARAMETER
            .captures_iter(parameters)
            .map(|cap| {
                let value = cap.get(2).or_else(|| cap.get(3)).map_or("", |m| m.as_str());
                (cap[1].to_ascii_lowercase(), value.to_string())
            })
            .collect();

        let mut take = |field: &str| {
            values
                .remove(field)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    Error::AuthChallenge(format!("missing {} in challenge {:?}", field, header))
                })
        };

        Ok(Some(Self {
            realm: take("realm")?,
            service: take("service")?,
            scope: take("scope")?,
        }))
    }
}
