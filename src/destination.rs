use std::{borrow::Cow, collections::HashMap, convert::TryInto, str::FromStr};

const DEFAULT_BREEZE_ENDPOINT: &str = "https://dc.services.visualstudio.com";
const TRACK_PATH: &str = "v2/track";
const FIELDS_SEPARATOR: char = ';';
const FIELD_KEY_VALUE_SEPARATOR: char = '=';
const INSTRUMENTATION_KEY_GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

/// Routing attributes of a batch: which Application Insights resource receives it and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub(crate) instrumentation_key: String,
    pub(crate) endpoint: http::Uri,
}

impl Destination {
    /// Create a destination from an instrumentation key and the full track endpoint.
    ///
    /// No validation happens here. Invalid destinations are rejected when a batch is sent.
    pub fn new(instrumentation_key: impl Into<String>, endpoint: http::Uri) -> Self {
        Destination {
            instrumentation_key: instrumentation_key.into(),
            endpoint,
        }
    }

    /// Instrumentation key.
    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    /// Track endpoint, e.g. `https://dc.services.visualstudio.com/v2/track`.
    pub fn endpoint(&self) -> &http::Uri {
        &self.endpoint
    }
}

/// Connection string parse error.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ParseError {
    /// A field is not a `key=value` pair.
    #[error("invalid format")]
    InvalidFormat,
    /// `InstrumentationKey` is missing.
    #[error("missing instrumentation key")]
    MissingInstrumentationKey,
    /// `Authorization` names something other than `ikey`.
    #[error("unsupported authorization; only \"ikey\" is supported")]
    UnsupportedAuthorization,
    /// The ingestion endpoint is not a valid URI.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(http::uri::InvalidUri),
}

impl FromStr for Destination {
    type Err = ParseError;

    /// Parse an Application Insights connection string.
    ///
    /// Based on
    /// https://github.com/Azure/azure-sdk-for-js/blob/a4b3762fd7503f90c7bc3bacf9e45ecc4012d3fa/sdk/monitor/monitor-opentelemetry-exporter/src/utils/connectionStringParser.ts
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result: HashMap<String, String> = s
            .split(FIELDS_SEPARATOR)
            .filter(|kv| !kv.trim().is_empty())
            .map(|kv| {
                let parts: Vec<&str> = kv.split(FIELD_KEY_VALUE_SEPARATOR).collect();
                if parts.len() == 2 {
                    Ok((parts[0].trim().to_lowercase(), parts[1].to_string()))
                } else {
                    Err(ParseError::InvalidFormat)
                }
            })
            .collect::<Result<_, _>>()?;

        let ingestion_endpoint = if let Some(endpoint) = result.remove("ingestionendpoint") {
            sanitize_url(endpoint)?
        } else if let Some(endpoint_suffix) = result.remove("endpointsuffix") {
            let location_prefix = result
                .remove("location")
                .map(|x| format!("{}.", x))
                .unwrap_or_default();
            sanitize_url(format!("https://{}dc.{}", location_prefix, endpoint_suffix))?
        } else {
            DEFAULT_BREEZE_ENDPOINT.to_string()
        };

        if let Some(authorization) = result.remove("authorization") {
            if !authorization.eq_ignore_ascii_case("ikey") {
                return Err(ParseError::UnsupportedAuthorization);
            }
        }
        let instrumentation_key = result
            .remove("instrumentationkey")
            .map(|key| key.trim().to_string())
            .ok_or(ParseError::MissingInstrumentationKey)?;

        Ok(Destination {
            instrumentation_key,
            endpoint: append_track_path(&ingestion_endpoint)?,
        })
    }
}

fn sanitize_url(url: String) -> Result<String, ParseError> {
    let mut new_url: Cow<str> = url.trim().into();
    if !new_url.starts_with("https://") {
        new_url = new_url.replace("http://", "https://").into();
    }

    let new_url = new_url.trim_end_matches('/');
    // Validate before the track path gets appended, so errors point at the configured value.
    let _: http::Uri = new_url.try_into().map_err(ParseError::InvalidEndpoint)?;
    Ok(new_url.to_string())
}

fn append_track_path(base: &str) -> Result<http::Uri, ParseError> {
    format!("{}/{}", base.trim_end_matches('/'), TRACK_PATH)
        .try_into()
        .map_err(ParseError::InvalidEndpoint)
}

/// Whether the instrumentation key is a well-formed GUID
/// (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, hex digits, any case).
pub(crate) fn is_valid_instrumentation_key(instrumentation_key: &str) -> bool {
    let groups: Vec<&str> = instrumentation_key.split('-').collect();
    groups.len() == INSTRUMENTATION_KEY_GROUPS.len()
        && groups
            .iter()
            .zip(INSTRUMENTATION_KEY_GROUPS.iter())
            .all(|(group, len)| {
                group.len() == *len && group.chars().all(|c| c.is_ascii_hexdigit())
            })
}

/// Whether the endpoint can be sent to: it needs both scheme and host.
pub(crate) fn is_valid_endpoint(endpoint: &http::Uri) -> bool {
    endpoint.scheme().is_some() && endpoint.host().map_or(false, |host| !host.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;
    use test_case::test_case;

    #[test_case(
        "Authorization=ikey;InstrumentationKey=instr_key;IngestionEndpoint=https://ingest",
        "https://ingest/v2/track",
        "instr_key" ; "default")]
    #[test_case(
        "Authorization=ikey;InstrumentationKey=instr_key;IngestionEndpoint= http://ingest/  ",
        "https://ingest/v2/track",
        "instr_key" ; "sanitize url")]
    #[test_case(
        "Foo=1;InstrumentationKey=instr_key;Bar=2;IngestionEndpoint=https://ingest;Baz=3",
        "https://ingest/v2/track",
        "instr_key" ; "ignore unknown fields")]
    #[test_case(
        "InstrumentationKey=instr_key",
        "https://dc.services.visualstudio.com/v2/track",
        "instr_key" ; "default endpoint")]
    #[test_case(
        "InstrumentationKey=instr_key;EndpointSuffix=ai.contoso.com",
        "https://dc.ai.contoso.com/v2/track",
        "instr_key" ; "endpoint suffix")]
    #[test_case(
        "InstrumentationKey=instr_key;EndpointSuffix=ai.contoso.com;Location=westus2",
        "https://westus2.dc.ai.contoso.com/v2/track",
        "instr_key" ; "endpoint suffix & location")]
    #[test_case(
        "InstrumentationKey=instr_key;EndpointSuffix=ai.contoso.com;IngestionEndpoint=https://ingest",
        "https://ingest/v2/track",
        "instr_key" ; "endpoint suffix & override")]
    #[test_case(
        "InstrumentationKey=instr_key;",
        "https://dc.services.visualstudio.com/v2/track",
        "instr_key" ; "trailing separator")]
    fn parse_succeeds(
        connection_string: &'static str,
        expected_endpoint: &'static str,
        expected_instrumentation_key: &'static str,
    ) {
        let result: Destination = connection_string.parse().unwrap();
        assert_eq!(http::Uri::try_from(expected_endpoint).unwrap(), result.endpoint);
        assert_eq!(expected_instrumentation_key, result.instrumentation_key);
    }

    #[test_case("Authorization=foo;InstrumentationKey=instr_key" ; "authorization != ikey")]
    #[test_case("InstrumentationKey=instr_key;NoValue" ; "field without value")]
    #[test_case("InstrumentationKey=instr_key;InvalidValue=foo=bar" ; "2 equals signs")]
    #[test_case("IngestionEndpoint=https://ingest" ; "no instrumentation key")]
    #[test_case("InstrumentationKey=instr_key;IngestionEndpoint=ftp:/foo" ; "invalid endpoint uri")]
    fn parse_fails(connection_string: &'static str) {
        connection_string.parse::<Destination>().unwrap_err();
    }

    #[test_case("0fdcec70-0ce5-4085-89d9-9ae8ead9af66", true ; "lowercase guid")]
    #[test_case("0FDCEC70-0CE5-4085-89D9-9AE8EAD9AF66", true ; "uppercase guid")]
    #[test_case("0fdcec700ce5408589d99ae8ead9af66", false ; "no dashes")]
    #[test_case("0fdcec70-0ce5-4085-89d9-9ae8ead9af6", false ; "short last group")]
    #[test_case("0fdcec70-0ce5-4085-89d9-9ae8ead9af6g", false ; "non hex")]
    #[test_case("", false ; "empty")]
    fn instrumentation_key_validation(key: &'static str, expected: bool) {
        assert_eq!(expected, is_valid_instrumentation_key(key));
    }

    #[test_case("https://dc.services.visualstudio.com/v2/track", true ; "absolute")]
    #[test_case("/v2/track", false ; "path only")]
    fn endpoint_validation(endpoint: &'static str, expected: bool) {
        assert_eq!(
            expected,
            is_valid_endpoint(&http::Uri::try_from(endpoint).unwrap())
        );
    }
}
