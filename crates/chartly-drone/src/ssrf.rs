// SPDX-License-Identifier: MIT OR Apache-2.0

//! SSRF hardening for outbound source fetches.

use std::net::IpAddr;
use url::Url;

use crate::DroneError;

/// Reject URLs that point at the local machine or the link-local metadata
/// range, before any connection is attempted.
///
/// Blocked: the `localhost` name, loopback addresses (`127.0.0.1`, `::1`),
/// and anything in `169.254.0.0/16` (cloud metadata endpoints).
///
/// # Errors
///
/// [`DroneError::InvalidUrl`] for unparseable URLs and
/// [`DroneError::BlockedHost`] for blocked targets.
pub fn check_url(raw: &str) -> Result<Url, DroneError> {
    let url = Url::parse(raw).map_err(|e| DroneError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    let Some(host) = url.host_str() else {
        return Err(DroneError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        });
    };

    if host.eq_ignore_ascii_case("localhost") {
        return Err(DroneError::BlockedHost { host: host.into() });
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let link_local = match ip {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(_) => false,
        };
        if ip.is_loopback() || link_local {
            return Err(DroneError::BlockedHost { host: host.into() });
        }
    }
    Ok(url)
}

/// Expand `${VAR}` placeholders using the provided lookup.
///
/// Missing variables fail closed rather than producing a partially
/// substituted URL.
///
/// # Errors
///
/// [`DroneError::MissingPlaceholder`] for any unresolvable variable.
pub fn expand_placeholders(
    raw: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, DroneError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // No closing brace; keep the tail verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| DroneError::MissingPlaceholder {
            name: name.to_string(),
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_localhost_loopback_and_link_local() {
        for url in [
            "http://localhost/latest",
            "http://LOCALHOST:8080/x",
            "http://127.0.0.1/admin",
            "http://127.0.0.53:9/probe",
            "https://[::1]/v1",
            "http://169.254.169.254/latest/meta-data/",
            "http://169.254.0.1/x",
        ] {
            let err = check_url(url).unwrap_err();
            assert!(matches!(err, DroneError::BlockedHost { .. }), "{url}");
        }
    }

    #[test]
    fn allows_public_hosts() {
        for url in [
            "https://api.coingecko.com/api/v3/simple/price",
            "https://api.bls.gov/publicAPI/v2/timeseries/data/",
            "http://10.0.0.5/internal-but-not-blocked",
        ] {
            check_url(url).unwrap_or_else(|e| panic!("{url}: {e}"));
        }
    }

    #[test]
    fn rejects_garbage_urls() {
        assert!(matches!(
            check_url("not a url").unwrap_err(),
            DroneError::InvalidUrl { .. }
        ));
    }

    #[test]
    fn expands_placeholders_from_lookup() {
        let lookup = |name: &str| match name {
            "DATA_GOV_API_KEY" => Some("k123".to_string()),
            "HOST" => Some("api.example.com".to_string()),
            _ => None,
        };
        let expanded = expand_placeholders(
            "https://${HOST}/data?api_key=${DATA_GOV_API_KEY}",
            lookup,
        )
        .unwrap();
        assert_eq!(expanded, "https://api.example.com/data?api_key=k123");
    }

    #[test]
    fn missing_placeholder_fails_closed() {
        let err = expand_placeholders("https://x.example.com/?key=${NOPE}", |_| None).unwrap_err();
        assert!(matches!(err, DroneError::MissingPlaceholder { ref name } if name == "NOPE"));
    }

    #[test]
    fn unterminated_placeholder_is_left_verbatim() {
        let out = expand_placeholders("https://x.example.com/${OOPS", |_| None).unwrap();
        assert_eq!(out, "https://x.example.com/${OOPS");
    }
}
