//! EC2 instance state lookup
//!
//! One `DescribeInstances` call over HTTPS, signed with AWS Signature V4.
//! Only the instance state name and its public address are read from the
//! XML response.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::credentials::CloudCredentials;
use super::{InstanceDescription, InstanceState, ProbeError};
use crate::config::ConnectionProfile;

const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";

type HmacSha256 = Hmac<Sha256>;

pub struct Ec2Prober {
    client: reqwest::Client,
    credentials: Option<CloudCredentials>,
    /// Replaces `https://ec2.<region>.amazonaws.com`
    endpoint: Option<String>,
}

impl Ec2Prober {
    pub fn new(credentials: Option<CloudCredentials>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            endpoint: None,
        }
    }

    /// Point at a different API endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub async fn describe(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<InstanceDescription, ProbeError> {
        let instance_id = profile.host.trim();

        let Some(credentials) = &self.credentials else {
            warn!(
                "No cloud credentials available, state of {} is unknown",
                instance_id
            );
            return Ok(InstanceDescription::unknown());
        };

        let region = profile
            .region
            .as_deref()
            .or(credentials.region.as_deref())
            .map(region_from_zone);
        let Some(region) = region else {
            warn!("No region for {}, state is unknown", instance_id);
            return Ok(InstanceDescription::unknown());
        };

        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ec2.{}.amazonaws.com", region));
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| ProbeError::Unreachable(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ProbeError::Unreachable(format!(
                    "Endpoint {} has no host",
                    endpoint
                )))
            }
        };

        let query = format!(
            "Action=DescribeInstances&InstanceId.1={}&Version={}",
            instance_id, API_VERSION
        );
        let signed = sign_request(credentials, &region, &host, &query, Utc::now())?;

        debug!("DescribeInstances {} in {}", instance_id, region);

        let mut request = self
            .client
            .get(format!("{}/?{}", endpoint.trim_end_matches('/'), query))
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization);
        if let Some(token) = &credentials.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable(format!("Failed to query EC2: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProbeError::Unreachable(format!("Failed to read EC2 response: {}", e)))?;

        if !status.is_success() {
            let code = error_code(&body);
            if status.as_u16() == 401 || status.as_u16() == 403 || is_auth_error(code.as_deref()) {
                return Err(ProbeError::Unauthorized(format!(
                    "EC2 returned HTTP {} ({})",
                    status.as_u16(),
                    code.unwrap_or_default()
                )));
            }
            if code.as_deref() == Some("InvalidInstanceID.NotFound") {
                warn!("Instance {} not found in {}", instance_id, region);
                return Ok(InstanceDescription::unknown());
            }
            return Err(ProbeError::Unreachable(format!(
                "EC2 returned HTTP {} ({})",
                status.as_u16(),
                code.unwrap_or_default()
            )));
        }

        let description = parse_describe_response(&body);
        info!(
            "Instance {} is {} (address: {})",
            instance_id,
            description.state,
            description.public_address.as_deref().unwrap_or("none")
        );
        Ok(description)
    }
}

/// `us-east-1a` -> `us-east-1`; regions pass through
fn region_from_zone(zone: &str) -> String {
    let zone = zone.trim();
    let mut chars = zone.chars().rev();
    match (chars.next(), chars.next()) {
        (Some(last), Some(prev)) if last.is_ascii_lowercase() && prev.is_ascii_digit() => {
            zone[..zone.len() - 1].to_string()
        }
        _ => zone.to_string(),
    }
}

fn map_state(name: &str) -> InstanceState {
    match name {
        "running" => InstanceState::Running,
        "stopped" | "stopping" | "terminated" | "shutting-down" => InstanceState::Stopped,
        _ => InstanceState::Unknown,
    }
}

fn state_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<instanceState>.*?<name>\s*([^<\s]+)\s*</name>").ok())
        .as_ref()
}

fn tag_regex(tag: &str) -> Option<Regex> {
    Regex::new(&format!(r"<{}>\s*([^<\s]+)\s*</{}>", tag, tag)).ok()
}

fn extract_tag(body: &str, tag: &str) -> Option<String> {
    tag_regex(tag)?
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// State and public address from a `DescribeInstancesResponse`
fn parse_describe_response(body: &str) -> InstanceDescription {
    let state = state_regex()
        .and_then(|re| re.captures(body))
        .and_then(|c| c.get(1))
        .map(|m| map_state(m.as_str()))
        .unwrap_or(InstanceState::Unknown);

    let public_address = extract_tag(body, "ipAddress").or_else(|| extract_tag(body, "dnsName"));

    InstanceDescription::new(state, public_address)
}

fn error_code(body: &str) -> Option<String> {
    extract_tag(body, "Code")
}

fn is_auth_error(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(
            "AuthFailure"
                | "UnauthorizedOperation"
                | "InvalidClientTokenId"
                | "SignatureDoesNotMatch"
                | "ExpiredToken"
        )
    )
}

struct SignedHeaders {
    amz_date: String,
    authorization: String,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProbeError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ProbeError::Unauthorized(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SigV4 key derivation
fn signing_key(
    secret: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, ProbeError> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Sign a GET with an empty body; `query` must already be in canonical order
fn sign_request(
    credentials: &CloudCredentials,
    region: &str,
    host: &str,
    query: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders, ProbeError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
    let mut signed_headers = String::from("host;x-amz-date");
    if let Some(token) = &credentials.session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
        signed_headers.push_str(";x-amz-security-token");
    }

    let canonical_request = format!(
        "GET\n/\n{}\n{}\n{}\n{}",
        query,
        canonical_headers,
        signed_headers,
        sha256_hex(b"")
    );

    let scope = format!("{}/{}/{}/aws4_request", date_stamp, region, SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&credentials.secret_access_key, &date_stamp, region, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, signed_headers, signature
    );

    Ok(SignedHeaders {
        amz_date,
        authorization,
    })
}
