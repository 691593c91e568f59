//! JWS-in-JSON envelope parsing and verification.
//!
//! Requests arrive as `{protected, payload, signature}` base64url
//! triples. Parsing decodes and validates the protected header and the
//! recognized payload fields; verification checks the signature against
//! a JWK (submitted or stored) per its key type.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ring::{hmac, signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

use super::problem::Problem;
use crate::db::{IdentifierType, JwkRecord};

/// Account key as it appears on the wire. Exactly one of the per-kty
/// field groups is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

impl Jwk {
    /// RFC 7638 thumbprint: SHA-256 over the canonical JSON of the
    /// required members, base64url encoded.
    pub fn thumbprint(&self) -> Result<String, Problem> {
        let canonical = match self.kty.as_str() {
            "RSA" => format!(
                r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
                self.e.as_deref().ok_or_else(bad_key)?,
                self.n.as_deref().ok_or_else(bad_key)?,
            ),
            "EC" => format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                self.crv.as_deref().ok_or_else(bad_key)?,
                self.x.as_deref().ok_or_else(bad_key)?,
                self.y.as_deref().ok_or_else(bad_key)?,
            ),
            "oct" => format!(
                r#"{{"k":"{}","kty":"oct"}}"#,
                self.k.as_deref().ok_or_else(bad_key)?,
            ),
            _ => return Err(bad_alg()),
        };
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(digest))
    }
}

impl From<&JwkRecord> for Jwk {
    fn from(record: &JwkRecord) -> Self {
        Self {
            kty: record.kty.clone(),
            n: record.n.clone(),
            e: record.e.clone(),
            crv: record.crv.clone(),
            x: record.x.clone(),
            y: record.y.clone(),
            k: record.k.clone(),
        }
    }
}

fn bad_key() -> Problem {
    Problem::new("badPublicKey", "Invalid JWK.")
}

fn bad_alg() -> Problem {
    Problem::new("badSignatureAlgorithm", "Invalid JWK signature algorithm.")
        .with_detail("JWK signature algorithm must be one of RSA, EC, oct.")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub jwk: Option<Jwk>,
    #[serde(default)]
    pub kid: Option<String>,
}

/// The `token + "." + base64url(thumbprint)` string a challenge responder
/// must serve.
pub fn key_authorization(token: &str, jwk: &Jwk) -> Result<String, Problem> {
    Ok(format!("{}.{}", token, jwk.thumbprint()?))
}

#[derive(Debug, Clone, Deserialize)]
struct RawIdentifier {
    #[serde(rename = "type", default)]
    id_type: Option<String>,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: IdentifierType,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawPayload {
    identifiers: Option<Vec<RawIdentifier>>,
    csr: Option<String>,
    profile: Option<String>,
    #[serde(rename = "onlyReturnExisting")]
    only_return_existing: Option<bool>,
    contact: Option<Vec<String>>,
    status: Option<String>,
    #[serde(rename = "notBefore")]
    not_before: Option<String>,
    #[serde(rename = "notAfter")]
    not_after: Option<String>,
}

/// Validated request payload; the recognized fields of every POST body.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub identifiers: Option<Vec<Identifier>>,
    pub csr: Option<String>,
    pub profile: Option<String>,
    pub only_return_existing: bool,
    pub contact: Option<Vec<String>>,
    pub status: Option<String>,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
}

fn validate_identifier(raw: RawIdentifier) -> Result<Identifier, Problem> {
    let id_type = match raw.id_type.as_deref() {
        Some("dns") => IdentifierType::Dns,
        Some("ip") => IdentifierType::Ip,
        _ => {
            return Err(Problem::new(
                "unsupportedIdentifier",
                "Invalid identifier type value",
            )
            .with_detail("identifier type must be one of dns, ip"))
        }
    };

    if raw.value.contains('*') {
        return Err(
            Problem::new("rejectedIdentifier", "Invalid identifier value")
                .with_detail("identifier values can not be wildcard"),
        );
    }

    let value = match id_type {
        IdentifierType::Dns => raw.value.to_lowercase(),
        IdentifierType::Ip => {
            if raw.value.parse::<IpAddr>().is_err() {
                return Err(
                    Problem::new("rejectedIdentifier", "Invalid identifier value")
                        .with_detail("With type ip value must be a valid IP address"),
                );
            }
            raw.value
        }
    };

    Ok(Identifier { id_type, value })
}

fn validate_payload(raw: RawPayload) -> Result<Payload, Problem> {
    let identifiers = match raw.identifiers {
        Some(raw_identifiers) => Some(
            raw_identifiers
                .into_iter()
                .map(validate_identifier)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };

    if let Some(status) = &raw.status {
        if !matches!(status.as_str(), "valid" | "invalid" | "deactivated") {
            return Err(Problem::malformed("Invalid status value")
                .with_detail("status must be one of valid, invalid, deactivated"));
        }
    }

    if let Some(not_before) = &raw.not_before {
        if DateTime::parse_from_rfc3339(not_before).is_err() {
            return Err(Problem::malformed("Invalid notBefore value")
                .with_detail("notBefore must be a valid date/time string in ISO 8601 format"));
        }
    }

    if let Some(not_after) = &raw.not_after {
        let parsed = DateTime::parse_from_rfc3339(not_after).map_err(|_| {
            Problem::malformed("Invalid notAfter value").with_detail(
                "notAfter must be a valid date/time string in ISO 8601 format and in the future",
            )
        })?;
        if parsed < Utc::now() {
            return Err(Problem::malformed("Invalid notAfter value").with_detail(
                "notAfter must be a valid date/time string in ISO 8601 format and in the future",
            ));
        }
    }

    Ok(Payload {
        identifiers,
        csr: raw.csr,
        profile: raw.profile,
        only_return_existing: raw.only_return_existing.unwrap_or(false),
        contact: raw.contact,
        status: raw.status,
        not_before: raw.not_before,
        not_after: raw.not_after,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct WireEnvelope {
    protected: String,
    #[serde(default)]
    payload: String,
    signature: String,
}

#[derive(Debug, Clone)]
pub struct ParsedEnvelope {
    protected_b64: String,
    payload_b64: String,
    signature_b64: String,
    pub header: ProtectedHeader,
    pub payload: Option<Payload>,
}

pub fn b64u_decode(value: &str) -> Result<Vec<u8>, Problem> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| Problem::malformed("Invalid base64url field").with_detail(e.to_string()))
}

impl ParsedEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, Problem> {
        let wire: WireEnvelope = serde_json::from_slice(body)
            .map_err(|e| Problem::malformed("Invalid JSON body").with_detail(e.to_string()))?;

        let header_bytes = b64u_decode(&wire.protected)?;
        let mut header: ProtectedHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| Problem::malformed("Invalid protected header").with_detail(e.to_string()))?;

        // An absolute account URL reduces to its kid segment
        if let Some(kid) = &header.kid {
            if kid.starts_with("http") {
                if let Some(last) = kid.split('/').next_back() {
                    header.kid = Some(last.to_string());
                }
            }
        }

        let payload = if wire.payload.is_empty() {
            None
        } else {
            let payload_bytes = b64u_decode(&wire.payload)?;
            let raw: RawPayload = serde_json::from_slice(&payload_bytes)
                .map_err(|e| Problem::malformed("Invalid payload").with_detail(e.to_string()))?;
            Some(validate_payload(raw)?)
        };

        if let Some(jwk) = &header.jwk {
            if !matches!(jwk.kty.as_str(), "RSA" | "EC" | "oct") {
                return Err(bad_alg());
            }
        }

        if header.kid.is_some() && header.jwk.is_some() {
            return Err(Problem::malformed("Client can not provide both kid and jwk."));
        }

        let envelope = Self {
            protected_b64: wire.protected,
            payload_b64: wire.payload,
            signature_b64: wire.signature,
            header,
            payload,
        };

        // Self-contained envelopes are verified right away
        if let Some(jwk) = envelope.header.jwk.clone() {
            envelope.verify_with(&jwk)?;
        }

        Ok(envelope)
    }

    /// POST-as-GET requests carry an empty payload.
    pub fn is_post_as_get(&self) -> bool {
        self.payload_b64.is_empty()
    }

    /// Verify the envelope's signature against a JWK. The signing input
    /// is the raw `protected.payload` compact form.
    pub fn verify_with(&self, jwk: &Jwk) -> Result<(), Problem> {
        let message = format!("{}.{}", self.protected_b64, self.payload_b64);
        let sig = b64u_decode(&self.signature_b64)?;
        let alg = self.header.alg.as_str();

        let verified = match jwk.kty.as_str() {
            "RSA" => {
                let n = b64u_decode(jwk.n.as_deref().ok_or_else(bad_key)?)?;
                let e = b64u_decode(jwk.e.as_deref().ok_or_else(bad_key)?)?;
                let params = match alg {
                    "RS256" => &signature::RSA_PKCS1_2048_8192_SHA256,
                    "RS384" => &signature::RSA_PKCS1_2048_8192_SHA384,
                    "RS512" => &signature::RSA_PKCS1_2048_8192_SHA512,
                    _ => return Err(bad_alg()),
                };
                let key = signature::RsaPublicKeyComponents { n: &n, e: &e };
                key.verify(params, message.as_bytes(), &sig).is_ok()
            }
            "EC" => {
                let x = b64u_decode(jwk.x.as_deref().ok_or_else(bad_key)?)?;
                let y = b64u_decode(jwk.y.as_deref().ok_or_else(bad_key)?)?;
                let params: &dyn signature::VerificationAlgorithm = match alg {
                    "ES256" => &signature::ECDSA_P256_SHA256_FIXED,
                    "ES384" => &signature::ECDSA_P384_SHA384_FIXED,
                    _ => return Err(bad_alg()),
                };
                // SEC 1 uncompressed point
                let mut point = Vec::with_capacity(1 + x.len() + y.len());
                point.push(0x04);
                point.extend_from_slice(&x);
                point.extend_from_slice(&y);
                signature::UnparsedPublicKey::new(params, &point)
                    .verify(message.as_bytes(), &sig)
                    .is_ok()
            }
            "oct" => {
                let k = b64u_decode(jwk.k.as_deref().ok_or_else(bad_key)?)?;
                let hmac_alg = match alg {
                    "HS256" => hmac::HMAC_SHA256,
                    "HS384" => hmac::HMAC_SHA384,
                    "HS512" => hmac::HMAC_SHA512,
                    _ => return Err(bad_alg()),
                };
                let key = hmac::Key::new(hmac_alg, &k);
                hmac::verify(&key, message.as_bytes(), &sig).is_ok()
            }
            _ => return Err(bad_alg()),
        };

        if !verified {
            return Err(bad_key().with_detail("signature verification failed"));
        }
        Ok(())
    }
}
