use base64::prelude::*;
use chrono::prelude::*;
use std::net::IpAddr;
use std::sync::Arc;

use crate::dns;
use crate::error::ApiError;
use crate::issuer::{self, CaIssuer, IssueError, IssuedCert};
use crate::models;
use crate::store::CertStore;

const BUSY_MESSAGE: &str =
    "The certificate authority is busy signing another request, please try again in a few minutes.";

pub enum EnrollOutcome {
    /// Certificate, key and PKCS#12 bundle, ready to send to the client.
    Issued(String),
    /// The request is parked on the waiting list.
    Waiting(&'static str),
    /// The signing lock was held; the client should retry later.
    Retry(&'static str),
}

/// Unauthenticated enrollment. Peers inside a registered IP range are
/// served immediately; everyone else goes through the waiting list until an
/// administrator approves the entry.
pub async fn reqcert(
    store: &CertStore,
    ca: &Arc<CaIssuer>,
    peer_ip: IpAddr,
    hostname_param: Option<String>,
) -> Result<EnrollOutcome, ApiError> {
    let param = hostname_param.filter(|h| !h.is_empty());

    let hostname;
    if store.iprange_contains(peer_ip).await? {
        hostname = match dns::forward_confirmed_reverse(peer_ip).await.or(param) {
            Some(h) => h,
            None => {
                return Err(ApiError::BadRequest(
                    "unable to determine a hostname for this machine".to_string(),
                ))
            }
        };
    } else {
        match store.waiting_lookup(&peer_ip.to_string()).await? {
            None => {
                let fallback = param.ok_or_else(|| {
                    ApiError::BadRequest("the hostname parameter is required".to_string())
                })?;
                let hostname = dns::forward_confirmed_reverse(peer_ip)
                    .await
                    .unwrap_or(fallback);
                store
                    .waiting_insert(models::WaitingEntry {
                        ipaddr: peer_ip.to_string(),
                        hostname,
                        received: Utc::now().naive_utc(),
                        approved: false,
                    })
                    .await?;
                return Ok(EnrollOutcome::Waiting(
                    "Your request has been added to the waiting list. \
                     An administrator has to approve it before a certificate can be issued.",
                ));
            }
            Some(entry) if !entry.approved => {
                return Ok(EnrollOutcome::Waiting(
                    "Your request is on the waiting list, please be patient.",
                ));
            }
            Some(entry) => hostname = entry.hostname,
        }
    }

    let (key, issued) = match sign_for(ca, &hostname).await? {
        Signed::Done(key, issued) => (key, issued),
        Signed::Busy => return Ok(EnrollOutcome::Retry(BUSY_MESSAGE)),
    };

    let fp = issuer::fingerprint(&issued.cert)?;
    store
        .insert_issued(models::Certificate {
            certid: issued.serial,
            fingerprint: fp,
            commonname: hostname.clone(),
            issued: Utc::now().naive_utc(),
            revoked: false,
            previous: None,
            first: None,
            cert: issued.pem.clone(),
        })
        .await?;

    if let Err(e) = store.waiting_delete(&peer_ip.to_string()).await {
        warn!("Failed to remove waiting list entry for {}: {}", peer_ip, e);
    }

    info!("Issued certificate {} for {}", issued.serial, hostname);
    Ok(EnrollOutcome::Issued(bundle(ca, &key, &issued)?))
}

/// mTLS-authenticated rotation of an existing identity. The new
/// certificate inherits `first` from the chain, and every row keyed on the
/// old fingerprint is repointed before the response goes out.
pub async fn renewcert(
    store: &CertStore,
    ca: &Arc<CaIssuer>,
    peer: &openssl::x509::X509,
) -> Result<EnrollOutcome, ApiError> {
    let old_fp = issuer::fingerprint(peer)?;
    let old = store
        .lookup_by_fingerprint(&old_fp)
        .await?
        .ok_or_else(|| ApiError::Forbidden("unknown client certificate".to_string()))?;
    if old.revoked {
        return Err(ApiError::Forbidden("your certificate has been revoked".to_string()));
    }

    let hostname = match store.hostname_for(&old_fp).await? {
        Some(h) => h,
        None => issuer::common_name(peer)
            .filter(|cn| !cn.is_empty())
            .ok_or_else(|| {
                ApiError::Internal("unable to determine the hostname of this machine".to_string())
            })?,
    };

    let (key, issued) = match sign_for(ca, &hostname).await? {
        Signed::Done(key, issued) => (key, issued),
        Signed::Busy => return Ok(EnrollOutcome::Retry(BUSY_MESSAGE)),
    };

    let new_fp = issuer::fingerprint(&issued.cert)?;
    store
        .insert_issued(models::Certificate {
            certid: issued.serial,
            fingerprint: new_fp.clone(),
            commonname: hostname.clone(),
            issued: Utc::now().naive_utc(),
            revoked: false,
            previous: Some(old.certid),
            first: old.first.or(Some(old.certid)),
            cert: issued.pem.clone(),
        })
        .await?;
    store.rewrite_fingerprint(&old_fp, &new_fp).await?;

    info!("Renewed certificate for {}: {} -> {}", hostname, old.certid, issued.serial);
    Ok(EnrollOutcome::Issued(bundle(ca, &key, &issued)?))
}

enum Signed {
    Done(openssl::pkey::PKey<openssl::pkey::Private>, IssuedCert),
    Busy,
}

// Key generation and signing are CPU-bound and hold the signing lock, so
// they run on the blocking pool.
async fn sign_for(ca: &Arc<CaIssuer>, hostname: &str) -> Result<Signed, ApiError> {
    let t_ca = ca.clone();
    let common_name = hostname.to_string();
    match tokio::task::spawn_blocking(move || t_ca.issue(&common_name))
        .await
        .map_err(|e| ApiError::Internal(format!("signing task failed: {}", e)))?
    {
        Ok((key, issued)) => Ok(Signed::Done(key, issued)),
        Err(IssueError::Busy) => Ok(Signed::Busy),
        Err(e) => {
            warn!("Certificate signing failed: {}", e);
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

fn bundle(
    ca: &CaIssuer,
    key: &openssl::pkey::PKey<openssl::pkey::Private>,
    issued: &IssuedCert,
) -> Result<String, ApiError> {
    let key_pem = key.rsa().and_then(|r| r.private_key_to_pem())?;
    let p12 = ca.pkcs12_bundle(key, &issued.cert).map_err(ApiError::Internal)?;

    let mut body = String::new();
    body.push_str(&issued.pem);
    body.push_str(&String::from_utf8_lossy(&key_pem));
    body.push_str(&p12_section(&p12));
    Ok(body)
}

// Clients locate the PKCS#12 part by these markers, so the framing is part
// of the wire contract.
fn p12_section(der: &[u8]) -> String {
    let mut out = String::from("-----BEGIN P12-----\n");
    let encoded = BASE64_STANDARD.encode(der);
    for chunk in encoded.as_bytes().chunks(60) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str("-----END P12-----\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p12_section_framing() {
        let section = p12_section(&[0u8; 100]);
        let lines: Vec<&str> = section.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN P12-----"));
        assert_eq!(lines.last(), Some(&"-----END P12-----"));
        for line in &lines[1..lines.len() - 1] {
            assert!(line.len() <= 60);
            assert!(line.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='));
        }
        // 100 bytes -> 136 base64 chars -> 60 + 60 + 16
        assert_eq!(lines.len(), 2 + 3);
    }

    #[test]
    fn p12_section_round_trips() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let section = p12_section(&payload);
        let inner: String = section
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        assert_eq!(BASE64_STANDARD.decode(inner).unwrap(), payload);
    }
}
