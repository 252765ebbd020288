use crate::error::ApiError;
use crate::issuer;
use crate::store::CertStore;

// Certificates with less than this much lifetime left are told to renew.
const RENEW_WINDOW_DAYS: i64 = 30;

pub enum SessionVerdict {
    Ok,
    MustRenew(&'static str),
    Rejected(&'static str),
}

/// The `ping`-time policy. Checks run in order and the first failure wins:
/// expiry window, revocation, hostname drift.
pub async fn ping(
    store: &CertStore,
    peer: &openssl::x509::X509,
) -> Result<SessionVerdict, ApiError> {
    let now = openssl::asn1::Asn1Time::days_from_now(0)?;
    let remaining = now.diff(peer.not_after())?;
    if !remaining_ok(remaining.days, remaining.secs) {
        return Ok(SessionVerdict::MustRenew(
            "Your certificate is about to expire, please renew it",
        ));
    }

    let fp = issuer::fingerprint(peer)?;
    if let Some(cert) = store.lookup_by_fingerprint(&fp).await? {
        if cert.revoked {
            return Ok(SessionVerdict::Rejected("Your certificate has been revoked"));
        }
    }

    if let Some(hostname) = store.hostname_for(&fp).await? {
        let cn = issuer::common_name(peer);
        if cn.as_deref() != Some(hostname.as_str()) {
            return Ok(SessionVerdict::Rejected("Please renew your certificate"));
        }
    }

    Ok(SessionVerdict::Ok)
}

fn remaining_ok(days: i32, secs: i32) -> bool {
    days as i64 * 86400 + secs as i64 >= RENEW_WINDOW_DAYS * 86400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_window_boundary() {
        // 29d 23h 59m 59s remaining is still too close to expiry
        assert!(!remaining_ok(29, 86399));
        assert!(remaining_ok(30, 0));
        assert!(remaining_ok(30, 1));
        assert!(!remaining_ok(0, 0));
    }

    #[test]
    fn expired_certificates_fail_the_window() {
        assert!(!remaining_ok(-3, 0));
        assert!(!remaining_ok(0, -120));
    }
}
