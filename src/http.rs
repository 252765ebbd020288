use axum::extract::{ConnectInfo, Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::prelude::*;
use chrono::prelude::*;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::enroll::{self, EnrollOutcome};
use crate::error::ApiError;
use crate::ingest;
use crate::issuer::{self, CaIssuer};
use crate::session::{self, SessionVerdict};
use crate::store::CertStore;

// The front server terminates TLS and forwards the peer address and the
// client certificate (single-line base64 DER) in these headers.
const HDR_PEER_IP: &str = "x-real-ip";
const HDR_CLIENT_CERT: &str = "x-ssl-client-cert";

pub struct App {
    pub store: CertStore,
    pub ca: Arc<CaIssuer>,
    pub queue_dir: PathBuf,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/reqcert", get(reqcert))
        .route("/secure/renewcert", get(renewcert))
        .route("/secure/ping", get(ping))
        .route("/secure/post", post(post_archive))
        .route("/ingest", get(ingest_worker))
        // uploaded archives are larger than the default multipart limit
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(app)
}

#[derive(Deserialize)]
struct ReqcertParams {
    hostname: Option<String>,
}

async fn reqcert(
    State(app): State<Arc<App>>,
    Query(params): Query<ReqcertParams>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    let peer_ip = peer_ip(&headers, addr);
    let outcome = enroll::reqcert(&app.store, &app.ca, peer_ip, params.hostname).await?;
    Ok(outcome_response(outcome))
}

async fn renewcert(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let peer = client_cert(&headers)?;
    let outcome = enroll::renewcert(&app.store, &app.ca, &peer).await?;
    Ok(outcome_response(outcome))
}

async fn ping(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let peer = client_cert(&headers)?;
    match session::ping(&app.store, &peer).await? {
        SessionVerdict::Ok => Ok("pong\n".into_response()),
        SessionVerdict::MustRenew(msg) | SessionVerdict::Rejected(msg) => {
            Ok((StatusCode::FORBIDDEN, format!("{}\n", msg)).into_response())
        }
    }
}

async fn post_archive(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let peer = client_cert(&headers)?;
    let peer_ip = peer_ip(&headers, addr);

    let mut archive: Option<axum::body::Bytes> = None;
    let mut archive_name: Option<String> = None;
    let mut signature: Option<String> = None;
    let mut hostname: Option<String> = None;
    let mut version: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::BadRequest(format!("invalid multipart request: {}", e))
    })? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("archive") => {
                archive_name = field.file_name().map(str::to_string);
                archive = Some(field.bytes().await.map_err(|e| {
                    ApiError::BadRequest(format!("failed to read archive field: {}", e))
                })?);
            }
            Some("signature") => signature = Some(read_text_field(field).await?),
            Some("hostname") => hostname = Some(read_text_field(field).await?),
            Some("version") => version = Some(read_text_field(field).await?),
            // nonce is accepted and ignored
            _ => {}
        }
    }

    let archive = archive
        .ok_or_else(|| ApiError::BadRequest("the archive field is required".to_string()))?;
    let signature = signature
        .ok_or_else(|| ApiError::BadRequest("the signature field is required".to_string()))?;

    // The upload must be signed by the key belonging to the presented
    // certificate.
    let sig = BASE64_STANDARD
        .decode(signature.trim())
        .map_err(|_| ApiError::BadRequest("malformed signature".to_string()))?;
    let pubkey = peer.public_key()?;
    let mut verifier =
        openssl::sign::Verifier::new(openssl::hash::MessageDigest::sha256(), &pubkey)?;
    if !verifier.verify_oneshot(&sig, &archive)? {
        return Err(ApiError::Forbidden(
            "archive signature verification failed".to_string(),
        ));
    }

    let ext = match archive_name.as_deref() {
        Some(name) if name.ends_with(".zip") => "zip",
        _ => "tgz",
    };
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let basename = format!("archive{}.{}", suffix, ext);

    let fp = issuer::fingerprint(&peer)?;
    std::fs::create_dir_all(&app.queue_dir)?;
    std::fs::write(app.queue_dir.join(&basename), &archive)?;
    let meta = format!(
        "received = {}\ncertfp = {}\nip = {}\nos_hostname = {}\ncertcn = {}\nclientversion = {}\n",
        Utc::now().timestamp(),
        fp,
        peer_ip,
        hostname.unwrap_or_default(),
        issuer::common_name(&peer).unwrap_or_default(),
        version.unwrap_or_default(),
    );
    std::fs::write(app.queue_dir.join(format!("{}.meta", basename)), meta)?;

    info!("Queued archive {} from {}", basename, fp);
    Ok("OK\n".into_response())
}

#[derive(Deserialize)]
struct IngestParams {
    file: Option<String>,
}

async fn ingest_worker(
    State(app): State<Arc<App>>,
    Query(params): Query<IngestParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    // Only the local front server may drive the queue; it has already
    // authenticated the submitter.
    if !addr.ip().is_loopback() {
        return Err(ApiError::Forbidden("only local requests are allowed".to_string()));
    }
    let file = params
        .file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing parameter: file".to_string()))?;
    ingest::process_archive(&app.store, &app.queue_dir, &file).await?;
    Ok("OK\n".into_response())
}

fn outcome_response(outcome: EnrollOutcome) -> Response {
    match outcome {
        EnrollOutcome::Issued(body) => body.into_response(),
        EnrollOutcome::Waiting(msg) | EnrollOutcome::Retry(msg) => {
            format!("{}\n", msg).into_response()
        }
    }
}

fn peer_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get(HDR_PEER_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

fn client_cert(headers: &HeaderMap) -> Result<openssl::x509::X509, ApiError> {
    let value = headers
        .get(HDR_CLIENT_CERT)
        .ok_or_else(|| ApiError::BadRequest("client certificate missing".to_string()))?;
    let der = BASE64_STANDARD
        .decode(value.as_bytes())
        .map_err(|_| ApiError::BadRequest("malformed client certificate header".to_string()))?;
    openssl::x509::X509::from_der(&der)
        .map_err(|_| ApiError::BadRequest("unparseable client certificate".to_string()))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read multipart field: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ip_prefers_the_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HDR_PEER_IP, "10.0.0.5".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:4040".parse().unwrap();
        assert_eq!(peer_ip(&headers, addr), "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn peer_ip_falls_back_to_the_socket() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "192.0.2.10:4040".parse().unwrap();
        assert_eq!(peer_ip(&headers, addr), "192.0.2.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_cert_requires_the_header() {
        match client_cert(&HeaderMap::new()) {
            Err(ApiError::BadRequest(_)) => {}
            _ => panic!("expected BadRequest"),
        }
    }
}
