use chrono::prelude::*;
use fs2::FileExt;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};

const KEY_BITS: u32 = 4096;
const CERT_LIFETIME_DAYS: i64 = 365;

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("another signing operation is already in progress")]
    Busy,
    #[error("{0}")]
    Signing(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct IssuedCert {
    pub cert: openssl::x509::X509,
    pub pem: String,
    pub serial: i32,
}

// The serial counter file is shared with any other process signing under the
// same confdir, so mutual exclusion uses an advisory file lock rather than an
// in-process mutex.
pub struct CaIssuer {
    ca_cert: openssl::x509::X509,
    ca_key: openssl::pkey::PKey<openssl::pkey::Private>,
    db_dir: PathBuf,
    certs_dir: PathBuf,
}

struct SigningLock(std::fs::File);

impl Drop for SigningLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl CaIssuer {
    pub fn open(confdir: &Path) -> Result<CaIssuer, String> {
        let ca_dir = confdir.join("CA");
        let cert_pem = std::fs::read(ca_dir.join("cacert.pem"))
            .map_err(|e| format!("failed to read CA certificate: {}", e))?;
        let key_pem = std::fs::read(ca_dir.join("cakey.pem"))
            .map_err(|e| format!("failed to read CA key: {}", e))?;
        let ca_cert = openssl::x509::X509::from_pem(&cert_pem)
            .map_err(|e| format!("failed to parse CA certificate: {}", e))?;
        let ca_key = openssl::pkey::PKey::private_key_from_pem(&key_pem)
            .map_err(|e| format!("failed to parse CA key: {}", e))?;
        Self::new(ca_cert, ca_key, confdir)
    }

    fn new(
        ca_cert: openssl::x509::X509,
        ca_key: openssl::pkey::PKey<openssl::pkey::Private>,
        confdir: &Path,
    ) -> Result<CaIssuer, String> {
        let db_dir = confdir.join("db");
        let certs_dir = confdir.join("certs");
        std::fs::create_dir_all(&db_dir)
            .map_err(|e| format!("failed to create {}: {}", db_dir.display(), e))?;
        std::fs::create_dir_all(&certs_dir)
            .map_err(|e| format!("failed to create {}: {}", certs_dir.display(), e))?;
        Ok(CaIssuer { ca_cert, ca_key, db_dir, certs_dir })
    }

    /// Generate a keypair and sign a certificate for `common_name`. The
    /// signing lock is held across the whole keygen -> CSR -> sign ->
    /// read-serial sequence; if it is already held the call fails with
    /// `Busy` instead of queueing.
    pub fn issue(
        &self,
        common_name: &str,
    ) -> Result<(openssl::pkey::PKey<openssl::pkey::Private>, IssuedCert), IssueError> {
        let _lock = self.acquire_lock()?;
        let (key, csr) = self.generate_key_and_csr(common_name).map_err(IssueError::Signing)?;
        let issued = self.sign_locked(&csr, common_name)?;
        Ok((key, issued))
    }

    fn acquire_lock(&self) -> Result<SigningLock, IssueError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.db_dir.join("signing.lock"))?;
        if file.try_lock_exclusive().is_err() {
            return Err(IssueError::Busy);
        }
        Ok(SigningLock(file))
    }

    pub fn generate_key_and_csr(
        &self,
        common_name: &str,
    ) -> Result<(openssl::pkey::PKey<openssl::pkey::Private>, openssl::x509::X509Req), String> {
        let rsa = openssl::rsa::Rsa::generate(KEY_BITS)
            .map_err(|e| format!("failed to generate RSA key: {}", e))?;
        let key = openssl::pkey::PKey::from_rsa(rsa)
            .map_err(|e| format!("failed to wrap RSA key: {}", e))?;

        let mut name = openssl::x509::X509NameBuilder::new()
            .map_err(|e| format!("failed to build subject name: {}", e))?;
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, common_name)
            .map_err(|e| format!("failed to set common name: {}", e))?;
        let name = name.build();

        let mut req = openssl::x509::X509ReqBuilder::new()
            .map_err(|e| format!("failed to build CSR: {}", e))?;
        req.set_subject_name(&name)
            .map_err(|e| format!("failed to set CSR subject: {}", e))?;
        req.set_pubkey(&key)
            .map_err(|e| format!("failed to set CSR public key: {}", e))?;
        req.sign(&key, openssl::hash::MessageDigest::sha256())
            .map_err(|e| format!("failed to sign CSR: {}", e))?;

        Ok((key, req.build()))
    }

    fn sign_locked(
        &self,
        csr: &openssl::x509::X509Req,
        common_name: &str,
    ) -> Result<IssuedCert, IssueError> {
        let serial_path = self.db_dir.join("serial");
        let next = match std::fs::read_to_string(&serial_path) {
            Ok(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|e| IssueError::Signing(format!("corrupt serial file: {}", e)))?
                + 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };

        let cert = self.build_cert(csr, common_name, next).map_err(IssueError::Signing)?;

        std::fs::write(&serial_path, format!("{}\n", next))?;
        let mut index = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.db_dir.join("index.txt"))?;
        writeln!(
            index,
            "{}\t{}\t{}",
            next,
            common_name,
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        )?;

        // The issued certificate passes through the transient output
        // directory and is removed once read back.
        let suffix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let out_path = self.certs_dir.join(format!("user{}.crt", suffix));
        let pem_bytes = cert
            .to_pem()
            .map_err(|e| IssueError::Signing(format!("failed to encode certificate: {}", e)))?;
        std::fs::write(&out_path, pem_bytes)?;
        let pem = std::fs::read_to_string(&out_path);
        let _ = std::fs::remove_file(&out_path);
        let pem = pem?;

        // The serial is read back from the counter file after signing.
        let serial = std::fs::read_to_string(&serial_path)?
            .trim()
            .parse::<i32>()
            .map_err(|e| IssueError::Signing(format!("corrupt serial file: {}", e)))?;

        Ok(IssuedCert { cert, pem, serial })
    }

    fn build_cert(
        &self,
        csr: &openssl::x509::X509Req,
        common_name: &str,
        serial: i32,
    ) -> Result<openssl::x509::X509, String> {
        let serial_bn = openssl::bn::BigNum::from_u32(serial as u32)
            .map_err(|e| format!("failed to make serial number: {}", e))?;

        let mut subject_name = openssl::x509::X509NameBuilder::new()
            .map_err(|e| format!("failed to build subject name: {}", e))?;
        subject_name
            .append_entry_by_nid(openssl::nid::Nid::COMMONNAME, common_name)
            .map_err(|e| format!("failed to set common name: {}", e))?;
        let subject_name = subject_name.build();

        let now = Utc::now();
        let expiry = now + chrono::Duration::days(CERT_LIFETIME_DAYS);

        let mut builder = openssl::x509::X509Builder::new()
            .map_err(|e| format!("failed to build builder: {}", e))?;
        builder.set_version(2)
            .map_err(|e| format!("failed to set certificate version: {}", e))?;
        builder.set_pubkey(
            csr.public_key()
                .map_err(|e| format!("failed to get public key from CSR: {}", e))?.as_ref()
        ).map_err(|e| format!("failed to set public key: {}", e))?;
        builder.set_serial_number(
            serial_bn.to_asn1_integer()
                .map_err(|e| format!("failed to make serial number: {}", e))?.as_ref()
        ).map_err(|e| format!("failed to set serial number: {}", e))?;
        builder.set_not_before(
            openssl::asn1::Asn1Time::from_unix(now.timestamp())
                .map_err(|e| format!("failed to make not before: {}", e))?.as_ref()
        ).map_err(|e| format!("failed to set not before: {}", e))?;
        builder.set_not_after(
            openssl::asn1::Asn1Time::from_unix(expiry.timestamp())
                .map_err(|e| format!("failed to make not after: {}", e))?.as_ref()
        ).map_err(|e| format!("failed to set not after: {}", e))?;
        builder.set_issuer_name(self.ca_cert.subject_name())
            .map_err(|e| format!("failed to set issuer name: {}", e))?;
        builder.set_subject_name(&subject_name)
            .map_err(|e| format!("failed to set subject name: {}", e))?;

        let bc = openssl::x509::extension::BasicConstraints::new()
            .critical()
            .build()
            .map_err(|e| format!("failed to build basic constraints: {}", e))?;
        builder.append_extension(bc)
            .map_err(|e| format!("failed to add basic constraints: {}", e))?;

        let mut ku = openssl::x509::extension::KeyUsage::new();
        ku.critical();
        ku.digital_signature();
        ku.key_encipherment();
        let ku = ku.build()
            .map_err(|e| format!("failed to build key usage: {}", e))?;
        builder.append_extension(ku)
            .map_err(|e| format!("failed to add key usage: {}", e))?;

        let mut eku = openssl::x509::extension::ExtendedKeyUsage::new();
        eku.client_auth();
        let eku = eku.build()
            .map_err(|e| format!("failed to build extended key usage: {}", e))?;
        builder.append_extension(eku)
            .map_err(|e| format!("failed to add extended key usage: {}", e))?;

        let context = builder.x509v3_context(Some(&self.ca_cert), None);
        let ski = openssl::x509::extension::SubjectKeyIdentifier::new()
            .build(&context)
            .map_err(|e| format!("failed to build SKI: {}", e))?;
        builder.append_extension(ski)
            .map_err(|e| format!("failed to add SKI: {}", e))?;

        let mut aki = openssl::x509::extension::AuthorityKeyIdentifier::new();
        aki.keyid(false);
        aki.issuer(false);
        let context = builder.x509v3_context(Some(&self.ca_cert), None);
        let aki = aki.build(&context)
            .map_err(|e| format!("failed to build AKI: {}", e))?;
        builder.append_extension(aki)
            .map_err(|e| format!("failed to add AKI: {}", e))?;

        builder.sign(&self.ca_key, openssl::hash::MessageDigest::sha256())
            .map_err(|e| format!("failed to sign certificate: {}", e))?;

        Ok(builder.build())
    }

    pub fn pkcs12_bundle(
        &self,
        key: &openssl::pkey::PKey<openssl::pkey::Private>,
        cert: &openssl::x509::X509,
    ) -> Result<Vec<u8>, String> {
        let mut ca_stack = openssl::stack::Stack::new()
            .map_err(|e| format!("failed to build CA stack: {}", e))?;
        ca_stack.push(self.ca_cert.clone())
            .map_err(|e| format!("failed to add CA certificate: {}", e))?;

        let mut builder = openssl::pkcs12::Pkcs12::builder();
        builder.name("nivlheim");
        builder.pkey(key);
        builder.cert(cert);
        builder.ca(ca_stack);
        let p12 = builder.build2("")
            .map_err(|e| format!("failed to build PKCS#12 bundle: {}", e))?;
        p12.to_der()
            .map_err(|e| format!("failed to encode PKCS#12 bundle: {}", e))
    }
}

/// SHA-1 over the DER encoding, uppercase hex without separators. This is
/// the durable key by which a certificate is referenced everywhere else.
pub fn fingerprint(cert: &openssl::x509::X509Ref) -> Result<String, openssl::error::ErrorStack> {
    let digest = cert.digest(openssl::hash::MessageDigest::sha1())?;
    Ok(digest.iter().map(|b| format!("{:02X}", b)).collect())
}

pub fn common_name(cert: &openssl::x509::X509Ref) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca(confdir: &Path) -> CaIssuer {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let key = openssl::pkey::PKey::from_rsa(rsa).unwrap();

        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, "Test CA").unwrap();
        let name = name.build();

        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(openssl::asn1::Asn1Time::days_from_now(0).unwrap().as_ref())
            .unwrap();
        builder
            .set_not_after(openssl::asn1::Asn1Time::days_from_now(3650).unwrap().as_ref())
            .unwrap();
        builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();

        CaIssuer::new(builder.build(), key, confdir).unwrap()
    }

    #[test]
    fn issue_assigns_serials_from_the_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca(dir.path());

        let (_key, first) = ca.issue("h1.example.org").unwrap();
        assert_eq!(first.serial, 1);
        assert_eq!(common_name(&first.cert).as_deref(), Some("h1.example.org"));
        assert!(first.pem.contains("BEGIN CERTIFICATE"));

        let fp = fingerprint(&first.cert).unwrap();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));

        let (_key, second) = ca.issue("h2.example.org").unwrap();
        assert_eq!(second.serial, 2);
        assert_ne!(fingerprint(&second.cert).unwrap(), fp);

        let stored = std::fs::read_to_string(dir.path().join("db/serial")).unwrap();
        assert_eq!(stored.trim(), "2");
    }

    #[test]
    fn signing_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca(dir.path());

        let held = ca.acquire_lock().unwrap();
        match ca.acquire_lock() {
            Err(IssueError::Busy) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }
        drop(held);
        assert!(ca.acquire_lock().is_ok());
    }
}
