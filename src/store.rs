use chrono::prelude::*;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::error::ApiError;
use crate::ingest::{ArchiveMeta, ParsedFile};
use crate::models;

/// Typed persistence operations over the inventory tables. All multi-step
/// writes run inside a transaction; the store never creates rows on lookup.
#[derive(Clone)]
pub struct CertStore {
    pool: crate::DBPool,
}

impl CertStore {
    pub fn new(pool: crate::DBPool) -> CertStore {
        CertStore { pool }
    }

    async fn conn(&self) -> Result<crate::DBConn, ApiError> {
        match self.pool.get().await {
            Ok(c) => Ok(c),
            Err(e) => {
                warn!("Failed to get DB connection: {}", e);
                Err(ApiError::Internal("database unavailable".to_string()))
            }
        }
    }

    pub async fn lookup_by_fingerprint(
        &self,
        fp: &str,
    ) -> Result<Option<models::Certificate>, ApiError> {
        let mut conn = self.conn().await?;
        Ok(crate::schema::certificates::dsl::certificates
            .filter(crate::schema::certificates::dsl::fingerprint.eq(fp))
            .get_result(&mut conn)
            .await
            .optional()?)
    }

    /// Insert a newly issued certificate. For a root enrollment (`previous`
    /// is none) the `first` pointer is backfilled to the new certid inside
    /// the same transaction.
    pub async fn insert_issued(&self, new: models::Certificate) -> Result<i32, ApiError> {
        let mut conn = self.conn().await?;
        let certid = new.certid;
        conn.transaction(|conn| Box::pin(async move {
            diesel::insert_into(crate::schema::certificates::dsl::certificates)
                .values(&new)
                .execute(conn)
                .await?;
            if new.previous.is_none() {
                diesel::update(
                    crate::schema::certificates::dsl::certificates.find(new.certid)
                )
                    .set(crate::schema::certificates::dsl::first.eq(new.certid))
                    .execute(conn)
                    .await?;
            }
            Ok::<(), diesel::result::Error>(())
        }))
        .await?;
        Ok(certid)
    }

    pub async fn set_revoked(&self, fp: &str) -> Result<(), ApiError> {
        let mut conn = self.conn().await?;
        diesel::update(
            crate::schema::certificates::dsl::certificates
                .filter(crate::schema::certificates::dsl::fingerprint.eq(fp)),
        )
        .set(crate::schema::certificates::dsl::revoked.eq(true))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    pub async fn waiting_lookup(
        &self,
        ip: &str,
    ) -> Result<Option<models::WaitingEntry>, ApiError> {
        let mut conn = self.conn().await?;
        Ok(crate::schema::waiting_for_approval::dsl::waiting_for_approval
            .find(ip)
            .get_result(&mut conn)
            .await
            .optional()?)
    }

    pub async fn waiting_insert(&self, entry: models::WaitingEntry) -> Result<(), ApiError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(crate::schema::waiting_for_approval::dsl::waiting_for_approval)
            .values(&entry)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn waiting_delete(&self, ip: &str) -> Result<(), ApiError> {
        let mut conn = self.conn().await?;
        diesel::delete(crate::schema::waiting_for_approval::dsl::waiting_for_approval.find(ip))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn iprange_contains(&self, ip: std::net::IpAddr) -> Result<bool, ApiError> {
        let mut conn = self.conn().await?;
        let ranges: Vec<models::IpRange> = crate::schema::ipranges::dsl::ipranges
            .load(&mut conn)
            .await?;
        for range in ranges {
            match range.iprange.parse::<ipnet::IpNet>() {
                Ok(net) => {
                    if net.contains(&ip) {
                        return Ok(true);
                    }
                }
                Err(_) => warn!("Ignoring malformed CIDR in ipranges: {}", range.iprange),
            }
        }
        Ok(false)
    }

    pub async fn hostname_for(&self, fp: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn().await?;
        let hostname: Option<Option<String>> = crate::schema::hostinfo::dsl::hostinfo
            .find(fp)
            .select(crate::schema::hostinfo::dsl::hostname)
            .get_result(&mut conn)
            .await
            .optional()?;
        Ok(hostname.flatten())
    }

    /// After a renewal, repoint every row keyed on the old fingerprint to
    /// the new one. A single commit covers both tables so readers never see
    /// a half-renamed host.
    pub async fn rewrite_fingerprint(&self, old_fp: &str, new_fp: &str) -> Result<(), ApiError> {
        let mut conn = self.conn().await?;
        let old_fp = old_fp.to_string();
        let new_fp = new_fp.to_string();
        conn.transaction(|conn| Box::pin(async move {
            diesel::update(
                crate::schema::hostinfo::dsl::hostinfo
                    .filter(crate::schema::hostinfo::dsl::certfp.eq(&old_fp)),
            )
            .set(crate::schema::hostinfo::dsl::certfp.eq(&new_fp))
            .execute(conn)
            .await?;
            diesel::update(
                crate::schema::files::dsl::files
                    .filter(crate::schema::files::dsl::certfp.eq(&old_fp)),
            )
            .set(crate::schema::files::dsl::certfp.eq(&new_fp))
            .execute(conn)
            .await?;
            Ok::<(), diesel::result::Error>(())
        }))
        .await?;
        Ok(())
    }

    /// All database work for one archive: per-file duplicate suppression,
    /// the current-flag swap, inserts, and host-liveness upkeep, in a
    /// single transaction. Any error rolls the whole archive back.
    pub async fn ingest_archive(
        &self,
        meta: ArchiveMeta,
        parsed: Vec<ParsedFile>,
    ) -> Result<(), ApiError> {
        let mut conn = self.conn().await?;
        conn.transaction(|conn| Box::pin(async move {
            use crate::schema::{certificates, files, hostinfo};

            let originalcertid: Option<i32> = certificates::dsl::certificates
                .filter(certificates::dsl::fingerprint.eq(&meta.certfp))
                .select(certificates::dsl::certid)
                .get_result(conn)
                .await
                .optional()?;

            // MarkAllNonCurrent runs at most once per archive, and only if
            // some file actually changed.
            let mut cleared = false;
            for pf in &parsed {
                let latest_crc: Option<i32> = files::dsl::files
                    .filter(files::dsl::certfp.eq(&meta.certfp))
                    .filter(files::dsl::filename.eq(&pf.filename))
                    .order(files::dsl::received.desc())
                    .select(files::dsl::crc32)
                    .first(conn)
                    .await
                    .optional()?;
                if latest_crc == Some(pf.crc32) {
                    debug!("{} is unchanged, suppressing insert", pf.filename);
                    continue;
                }

                if !cleared {
                    diesel::update(
                        files::dsl::files
                            .filter(files::dsl::certfp.eq(&meta.certfp))
                            .filter(files::dsl::current),
                    )
                    .set(files::dsl::current.eq(false))
                    .execute(conn)
                    .await?;
                    cleared = true;
                }

                diesel::insert_into(files::dsl::files)
                    .values(&models::NewFileRecord {
                        ipaddr: meta.ip.clone(),
                        os_hostname: meta.os_hostname.clone(),
                        certcn: meta.certcn.clone(),
                        certfp: meta.certfp.clone(),
                        filename: pf.filename.clone(),
                        received: meta.received,
                        mtime: pf.mtime,
                        content: pf.content.clone(),
                        crc32: pf.crc32,
                        is_command: pf.is_command,
                        clientversion: meta.clientversion.clone(),
                        originalcertid,
                    })
                    .execute(conn)
                    .await?;
            }

            // Host-liveness upkeep happens whether or not any file changed.
            let existing: Option<models::HostInfo> = hostinfo::dsl::hostinfo
                .find(&meta.certfp)
                .get_result(conn)
                .await
                .optional()?;
            match existing {
                None => {
                    diesel::insert_into(hostinfo::dsl::hostinfo)
                        .values(&models::HostInfo {
                            certfp: meta.certfp.clone(),
                            hostname: None,
                            ipaddr: meta.ip.clone(),
                            os_hostname: meta.os_hostname.clone(),
                            lastseen: Some(meta.received),
                            clientversion: meta.clientversion.clone(),
                            dnsttl: None,
                        })
                        .execute(conn)
                        .await?;
                }
                Some(host) => {
                    // lastseen only moves forward
                    if host.lastseen.map_or(true, |t| t < meta.received) {
                        diesel::update(
                            hostinfo::dsl::hostinfo.find(&meta.certfp),
                        )
                        .set((
                            hostinfo::dsl::lastseen.eq(meta.received),
                            hostinfo::dsl::clientversion.eq(meta.clientversion.clone()),
                        ))
                        .execute(conn)
                        .await?;
                    }
                    // identity drift invalidates the cached DNS state
                    if host.ipaddr != meta.ip || host.os_hostname != meta.os_hostname {
                        diesel::update(
                            hostinfo::dsl::hostinfo.find(&meta.certfp),
                        )
                        .set((
                            hostinfo::dsl::ipaddr.eq(meta.ip.clone()),
                            hostinfo::dsl::os_hostname.eq(meta.os_hostname.clone()),
                            hostinfo::dsl::dnsttl.eq(None::<NaiveDateTime>),
                        ))
                        .execute(conn)
                        .await?;
                    }
                }
            }

            Ok::<(), diesel::result::Error>(())
        }))
        .await?;
        Ok(())
    }
}
