use super::schema::*;
use chrono::prelude::*;
use diesel::prelude::*;

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Debug, Clone)]
#[diesel(table_name = certificates, primary_key(certid))]
pub struct Certificate {
    pub certid: i32,
    pub fingerprint: String,
    pub commonname: String,
    pub issued: NaiveDateTime,
    pub revoked: bool,
    pub previous: Option<i32>,
    pub first: Option<i32>,
    pub cert: String,
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Debug, Clone)]
#[diesel(table_name = waiting_for_approval, primary_key(ipaddr))]
pub struct WaitingEntry {
    pub ipaddr: String,
    pub hostname: String,
    pub received: NaiveDateTime,
    pub approved: bool,
}

#[derive(Insertable, Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = hostinfo, primary_key(certfp))]
pub struct HostInfo {
    pub certfp: String,
    pub hostname: Option<String>,
    pub ipaddr: Option<String>,
    pub os_hostname: Option<String>,
    pub lastseen: Option<NaiveDateTime>,
    pub clientversion: Option<String>,
    pub dnsttl: Option<NaiveDateTime>,
}

// fileid and current are assigned by the database on insert.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = files)]
pub struct NewFileRecord {
    pub ipaddr: Option<String>,
    pub os_hostname: Option<String>,
    pub certcn: Option<String>,
    pub certfp: String,
    pub filename: String,
    pub received: NaiveDateTime,
    pub mtime: NaiveDateTime,
    pub content: String,
    pub crc32: i32,
    pub is_command: bool,
    pub clientversion: Option<String>,
    pub originalcertid: Option<i32>,
}

#[derive(Insertable, Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = ipranges, primary_key(iprange))]
pub struct IpRange {
    pub iprange: String,
}
