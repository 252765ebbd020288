use chrono::prelude::*;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::ApiError;
use crate::store::CertStore;

#[derive(Debug, Clone)]
pub struct ArchiveMeta {
    pub received: NaiveDateTime,
    pub certfp: String,
    pub ip: Option<String>,
    pub os_hostname: Option<String>,
    pub certcn: Option<String>,
    pub clientversion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub filename: String,
    pub content: String,
    pub crc32: i32,
    pub is_command: bool,
    pub mtime: NaiveDateTime,
}

// Host keys and logs must never reach the database.
const SENSITIVE_FILES: &[&str] = &[
    "files/etc/ssh/ssh_host_rsa_key",
    "files/etc/ssh/ssh_host_dsa_key",
    "files/etc/ssh/ssh_host_ecdsa_key",
];
const SENSITIVE_DIRS: &[&str] = &["files/var/log"];

/// Process one queued archive end to end: extract into a scratch directory,
/// scrub and normalize every file, and commit the result in a single
/// transaction. The queue files are only removed after the commit; any
/// failure leaves them in place for reprocessing.
pub async fn process_archive(
    store: &CertStore,
    queue_dir: &Path,
    basename: &str,
) -> Result<(), ApiError> {
    if basename.contains('/') || basename.contains('\\') {
        return Err(ApiError::Forbidden(
            "file parameter must not contain path separators".to_string(),
        ));
    }

    let archive_path = queue_dir.join(basename);
    if !archive_path.is_file() {
        return Err(ApiError::Gone(format!("no such queued archive: {}", basename)));
    }
    let meta_path = queue_dir.join(format!("{}.meta", basename));
    let meta_text = std::fs::read_to_string(&meta_path)?;
    let meta = archive_meta(&parse_meta(&meta_text))
        .ok_or_else(|| ApiError::Internal("archive metadata is incomplete".to_string()))?;

    // The TempDir guard removes the scratch tree on every exit path.
    let scratch = tempfile::tempdir()?;

    if basename.ends_with(".tgz") {
        extract_tgz(&archive_path, scratch.path())
            .map_err(|e| ApiError::Internal(format!("failed to extract archive: {}", e)))?;
    } else if basename.ends_with(".zip") {
        extract_zip(&archive_path, scratch.path())
            .map_err(|e| ApiError::Internal(format!("failed to extract archive: {}", e)))?;
        normalize_utf16_files(scratch.path())?;
    } else {
        return Err(ApiError::Internal(format!(
            "unsupported archive format: {}",
            basename
        )));
    }

    strip_sensitive_files(scratch.path());

    let mut parsed = Vec::new();
    collect_files(scratch.path(), &mut parsed)?;
    info!(
        "Ingesting {}: {} file(s) from {}",
        basename,
        parsed.len(),
        meta.certfp
    );

    store.ingest_archive(meta, parsed).await?;

    std::fs::remove_file(&archive_path)?;
    std::fs::remove_file(&meta_path)?;
    Ok(())
}

/// One `key = value` per line; whitespace around `=` is trimmed, as are
/// trailing CR/LF.
pub fn parse_meta(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn archive_meta(map: &HashMap<String, String>) -> Option<ArchiveMeta> {
    let received = map
        .get("received")?
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))?
        .naive_utc();
    let nonempty = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
    Some(ArchiveMeta {
        received,
        certfp: map.get("certfp").filter(|v| !v.is_empty())?.clone(),
        ip: nonempty("ip"),
        os_hostname: nonempty("os_hostname"),
        certcn: nonempty("certcn"),
        clientversion: nonempty("clientversion"),
    })
}

fn extract_tgz(archive: &Path, dest: &Path) -> Result<(), String> {
    let file = std::fs::File::open(archive).map_err(|e| format!("failed to open archive: {}", e))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    for entry in tar.entries().map_err(|e| format!("failed to read archive: {}", e))? {
        let mut entry = entry.map_err(|e| format!("failed to read archive entry: {}", e))?;
        // unpack_in refuses entries that would land outside dest
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| format!("failed to unpack archive entry: {}", e))?;
        if !unpacked {
            warn!("Skipping archive entry that escapes the extraction root");
        }
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), String> {
    let file = std::fs::File::open(archive).map_err(|e| format!("failed to open archive: {}", e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| format!("failed to read archive: {}", e))?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| format!("failed to read archive entry: {}", e))?;
        let name = entry.name().replace('\\', "/");
        let rel = match sanitize_entry_path(&name) {
            Some(p) => p,
            None => {
                warn!("Skipping archive entry with unsafe path: {}", name);
                continue;
            }
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| format!("failed to create directory: {}", e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create directory: {}", e))?;
        }
        let mut out = std::fs::File::create(&target)
            .map_err(|e| format!("failed to create file: {}", e))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| format!("failed to write file: {}", e))?;
    }
    Ok(())
}

/// Resolve an archive entry name to a path that stays inside the
/// extraction root. Absolute paths and parent references are rejected.
fn sanitize_entry_path(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

// Zip archives from some platforms carry UTF-16 LE text files. Anything
// starting with the FF FE byte order mark is rewritten as UTF-8 in place.
fn normalize_utf16_files(root: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            normalize_utf16_files(&path)?;
        } else if entry.file_type()?.is_file() {
            let bytes = std::fs::read(&path)?;
            if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
                let (text, _, _) = encoding_rs::UTF_16LE.decode(&bytes);
                std::fs::write(&path, text.as_bytes())?;
            }
        }
    }
    Ok(())
}

fn strip_sensitive_files(root: &Path) {
    for rel in SENSITIVE_FILES {
        let path = root.join(rel);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed sensitive file {}", rel),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", rel, e),
        }
    }
    for rel in SENSITIVE_DIRS {
        let path = root.join(rel);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!("Removed sensitive directory {}", rel),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", rel, e),
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<ParsedFile>) -> Result<(), ApiError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else if entry.file_type()?.is_file() {
            match parse_one_file(&path) {
                Ok(Some(pf)) => out.push(pf),
                Ok(None) => {}
                // a broken file skips, the walk continues
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
    }
    Ok(())
}

fn parse_one_file(path: &Path) -> Result<Option<ParsedFile>, String> {
    let class = match classify(&path.to_string_lossy()) {
        Some(c) => c,
        None => return Ok(None),
    };

    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| format!("failed to stat: {}", e))?;
    let mtime = DateTime::<Utc>::from(modified).naive_utc();

    let bytes = std::fs::read(path).map_err(|e| format!("failed to read: {}", e))?;
    let text = decode_text(&bytes);

    let (filename, content, is_command) = match class {
        FileClass::Command => {
            let (cmd, rest) = match text.split_once('\n') {
                Some((cmd, rest)) => (cmd.trim_end_matches('\r').to_string(), rest.to_string()),
                None => (text.clone(), String::new()),
            };
            if cmd.is_empty() {
                return Err("command file without a command line".to_string());
            }
            debug!("Command output for {}", shorten_cmd(&cmd));
            (cmd, rest, true)
        }
        FileClass::File(name) => (name, text, false),
    };

    let content = scrub_control_chars(&content);
    let crc32 = signed_crc32(content.as_bytes());

    Ok(Some(ParsedFile { filename, content, crc32, is_command, mtime }))
}

enum FileClass {
    Command,
    File(String),
}

/// A path is ingested only when it carries a `/files/` or `/commands/`
/// segment. For plain files the stored name is the sub-path after
/// `/files`, so `.../files/etc/hostname` becomes `/etc/hostname`.
fn classify(path: &str) -> Option<FileClass> {
    if path.contains("/commands/") {
        Some(FileClass::Command)
    } else {
        path.find("/files/")
            .map(|idx| FileClass::File(path[idx + "/files".len()..].to_string()))
    }
}

/// Strict UTF-8 first; anything else is read as Latin-1, where every byte
/// maps to the code point of the same value.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Replace control characters with spaces, keeping TAB, LF and CR.
pub fn scrub_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}' => ' ',
            c => c,
        })
        .collect()
}

/// CRC-32/IEEE reinterpreted as signed, to match the column type.
pub fn signed_crc32(data: &[u8]) -> i32 {
    crc32fast::hash(data) as i32
}

/// Abbreviate a command string to a name that is safe for file systems and
/// logs. The result never looks like a plain hex string, so it cannot be
/// mistaken for a fingerprint.
pub fn shorten_cmd(cmd: &str) -> String {
    let mut out: String = cmd
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(31)
        .collect();
    if !out.is_empty() && out.chars().all(|c| c.is_ascii_hexdigit()) {
        if out.len() == 31 {
            out.pop();
        }
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn meta_lines_are_trimmed() {
        let map = parse_meta("received = 1700000000\ncertfp=AABB\r\n ip =  10.0.0.5 \nbogus line\n");
        assert_eq!(map.get("received").map(String::as_str), Some("1700000000"));
        assert_eq!(map.get("certfp").map(String::as_str), Some("AABB"));
        assert_eq!(map.get("ip").map(String::as_str), Some("10.0.0.5"));
        assert!(!map.contains_key("bogus line"));
    }

    #[test]
    fn meta_requires_certfp() {
        let mut map = HashMap::new();
        map.insert("received".to_string(), "1700000000".to_string());
        assert!(archive_meta(&map).is_none());
        map.insert("certfp".to_string(), "AA11".to_string());
        let meta = archive_meta(&map).unwrap();
        assert_eq!(meta.certfp, "AA11");
        assert_eq!(meta.received.and_utc().timestamp(), 1700000000);
        assert!(meta.ip.is_none());
    }

    #[test]
    fn classification_by_path_segment() {
        match classify("/tmp/scratch123/files/etc/hostname") {
            Some(FileClass::File(name)) => assert_eq!(name, "/etc/hostname"),
            _ => panic!("expected a file"),
        }
        assert!(matches!(
            classify("/tmp/scratch123/commands/dmesg"),
            Some(FileClass::Command)
        ));
        assert!(classify("/tmp/scratch123/README").is_none());
    }

    #[test]
    fn entry_paths_cannot_escape() {
        assert!(sanitize_entry_path("../evil").is_none());
        assert!(sanitize_entry_path("a/../../evil").is_none());
        assert!(sanitize_entry_path("/etc/passwd").is_none());
        assert_eq!(
            sanitize_entry_path("./files/etc/hostname"),
            Some(PathBuf::from("files/etc/hostname"))
        );
    }

    #[test]
    fn latin1_fallback_preserves_code_points() {
        // "blåbærsyltetøy" in Latin-1
        let bytes = b"bl\xe5b\xe6rsyltet\xf8y";
        assert_eq!(decode_text(bytes), "blåbærsyltetøy");
        // already valid UTF-8 passes through unchanged
        assert_eq!(decode_text("blåbær".as_bytes()), "blåbær");
        // the high Latin-1 range becomes valid UTF-8
        let all: Vec<u8> = (0xA0..=0xFF).collect();
        let decoded = decode_text(&all);
        assert_eq!(decoded.chars().count(), all.len());
        for (b, c) in all.iter().zip(decoded.chars()) {
            assert_eq!(*b as u32, c as u32);
        }
    }

    #[test]
    fn scrub_keeps_tab_lf_cr() {
        assert_eq!(scrub_control_chars("a\x00b\x1fc"), "a b c");
        assert_eq!(scrub_control_chars("a\tb\nc\rd"), "a\tb\nc\rd");
        assert_eq!(scrub_control_chars("\x0b\x0c"), "  ");
        // \x0d and \x0a stay, \x0e goes
        assert_eq!(scrub_control_chars("x\x0ey"), "x y");
    }

    #[test]
    fn crc_reinterpretation_round_trips() {
        for v in [0u32, 1, 0x7FFF_FFFF, 0x8000_0000, 0xFFFF_FFFF, 0xDEAD_BEEF] {
            assert_eq!((v as i32) as u32, v);
        }
        assert_eq!(signed_crc32(b""), 0);
        // crc32("a") = 0xE8B7BE43, above 0x7FFFFFFF, so it stores negative
        let crc = signed_crc32(b"a");
        assert!(crc < 0);
        assert_eq!(crc as u32, 0xE8B7_BE43);
    }

    #[test]
    fn shorten_cmd_properties() {
        let long = shorten_cmd("/usr/sbin/dmidecode --type system | grep -i serial");
        assert!(long.len() <= 31);
        assert!(long.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(shorten_cmd("ls -l"), shorten_cmd("ls -l"));
        // pure hex gains a trailing underscore
        let hexish = shorten_cmd("deadbeef");
        assert_eq!(hexish, "deadbeef_");
        let long_hex = shorten_cmd(&"a".repeat(40));
        assert!(long_hex.len() <= 31);
        assert!(long_hex.ends_with('_'));
    }

    #[test]
    fn utf16_bom_files_are_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files").join("report.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0xFF, 0xFE]).unwrap();
        for unit in "høst".encode_utf16() {
            f.write_all(&unit.to_le_bytes()).unwrap();
        }
        drop(f);

        normalize_utf16_files(dir.path()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "høst");
    }

    #[test]
    fn sensitive_paths_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("files/etc/ssh/ssh_host_rsa_key");
        let log = dir.path().join("files/var/log/messages");
        let keep = dir.path().join("files/etc/hostname");
        for p in [&key, &log, &keep] {
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, "x").unwrap();
        }

        strip_sensitive_files(dir.path());
        assert!(!key.exists());
        assert!(!log.exists());
        assert!(keep.exists());
    }

    #[test]
    fn command_files_take_the_name_from_the_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands").join("dmesg");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "/bin/dmesg\r\nline one\nline two\n").unwrap();

        let pf = parse_one_file(&path).unwrap().unwrap();
        assert!(pf.is_command);
        assert_eq!(pf.filename, "/bin/dmesg");
        assert_eq!(pf.content, "line one\nline two\n");
    }

    #[test]
    fn plain_files_keep_the_sub_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files/etc/hostname");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "h5.example.org\n").unwrap();

        let pf = parse_one_file(&path).unwrap().unwrap();
        assert!(!pf.is_command);
        assert_eq!(pf.filename, "/etc/hostname");
        assert_eq!(pf.content, "h5.example.org\n");
        assert_eq!(pf.crc32, signed_crc32(b"h5.example.org\n"));
    }
}
