/*!
fsproto.rs - The custom filesystem-over-Ethernet RPC (`spec.md` §4.7),
grounded on `original_source/edfs.c`. Nineteen functions, each taking a
request payload beginning at wire offset 0x3C and returning a response
payload at the same offset plus a two-byte result code at 0x3A/0x3B
(callers splice those in; this module only deals in payload bytes and
result codes).

Paths are mapped to a host filesystem below a configured root. Every path
encountered is assigned a 16-bit "cluster" identifier on first use (cluster
0 is always the root), matching `edfs_cluster_register`'s linear table.
*/

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, Timelike};

use super::translator;

/// Packs a timestamp into a DOS/FAT 16-bit time word (5 bits hour, 6 bits
/// minute, 5 bits 2-second-resolution seconds), matching
/// `edfs.c`'s `time_to_dos_time`.
fn dos_time(t: SystemTime) -> u16 {
    let local: DateTime<Local> = t.into();
    (local.second() as u16 / 2) | ((local.minute() as u16) << 5) | ((local.hour() as u16) << 11)
}

/// Packs a timestamp into a DOS/FAT 16-bit date word, matching
/// `edfs.c`'s `time_to_dos_date` (`tm_year - 80` is years since 1980).
fn dos_date(t: SystemTime) -> u16 {
    let local: DateTime<Local> = t.into();
    let years_since_1980 = local.year() as u16 - 1980;
    (local.day() as u16) | ((local.month() as u16) << 5) | (years_since_1980 << 9)
}

pub const FUNC_RMDIR: u8 = 0x01;
pub const FUNC_MKDIR: u8 = 0x03;
pub const FUNC_CHDIR: u8 = 0x05;
pub const FUNC_CLOSEFILE: u8 = 0x06;
pub const FUNC_READFILE: u8 = 0x08;
pub const FUNC_WRITEFILE: u8 = 0x09;
pub const FUNC_LOCK: u8 = 0x0A;
pub const FUNC_UNLOCK: u8 = 0x0B;
pub const FUNC_DISKSPACE: u8 = 0x0C;
pub const FUNC_SETATTR: u8 = 0x0E;
pub const FUNC_GETATTR: u8 = 0x0F;
pub const FUNC_RENAME: u8 = 0x11;
pub const FUNC_DELETE: u8 = 0x13;
pub const FUNC_OPEN: u8 = 0x16;
pub const FUNC_CREATE: u8 = 0x17;
pub const FUNC_FINDFIRST: u8 = 0x1B;
pub const FUNC_FINDNEXT: u8 = 0x1C;
pub const FUNC_SEEKFROMEND: u8 = 0x21;
pub const FUNC_SPOPNFIL: u8 = 0x2E;

pub const RESULT_OK: u16 = 0x00;
pub const RESULT_INVALID_FUNCTION: u16 = 0x01;
pub const RESULT_FILE_NOT_FOUND: u16 = 0x02;
pub const RESULT_PATH_NOT_FOUND: u16 = 0x03;
pub const RESULT_ACCESS_DENIED: u16 = 0x05;
pub const RESULT_NO_MORE_MATCH: u16 = 0x12;

pub const CLUSTER_MAX: usize = 1024;

struct FindState {
    entries: Vec<String>,
    next: usize,
}

pub struct FsProto {
    root: PathBuf,
    clusters: Vec<String>,
    find_handles: HashMap<u16, FindState>,
    next_find_handle: u16,
    open_files: HashMap<u16, fs::File>,
    next_file_handle: u16,
}

pub struct Response {
    pub result: u16,
    pub payload: Vec<u8>,
}

impl Response {
    fn ok(payload: Vec<u8>) -> Self {
        Self { result: RESULT_OK, payload }
    }

    fn err(code: u16) -> Self {
        Self { result: code, payload: Vec::new() }
    }
}

impl FsProto {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clusters: vec![String::new()], // cluster 0 = filesystem root
            find_handles: HashMap::new(),
            next_find_handle: 1,
            open_files: HashMap::new(),
            next_file_handle: 1,
        }
    }

    fn cluster_register(&mut self, host_path: &str) -> u16 {
        if let Some(idx) = self.clusters.iter().position(|p| p == host_path) {
            return idx as u16;
        }
        if self.clusters.len() >= CLUSTER_MAX {
            log::error!("fsproto: cluster table exhausted, refusing to register {host_path}");
            return 0;
        }
        self.clusters.push(host_path.to_string());
        (self.clusters.len() - 1) as u16
    }

    fn cluster_lookup(&self, cluster: u16) -> Option<&str> {
        self.clusters.get(cluster as usize).map(|s| s.as_str())
    }

    fn host_path(&self, relative: &str) -> PathBuf {
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Extracts a NUL-terminated (or whole-remainder) ASCII path from the
    /// payload and converts it to a host-relative path.
    fn path_from_payload(&self, payload: &[u8]) -> String {
        let raw = match payload.iter().position(|&b| b == 0) {
            Some(end) => &payload[..end],
            None => payload,
        };
        let wire = String::from_utf8_lossy(raw);
        translator::path83_to_host(&wire)
    }

    pub fn dispatch(&mut self, func: u8, payload: &[u8]) -> Response {
        match func {
            FUNC_MKDIR => self.mkdir(payload),
            FUNC_RMDIR => self.rmdir(payload),
            FUNC_CHDIR => self.chdir(payload),
            FUNC_OPEN => self.open_existing(payload),
            FUNC_CREATE => self.create(payload),
            FUNC_CLOSEFILE => self.close(payload),
            FUNC_READFILE => self.read(payload),
            FUNC_WRITEFILE => self.write(payload),
            FUNC_FINDFIRST => self.find_first(payload),
            FUNC_FINDNEXT => self.find_next(payload),
            FUNC_GETATTR => self.get_attr(payload),
            FUNC_SETATTR => self.set_attr(payload),
            FUNC_DELETE => self.delete(payload),
            FUNC_RENAME => self.rename(payload),
            FUNC_DISKSPACE => self.disk_space(),
            FUNC_LOCK | FUNC_UNLOCK | FUNC_SEEKFROMEND | FUNC_SPOPNFIL => Response::ok(Vec::new()),
            _ => {
                log::warn!("fsproto: unrecognized function code {func:#04x}");
                Response::err(RESULT_INVALID_FUNCTION)
            }
        }
    }

    fn mkdir(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        match fs::create_dir_all(&host) {
            Ok(()) => {
                self.cluster_register(&rel);
                Response::ok(Vec::new())
            }
            Err(_) => Response::err(RESULT_PATH_NOT_FOUND),
        }
    }

    fn rmdir(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        match fs::remove_dir(&host) {
            Ok(()) => {
                if let Some(idx) = self.clusters.iter().position(|p| p == &rel) {
                    self.clusters[idx].clear();
                }
                Response::ok(Vec::new())
            }
            Err(_) => Response::err(RESULT_PATH_NOT_FOUND),
        }
    }

    fn chdir(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        if host.is_dir() {
            let cluster = self.cluster_register(&rel);
            Response::ok(cluster.to_le_bytes().to_vec())
        } else {
            Response::err(RESULT_PATH_NOT_FOUND)
        }
    }

    fn open_existing(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        match fs::OpenOptions::new().read(true).write(true).open(&host) {
            Ok(file) => {
                let handle = self.next_file_handle;
                self.next_file_handle += 1;
                self.open_files.insert(handle, file);
                let cluster = self.cluster_register(&rel);
                let mut out = cluster.to_le_bytes().to_vec();
                out.extend_from_slice(&handle.to_le_bytes());
                Response::ok(out)
            }
            Err(_) => Response::err(RESULT_FILE_NOT_FOUND),
        }
    }

    fn create(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        if let Some(parent) = host.parent() {
            if !parent.exists() {
                return Response::err(RESULT_PATH_NOT_FOUND);
            }
        }
        match fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&host) {
            Ok(file) => {
                let handle = self.next_file_handle;
                self.next_file_handle += 1;
                self.open_files.insert(handle, file);
                let cluster = self.cluster_register(&rel);
                let mut out = cluster.to_le_bytes().to_vec();
                out.extend_from_slice(&handle.to_le_bytes());
                Response::ok(out)
            }
            Err(_) => Response::err(RESULT_ACCESS_DENIED),
        }
    }

    fn close(&mut self, payload: &[u8]) -> Response {
        if payload.len() >= 2 {
            let handle = u16::from_le_bytes([payload[0], payload[1]]);
            self.open_files.remove(&handle);
        }
        Response::ok(Vec::new())
    }

    fn read(&mut self, payload: &[u8]) -> Response {
        if payload.len() < 8 {
            return Response::err(RESULT_INVALID_FUNCTION);
        }
        let offset = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let handle = u16::from_le_bytes([payload[4], payload[5]]);
        let len = u16::from_le_bytes([payload[6], payload[7]]) as usize;
        let Some(file) = self.open_files.get_mut(&handle) else {
            return Response::err(RESULT_FILE_NOT_FOUND);
        };
        if file.seek(SeekFrom::Start(offset as u64)).is_err() {
            return Response::err(RESULT_FILE_NOT_FOUND);
        }
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).unwrap_or(0);
        buf.truncate(n);
        Response::ok(buf)
    }

    fn write(&mut self, payload: &[u8]) -> Response {
        if payload.len() < 8 {
            return Response::err(RESULT_INVALID_FUNCTION);
        }
        let offset = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let handle = u16::from_le_bytes([payload[4], payload[5]]);
        let len = u16::from_le_bytes([payload[6], payload[7]]) as usize;
        let data = &payload[8..(8 + len).min(payload.len())];
        let Some(file) = self.open_files.get_mut(&handle) else {
            return Response::err(RESULT_FILE_NOT_FOUND);
        };
        if file.seek(SeekFrom::Start(offset as u64)).is_err() || file.write_all(data).is_err() {
            return Response::err(RESULT_ACCESS_DENIED);
        }
        Response::ok((data.len() as u16).to_le_bytes().to_vec())
    }

    fn find_first(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        let mut entries: Vec<String> = match fs::read_dir(&host) {
            Ok(iter) => iter
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => return Response::err(RESULT_PATH_NOT_FOUND),
        };
        entries.sort();
        let handle = self.next_find_handle;
        self.next_find_handle = self.next_find_handle.wrapping_add(1).max(1);
        let name = entries.first().cloned();
        self.find_handles.insert(handle, FindState { entries, next: 1 });
        match name {
            Some(n) => Response::ok(Self::find_entry_payload(handle, &n)),
            None => Response::err(RESULT_NO_MORE_MATCH),
        }
    }

    fn find_next(&mut self, payload: &[u8]) -> Response {
        if payload.len() < 2 {
            return Response::err(RESULT_NO_MORE_MATCH);
        }
        let handle = u16::from_le_bytes([payload[0], payload[1]]);
        let Some(state) = self.find_handles.get_mut(&handle) else {
            return Response::err(RESULT_NO_MORE_MATCH);
        };
        if state.next >= state.entries.len() {
            self.find_handles.remove(&handle);
            return Response::err(RESULT_NO_MORE_MATCH);
        }
        let name = state.entries[state.next].clone();
        state.next += 1;
        Response::ok(Self::find_entry_payload(handle, &name))
    }

    fn find_entry_payload(handle: u16, name: &str) -> Vec<u8> {
        let mut out = handle.to_le_bytes().to_vec();
        let wire = translator::name_to_83(name);
        out.extend_from_slice(wire.as_bytes());
        out.push(0);
        out
    }

    fn get_attr(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        match fs::metadata(&host) {
            Ok(meta) => {
                // Wire order matches `edfs_getattr`: time(2) date(2) size(4)
                // attrib(1) - the attribute byte lands at payload offset 8,
                // i.e. frame offset 0x44.
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let mut out = Vec::with_capacity(9);
                out.extend_from_slice(&dos_time(mtime).to_le_bytes());
                out.extend_from_slice(&dos_date(mtime).to_le_bytes());
                out.extend_from_slice(&(meta.len() as u32).to_le_bytes());
                out.push(if meta.is_dir() { 0x10 } else { 0x00 });
                Response::ok(out)
            }
            Err(_) => Response::err(RESULT_FILE_NOT_FOUND),
        }
    }

    fn set_attr(&mut self, payload: &[u8]) -> Response {
        if payload.is_empty() {
            return Response::err(RESULT_INVALID_FUNCTION);
        }
        let rel = self.path_from_payload(&payload[1..]);
        let host = self.host_path(&rel);
        let attrib = payload[0];
        match fs::metadata(&host) {
            Ok(meta) => {
                let mut perms = meta.permissions();
                perms.set_readonly(attrib & 0x01 != 0);
                match fs::set_permissions(&host, perms) {
                    Ok(()) => Response::ok(Vec::new()),
                    Err(_) => Response::err(RESULT_ACCESS_DENIED),
                }
            }
            Err(_) => Response::err(RESULT_FILE_NOT_FOUND),
        }
    }

    fn delete(&mut self, payload: &[u8]) -> Response {
        let rel = self.path_from_payload(payload);
        let host = self.host_path(&rel);
        match fs::remove_file(&host) {
            Ok(()) => Response::ok(Vec::new()),
            Err(_) => Response::err(RESULT_FILE_NOT_FOUND),
        }
    }

    fn rename(&mut self, payload: &[u8]) -> Response {
        let Some(split) = payload.iter().position(|&b| b == 0) else {
            return Response::err(RESULT_INVALID_FUNCTION);
        };
        let from_rel = self.path_from_payload(&payload[..split]);
        let to_rel = self.path_from_payload(&payload[split + 1..]);
        let from_host = self.host_path(&from_rel);
        let to_host = self.host_path(&to_rel);
        // A rename that crosses into a different parent directory (and
        // therefore a different cluster) is handled conservatively: only
        // same-directory renames are permitted, matching the original's
        // single-cluster FCB assumption.
        if from_host.parent() != to_host.parent() {
            log::warn!("fsproto: cross-cluster rename rejected ({from_rel} -> {to_rel})");
            return Response::err(RESULT_ACCESS_DENIED);
        }
        match fs::rename(&from_host, &to_host) {
            Ok(()) => Response::ok(Vec::new()),
            Err(_) => Response::err(RESULT_FILE_NOT_FOUND),
        }
    }

    fn disk_space(&self) -> Response {
        // No portable free-space query in std; report a fixed generous
        // figure in 512-byte sectors, matching the emulator's fixed-size
        // hard disk rather than querying the host filesystem.
        let total_sectors: u32 = crate::harddisk::DISK_BYTES as u32 / 512;
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&total_sectors.to_le_bytes());
        out.extend_from_slice(&(total_sectors / 2).to_le_bytes());
        Response::ok(out)
    }
}

pub fn ensure_root_exists(root: &Path) -> std::io::Result<()> {
    fs::create_dir_all(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_then_getattr_reports_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FsProto::new(dir.path());
        let path = b"SUBDIR\0";
        let mkdir = fs.dispatch(FUNC_MKDIR, path);
        assert_eq!(mkdir.result, RESULT_OK);
        let attr = fs.dispatch(FUNC_GETATTR, path);
        assert_eq!(attr.result, RESULT_OK);
        // attrib byte sits at payload offset 8 (wire frame offset 0x44).
        assert_eq!(attr.payload[8], 0x10);
    }

    #[test]
    fn find_first_on_empty_directory_reports_no_more_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FsProto::new(dir.path());
        let resp = fs.dispatch(FUNC_FINDFIRST, b"\0");
        assert_eq!(resp.result, RESULT_NO_MORE_MATCH);
    }

    #[test]
    fn create_write_read_round_trips_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FsProto::new(dir.path());
        let create = fs.dispatch(FUNC_CREATE, b"FILE.TXT\0");
        assert_eq!(create.result, RESULT_OK);
        let handle = u16::from_le_bytes([create.payload[2], create.payload[3]]);

        let mut write_payload = 0u32.to_le_bytes().to_vec();
        write_payload.extend_from_slice(&handle.to_le_bytes());
        write_payload.extend_from_slice(&5u16.to_le_bytes());
        write_payload.extend_from_slice(b"hello");
        let write = fs.dispatch(FUNC_WRITEFILE, &write_payload);
        assert_eq!(write.result, RESULT_OK);

        let mut read_payload = 0u32.to_le_bytes().to_vec();
        read_payload.extend_from_slice(&handle.to_le_bytes());
        read_payload.extend_from_slice(&5u16.to_le_bytes());
        let read = fs.dispatch(FUNC_READFILE, &read_payload);
        assert_eq!(read.payload, b"hello");
    }

    #[test]
    fn unknown_function_reports_invalid_function() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FsProto::new(dir.path());
        let resp = fs.dispatch(0x7F, &[]);
        assert_eq!(resp.result, RESULT_INVALID_FUNCTION);
    }
}
