// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The in-drive-mutex back-end. Locks are identified by a
//! (vg_uuid, lv_uuid) pair with the dashes stripped, and each
//! operation addresses a list of drives: every "propeller" drive for
//! the global lock, the VG's PVs for the VG lock, the LV's PVs for an
//! LV lock. The value block is an 8-byte timestamp in microseconds,
//! bumped monotonically on every write; a reader finding a timestamp
//! other than the one it cached knows another host updated the lock
//! and must invalidate its metadata.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};

use crate::lockd::{
    AcquireFlags, HostRecord, HostState, LmError, LmResult, LockManager, LockMode, LockspaceInfo,
    PersistedInfo, ResType, Resource, ValBlk, VAL_BLK_VERSION,
};

/// Per-operation timeout handed to the drive firmware.
pub const IDM_TIMEOUT_MS: u64 = 60_000;

const IDM_MAGIC: u32 = 0x6d64_6931;
const RECORD_SIZE: usize = 128;
const KEY_LEN: usize = 64;

const MODE_FREE: u32 = 0;
const MODE_SH: u32 = 1;
const MODE_EX: u32 = 2;

fn now_micros() -> u64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1000) as u64
}

/// Strip the dashes out of an LVM UUID; the firmware identifies locks
/// by the bare 32 characters.
pub fn uuid_read_format(buffer: &str) -> LmResult<String> {
    let stripped: String = buffer.chars().filter(|c| *c != '-').collect();
    if stripped.len() != 32 {
        error!("couldn't read uuid: incorrect number of characters");
        return Err(LmError::Args(format!("bad uuid {}", buffer)));
    }
    Ok(stripped)
}

/// Clocks on different hosts need not agree to microsecond precision;
/// when time appears to go backwards, step past the cached value
/// instead.
fn update_vb_timestamp(vb_timestamp: &mut u64) {
    let utc_us = now_micros();
    if *vb_timestamp >= utc_us {
        *vb_timestamp += 1;
    } else {
        *vb_timestamp = utc_us;
    }
}

/// Drives that take part in the global lock: every SCSI device (bus
/// address `x:x:x:x`) carrying a propeller partition.
pub fn discover_propeller_drives(sysfs_scsi_dir: &Path) -> Vec<PathBuf> {
    let mut drives = Vec::new();

    let entries = match fs::read_dir(sysfs_scsi_dir) {
        Ok(e) => e,
        Err(_) => {
            error!("Attached devices: none");
            return drives;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_scsi_bus_address(&name) {
            continue;
        }
        let marker = entry.path().join("propeller");
        if marker.exists() {
            debug!("partition name='propeller' under {}", name);
            drives.push(marker);
        }
    }

    drives
}

fn is_scsi_bus_address(name: &str) -> bool {
    let parts: Vec<&str> = name.split(':').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone)]
struct IdmRecord {
    key: String,
    mode: u32,
    owner: u32,
    timestamp: u64,
}

fn encode_record(rec: &IdmRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    LittleEndian::write_u32(&mut buf[..4], IDM_MAGIC);
    let key = rec.key.as_bytes();
    let n = key.len().min(KEY_LEN);
    buf[8..8 + n].copy_from_slice(&key[..n]);
    LittleEndian::write_u32(&mut buf[72..76], rec.mode);
    LittleEndian::write_u32(&mut buf[76..80], rec.owner);
    LittleEndian::write_u64(&mut buf[80..88], rec.timestamp);
    buf
}

fn decode_record(buf: &[u8]) -> Option<IdmRecord> {
    if LittleEndian::read_u32(&buf[..4]) != IDM_MAGIC {
        return None;
    }
    let end = buf[8..8 + KEY_LEN]
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(KEY_LEN);
    Some(IdmRecord {
        key: String::from_utf8_lossy(&buf[8..8 + end]).into_owned(),
        mode: LittleEndian::read_u32(&buf[72..76]),
        owner: LittleEndian::read_u32(&buf[76..80]),
        timestamp: LittleEndian::read_u64(&buf[80..88]),
    })
}

pub struct IdmLm {
    ls_name: String,
    vg_uuid: String,
    host_id: u32,
    generation: u64,
    /// The per-operation drive list for VG and LV locks; the global
    /// lock carries its own discovered list.
    drives: Vec<PathBuf>,
    gl_drives: Vec<PathBuf>,
    connected: bool,
    killpath: Option<(String, String)>,
    /// In-memory value blocks; only the timestamp lives on the drive.
    vb_mem: BTreeMap<String, ValBlk>,
    vb_timestamps: BTreeMap<String, u64>,
}

impl IdmLm {
    pub fn new(ls_name: &str, vg_uuid: &str, drives: Vec<PathBuf>) -> LmResult<IdmLm> {
        Ok(IdmLm {
            ls_name: ls_name.to_string(),
            vg_uuid: uuid_read_format(vg_uuid)?,
            host_id: 0,
            generation: 0,
            drives,
            gl_drives: Vec::new(),
            connected: false,
            killpath: None,
            vb_mem: BTreeMap::new(),
            vb_timestamps: BTreeMap::new(),
        })
    }

    pub fn set_gl_drives(&mut self, drives: Vec<PathBuf>) {
        self.gl_drives = drives;
    }

    /// The helper the firmware monitor runs on lock renewal failure.
    pub fn killpath(&self) -> Option<&(String, String)> {
        self.killpath.as_ref()
    }

    fn resource_key(&self, r: &Resource) -> LmResult<String> {
        match r.rtype {
            ResType::Gl => Ok(format!("GL:{}", self.vg_uuid)),
            ResType::Vg => Ok(format!("VG:{}", self.vg_uuid)),
            ResType::Lv => {
                let lv_uuid = r
                    .lv_uuid
                    .as_ref()
                    .ok_or_else(|| LmError::Args("LV lock without LV uuid".to_string()))?;
                Ok(format!("{}{}", self.vg_uuid, uuid_read_format(lv_uuid)?))
            }
        }
    }

    fn op_drives(&self, r: &Resource) -> LmResult<Vec<PathBuf>> {
        let drives = match r.rtype {
            ResType::Gl => {
                if self.gl_drives.is_empty() {
                    self.drives.clone()
                } else {
                    self.gl_drives.clone()
                }
            }
            _ => self.drives.clone(),
        };
        if drives.is_empty() {
            return Err(LmError::Args("cannot find a valid drive path".to_string()));
        }
        Ok(drives)
    }

    /// Find a record on a drive; returns its byte offset when present.
    fn find_record(&self, drive: &Path, key: &str) -> LmResult<Option<(u64, IdmRecord)>> {
        let mut f = match OpenOptions::new().read(true).open(drive) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LmError::Io(e)),
        };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(LmError::Io)?;

        for (i, chunk) in buf.chunks_exact(RECORD_SIZE).enumerate() {
            if let Some(rec) = decode_record(chunk) {
                if rec.key == key {
                    return Ok(Some(((i * RECORD_SIZE) as u64, rec)));
                }
            }
        }
        Ok(None)
    }

    fn write_record(&self, drive: &Path, offset: Option<u64>, rec: &IdmRecord) -> LmResult<()> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(drive)
            .map_err(LmError::Io)?;
        let pos = match offset {
            Some(o) => o,
            None => f.metadata().map_err(LmError::Io)?.len(),
        };
        f.seek(SeekFrom::Start(pos)).map_err(LmError::Io)?;
        f.write_all(&encode_record(rec)).map_err(LmError::Io)?;
        Ok(())
    }

    /// Apply a mutation of the record for `key` across the drive
    /// list; the mutex must end up in the same state on every drive.
    fn update_all_drives<F>(&self, drives: &[PathBuf], key: &str, mutate: F) -> LmResult<()>
    where
        F: Fn(&mut IdmRecord),
    {
        for drive in drives {
            let (offset, mut rec) = match self.find_record(drive, key)? {
                Some((o, r)) => (Some(o), r),
                None => (
                    None,
                    IdmRecord {
                        key: key.to_string(),
                        mode: MODE_FREE,
                        owner: 0,
                        timestamp: 0,
                    },
                ),
            };
            mutate(&mut rec);
            self.write_record(drive, offset, &rec)?;
        }
        Ok(())
    }

    fn write_lvb(&self, drives: &[PathBuf], key: &str, timestamp: u64) -> LmResult<()> {
        self.update_all_drives(drives, key, |rec| rec.timestamp = timestamp)
    }

    fn read_drive_timestamp(&self, drives: &[PathBuf], key: &str) -> LmResult<u64> {
        let drive = drives
            .first()
            .ok_or_else(|| LmError::Args("cannot find a valid drive path".to_string()))?;
        Ok(self
            .find_record(drive, key)?
            .map(|(_, r)| r.timestamp)
            .unwrap_or(0))
    }
}

impl LockManager for IdmLm {
    fn connect(&mut self) -> LmResult<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> LmResult<()> {
        self.connected = false;
        Ok(())
    }

    fn set_host_id(&mut self, host_id: u32) {
        self.host_id = host_id;
    }

    fn set_killpath(&mut self, cmd: &str, args: &str) -> LmResult<()> {
        debug!("S {} kill path is: \"{} {}\"", self.ls_name, cmd, args);
        self.killpath = Some((cmd.to_string(), args.to_string()));
        Ok(())
    }

    fn init_lockspace(&mut self, _enable_gl: bool) -> LmResult<()> {
        // the firmware keeps no lockspace structure; drives only carry
        // the individual mutexes
        Ok(())
    }

    fn init_lv(&mut self, _lv_name: &str, _start_offset: Option<u64>) -> LmResult<u64> {
        // LV locks are addressed by uuid pair, no slot to allocate
        Ok(0)
    }

    fn rename_lockspace(&mut self, new_name: &str) -> LmResult<()> {
        self.ls_name = new_name.to_string();
        Ok(())
    }

    fn free_lv(&mut self, _offset: u64) -> LmResult<()> {
        Ok(())
    }

    fn read_lockspace_info(&mut self) -> LmResult<LockspaceInfo> {
        let key = format!("HOST:{}:{}", self.vg_uuid, self.host_id);
        let prev_generation = if self.drives.is_empty() {
            0
        } else {
            self.read_drive_timestamp(&self.drives, &key)?
        };
        Ok(LockspaceInfo {
            sector_size: 512,
            align_size: 0,
            prev_generation,
        })
    }

    fn repair_lockspace(&mut self, info: &PersistedInfo) -> LmResult<()> {
        let key = format!("HOST:{}:{}", self.vg_uuid, info.host_id);
        self.write_lvb(&self.drives.clone(), &key, info.generation)
    }

    fn add_lockspace(&mut self) -> LmResult<u64> {
        let key = format!("HOST:{}:{}", self.vg_uuid, self.host_id);
        let prev = self.read_drive_timestamp(&self.drives, &key)?;
        let generation = prev + 1;
        let host = self.host_id;
        self.update_all_drives(&self.drives.clone(), &key, |rec| {
            rec.owner = host;
            rec.mode = MODE_SH;
            rec.timestamp = generation;
        })?;
        self.generation = generation;
        debug!(
            "S {} add_lockspace done generation {}",
            self.ls_name, self.generation
        );
        Ok(generation)
    }

    fn rem_lockspace(&mut self, _free_vg: bool) -> LmResult<()> {
        let key = format!("HOST:{}:{}", self.vg_uuid, self.host_id);
        self.update_all_drives(&self.drives.clone(), &key, |rec| {
            rec.mode = MODE_FREE;
        })?;
        Ok(())
    }

    fn acquire(
        &mut self,
        r: &mut Resource,
        mode: LockMode,
        flags: AcquireFlags,
    ) -> LmResult<Option<ValBlk>> {
        if !self.connected {
            return Err(LmError::Manager("not connected".to_string()));
        }

        let key = self.resource_key(r)?;
        let drives = self.op_drives(r)?;

        debug!(
            "S {} R {} lock mode {:?} drive_num {} timeout {}",
            self.ls_name,
            r.name,
            mode,
            drives.len(),
            IDM_TIMEOUT_MS
        );

        let want = match mode {
            LockMode::Sh => MODE_SH,
            LockMode::Ex => MODE_EX,
            LockMode::Un => return Err(LmError::Args("invalid mode".to_string())),
        };

        // the mutex must be obtainable on every drive in the list
        let mut shared_holder = false;
        for drive in &drives {
            if let Some((_, rec)) = self.find_record(drive, &key)? {
                if rec.mode != MODE_FREE && rec.owner != self.host_id {
                    if rec.mode == MODE_SH && want == MODE_SH {
                        // shared holders coexist; the recorded owner
                        // must stay theirs so their release is theirs
                        shared_holder = true;
                        continue;
                    }
                    return Err(LmError::Again(Some(HostRecord {
                        host_id: rec.owner,
                        generation: 0,
                        timestamp: rec.timestamp,
                        state: HostState::Unknown,
                    })));
                }
                if rec.mode != MODE_FREE && rec.owner == self.host_id {
                    if !flags.adopt_ok && !flags.adopt_only {
                        return Err(LmError::Orphan);
                    }
                }
            }
        }

        if !shared_holder {
            let host = self.host_id;
            self.update_all_drives(&drives, &key, |rec| {
                rec.owner = host;
                rec.mode = want;
            })?;
        }

        if r.rtype == ResType::Lv {
            return Ok(None);
        }

        // Compare the stored timestamp with the cached one. A
        // mismatch means another host wrote a new value block; hand
        // back a reset block so the caller invalidates its metadata.
        let stored = self.read_drive_timestamp(&drives, &key)?;
        let cached = self.vb_timestamps.get(&key).copied().unwrap_or(0);

        if stored != cached {
            debug!(
                "S {} R {} lvb timestamp {}:{}",
                self.ls_name, r.name, cached, stored
            );
            self.vb_timestamps.insert(key.clone(), stored);
            self.vb_mem.insert(key, ValBlk::default());
            return Ok(Some(ValBlk {
                version: 0,
                flags: 0,
                r_version: stored as u32,
            }));
        }

        Ok(Some(
            self.vb_mem.get(&key).copied().unwrap_or_default(),
        ))
    }

    fn convert(
        &mut self,
        r: &mut Resource,
        mode: LockMode,
        r_version: Option<u32>,
    ) -> LmResult<()> {
        let key = self.resource_key(r)?;
        let drives = self.op_drives(r)?;

        if let Some(rv) = r_version {
            if r.mode == LockMode::Ex {
                let vb = self.vb_mem.entry(key.clone()).or_default();
                if vb.version == 0 {
                    vb.version = VAL_BLK_VERSION;
                }
                vb.r_version = rv;

                let ts = self.vb_timestamps.entry(key.clone()).or_insert(0);
                update_vb_timestamp(ts);
                let ts = *ts;
                debug!(
                    "S {} R {} convert set r_version {} timestamp {}",
                    self.ls_name, r.name, rv, ts
                );
                self.write_lvb(&drives, &key, ts)?;
            }
        }

        let want = match mode {
            LockMode::Sh => MODE_SH,
            LockMode::Ex => MODE_EX,
            LockMode::Un => MODE_FREE,
        };
        self.update_all_drives(&drives, &key, |rec| rec.mode = want)
    }

    fn release(&mut self, r: &mut Resource, r_version: Option<u32>, _free_vg: bool) -> LmResult<()> {
        let key = self.resource_key(r)?;
        let drives = self.op_drives(r)?;

        if let Some(rv) = r_version {
            if r.mode == LockMode::Ex {
                let vb = self.vb_mem.entry(key.clone()).or_default();
                if vb.version == 0 {
                    vb.version = VAL_BLK_VERSION;
                }
                vb.r_version = rv;

                let ts = self.vb_timestamps.entry(key.clone()).or_insert(0);
                update_vb_timestamp(ts);
                let ts = *ts;
                debug!(
                    "S {} R {} unlock set r_version {} timestamp {}",
                    self.ls_name, r.name, rv, ts
                );
                self.write_lvb(&drives, &key, ts)?;
            }
        }

        self.update_all_drives(&drives, &key, |rec| {
            rec.mode = MODE_FREE;
            rec.owner = 0;
        })
    }

    fn read_lvb(&mut self, r: &Resource) -> LmResult<ValBlk> {
        let key = self.resource_key(r)?;
        Ok(self.vb_mem.get(&key).copied().unwrap_or_default())
    }

    fn set_lvb(&mut self, r: &Resource, vb: &ValBlk) -> LmResult<()> {
        let key = self.resource_key(r)?;
        let drives = self.op_drives(r)?;
        self.vb_mem.insert(key.clone(), *vb);
        let ts = self.vb_timestamps.entry(key.clone()).or_insert(0);
        update_vb_timestamp(ts);
        let ts = *ts;
        self.write_lvb(&drives, &key, ts)
    }

    fn get_hosts(&mut self) -> LmResult<Vec<HostRecord>> {
        let drive = match self.drives.first() {
            Some(d) => d.clone(),
            None => return Ok(Vec::new()),
        };

        let mut f = match OpenOptions::new().read(true).open(&drive) {
            Ok(f) => f,
            Err(_) => return Ok(Vec::new()),
        };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(LmError::Io)?;

        let mut hosts: Vec<HostRecord> = Vec::new();
        for chunk in buf.chunks_exact(RECORD_SIZE) {
            if let Some(rec) = decode_record(chunk) {
                if rec.key.starts_with("HOST:") && rec.mode != MODE_FREE {
                    if !hosts.iter().any(|h| h.host_id == rec.owner) {
                        hosts.push(HostRecord {
                            host_id: rec.owner,
                            generation: rec.timestamp,
                            timestamp: rec.timestamp,
                            state: HostState::Live,
                        });
                    }
                }
            }
        }
        Ok(hosts)
    }

    fn hosts_count(&mut self) -> LmResult<usize> {
        let me = self.host_id;
        Ok(self
            .get_hosts()?
            .iter()
            .filter(|h| h.host_id != me)
            .count())
    }

    fn find_free_lv_slot(&mut self, _start_offset: Option<u64>) -> LmResult<u64> {
        // no slot allocation: locks are addressed by uuid pair
        Ok(0)
    }

    fn gl_is_enabled(&mut self) -> LmResult<bool> {
        Ok(true)
    }

    fn able_gl(&mut self, _enable: bool) -> LmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VG_UUID: &str = "exxNPX-wZdO-uCNy-yiGa-aJGT-JKVl-arfcYT";

    fn drives(dir: &Path, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let p = dir.join(format!("drive{}", i));
                fs::File::create(&p).unwrap();
                p
            })
            .collect()
    }

    fn vg_resource() -> Resource {
        Resource {
            rtype: ResType::Vg,
            name: "VG".to_string(),
            mode: LockMode::Un,
            offset: 0,
            lv_uuid: None,
            vb: None,
        }
    }

    #[test]
    fn uuid_format() {
        assert_eq!(
            uuid_read_format(VG_UUID).unwrap(),
            "exxNPXwZdOuCNyyiGaaJGTJKVlarfcYT"
        );
        assert!(uuid_read_format("too-short").is_err());
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut ts = 0u64;
        update_vb_timestamp(&mut ts);
        let first = ts;
        update_vb_timestamp(&mut ts);
        assert!(ts > first);

        // a clock that went backwards still moves the stamp forward
        let mut ts = u64::MAX - 10;
        update_vb_timestamp(&mut ts);
        assert_eq!(ts, u64::MAX - 9);
    }

    #[test]
    fn ex_lock_conflicts_across_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let d = drives(dir.path(), 1);

        let mut lm1 = IdmLm::new("lvm_test", VG_UUID, d.clone()).unwrap();
        lm1.set_host_id(1);
        lm1.connect().unwrap();
        let mut lm2 = IdmLm::new("lvm_test", VG_UUID, d).unwrap();
        lm2.set_host_id(2);
        lm2.connect().unwrap();

        let mut r1 = vg_resource();
        lm1.acquire(&mut r1, LockMode::Ex, AcquireFlags::default())
            .unwrap();

        let mut r2 = vg_resource();
        match lm2.acquire(&mut r2, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::Again(Some(owner))) => assert_eq!(owner.host_id, 1),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        r1.mode = LockMode::Ex;
        lm1.release(&mut r1, None, false).unwrap();
        lm2.acquire(&mut r2, LockMode::Ex, AcquireFlags::default())
            .unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let d = drives(dir.path(), 1);

        let mut lm1 = IdmLm::new("lvm_test", VG_UUID, d.clone()).unwrap();
        lm1.set_host_id(1);
        lm1.connect().unwrap();
        let mut lm2 = IdmLm::new("lvm_test", VG_UUID, d.clone()).unwrap();
        lm2.set_host_id(2);
        lm2.connect().unwrap();

        let mut r1 = vg_resource();
        lm1.acquire(&mut r1, LockMode::Sh, AcquireFlags::default())
            .unwrap();
        let mut r2 = vg_resource();
        lm2.acquire(&mut r2, LockMode::Sh, AcquireFlags::default())
            .unwrap();

        // the second shared holder did not clobber the recorded owner
        let mut lm3 = IdmLm::new("lvm_test", VG_UUID, d).unwrap();
        lm3.set_host_id(3);
        lm3.connect().unwrap();
        let mut r3 = vg_resource();
        match lm3.acquire(&mut r3, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::Again(Some(owner))) => assert_eq!(owner.host_id, 1),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn timestamp_mismatch_resets_value_block() {
        let dir = tempfile::tempdir().unwrap();
        let d = drives(dir.path(), 1);

        let mut lm1 = IdmLm::new("lvm_test", VG_UUID, d.clone()).unwrap();
        lm1.set_host_id(1);
        lm1.connect().unwrap();
        let mut lm2 = IdmLm::new("lvm_test", VG_UUID, d).unwrap();
        lm2.set_host_id(2);
        lm2.connect().unwrap();

        // host 1 writes a new version through the lock
        let mut r1 = vg_resource();
        lm1.acquire(&mut r1, LockMode::Ex, AcquireFlags::default())
            .unwrap();
        r1.mode = LockMode::Ex;
        lm1.release(&mut r1, Some(5), false).unwrap();

        // host 2 sees a timestamp it has not cached: reset block
        let mut r2 = vg_resource();
        let vb = lm2
            .acquire(&mut r2, LockMode::Ex, AcquireFlags::default())
            .unwrap()
            .unwrap();
        assert_eq!(vb.version, 0);
        assert_ne!(vb.r_version, 0);
        r2.mode = LockMode::Ex;
        lm2.release(&mut r2, None, false).unwrap();

        // with no further writes the next acquire is quiet
        let vb = lm2
            .acquire(&mut r2, LockMode::Ex, AcquireFlags::default())
            .unwrap()
            .unwrap();
        assert_eq!(vb, ValBlk::default());
    }

    #[test]
    fn lock_spans_every_drive() {
        let dir = tempfile::tempdir().unwrap();
        let d = drives(dir.path(), 3);

        let mut lm = IdmLm::new("lvm_test", VG_UUID, d.clone()).unwrap();
        lm.set_host_id(1);
        lm.connect().unwrap();
        let mut r = vg_resource();
        lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();

        for drive in &d {
            let len = fs::metadata(drive).unwrap().len();
            assert!(len >= RECORD_SIZE as u64, "no record on {:?}", drive);
        }
    }

    #[test]
    fn lv_locks_use_uuid_pair() {
        let dir = tempfile::tempdir().unwrap();
        let d = drives(dir.path(), 1);

        let mut lm = IdmLm::new("lvm_test", VG_UUID, d).unwrap();
        lm.set_host_id(1);
        lm.connect().unwrap();

        let mut r = Resource {
            rtype: ResType::Lv,
            name: "lv1".to_string(),
            mode: LockMode::Un,
            offset: 0,
            lv_uuid: Some("7xoDtu-yvNM-iwQx-C94t-BbYs-UzBl-o8hAIa".to_string()),
            vb: None,
        };
        let vb = lm
            .acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();
        assert!(vb.is_none());

        // an LV lock without its uuid cannot be addressed
        let mut bad = Resource {
            lv_uuid: None,
            ..r.clone()
        };
        assert!(matches!(
            lm.acquire(&mut bad, LockMode::Ex, AcquireFlags::default()),
            Err(LmError::Args(_))
        ));
    }

    #[test]
    fn generation_tracks_joins() {
        let dir = tempfile::tempdir().unwrap();
        let d = drives(dir.path(), 1);

        let mut lm = IdmLm::new("lvm_test", VG_UUID, d).unwrap();
        lm.set_host_id(1);
        lm.connect().unwrap();
        assert_eq!(lm.add_lockspace().unwrap(), 1);
        lm.rem_lockspace(false).unwrap();
        assert_eq!(lm.add_lockspace().unwrap(), 2);
        assert_eq!(lm.read_lockspace_info().unwrap().prev_generation, 2);
    }

    #[test]
    fn propeller_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let scsi = dir.path();

        let with = scsi.join("1:0:0:0");
        fs::create_dir_all(&with).unwrap();
        fs::write(with.join("propeller"), b"").unwrap();

        let without = scsi.join("2:0:0:0");
        fs::create_dir_all(&without).unwrap();

        fs::create_dir_all(scsi.join("host3")).unwrap();

        let found = discover_propeller_drives(scsi);
        assert_eq!(found.len(), 1);
        assert!(found[0].starts_with(&with));
    }

    #[test]
    fn scsi_address_matcher() {
        assert!(is_scsi_bus_address("1:0:0:0"));
        assert!(is_scsi_bus_address("10:2:0:31"));
        assert!(!is_scsi_bus_address("host3"));
        assert!(!is_scsi_bus_address("1:0:0"));
        assert!(!is_scsi_bus_address("1:0:0:x"));
    }
}
