// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The shared-VG lock coordinator.
//!
//! Each started shared VG gets a lockspace whose leases live on a
//! hidden LV inside the VG itself (`/dev/<vgname>/lvmlock`). The
//! lockspace holds one lease for the VG lock, one per active LV, and
//! in one elected VG the global lock. Leases carry a small value block
//! used to propagate the VG seqno between hosts: acquiring a lease and
//! finding a version newer than the one we last wrote or read means
//! another host changed the metadata, and the cache is told to flag
//! it invalid before the lock is handed to the caller.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use crate::cache::Cache;

pub const LS_NAME_PREFIX: &str = "lvm_";
pub const GL_LS_NAME: &str = "lvm_global";

pub const R_NAME_GL: &str = "GL";
pub const R_NAME_GL_DISABLED: &str = "GL_DISABLED";
pub const R_NAME_VG: &str = "VG";
pub const R_NAME_UNUSED: &str = "#unused";
pub const R_NAME_REMOVED: &str = "invalid_removed";

pub const MAX_HOST_ID: u32 = 2000;

pub const HOST_ID_ENV: &str = "LVM_HOST_ID";

pub fn lockspace_name(vg_name: &str) -> String {
    format!("{}{}", LS_NAME_PREFIX, vg_name)
}

pub fn lock_lv_path(vg_name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{}/lvmlock", vg_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Un,
    Sh,
    Ex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResType {
    Gl,
    Vg,
    Lv,
}

/// The 16-byte value block attached to GL and VG leases.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValBlk {
    pub version: u16,
    pub flags: u16,
    pub r_version: u32,
}

pub const VAL_BLK_VERSION: u16 = 0x0101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Free,
    Live,
    Fail,
    Dead,
    Unknown,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Free => "FREE",
            HostState::Live => "LIVE",
            HostState::Fail => "FAIL",
            HostState::Dead => "DEAD",
            HostState::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostRecord {
    pub host_id: u32,
    pub generation: u64,
    pub timestamp: u64,
    pub state: HostState,
}

#[derive(Debug)]
pub enum LmError {
    /// Held by another live or failed host; callers retry, shared
    /// requests transparently.
    Again(Option<HostRecord>),
    /// A failed process of ours still holds the lease.
    Orphan,
    /// Lease I/O did not complete in time; treated as storage loss.
    IoTimeout,
    /// Lease I/O failed outright.
    LockIo,
    /// The lease is corrupt; repair may be possible.
    LockRepair,
    /// The end of the lock-LV was reached; the caller extends it and
    /// retries.
    NoSpace,
    Exists,
    HostId(u32),
    /// The lockspace is being killed after storage loss.
    Killed,
    /// The global lock in this lockspace has been disabled.
    GlDisabled,
    /// Other hosts are still joined to the lockspace.
    Busy(usize),
    Args(String),
    Manager(String),
    Io(io::Error),
}

pub type LmResult<T> = std::result::Result<T, LmError>;

impl fmt::Display for LmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LmError::Again(_) => write!(f, "lock held by another host"),
            LmError::Orphan => write!(f, "orphan lock exists"),
            LmError::IoTimeout => write!(f, "lease i/o timeout"),
            LmError::LockIo => write!(f, "lease i/o error"),
            LmError::LockRepair => write!(f, "lease corrupt, needs repair"),
            LmError::NoSpace => write!(f, "no space on lock lv"),
            LmError::Exists => write!(f, "already exists"),
            LmError::HostId(id) => write!(f, "invalid host_id {}", id),
            LmError::Killed => write!(f, "lockspace is being killed"),
            LmError::GlDisabled => write!(f, "global lock is disabled"),
            LmError::Busy(n) => write!(f, "{} other hosts in lockspace", n),
            LmError::Args(msg) => write!(f, "bad arguments: {}", msg),
            LmError::Manager(msg) => write!(f, "lock manager error: {}", msg),
            LmError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for LmError {
    fn from(e: io::Error) -> LmError {
        if e.kind() == io::ErrorKind::TimedOut {
            LmError::IoTimeout
        } else {
            LmError::Io(e)
        }
    }
}

/// One lease within a lockspace.
#[derive(Debug, Clone)]
pub struct Resource {
    pub rtype: ResType,
    pub name: String,
    pub mode: LockMode,
    /// On-disk coordinate for the paxos-lease back-end.
    pub offset: u64,
    /// Coordinate for the in-drive-mutex back-end.
    pub lv_uuid: Option<String>,
    pub vb: Option<ValBlk>,
}

/// Acquire options. Shared vs exclusive travels as the `LockMode`;
/// owner-nowait (never block on a failed owner's lease expiring) and
/// persistence across a daemon restart are unconditional in both
/// back-ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcquireFlags {
    /// Only adopt an orphan left by a failed process; fail otherwise.
    pub adopt_only: bool,
    /// Adopting an orphan is acceptable.
    pub adopt_ok: bool,
    /// Rewrite a corrupt lease and retry once.
    pub repair: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LockspaceInfo {
    pub sector_size: u32,
    pub align_size: u64,
    pub prev_generation: u64,
}

/// What the info file records, enough to reconstruct our host-id
/// lease if the on-disk lockspace is corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedInfo {
    pub host_id: u32,
    pub generation: u64,
    pub sector_size: u32,
    pub align_size: u64,
}

/// The abstract capability set both lease back-ends implement.
pub trait LockManager: Send {
    fn connect(&mut self) -> LmResult<()>;
    fn disconnect(&mut self) -> LmResult<()>;

    fn set_host_id(&mut self, host_id: u32);
    fn set_killpath(&mut self, cmd: &str, args: &str) -> LmResult<()>;

    /// Format the lockspace: header, a GL resource (disabled unless
    /// this VG is elected to carry the global lock), the VG resource,
    /// and `#unused` LV slots to the end of the device.
    fn init_lockspace(&mut self, enable_gl: bool) -> LmResult<()>;
    /// Claim the first free LV slot for `lv_name`, returning its
    /// offset.
    fn init_lv(&mut self, lv_name: &str, start_offset: Option<u64>) -> LmResult<u64>;
    fn rename_lockspace(&mut self, new_name: &str) -> LmResult<()>;
    fn free_lv(&mut self, offset: u64) -> LmResult<()>;

    fn read_lockspace_info(&mut self) -> LmResult<LockspaceInfo>;
    /// Rewrite our host-id lease from the persisted info so a
    /// corrupted lockspace can be rejoined.
    fn repair_lockspace(&mut self, info: &PersistedInfo) -> LmResult<()>;
    /// Join; returns our generation for this incarnation.
    fn add_lockspace(&mut self) -> LmResult<u64>;
    fn rem_lockspace(&mut self, free_vg: bool) -> LmResult<()>;

    fn acquire(
        &mut self,
        r: &mut Resource,
        mode: LockMode,
        flags: AcquireFlags,
    ) -> LmResult<Option<ValBlk>>;
    fn convert(&mut self, r: &mut Resource, mode: LockMode, r_version: Option<u32>)
        -> LmResult<()>;
    fn release(&mut self, r: &mut Resource, r_version: Option<u32>, free_vg: bool) -> LmResult<()>;

    fn read_lvb(&mut self, r: &Resource) -> LmResult<ValBlk>;
    fn set_lvb(&mut self, r: &Resource, vb: &ValBlk) -> LmResult<()>;

    fn get_hosts(&mut self) -> LmResult<Vec<HostRecord>>;
    /// Live hosts other than ourselves.
    fn hosts_count(&mut self) -> LmResult<usize>;

    fn find_free_lv_slot(&mut self, start_offset: Option<u64>) -> LmResult<u64>;

    fn gl_is_enabled(&mut self) -> LmResult<bool>;
    fn able_gl(&mut self, enable: bool) -> LmResult<()>;
}

/// How the coordinator tells the metadata cache that a value block
/// showed a cross-host change.
pub trait CacheNotifier: Send + Sync {
    fn vg_changed(&self, vg_uuid: &str, version: i64);
    fn global_changed(&self);
}

impl CacheNotifier for Cache {
    fn vg_changed(&self, vg_uuid: &str, version: i64) {
        self.invalidate_vg(vg_uuid, version);
    }
    fn global_changed(&self) {
        self.invalidate_global();
    }
}

//
// Info file persistence
//

fn info_file_path(dir: &Path, vg_name: &str) -> PathBuf {
    dir.join(format!("lvmlockd_info_{}", vg_name))
}

pub fn write_info_file(
    dir: &Path,
    vg_name: &str,
    vg_uuid: &str,
    info: &PersistedInfo,
) -> io::Result<()> {
    let path = info_file_path(dir, vg_name);
    let mut f = fs::File::create(&path)?;

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    writeln!(f, "# vg {} {} created {}", vg_name, vg_uuid, now)?;
    writeln!(f, "host_id {}", info.host_id)?;
    writeln!(f, "generation {}", info.generation)?;
    writeln!(f, "sector_size {}", info.sector_size)?;
    writeln!(f, "align_size {}", info.align_size)?;
    f.flush()?;

    debug!(
        "info file: wrote {} {} {} {}",
        info.host_id, info.generation, info.sector_size, info.align_size
    );
    Ok(())
}

pub fn read_info_file(dir: &Path, vg_name: &str) -> io::Result<PersistedInfo> {
    let path = info_file_path(dir, vg_name);
    let text = fs::read_to_string(&path)?;

    let mut info = PersistedInfo {
        host_id: 0,
        generation: 0,
        sector_size: 0,
        align_size: 0,
    };

    for line in text.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or("");
        let val = parts.next().unwrap_or("");
        match key {
            "host_id" => info.host_id = val.parse().map_err(bad_info)?,
            "generation" => info.generation = val.parse().map_err(bad_info)?,
            "sector_size" => info.sector_size = val.parse().map_err(bad_info)?,
            "align_size" => info.align_size = val.parse().map_err(bad_info)?,
            _ => {}
        }
    }

    debug!(
        "info file: read {} {} {} {}",
        info.host_id, info.generation, info.sector_size, info.align_size
    );
    Ok(info)
}

fn bad_info(_: std::num::ParseIntError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "invalid info file values")
}

pub fn remove_info_file(dir: &Path, vg_name: &str) {
    let _ = fs::remove_file(info_file_path(dir, vg_name));
}

fn read_host_id_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some(eq) = line.find('=') {
            let (key, val) = line.split_at(eq);
            if key.trim() == "host_id" {
                return val[1..].trim().parse().ok();
            }
        }
    }
    None
}

//
// The coordinator
//

struct Lockspace {
    name: String,
    vg_name: String,
    vg_uuid: String,
    host_id: u32,
    generation: u64,
    sector_size: u32,
    align_size: u64,
    free_lock_offset: Option<u64>,
    killed: bool,
    resources: BTreeMap<String, Resource>,
    lm: Box<dyn LockManager>,
}

pub struct LockdOptions {
    pub info_dir: PathBuf,
    pub host_id: Option<u32>,
    pub host_id_file: Option<PathBuf>,
    /// The external helper the back-end runs on storage loss.
    pub killpath: String,
}

impl Default for LockdOptions {
    fn default() -> LockdOptions {
        LockdOptions {
            info_dir: PathBuf::from("/var/lib/lvm"),
            host_id: None,
            host_id_file: None,
            killpath: "lvmlockctl".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StartOptions {
    pub host_id: Option<u32>,
    pub adopt_ok: bool,
    pub repair: bool,
}

pub struct LockCoordinator {
    lockspaces: Mutex<BTreeMap<String, Lockspace>>,
    notifier: Arc<dyn CacheNotifier>,
    opts: LockdOptions,
}

impl LockCoordinator {
    pub fn new(notifier: Arc<dyn CacheNotifier>, opts: LockdOptions) -> LockCoordinator {
        LockCoordinator {
            lockspaces: Mutex::new(BTreeMap::new()),
            notifier,
            opts,
        }
    }

    fn resolve_host_id(&self, requested: Option<u32>) -> LmResult<u32> {
        let id = requested
            .or(self.opts.host_id)
            .or_else(|| env::var(HOST_ID_ENV).ok().and_then(|s| s.parse().ok()))
            .or_else(|| {
                self.opts
                    .host_id_file
                    .as_ref()
                    .and_then(|p| read_host_id_file(p))
            })
            .unwrap_or(0);

        if id == 0 || id > MAX_HOST_ID {
            return Err(LmError::HostId(id));
        }
        Ok(id)
    }

    /// Start a lockspace for a VG: recover the on-disk geometry and
    /// our previous generation, join, and persist the info file that
    /// makes a future lease repair possible.
    pub fn start_lockspace(
        &self,
        vg_name: &str,
        vg_uuid: &str,
        mut lm: Box<dyn LockManager>,
        opts: StartOptions,
    ) -> LmResult<u64> {
        let ls_name = lockspace_name(vg_name);

        {
            let map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
            if map.contains_key(vg_name) {
                return Err(LmError::Exists);
            }
        }

        let host_id = self.resolve_host_id(opts.host_id)?;
        lm.set_host_id(host_id);

        debug!(
            "S {} start host_id {} repair {}",
            ls_name, host_id, opts.repair
        );

        lm.connect()?;
        lm.set_killpath(&self.opts.killpath, &format!("--kill {}", vg_name))?;

        let info = match lm.read_lockspace_info() {
            Ok(info) => info,
            Err(LmError::LockRepair) if opts.repair => {
                let saved = read_info_file(&self.opts.info_dir, vg_name).map_err(|_| {
                    error!("S {} cannot repair lockspace, no info file", ls_name);
                    LmError::LockRepair
                })?;
                if saved.host_id != host_id {
                    error!("S {} cannot repair lockspace, other host_id", ls_name);
                    return Err(LmError::HostId(saved.host_id));
                }
                lm.repair_lockspace(&saved)?;
                // one retry after rewriting our host-id lease
                lm.read_lockspace_info()?
            }
            Err(e) => {
                let _ = lm.disconnect();
                return Err(e);
            }
        };

        let generation = lm.add_lockspace()?;

        let persisted = PersistedInfo {
            host_id,
            generation,
            sector_size: info.sector_size,
            align_size: info.align_size,
        };
        if let Err(e) = write_info_file(&self.opts.info_dir, vg_name, vg_uuid, &persisted) {
            warn!("S {} failed to write info file: {}", ls_name, e);
        }

        let ls = Lockspace {
            name: ls_name,
            vg_name: vg_name.to_string(),
            vg_uuid: vg_uuid.to_string(),
            host_id,
            generation,
            sector_size: info.sector_size,
            align_size: info.align_size,
            free_lock_offset: None,
            killed: false,
            resources: BTreeMap::new(),
            lm,
        };

        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(vg_name) {
            return Err(LmError::Exists);
        }
        map.insert(vg_name.to_string(), ls);

        Ok(generation)
    }

    /// Stop a lockspace. With `free_vg` the VG is being removed:
    /// refuse while other hosts are joined, release the GL/VG leases
    /// under their poisoned name, overwrite the lockspace name so it
    /// cannot be rejoined, and delete the info file.
    pub fn stop_lockspace(&self, vg_name: &str, free_vg: bool) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        if free_vg {
            let others = ls.lm.hosts_count()?;
            if others > 0 {
                return Err(LmError::Busy(others));
            }
        }

        let names: Vec<String> = ls.resources.keys().cloned().collect();
        for name in names {
            let mut r = ls.resources.remove(&name).unwrap();
            if r.mode != LockMode::Un {
                if let Err(e) = ls.lm.release(&mut r, None, free_vg) {
                    warn!("S {} release {} failed: {}", ls.name, r.name, e);
                }
            }
        }

        ls.lm.rem_lockspace(free_vg)?;
        let _ = ls.lm.disconnect();

        if free_vg {
            remove_info_file(&self.opts.info_dir, vg_name);
        }

        map.remove(vg_name);
        Ok(())
    }

    /// Acquire a lease. On success the lease's value block is compared
    /// with the last one seen on this resource; a change means another
    /// host wrote through this lock, and the cache is invalidated
    /// before the lock is returned to the caller.
    pub fn lock(
        &self,
        vg_name: &str,
        rtype: ResType,
        lv: Option<(&str, u64, Option<&str>)>,
        mode: LockMode,
        flags: AcquireFlags,
    ) -> LmResult<Option<ValBlk>> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        if ls.killed {
            return Err(LmError::Killed);
        }

        let (key, name, offset, lv_uuid) = match (rtype, lv) {
            (ResType::Gl, _) => (R_NAME_GL.to_string(), R_NAME_GL.to_string(), 0, None),
            (ResType::Vg, _) => (R_NAME_VG.to_string(), R_NAME_VG.to_string(), 0, None),
            (ResType::Lv, Some((name, offset, uuid))) => (
                format!("LV:{}", name),
                name.to_string(),
                offset,
                uuid.map(str::to_string),
            ),
            (ResType::Lv, None) => {
                return Err(LmError::Args("LV lock without LV coordinates".to_string()))
            }
        };

        // at most one resource per (type, identifier)
        let r = ls.resources.entry(key).or_insert_with(|| Resource {
            rtype,
            name,
            mode: LockMode::Un,
            offset,
            lv_uuid,
            vb: None,
        });

        if r.mode != LockMode::Un {
            return Err(LmError::Exists);
        }
        // an LV may have been freed and re-created at a new offset
        if rtype == ResType::Lv {
            r.offset = offset;
        }

        let prev_version = r.vb.map(|v| v.r_version).unwrap_or(0);

        debug!("{}:{} lock {:?}", ls.name, r.name, mode);

        let vb = ls.lm.acquire(r, mode, flags)?;
        r.mode = mode;

        if let Some(vb) = vb {
            r.vb = Some(vb);
            if vb.r_version != prev_version {
                debug!(
                    "{}:{} r_version {} -> {}, invalidating",
                    ls.name, r.name, prev_version, vb.r_version
                );
                match rtype {
                    ResType::Vg => self.notifier.vg_changed(&ls.vg_uuid, vb.r_version as i64),
                    ResType::Gl => self.notifier.global_changed(),
                    ResType::Lv => {}
                }
            }
        }

        Ok(vb)
    }

    /// Convert a held lease in place. An `r_version` is written to the
    /// value block first, and only from EX.
    pub fn convert(
        &self,
        vg_name: &str,
        rtype: ResType,
        lv_name: Option<&str>,
        mode: LockMode,
        r_version: Option<u32>,
    ) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        if ls.killed {
            return Err(LmError::Killed);
        }

        let key = resource_key(rtype, lv_name);
        let r = ls
            .resources
            .get_mut(&key)
            .ok_or_else(|| LmError::Args(format!("no lock found for {}", key)))?;

        ls.lm.convert(r, mode, r_version)?;

        if let (Some(rv), Some(vb)) = (r_version, r.vb.as_mut()) {
            vb.r_version = rv;
        }
        r.mode = mode;
        Ok(())
    }

    /// Release a lease, optionally publishing a new r_version through
    /// its value block on the way out.
    pub fn unlock(
        &self,
        vg_name: &str,
        rtype: ResType,
        lv_name: Option<&str>,
        r_version: Option<u32>,
    ) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        let key = resource_key(rtype, lv_name);
        let r = ls
            .resources
            .get_mut(&key)
            .ok_or_else(|| LmError::Args(format!("no lock found for {}", key)))?;

        ls.lm.release(r, r_version, false)?;

        if let (Some(rv), Some(vb)) = (r_version, r.vb.as_mut()) {
            vb.r_version = rv;
        }
        r.mode = LockMode::Un;
        Ok(())
    }

    /// The kill-path helper observed storage loss: every new request
    /// on the VG fails immediately from here on.
    pub fn kill_vg(&self, vg_name: &str) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;
        error!("S {} is being killed", ls.name);
        ls.killed = true;
        Ok(())
    }

    /// The kill-path helper quiesced the VG: drop every lease so the
    /// host escapes the watchdog.
    pub fn drop_vg(&self, vg_name: &str) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let mut ls = map
            .remove(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        let names: Vec<String> = ls.resources.keys().cloned().collect();
        for name in names {
            let mut r = ls.resources.remove(&name).unwrap();
            if r.mode != LockMode::Un {
                let _ = ls.lm.release(&mut r, None, false);
            }
        }
        let _ = ls.lm.rem_lockspace(false);
        let _ = ls.lm.disconnect();
        Ok(())
    }

    /// Allocate an LV lease slot, scanning from the remembered free
    /// offset. `NoSpace` means the lock-LV is full; the caller extends
    /// it and retries.
    pub fn find_free_lv_slot(&self, vg_name: &str) -> LmResult<u64> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        let offset = ls.lm.find_free_lv_slot(ls.free_lock_offset)?;
        ls.free_lock_offset = Some(offset);
        Ok(offset)
    }

    pub fn init_lv(&self, vg_name: &str, lv_name: &str) -> LmResult<u64> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;

        let offset = ls.lm.init_lv(lv_name, ls.free_lock_offset)?;
        ls.free_lock_offset = Some(offset + ls.align_size);
        Ok(offset)
    }

    pub fn free_lv(&self, vg_name: &str, offset: u64) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;
        ls.lm.free_lv(offset)
    }

    pub fn able_gl(&self, vg_name: &str, enable: bool) -> LmResult<()> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;
        ls.lm.able_gl(enable)
    }

    pub fn get_hosts(&self, vg_name: &str) -> LmResult<Vec<HostRecord>> {
        let mut map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        let ls = map
            .get_mut(vg_name)
            .ok_or_else(|| LmError::Args(format!("lockspace not started for {}", vg_name)))?;
        ls.lm.get_hosts()
    }

    pub fn generation(&self, vg_name: &str) -> Option<u64> {
        let map = self.lockspaces.lock().unwrap_or_else(|e| e.into_inner());
        map.get(vg_name).map(|ls| ls.generation)
    }
}

fn resource_key(rtype: ResType, lv_name: Option<&str>) -> String {
    match rtype {
        ResType::Gl => R_NAME_GL.to_string(),
        ResType::Vg => R_NAME_VG.to_string(),
        ResType::Lv => format!("LV:{}", lv_name.unwrap_or("")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        vg_calls: Mutex<Vec<(String, i64)>>,
        global_calls: AtomicUsize,
    }

    impl CacheNotifier for Recorder {
        fn vg_changed(&self, vg_uuid: &str, version: i64) {
            self.vg_calls
                .lock()
                .unwrap()
                .push((vg_uuid.to_string(), version));
        }
        fn global_changed(&self) {
            self.global_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A scripted lock manager for exercising the coordinator without
    /// a disk behind it.
    struct FakeLm {
        host_id: u32,
        generation: u64,
        corrupt: bool,
        repaired: bool,
        other_hosts: usize,
        vg_lease_version: u32,
        released: Vec<(String, bool)>,
    }

    impl FakeLm {
        fn new() -> FakeLm {
            FakeLm {
                host_id: 0,
                generation: 3,
                corrupt: false,
                repaired: false,
                other_hosts: 0,
                vg_lease_version: 0,
                released: Vec::new(),
            }
        }
    }

    impl LockManager for FakeLm {
        fn connect(&mut self) -> LmResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) -> LmResult<()> {
            Ok(())
        }
        fn set_host_id(&mut self, host_id: u32) {
            self.host_id = host_id;
        }
        fn set_killpath(&mut self, _cmd: &str, _args: &str) -> LmResult<()> {
            Ok(())
        }
        fn init_lockspace(&mut self, _enable_gl: bool) -> LmResult<()> {
            Ok(())
        }
        fn init_lv(&mut self, _lv_name: &str, start: Option<u64>) -> LmResult<u64> {
            Ok(start.unwrap_or(67 * 1048576))
        }
        fn rename_lockspace(&mut self, _new_name: &str) -> LmResult<()> {
            Ok(())
        }
        fn free_lv(&mut self, _offset: u64) -> LmResult<()> {
            Ok(())
        }
        fn read_lockspace_info(&mut self) -> LmResult<LockspaceInfo> {
            if self.corrupt && !self.repaired {
                return Err(LmError::LockRepair);
            }
            Ok(LockspaceInfo {
                sector_size: 512,
                align_size: 1048576,
                prev_generation: self.generation,
            })
        }
        fn repair_lockspace(&mut self, info: &PersistedInfo) -> LmResult<()> {
            assert_eq!(info.host_id, self.host_id);
            self.generation = info.generation;
            self.repaired = true;
            Ok(())
        }
        fn add_lockspace(&mut self) -> LmResult<u64> {
            self.generation += 1;
            Ok(self.generation)
        }
        fn rem_lockspace(&mut self, _free_vg: bool) -> LmResult<()> {
            Ok(())
        }
        fn acquire(
            &mut self,
            r: &mut Resource,
            _mode: LockMode,
            _flags: AcquireFlags,
        ) -> LmResult<Option<ValBlk>> {
            match r.rtype {
                ResType::Vg | ResType::Gl => Ok(Some(ValBlk {
                    version: VAL_BLK_VERSION,
                    flags: 0,
                    r_version: self.vg_lease_version,
                })),
                ResType::Lv => Ok(None),
            }
        }
        fn convert(
            &mut self,
            _r: &mut Resource,
            _mode: LockMode,
            _r_version: Option<u32>,
        ) -> LmResult<()> {
            Ok(())
        }
        fn release(
            &mut self,
            r: &mut Resource,
            r_version: Option<u32>,
            free_vg: bool,
        ) -> LmResult<()> {
            if let Some(rv) = r_version {
                self.vg_lease_version = rv;
            }
            self.released.push((r.name.clone(), free_vg));
            Ok(())
        }
        fn read_lvb(&mut self, _r: &Resource) -> LmResult<ValBlk> {
            Ok(ValBlk {
                version: VAL_BLK_VERSION,
                flags: 0,
                r_version: self.vg_lease_version,
            })
        }
        fn set_lvb(&mut self, _r: &Resource, vb: &ValBlk) -> LmResult<()> {
            self.vg_lease_version = vb.r_version;
            Ok(())
        }
        fn get_hosts(&mut self) -> LmResult<Vec<HostRecord>> {
            Ok(vec![HostRecord {
                host_id: self.host_id,
                generation: self.generation,
                timestamp: 0,
                state: HostState::Live,
            }])
        }
        fn hosts_count(&mut self) -> LmResult<usize> {
            Ok(self.other_hosts)
        }
        fn find_free_lv_slot(&mut self, start: Option<u64>) -> LmResult<u64> {
            Ok(start.unwrap_or(67 * 1048576))
        }
        fn gl_is_enabled(&mut self) -> LmResult<bool> {
            Ok(true)
        }
        fn able_gl(&mut self, _enable: bool) -> LmResult<()> {
            Ok(())
        }
    }

    fn coordinator(dir: &Path) -> (LockCoordinator, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let opts = LockdOptions {
            info_dir: dir.to_path_buf(),
            host_id: Some(7),
            host_id_file: None,
            killpath: "lvmlockctl".to_string(),
        };
        (LockCoordinator::new(rec.clone(), opts), rec)
    }

    #[test]
    fn info_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let info = PersistedInfo {
            host_id: 12,
            generation: 9,
            sector_size: 4096,
            align_size: 8 * 1048576,
        };
        write_info_file(dir.path(), "vg0", "UUID0", &info).unwrap();
        let back = read_info_file(dir.path(), "vg0").unwrap();
        assert_eq!(back, info);

        remove_info_file(dir.path(), "vg0");
        assert!(read_info_file(dir.path(), "vg0").is_err());
    }

    #[test]
    fn start_persists_info_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _rec) = coordinator(dir.path());

        let generation = coord
            .start_lockspace("vg0", "UUID0", Box::new(FakeLm::new()), StartOptions::default())
            .unwrap();
        assert_eq!(generation, 4);
        assert_eq!(coord.generation("vg0"), Some(4));

        let info = read_info_file(dir.path(), "vg0").unwrap();
        assert_eq!(info.host_id, 7);
        assert_eq!(info.generation, 4);
        assert_eq!(info.sector_size, 512);

        // double start is refused
        match coord.start_lockspace("vg0", "UUID0", Box::new(FakeLm::new()), StartOptions::default())
        {
            Err(LmError::Exists) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn repair_uses_info_file() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _rec) = coordinator(dir.path());

        write_info_file(
            dir.path(),
            "vg0",
            "UUID0",
            &PersistedInfo {
                host_id: 7,
                generation: 11,
                sector_size: 512,
                align_size: 1048576,
            },
        )
        .unwrap();

        let mut lm = FakeLm::new();
        lm.corrupt = true;
        let generation = coord
            .start_lockspace(
                "vg0",
                "UUID0",
                Box::new(lm),
                StartOptions {
                    repair: true,
                    ..Default::default()
                },
            )
            .unwrap();
        // recorded generation, plus the join epoch bump
        assert_eq!(generation, 12);
    }

    #[test]
    fn repair_without_info_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _rec) = coordinator(dir.path());

        let mut lm = FakeLm::new();
        lm.corrupt = true;
        match coord.start_lockspace(
            "vg0",
            "UUID0",
            Box::new(lm),
            StartOptions {
                repair: true,
                ..Default::default()
            },
        ) {
            Err(LmError::LockRepair) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn value_block_change_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, rec) = coordinator(dir.path());

        let mut lm = FakeLm::new();
        lm.vg_lease_version = 17;
        coord
            .start_lockspace("vg0", "UUID0", Box::new(lm), StartOptions::default())
            .unwrap();

        coord
            .lock(
                "vg0",
                ResType::Vg,
                None,
                LockMode::Ex,
                AcquireFlags::default(),
            )
            .unwrap();
        assert_eq!(
            *rec.vg_calls.lock().unwrap(),
            vec![("UUID0".to_string(), 17)]
        );

        // our own release with the same version must not re-trigger
        coord.unlock("vg0", ResType::Vg, None, Some(17)).unwrap();
        coord
            .lock(
                "vg0",
                ResType::Vg,
                None,
                LockMode::Ex,
                AcquireFlags::default(),
            )
            .unwrap();
        assert_eq!(rec.vg_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn killed_lockspace_rejects_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _rec) = coordinator(dir.path());

        coord
            .start_lockspace("vg0", "UUID0", Box::new(FakeLm::new()), StartOptions::default())
            .unwrap();
        coord.kill_vg("vg0").unwrap();

        match coord.lock(
            "vg0",
            ResType::Vg,
            None,
            LockMode::Sh,
            AcquireFlags::default(),
        ) {
            Err(LmError::Killed) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        // the helper can still drop everything
        coord.drop_vg("vg0").unwrap();
        assert!(coord.generation("vg0").is_none());
    }

    #[test]
    fn free_vg_refused_while_hosts_joined() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _rec) = coordinator(dir.path());

        let mut lm = FakeLm::new();
        lm.other_hosts = 2;
        coord
            .start_lockspace("vg0", "UUID0", Box::new(lm), StartOptions::default())
            .unwrap();

        match coord.stop_lockspace("vg0", true) {
            Err(LmError::Busy(2)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        // a plain stop is fine
        coord.stop_lockspace("vg0", false).unwrap();
    }

    #[test]
    fn host_id_must_be_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(Recorder::default());
        let opts = LockdOptions {
            info_dir: dir.path().to_path_buf(),
            host_id: Some(2001),
            host_id_file: None,
            killpath: "lvmlockctl".to_string(),
        };
        let coord = LockCoordinator::new(rec, opts);

        match coord.start_lockspace("vg0", "UUID0", Box::new(FakeLm::new()), StartOptions::default())
        {
            Err(LmError::HostId(2001)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn host_id_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lvmlocal.conf");
        fs::write(&path, "# local config\nhost_id = 42\n").unwrap();
        assert_eq!(read_host_id_file(&path), Some(42));
    }

    #[test]
    fn lockspace_names() {
        assert_eq!(lockspace_name("cc"), "lvm_cc");
        assert_eq!(GL_LS_NAME, "lvm_global");
        assert_eq!(
            lock_lv_path("cc"),
            PathBuf::from("/dev/cc/lvmlock")
        );
    }
}
