// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The in-memory metadata cache: an index of every PV and VG visible
//! to the host, populated by scans from clients and served back to
//! commands over the local socket.
//!
//! Cache states and transitions:
//!
//! . Empty: the process just started, nothing has been added yet.
//!   Requests get a token error until a scan populates us.
//! . Scanning: a client set the token to "updating" and is
//!   repopulating the cache with pv_found events. Other clients get
//!   `token_mismatch` until the scan finishes.
//! . Initialized: the scanning client set the token to its hash value;
//!   requests are served.
//! . Outdated: something changed on the system or on shared storage
//!   that has not been fed back in yet. We only learn about it when a
//!   client or the lock coordinator calls set_vg_info/set_global_info,
//!   after which read replies carry `vg_invalid`/`global_invalid`
//!   annotations until fresh metadata arrives.
//! . Updated: all pending events have been processed.
//!
//!   Empty -> Scanning -> Initialized -> {Scanning, Outdated}
//!   Outdated -> {Scanning, Updated}, Updated -> {Scanning, Outdated}
//!
//! Validity is tracked at two granularities. A single VG's cached
//! metadata is flagged with VGFL_INVALID in its side record when a
//! newer seqno is known to exist on disk; the VG namespace and the
//! orphan-PV set are flagged process-wide with GLFL_INVALID. A command
//! that sees the annotation decides for itself whether to rescan and
//! send the fresh metadata back via vg_update.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use log::{debug, error, warn};

use crate::parser::{textmap_to_buf, Entry, LvmTextMap, TextMapBuilder, TextMapOps};
use crate::registry::Registry;

pub const ORPHAN_VGID: &str = "#orphan";

pub const GLFL_INVALID: u32 = 0x0000_0001;
pub const GLFL_DISABLE: u32 = 0x0000_0002;
pub const GLFL_DISABLE_REASON_DIRECT: u32 = 0x0000_0004;
pub const GLFL_DISABLE_REASON_LVM1: u32 = 0x0000_0008;
pub const GLFL_DISABLE_REASON_DUPLICATES: u32 = 0x0000_0010;

const GLFL_DISABLE_REASON_ALL: u32 =
    GLFL_DISABLE_REASON_DIRECT | GLFL_DISABLE_REASON_LVM1 | GLFL_DISABLE_REASON_DUPLICATES;

pub const VGFL_INVALID: u32 = 0x0000_0001;

pub const DISABLE_REASON_DIRECT: &str = "DIRECT";
pub const DISABLE_REASON_LVM1: &str = "LVM1";
pub const DISABLE_REASON_DUPLICATES: &str = "DUPLICATES";

const TOKEN_MAX: usize = 128;

/// What a handler sends back: a config tree for nearly everything, raw
/// text for `dump`.
#[derive(Debug)]
pub enum Reply {
    Map(LvmTextMap),
    Text(Vec<u8>),
}

impl Reply {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Map(m) => textmap_to_buf(m),
            Reply::Text(t) => t.clone(),
        }
    }

    /// Unwrap the config-tree form; panics on a raw reply. Test and
    /// client-side convenience.
    pub fn into_map(self) -> LvmTextMap {
        match self {
            Reply::Map(m) => m,
            Reply::Text(_) => panic!("raw reply where a config tree was expected"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct VgInfo {
    external_version: i64,
    flags: u32,
}

#[derive(Default)]
struct PvTables {
    pvid_to_pvmeta: Registry<String, LvmTextMap>,
    device_to_pvid: Registry<u64, String>,
}

#[derive(Default)]
struct VgTables {
    vgid_to_metadata: Registry<String, LvmTextMap>,
    vgid_to_vgname: Registry<String, String>,
    // multimap: multiple VGs may share a name
    vgname_to_vgid: Registry<String, String>,
    vgid_to_info: BTreeMap<String, VgInfo>,
    vgid_to_outdated_pvs: Registry<String, Vec<String>>,
}

#[derive(Default)]
struct VgLockState {
    owner: Option<ThreadId>,
    depth: u32,
}

#[derive(Default)]
struct VgLock {
    state: Mutex<VgLockState>,
    cv: Condvar,
}

/// Per-vgid reentrant locks. Entries are never removed, so a clone of
/// the Arc stays valid for the unlock path without re-taking the
/// structural lock.
#[derive(Default)]
struct VgLockMap {
    locks: Mutex<BTreeMap<String, Arc<VgLock>>>,
}

struct VgLockGuard {
    lock: Arc<VgLock>,
}

impl VgLockMap {
    fn lock(&self, vgid: &str) -> VgLockGuard {
        let lock = {
            let mut map = self
                .locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            map.entry(vgid.to_string())
                .or_insert_with(|| Arc::new(VgLock::default()))
                .clone()
        };

        let me = thread::current().id();
        let mut st = lock.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    break;
                }
                Some(_) => {
                    st = lock.cv.wait(st).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        drop(st);

        VgLockGuard { lock }
    }
}

impl Drop for VgLockGuard {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock().unwrap_or_else(|e| e.into_inner());
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            self.lock.cv.notify_one();
        }
    }
}

enum Class {
    New,
    Rekeyed { old_vgid: String },
    Renamed { old_name: String },
    Unchanged,
}

enum UpdateOutcome {
    /// The cache now reflects the supplied metadata (or already did).
    Applied { old_seq: i64 },
    /// The supplied metadata was rejected and the cache kept; the
    /// origin PV may have been marked outdated.
    Ignored { old_seq: i64 },
}

type UpdateResult = std::result::Result<UpdateOutcome, String>;

/// The cache proper. Lock acquisition order, to prevent deadlock:
/// per-vg lock, then `pvid_to_vgid`, then the VG tables, then the PV
/// tables. The token lock is independent.
pub struct Cache {
    pvs: Mutex<PvTables>,
    vgs: Mutex<VgTables>,
    pvid_to_vgid: Mutex<Registry<String, String>>,
    vg_locks: VgLockMap,
    token: Mutex<String>,
    flags: AtomicU32,
}

impl Default for Cache {
    fn default() -> Cache {
        Cache::new()
    }
}

fn reply_ok() -> LvmTextMap {
    TextMapBuilder::new().string("response", "OK").build()
}

fn reply_fail(reason: &str) -> LvmTextMap {
    TextMapBuilder::new()
        .string("response", "failed")
        .string("reason", reason)
        .build()
}

fn reply_unknown(reason: &str) -> LvmTextMap {
    TextMapBuilder::new()
        .string("response", "unknown")
        .string("reason", reason)
        .build()
}

fn devno_str(dev: u64) -> String {
    format!("{}:{}", libc::major(dev), libc::minor(dev))
}

/// The pvids of every PV reference in a VG metadata tree.
fn pv_ids(meta: &LvmTextMap) -> Vec<String> {
    match meta.textmap_from_textmap("physical_volumes") {
        Some(pvs) => pvs
            .values()
            .filter_map(|e| match e {
                Entry::TextMap(pv) => pv.string_from_textmap("id").map(str::to_string),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    }
}

/// Drop the advisory per-PV device fields before caching metadata.
fn filter_metadata(meta: &mut LvmTextMap) {
    if let Some(Entry::TextMap(pvs)) = meta.get_mut("physical_volumes") {
        for v in pvs.values_mut() {
            if let Entry::TextMap(pv) = v {
                pv.remove("device");
            }
        }
    }
}

/// Add or remove a flag string in a list-valued field, creating the
/// field if needed. The field may arrive as a bare string.
fn set_flag(map: &mut LvmTextMap, field: &str, flag: &str, want: bool) {
    let mut list: Vec<Entry> = match map.get(field) {
        Some(Entry::List(l)) => (**l).clone(),
        Some(Entry::String(s)) => vec![Entry::String(s.clone())],
        _ => Vec::new(),
    };
    list.retain(|e| *e != Entry::String(flag.to_string()));
    if want {
        list.push(Entry::String(flag.to_string()));
    }
    map.insert(field.to_string(), Entry::List(Box::new(list)));
}

/// Remove `device` from a pvmeta, promoting the first alternate to
/// primary if `device` was the primary. Returns the device the PV
/// remains visible on, or None if this was its only device. Must run
/// under the PV-table lock so no reader can observe a pvmeta whose
/// primary is gone.
fn device_remove(pvmeta: &mut LvmTextMap, device: u64) -> Option<u64> {
    let prim = pvmeta.i64_from_textmap("device").unwrap_or(0) as u64;
    let mut alts: Vec<i64> = match pvmeta.list_from_textmap("devices_alternate") {
        Some(l) => l
            .iter()
            .filter_map(|e| match e {
                Entry::Number(n) => Some(*n),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    };

    let alt_device = if device > 0 && device == prim && !alts.is_empty() {
        let promoted = alts.remove(0);
        pvmeta.insert("device".to_string(), Entry::Number(promoted));
        Some(promoted as u64)
    } else if device != prim && prim > 0 {
        Some(prim)
    } else {
        None
    };

    alts.retain(|d| *d as u64 != device);
    if alts.is_empty() {
        pvmeta.remove("devices_alternate");
    } else {
        pvmeta.insert(
            "devices_alternate".to_string(),
            Entry::List(Box::new(alts.into_iter().map(Entry::Number).collect())),
        );
    }

    alt_device
}

impl Cache {
    pub fn new() -> Cache {
        Cache {
            pvs: Mutex::new(PvTables::default()),
            vgs: Mutex::new(VgTables::default()),
            pvid_to_vgid: Mutex::new(Registry::new()),
            vg_locks: VgLockMap::default(),
            token: Mutex::new(String::new()),
            flags: AtomicU32::new(0),
        }
    }

    /// Unrecoverable mid-mutation failure: the cache cannot be
    /// guaranteed consistent, so exit rather than continue and let the
    /// init system restart us into a fresh scan.
    fn abort_daemon(&self, msg: &str) -> ! {
        error!("{}", msg);
        error!("melvind could not be updated and is aborting.");
        if cfg!(test) {
            panic!("abort_daemon: {}", msg);
        }
        std::process::exit(1);
    }

    fn lock_pvs(&self) -> MutexGuard<PvTables> {
        match self.pvs.lock() {
            Ok(g) => g,
            Err(_) => self.abort_daemon("PV tables poisoned by a failed handler"),
        }
    }

    fn lock_vgs(&self) -> MutexGuard<VgTables> {
        match self.vgs.lock() {
            Ok(g) => g,
            Err(_) => self.abort_daemon("VG tables poisoned by a failed handler"),
        }
    }

    fn lock_pv2vg(&self) -> MutexGuard<Registry<String, String>> {
        match self.pvid_to_vgid.lock() {
            Ok(g) => g,
            Err(_) => self.abort_daemon("pvid_to_vgid poisoned by a failed handler"),
        }
    }

    /// Parse one request and return one reply, enforcing the token
    /// discipline first.
    pub fn handle(&self, req: &LvmTextMap) -> Reply {
        let rq = req.string_from_textmap("request").unwrap_or("NONE");
        let token = req.string_from_textmap("token").unwrap_or("NONE");

        if rq == "token_update" {
            let mut cur = self.token.lock().unwrap_or_else(|e| e.into_inner());
            let prev = cur.clone();
            *cur = token.chars().take(TOKEN_MAX).collect();
            return Reply::Map(
                TextMapBuilder::new()
                    .string("response", "OK")
                    .string("prev_token", &prev)
                    .build(),
            );
        }

        {
            let cur = self.token.lock().unwrap_or_else(|e| e.into_inner());
            if *cur != token && rq != "dump" && token != "skip" {
                let reason = if *cur == "updating" {
                    "updating"
                } else {
                    "token mismatch"
                };
                return Reply::Map(
                    TextMapBuilder::new()
                        .string("response", "token_mismatch")
                        .string("expected", cur.as_str())
                        .string("received", token)
                        .string("reason", reason)
                        .build(),
                );
            }
        }

        match rq {
            "pv_found" => Reply::Map(self.pv_found(req)),
            "pv_gone" => Reply::Map(self.pv_gone(req)),
            "pv_clear_all" => Reply::Map(self.pv_clear_all()),
            "pv_lookup" => Reply::Map(self.pv_lookup(req)),
            "pv_list" => Reply::Map(self.pv_list()),
            "vg_update" => Reply::Map(self.vg_update(req)),
            "vg_clear_outdated_pvs" => Reply::Map(self.vg_clear_outdated_pvs(req)),
            "vg_remove" => Reply::Map(self.vg_remove(req)),
            "vg_lookup" => Reply::Map(self.vg_lookup(req)),
            "vg_list" => Reply::Map(self.vg_list()),
            "set_global_info" => Reply::Map(self.set_global_info(req)),
            "get_global_info" => Reply::Map(self.get_global_info()),
            "set_vg_info" => Reply::Map(self.set_vg_info(req)),
            "dump" => Reply::Text(self.dump()),
            _ => Reply::Map(reply_fail("request not implemented")),
        }
    }

    //
    // Read handlers
    //

    fn global_invalid(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & GLFL_INVALID != 0
    }

    fn make_pv_node(
        &self,
        pv2vg: &Registry<String, String>,
        vgs: &VgTables,
        pvs: &PvTables,
        pvid: &str,
    ) -> Option<LvmTextMap> {
        let pvmeta = pvs.pvid_to_pvmeta.lookup(&pvid.to_string())?;
        let mut node = pvmeta.clone();

        if let Some(vgid) = pv2vg.lookup(&pvid.to_string()) {
            if vgid.as_str() != ORPHAN_VGID {
                node.insert("vgid".to_string(), Entry::String(vgid.clone()));
                if let Some(name) = vgs.vgid_to_vgname.lookup(vgid) {
                    node.insert("vgname".to_string(), Entry::String(name.clone()));
                }
            }
        }

        Some(node)
    }

    fn pv_list(&self) -> LvmTextMap {
        debug!("pv_list");

        let pv2vg = self.lock_pv2vg();
        let vgs = self.lock_vgs();
        let pvs = self.lock_pvs();

        let mut cn_pvs = LvmTextMap::new();
        for (pvid, _) in pvs.pvid_to_pvmeta.iter() {
            if let Some(node) = self.make_pv_node(&pv2vg, &vgs, &pvs, pvid) {
                cn_pvs.insert(pvid.clone(), Entry::TextMap(Box::new(node)));
            }
        }

        let mut b = TextMapBuilder::new()
            .string("response", "OK")
            .textmap("physical_volumes", cn_pvs);
        if self.global_invalid() {
            b = b.section("global_invalid");
        }
        b.build()
    }

    fn pv_lookup(&self, req: &LvmTextMap) -> LvmTextMap {
        let arg_pvid = req.string_from_textmap("uuid").map(str::to_string);
        let devt = req.i64_from_textmap("device").unwrap_or(0);

        debug!("pv_lookup pvid {:?} device {}", arg_pvid, devt);

        if arg_pvid.is_none() && devt == 0 {
            return reply_fail("need PVID or device");
        }

        let pv2vg = self.lock_pv2vg();
        let vgs = self.lock_vgs();
        let pvs = self.lock_pvs();

        let pvid = match arg_pvid {
            Some(p) => p,
            None => match pvs.device_to_pvid.lookup(&(devt as u64)) {
                Some(p) => p.clone(),
                None => {
                    warn!("pv_lookup: could not find device {}", devno_str(devt as u64));
                    return reply_unknown("device not found");
                }
            },
        };

        let node = match self.make_pv_node(&pv2vg, &vgs, &pvs, &pvid) {
            Some(n) => n,
            None => return reply_unknown("PV not found"),
        };

        let mut b = TextMapBuilder::new()
            .string("response", "OK")
            .textmap("physical_volume", node);
        if self.global_invalid() {
            b = b.section("global_invalid");
        }
        b.build()
    }

    fn vg_list(&self) -> LvmTextMap {
        debug!("vg_list");

        let vgs = self.lock_vgs();

        let mut cn_vgs = LvmTextMap::new();
        for (vgid, name) in vgs.vgid_to_vgname.iter() {
            let node = TextMapBuilder::new().string("name", name).build();
            cn_vgs.insert(vgid.clone(), Entry::TextMap(Box::new(node)));
        }

        let mut b = TextMapBuilder::new()
            .string("response", "OK")
            .textmap("volume_groups", cn_vgs);
        if self.global_invalid() {
            b = b.section("global_invalid");
        }
        b.build()
    }

    /// Merge each PV's cached pvmeta into the cloned metadata being
    /// returned, and flag PVs we hold no record for as MISSING.
    fn update_pv_status(&self, meta: &mut LvmTextMap) {
        let pvs = self.lock_pvs();

        if let Some(Entry::TextMap(pvsec)) = meta.get_mut("physical_volumes") {
            for v in pvsec.values_mut() {
                if let Entry::TextMap(pv) = v {
                    let pvid = pv.string_from_textmap("id").map(str::to_string);
                    let pvmeta = pvid
                        .and_then(|p| pvs.pvid_to_pvmeta.lookup(&p))
                        .cloned();

                    set_flag(pv, "status", "MISSING", pvmeta.is_none());

                    if let Some(pvmeta) = pvmeta {
                        for (mk, mv) in pvmeta {
                            // the id and dev_size nodes are redundant here
                            if mk != "id" && mk != "dev_size" {
                                pv.entry(mk).or_insert(mv);
                            }
                        }
                    }
                }
            }
        }
    }

    fn chain_outdated_pvs(&self, vgid: &str, meta: &mut LvmTextMap) {
        let vgs = self.lock_vgs();
        let pvs = self.lock_pvs();

        let list = match vgs.vgid_to_outdated_pvs.lookup(&vgid.to_string()) {
            Some(l) if !l.is_empty() => l,
            _ => return,
        };

        let mut out = LvmTextMap::new();
        for pvid in list {
            match pvs.pvid_to_pvmeta.lookup(pvid) {
                Some(m) => {
                    out.insert(pvid.clone(), Entry::TextMap(Box::new(m.clone())));
                }
                None => warn!("metadata for outdated PV {} not found", pvid),
            }
        }
        meta.insert("outdated_pvs".to_string(), Entry::TextMap(Box::new(out)));
    }

    fn vg_lookup(&self, req: &LvmTextMap) -> LvmTextMap {
        let mut uuid = req.string_from_textmap("uuid").map(str::to_string);
        let mut name = req.string_from_textmap("name").map(str::to_string);

        if uuid.is_none() && name.is_none() {
            error!("vg_lookup with no uuid or name");
            return reply_unknown("VG not found");
        } else if uuid.is_none() || name.is_none() {
            debug!(
                "vg_lookup vgid {} name {} needs lookup",
                uuid.as_deref().unwrap_or("none"),
                name.as_deref().unwrap_or("none")
            );

            {
                let vgs = self.lock_vgs();
                if let Some(n) = &name {
                    if uuid.is_none() {
                        if let Some((u, count)) = vgs.vgname_to_vgid.lookup_with_count(n) {
                            if count > 1 {
                                debug!("vg_lookup name {} found {} vgids", n, count);
                                return TextMapBuilder::new()
                                    .string("response", "multiple")
                                    .string("reason", "Multiple VGs found with same name")
                                    .build();
                            }
                            uuid = Some(u.clone());
                        }
                    }
                }
                if let Some(u) = &uuid {
                    if name.is_none() {
                        name = vgs.vgid_to_vgname.lookup(u).cloned();
                    }
                }
            }

            if uuid.is_none() || name.is_none() {
                return reply_unknown("VG not found");
            }
        } else {
            let u = uuid.as_ref().unwrap();
            let n = name.as_ref().unwrap();
            let vgs = self.lock_vgs();
            let name_lookup = vgs.vgid_to_vgname.lookup(u);
            let uuid_lookup = vgs.vgname_to_vgid.lookup_with_val(n, u);

            if name_lookup.is_none() || uuid_lookup.is_none() {
                error!("vg_lookup vgid {} name {} found incomplete mapping", u, n);
                return reply_unknown("VG mapping incomplete");
            } else if name_lookup != Some(n) {
                error!("vg_lookup vgid {} name {} found inconsistent mapping", u, n);
                return reply_unknown("VG mapping inconsistent");
            }
        }

        let uuid = uuid.unwrap();
        let name = name.unwrap();

        debug!("vg_lookup vgid {} name {}", uuid, name);

        let mut metadata = {
            let _vg = self.vg_locks.lock(&uuid);
            let vgs = self.lock_vgs();
            match vgs.vgid_to_metadata.lookup(&uuid) {
                Some(m) => m.clone(),
                None => return reply_unknown("UUID not found"),
            }
        };

        self.update_pv_status(&mut metadata);
        self.chain_outdated_pvs(&uuid, &mut metadata);

        let mut b = TextMapBuilder::new()
            .string("response", "OK")
            .string("name", &name)
            .textmap("metadata", metadata);

        if self.global_invalid() {
            b = b.section("global_invalid");
        }
        {
            let vgs = self.lock_vgs();
            if let Some(info) = vgs.vgid_to_info.get(&uuid) {
                if info.flags & VGFL_INVALID != 0 {
                    b = b.section("vg_invalid");
                }
            }
        }

        b.build()
    }

    //
    // Outdated-PV tracking
    //

    fn mark_outdated_pv(&self, vgid: &str, pvid: &str) {
        let mut vgs = self.lock_vgs();
        let pvs = self.lock_pvs();

        // only a PV with an unignored MDA can hold stale metadata
        let has_usable_mda = pvs
            .pvid_to_pvmeta
            .lookup(&pvid.to_string())
            .map(|m| {
                m.find_i64("mda0/ignore").unwrap_or(1) == 0
                    || m.find_i64("mda1/ignore").unwrap_or(1) == 0
            })
            .unwrap_or(false);
        if !has_usable_mda {
            return;
        }

        error!("PV {} has outdated metadata for VG {}", pvid, vgid);

        if let Some(list) = vgs.vgid_to_outdated_pvs.lookup_mut(&vgid.to_string()) {
            if !list.iter().any(|p| p == pvid) {
                list.push(pvid.to_string());
            }
        } else {
            debug!("created outdated_pvs list for VG {}", vgid);
            vgs.vgid_to_outdated_pvs
                .insert(vgid.to_string(), vec![pvid.to_string()]);
        }
    }

    fn vg_clear_outdated_pvs(&self, req: &LvmTextMap) -> LvmTextMap {
        let vgid = match req.string_from_textmap("vgid") {
            Some(v) => v,
            None => return reply_fail("need VG UUID"),
        };

        debug!("vg_clear_outdated_pvs vgid {}", vgid);

        let mut vgs = self.lock_vgs();
        vgs.vgid_to_outdated_pvs.remove(&vgid.to_string());
        reply_ok()
    }

    //
    // Structural removal
    //

    /// Drop every table entry for a vgid. Caller holds the VG tables
    /// and pvid_to_vgid locks.
    fn remove_metadata_locked(
        &self,
        vgs: &mut VgTables,
        pv2vg: &mut Registry<String, String>,
        vgid: &str,
        update_pvids: bool,
    ) {
        let key = vgid.to_string();
        let meta = vgs.vgid_to_metadata.remove(&key);
        vgs.vgid_to_info.remove(&key);
        vgs.vgid_to_outdated_pvs.remove(&key);
        let name = vgs.vgid_to_vgname.remove(&key);
        if let Some(name) = name {
            vgs.vgname_to_vgid.remove_with_val(&name, &key);
        }

        if update_pvids {
            if let Some(meta) = &meta {
                for pvid in pv_ids(meta) {
                    pv2vg.insert(pvid, ORPHAN_VGID.to_string());
                }
            }
        }
    }

    /// Retire a vgid whose PVs have all gone missing.
    fn vg_remove_if_missing(&self, vgid: &str, update_pvids: bool) {
        let _vg = self.vg_locks.lock(vgid);
        let mut pv2vg = self.lock_pv2vg();
        let mut vgs = self.lock_vgs();
        let pvs = self.lock_pvs();

        let meta = match vgs.vgid_to_metadata.lookup(&vgid.to_string()) {
            Some(m) => m.clone(),
            None => return,
        };

        let mut missing = true;
        for pvid in pv_ids(&meta) {
            if pv2vg.lookup(&pvid).map(String::as_str) == Some(vgid)
                && pvs.pvid_to_pvmeta.contains_key(&pvid)
            {
                missing = false;
            }
        }

        if missing {
            debug!("removing empty VG {}", vgid);
            drop(pvs);
            self.remove_metadata_locked(&mut vgs, &mut pv2vg, vgid, update_pvids);
        }
    }

    fn vg_remove(&self, req: &LvmTextMap) -> LvmTextMap {
        let vgid = match req.string_from_textmap("uuid") {
            Some(v) => v.to_string(),
            None => return reply_fail("need VG UUID"),
        };

        debug!("vg_remove: {}", vgid);

        let _vg = self.vg_locks.lock(&vgid);
        let mut pv2vg = self.lock_pv2vg();
        let mut vgs = self.lock_vgs();
        self.remove_metadata_locked(&mut vgs, &mut pv2vg, &vgid, true);

        reply_ok()
    }

    /// Purge every record of (name, vgid) so new metadata can be added
    /// without interference from an inconsistent previous state.
    fn purge_metadata(&self, arg_name: &str, arg_vgid: &str) {
        let mut pv2vg = self.lock_pv2vg();
        let mut vgs = self.lock_vgs();
        self.remove_metadata_locked(&mut vgs, &mut pv2vg, arg_vgid, true);
        vgs.vgname_to_vgid
            .remove_with_val(&arg_name.to_string(), &arg_vgid.to_string());
    }

    //
    // The update algorithm
    //

    /// Reassign every PV of `meta` to `vgid`. Returns the set of vgids
    /// those PVs previously belonged to, for an emptiness check once
    /// the structural locks have been released.
    fn update_pvid_to_vgid(
        &self,
        pv2vg: &mut Registry<String, String>,
        meta: &LvmTextMap,
        vgid: &str,
        collect_old: bool,
    ) -> Vec<String> {
        let mut to_check = Vec::new();

        for pvid in pv_ids(meta) {
            let old = pv2vg.insert(pvid.clone(), vgid.to_string());
            if collect_old {
                if let Some(old) = old {
                    if old != vgid && !to_check.contains(&old) {
                        to_check.push(old);
                    }
                }
            }
            debug!("moving PV {} to VG {}", pvid, vgid);
        }

        to_check
    }

    /// Orphan every PV of an outgoing metadata tree. Step (a) of each
    /// update path.
    fn orphan_pvs(&self, pv2vg: &mut Registry<String, String>, meta: &LvmTextMap) {
        for pvid in pv_ids(meta) {
            pv2vg.insert(pvid, ORPHAN_VGID.to_string());
        }
    }

    fn check_emptied_vgs(&self, to_check: Vec<String>) {
        for vgid in to_check {
            self.vg_remove_if_missing(&vgid, false);
        }
    }

    fn apply_add_new(&self, new_name: &str, new_vgid: &str, new_meta: LvmTextMap) {
        debug!("update_metadata_add_new for {} {}", new_name, new_vgid);

        let _vg = self.vg_locks.lock(new_vgid);
        let to_check = {
            let mut pv2vg = self.lock_pv2vg();
            let mut vgs = self.lock_vgs();

            vgs.vgid_to_metadata
                .insert(new_vgid.to_string(), new_meta.clone());
            vgs.vgid_to_vgname
                .insert(new_vgid.to_string(), new_name.to_string());
            vgs.vgname_to_vgid
                .insert_allow_multiple(new_name.to_string(), new_vgid.to_string());

            self.update_pvid_to_vgid(&mut pv2vg, &new_meta, new_vgid, true)
        };
        self.check_emptied_vgs(to_check);
    }

    fn apply_new_vgid(
        &self,
        arg_name: &str,
        old_vgid: &str,
        new_vgid: &str,
        old_meta: &LvmTextMap,
        new_meta: LvmTextMap,
    ) {
        debug!(
            "update_metadata_new_vgid for {} old {} new {}",
            arg_name, old_vgid, new_vgid
        );

        let _vg = self.vg_locks.lock(new_vgid);
        let to_check = {
            let mut pv2vg = self.lock_pv2vg();
            let mut vgs = self.lock_vgs();

            self.orphan_pvs(&mut pv2vg, old_meta);

            let old_key = old_vgid.to_string();
            vgs.vgid_to_info.remove(&old_key);
            vgs.vgid_to_outdated_pvs.remove(&old_key);
            vgs.vgid_to_metadata.remove(&old_key);
            vgs.vgid_to_vgname.remove(&old_key);
            vgs.vgname_to_vgid
                .remove_with_val(&arg_name.to_string(), &old_key);

            vgs.vgid_to_metadata
                .insert(new_vgid.to_string(), new_meta.clone());
            vgs.vgid_to_vgname
                .insert(new_vgid.to_string(), arg_name.to_string());
            vgs.vgname_to_vgid
                .insert_allow_multiple(arg_name.to_string(), new_vgid.to_string());

            self.update_pvid_to_vgid(&mut pv2vg, &new_meta, new_vgid, true)
        };
        self.check_emptied_vgs(to_check);
    }

    fn apply_new_name(
        &self,
        arg_vgid: &str,
        old_name: &str,
        new_name: &str,
        old_meta: &LvmTextMap,
        new_meta: LvmTextMap,
    ) {
        debug!(
            "update_metadata_new_name for {} old {} new {}",
            arg_vgid, old_name, new_name
        );

        let _vg = self.vg_locks.lock(arg_vgid);
        let to_check = {
            let mut pv2vg = self.lock_pv2vg();
            let mut vgs = self.lock_vgs();

            self.orphan_pvs(&mut pv2vg, old_meta);

            let key = arg_vgid.to_string();
            vgs.vgid_to_info.remove(&key);
            vgs.vgid_to_outdated_pvs.remove(&key);
            vgs.vgid_to_metadata.remove(&key);
            vgs.vgid_to_vgname.remove(&key);
            vgs.vgname_to_vgid
                .remove_with_val(&old_name.to_string(), &key);

            vgs.vgid_to_metadata
                .insert(arg_vgid.to_string(), new_meta.clone());
            vgs.vgid_to_vgname
                .insert(arg_vgid.to_string(), new_name.to_string());
            vgs.vgname_to_vgid
                .insert_allow_multiple(new_name.to_string(), arg_vgid.to_string());

            self.update_pvid_to_vgid(&mut pv2vg, &new_meta, arg_vgid, true)
        };
        self.check_emptied_vgs(to_check);
    }

    fn apply_replace(&self, arg_name: &str, arg_vgid: &str, old_meta: &LvmTextMap, new_meta: LvmTextMap) {
        debug!("update_metadata replace for {} {}", arg_name, arg_vgid);

        let _vg = self.vg_locks.lock(arg_vgid);
        let to_check = {
            let mut pv2vg = self.lock_pv2vg();
            let mut vgs = self.lock_vgs();

            self.orphan_pvs(&mut pv2vg, old_meta);

            vgs.vgid_to_metadata
                .insert(arg_vgid.to_string(), new_meta.clone());

            self.update_pvid_to_vgid(&mut pv2vg, &new_meta, arg_vgid, true)
        };
        self.check_emptied_vgs(to_check);
    }

    /// Reconcile one piece of incoming VG metadata with the cache.
    ///
    /// With `pvid` set the metadata was read from that single PV and
    /// may legitimately lose to what is cached; without it the caller
    /// holds the on-disk VG write lock and is authoritative.
    fn update_metadata(
        &self,
        arg_name: &str,
        arg_vgid: &str,
        new_metadata: &LvmTextMap,
        pvid: Option<&str>,
    ) -> UpdateResult {
        debug!(
            "update_metadata begin arg_vgid {} arg_name {} pvid {}",
            arg_vgid,
            arg_name,
            pvid.unwrap_or("none")
        );

        let mut new_meta = new_metadata.clone();
        filter_metadata(&mut new_meta);

        let new_seq = new_meta.i64_from_textmap("seqno").unwrap_or(-1);
        if new_seq <= 0 {
            return Err(format!("invalid seqno {} in new metadata", new_seq));
        }
        if new_meta.string_from_textmap("id") != Some(arg_vgid) {
            return Err("new metadata internal vgid does not match".to_string());
        }

        // Classify what changed: new VG, new vgid for an existing
        // name, new name for an existing vgid, or unchanged identity.
        let (mut class, mut old_meta) = {
            let vgs = self.lock_vgs();
            let name_of_vgid = vgs.vgid_to_vgname.lookup(&arg_vgid.to_string()).cloned();
            let pair_exists = vgs
                .vgname_to_vgid
                .lookup_with_val(&arg_name.to_string(), &arg_vgid.to_string())
                .is_some();

            let class = match (name_of_vgid, pair_exists) {
                (None, false) => match vgs.vgname_to_vgid.lookup_with_count(&arg_name.to_string()) {
                    None => Class::New,
                    Some((old_vgid, 1)) => Class::Rekeyed {
                        old_vgid: old_vgid.clone(),
                    },
                    Some((_, count)) => {
                        // no way to pick which of the vgids sharing
                        // this name is being replaced
                        error!(
                            "update_metadata arg_vgid {} arg_name {} found {} vgids for name",
                            arg_vgid, arg_name, count
                        );
                        return Err("VG name maps to multiple vgids".to_string());
                    }
                },
                (Some(ref n), true) if n.as_str() == arg_name => Class::Unchanged,
                (Some(n), false) if n.as_str() != arg_name => Class::Renamed { old_name: n },
                _ => {
                    error!(
                        "update_metadata arg_vgid {} arg_name {} inconsistent mapping",
                        arg_vgid, arg_name
                    );
                    if pvid.is_some() {
                        return Err("inconsistent name/vgid mapping".to_string());
                    }
                    drop(vgs);
                    self.abort_daemon("metadata update found an inconsistent name/vgid mapping");
                }
            };

            let old_meta = match &class {
                Class::New => None,
                Class::Rekeyed { old_vgid } => {
                    Some(vgs.vgid_to_metadata.lookup(old_vgid).cloned())
                }
                _ => Some(vgs.vgid_to_metadata.lookup(&arg_vgid.to_string()).cloned()),
            };

            let old_meta = match old_meta {
                None => None,
                Some(Some(m)) => Some(m),
                Some(None) => {
                    error!(
                        "update_metadata arg_vgid {} arg_name {} no old metadata",
                        arg_vgid, arg_name
                    );
                    if pvid.is_some() {
                        return Err("cached mapping without metadata".to_string());
                    }
                    drop(vgs);
                    self.abort_daemon("metadata update found a mapping with no cached metadata");
                }
            };

            (class, old_meta)
        };

        let mut old_seq = old_meta
            .as_ref()
            .and_then(|m| m.i64_from_textmap("seqno"))
            .unwrap_or(-1);
        let ret_old_seq = if old_meta.is_some() { old_seq } else { -1 };

        // outdated marks go on the vgid that holds the cached copy
        let owner_vgid = match &class {
            Class::Rekeyed { old_vgid } => old_vgid.clone(),
            _ => arg_vgid.to_string(),
        };

        // A reappeared PV carrying an older version of the VG: mark it
        // outdated and keep the cache.
        if pvid.is_some() && old_seq > 0 && new_seq < old_seq {
            error!(
                "update_metadata ignoring outdated metadata on PV {} seqno {} for {} {} seqno {}",
                pvid.unwrap(),
                new_seq,
                arg_vgid,
                arg_name,
                old_seq
            );
            self.mark_outdated_pv(&owner_vgid, pvid.unwrap());
            return Ok(UpdateOutcome::Ignored {
                old_seq: ret_old_seq,
            });
        }

        // A PV carrying a newer version than the cache: everything we
        // currently map must be outdated; the new metadata wins.
        if pvid.is_some() && old_seq > 0 && new_seq > old_seq {
            error!(
                "update_metadata found newer metadata on PV {} seqno {} for {} {} seqno {}",
                pvid.unwrap(),
                new_seq,
                arg_vgid,
                arg_name,
                old_seq
            );
            if let Some(old) = &old_meta {
                for p in pv_ids(old) {
                    self.mark_outdated_pv(&owner_vgid, &p);
                }
            }
        }

        // A corrupted cached entry cannot be reconciled; purge it.
        if old_meta.is_some() && old_seq <= 0 {
            error!(
                "update_metadata bad old seqno {} for {} {}",
                old_seq, arg_name, arg_vgid
            );
            self.purge_metadata(arg_name, arg_vgid);
            class = Class::New;
            old_meta = None;
            old_seq = -1;
        }

        if new_seq == old_seq {
            let same = old_meta.as_ref() == Some(&new_meta);
            if same {
                debug!(
                    "update_metadata skipped for {} {} seqno {} is unchanged",
                    arg_name, arg_vgid, old_seq
                );
                return Ok(UpdateOutcome::Applied {
                    old_seq: ret_old_seq,
                });
            }
            if let Some(p) = pvid {
                // matching seqno, unmatching content, from one PV:
                // that PV cannot be trusted
                error!(
                    "update_metadata from pv {} same seqno {} with unmatching data for {} {}",
                    p, new_seq, arg_name, arg_vgid
                );
                self.mark_outdated_pv(&owner_vgid, p);
                return Ok(UpdateOutcome::Ignored {
                    old_seq: ret_old_seq,
                });
            }
            error!(
                "update_metadata same seqno {} with unmatching data for {} {}",
                new_seq, arg_name, arg_vgid
            );
            self.purge_metadata(arg_name, arg_vgid);
            class = Class::New;
            old_meta = None;
        }

        if pvid.is_none() && old_meta.is_some() && new_seq < old_seq {
            // The command holds the VG lock and is authoritative even
            // when it moves the seqno backwards.
            error!(
                "update_metadata new seqno {} less than old seqno {} for {} {}",
                new_seq, old_seq, arg_name, arg_vgid
            );
            self.purge_metadata(arg_name, arg_vgid);
            class = Class::New;
            old_meta = None;
        }

        match class {
            Class::New => self.apply_add_new(arg_name, arg_vgid, new_meta),
            Class::Rekeyed { old_vgid } => self.apply_new_vgid(
                arg_name,
                &old_vgid,
                arg_vgid,
                old_meta.as_ref().unwrap(),
                new_meta,
            ),
            Class::Renamed { old_name } => self.apply_new_name(
                arg_vgid,
                &old_name,
                arg_name,
                old_meta.as_ref().unwrap(),
                new_meta,
            ),
            Class::Unchanged => self.apply_replace(
                arg_name,
                arg_vgid,
                old_meta.as_ref().unwrap(),
                new_meta,
            ),
        }

        debug!("update_metadata is done for {} {}", arg_name, arg_vgid);
        Ok(UpdateOutcome::Applied {
            old_seq: ret_old_seq,
        })
    }

    //
    // Event handlers
    //

    fn vg_is_complete(&self, meta: &LvmTextMap) -> bool {
        let pvs = self.lock_pvs();
        pv_ids(meta)
            .iter()
            .all(|pvid| pvs.pvid_to_pvmeta.contains_key(pvid))
    }

    fn pv_found(&self, req: &LvmTextMap) -> LvmTextMap {
        let arg_pvmeta = match req.textmap_from_textmap("pvmeta") {
            Some(m) => m.clone(),
            None => {
                error!("Ignore PV without PV metadata");
                return reply_fail("Ignore PV without PV metadata");
            }
        };
        let arg_pvid = match arg_pvmeta.string_from_textmap("id") {
            Some(p) => p.to_string(),
            None => {
                error!("Ignore PV without PV UUID");
                return reply_fail("Ignore PV without PV UUID");
            }
        };
        let arg_device = match arg_pvmeta.i64_from_textmap("device") {
            Some(d) if d > 0 => d as u64,
            _ => {
                error!("Ignore PV without device pvid {}", arg_pvid);
                return reply_fail("Ignore PV without device");
            }
        };

        let mut arg_vgmeta = None;
        let mut arg_name: Option<String> = None;
        let mut arg_vgid: Option<String> = None;
        let mut arg_seqno = -1;
        if let Some(meta) = req.textmap_from_textmap("metadata") {
            let name = req.string_from_textmap("vgname");
            let vgid = meta.string_from_textmap("id");
            let seqno = meta.i64_from_textmap("seqno").unwrap_or(-1);
            if name.is_none() {
                return reply_fail("Ignore VG metadata from PV without VG name");
            }
            if vgid.is_none() {
                return reply_fail("Ignore VG metadata from PV without VG vgid");
            }
            if seqno < 0 {
                return reply_fail("Ignore VG metadata from PV without VG seqno");
            }
            arg_name = name.map(str::to_string);
            arg_vgid = vgid.map(str::to_string);
            arg_seqno = seqno;
            arg_vgmeta = Some(meta.clone());
        }

        let mut changed = false;
        let mut prev_pvid_on_dev: Option<String> = None;
        let mut prev_vgid_on_dev: Option<String> = None;

        // The device axis: which of the four device/pvid combinations
        // is this?
        {
            let pv2vg = self.lock_pv2vg();
            let mut pvs = self.lock_pvs();

            let arg_device_lookup = pvs
                .pvid_to_pvmeta
                .lookup(&arg_pvid)
                .and_then(|m| m.i64_from_textmap("device"))
                .map(|d| d as u64);
            let arg_pvid_lookup = pvs.device_to_pvid.lookup(&arg_device).cloned();

            match (arg_pvid_lookup, arg_device_lookup) {
                (Some(ref p), Some(d)) if *p == arg_pvid && d == arg_device => {
                    // old PV on old device: refresh pvmeta in place
                    debug!(
                        "pv_found pvid {} on device {} matches existing",
                        arg_pvid,
                        devno_str(arg_device)
                    );
                    let old = pvs
                        .pvid_to_pvmeta
                        .insert(arg_pvid.clone(), arg_pvmeta.clone());
                    if old.as_ref() != Some(&arg_pvmeta) {
                        changed = true;
                    }
                }
                (None, None) => {
                    // new PV on new device
                    debug!(
                        "pv_found pvid {} on device {} is new",
                        arg_pvid,
                        devno_str(arg_device)
                    );
                    changed = true;
                    pvs.device_to_pvid.insert(arg_device, arg_pvid.clone());
                    pvs.pvid_to_pvmeta
                        .insert(arg_pvid.clone(), arg_pvmeta.clone());
                }
                (Some(prev_pvid), _) if prev_pvid != arg_pvid => {
                    // new PV on old device: the device has been reused
                    changed = true;
                    prev_vgid_on_dev = pv2vg.lookup(&prev_pvid).cloned();
                    debug!(
                        "pv_found pvid {} on device {} previous pvid {} vgid {}",
                        arg_pvid,
                        devno_str(arg_device),
                        prev_pvid,
                        prev_vgid_on_dev.as_deref().unwrap_or("none")
                    );

                    let remove_prev = match pvs.pvid_to_pvmeta.lookup_mut(&prev_pvid) {
                        Some(prev_meta) => device_remove(prev_meta, arg_device).is_none(),
                        None => false,
                    };
                    if remove_prev {
                        // arg_device was the prev PV's only device
                        debug!(
                            "pv_found device {} removes prev pvid {}",
                            devno_str(arg_device),
                            prev_pvid
                        );
                        pvs.pvid_to_pvmeta.remove(&prev_pvid);
                    }
                    prev_pvid_on_dev = Some(prev_pvid);

                    pvs.device_to_pvid.remove(&arg_device);
                    pvs.device_to_pvid.insert(arg_device, arg_pvid.clone());
                    pvs.pvid_to_pvmeta
                        .insert(arg_pvid.clone(), arg_pvmeta.clone());
                }
                (_, Some(old_device)) if old_device != arg_device => {
                    // old PV on new device: duplicate
                    changed = true;
                    debug!(
                        "pv_found pvid {} on device {} duplicate of {}",
                        arg_pvid,
                        devno_str(arg_device),
                        devno_str(old_device)
                    );

                    let mut alts: Vec<i64> = pvs
                        .pvid_to_pvmeta
                        .lookup(&arg_pvid)
                        .and_then(|m| m.list_from_textmap("devices_alternate").cloned())
                        .map(|l| {
                            l.iter()
                                .filter_map(|e| match e {
                                    Entry::Number(n) => Some(*n),
                                    _ => None,
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    if !alts.contains(&(old_device as i64)) {
                        alts.push(old_device as i64);
                    }
                    alts.retain(|d| *d as u64 != arg_device);

                    let mut new_pvmeta = arg_pvmeta.clone();
                    new_pvmeta.insert(
                        "devices_alternate".to_string(),
                        Entry::List(Box::new(alts.into_iter().map(Entry::Number).collect())),
                    );

                    pvs.device_to_pvid.insert(arg_device, arg_pvid.clone());
                    pvs.pvid_to_pvmeta.insert(arg_pvid.clone(), new_pvmeta);
                }
                (p, d) => {
                    error!(
                        "pv_found pvid {} on device {} unknown lookup {:?} {:?}",
                        arg_pvid,
                        devno_str(arg_device),
                        p,
                        d
                    );
                    return reply_fail("Ignore PV for unknown state");
                }
            }
        }

        // The VG metadata that came with the PV, if any.
        let mut old_seqno = -1;
        if let Some(vgmeta) = &arg_vgmeta {
            let name = arg_name.as_ref().unwrap();
            let vgid = arg_vgid.as_ref().unwrap();
            debug!(
                "pv_found pvid {} has VG {} {} seqno {}",
                arg_pvid, name, vgid, arg_seqno
            );

            match self.update_metadata(name, vgid, vgmeta, Some(&arg_pvid)) {
                Ok(UpdateOutcome::Applied { old_seq })
                | Ok(UpdateOutcome::Ignored { old_seq }) => old_seqno = old_seq,
                Err(reason) => {
                    error!(
                        "Cannot use VG metadata for {} {} from PV {} on {}: {}",
                        name,
                        vgid,
                        arg_pvid,
                        devno_str(arg_device),
                        reason
                    );
                }
            }

            changed |= old_seqno != arg_seqno;
        } else {
            arg_vgid = self.lock_pv2vg().lookup(&arg_pvid).cloned();
            if let Some(vgid) = &arg_vgid {
                arg_name = self.lock_vgs().vgid_to_vgname.lookup(vgid).cloned();
            }
        }

        // Is the VG complete now that this PV is in?
        let mut vg_status = "orphan";
        let mut vg_status_seqno = -1;
        match &arg_vgid {
            None => {}
            Some(vgid) if vgid.as_str() == ORPHAN_VGID => {}
            Some(vgid) => {
                let _vg = self.vg_locks.lock(vgid);
                let meta = self.lock_vgs().vgid_to_metadata.lookup(vgid).cloned();
                match meta {
                    None => {
                        error!(
                            "pv_found {} on {} vgid {} no VG metadata found",
                            arg_pvid,
                            devno_str(arg_device),
                            vgid
                        );
                    }
                    Some(meta) => {
                        vg_status = if self.vg_is_complete(&meta) {
                            "complete"
                        } else {
                            "partial"
                        };
                        vg_status_seqno = meta.i64_from_textmap("seqno").unwrap_or(-1);
                    }
                }
            }
        }

        // If the device previously held a different VG, that VG may
        // have no devices left.
        if let Some(prev_vgid) = &prev_vgid_on_dev {
            if arg_vgid.as_deref() != Some(prev_vgid.as_str()) {
                self.vg_remove_if_missing(prev_vgid, true);
            }
            if let Some(prev_pvid) = &prev_pvid_on_dev {
                self.lock_pv2vg().remove(prev_pvid);
            }
        }

        TextMapBuilder::new()
            .string("response", "OK")
            .string("status", vg_status)
            .number("changed", changed as i64)
            .string("vgid", arg_vgid.as_deref().unwrap_or(ORPHAN_VGID))
            .string("vgname", arg_name.as_deref().unwrap_or(ORPHAN_VGID))
            .number("seqno_before", old_seqno)
            .number("seqno_after", vg_status_seqno)
            .build()
    }

    fn pv_gone(&self, req: &LvmTextMap) -> LvmTextMap {
        let arg_pvid = req.string_from_textmap("uuid").map(str::to_string);
        let arg_device = req.i64_from_textmap("device").unwrap_or(0);

        let vgid;
        let alt_device;
        {
            let pv2vg = self.lock_pv2vg();
            let mut pvs = self.lock_pvs();

            let pvid = match &arg_pvid {
                Some(p) => p.clone(),
                None => {
                    if arg_device <= 0 {
                        return reply_unknown("device not in cache");
                    }
                    match pvs.device_to_pvid.lookup(&(arg_device as u64)) {
                        Some(p) => p.clone(),
                        None => {
                            debug!("pv_gone device {} not found", devno_str(arg_device as u64));
                            return reply_unknown("device not in cache");
                        }
                    }
                }
            };

            debug!("pv_gone {} device {}", pvid, arg_device);

            if !pvs.pvid_to_pvmeta.contains_key(&pvid) {
                return reply_unknown("PVID does not exist");
            }

            vgid = pv2vg.lookup(&pvid).cloned();

            // with only a uuid, the primary device is the one going
            let device = if arg_device > 0 {
                arg_device as u64
            } else {
                pvs.pvid_to_pvmeta
                    .lookup(&pvid)
                    .and_then(|m| m.i64_from_textmap("device"))
                    .unwrap_or(0) as u64
            };

            pvs.device_to_pvid.remove(&device);
            alt_device = pvs
                .pvid_to_pvmeta
                .lookup_mut(&pvid)
                .and_then(|m| device_remove(m, device));

            if alt_device.is_none() {
                pvs.pvid_to_pvmeta.remove(&pvid);
            } else {
                debug!(
                    "pv_gone {} device {} has alt_device {}",
                    pvid,
                    device,
                    alt_device.unwrap()
                );
            }
        }

        if let Some(vgid) = vgid {
            self.vg_remove_if_missing(&vgid, true);
        }

        match alt_device {
            Some(alt) => TextMapBuilder::new()
                .string("response", "OK")
                .number("device", alt as i64)
                .build(),
            None => reply_ok(),
        }
    }

    fn pv_clear_all(&self) -> LvmTextMap {
        debug!("pv_clear_all");

        let mut pv2vg = self.lock_pv2vg();
        let mut vgs = self.lock_vgs();
        let mut pvs = self.lock_pvs();

        pvs.pvid_to_pvmeta.clear();
        pvs.device_to_pvid.clear();
        vgs.vgid_to_metadata.clear();
        vgs.vgid_to_vgname.clear();
        vgs.vgname_to_vgid.clear();
        vgs.vgid_to_info.clear();
        vgs.vgid_to_outdated_pvs.clear();
        pv2vg.clear();

        reply_ok()
    }

    fn vg_update(&self, req: &LvmTextMap) -> LvmTextMap {
        let metadata = match req.textmap_from_textmap("metadata") {
            Some(m) => m.clone(),
            None => return reply_ok(),
        };
        let vgid = match metadata.string_from_textmap("id") {
            Some(v) => v.to_string(),
            None => return reply_fail("vg_update: need VG UUID"),
        };
        let vgname = match req.string_from_textmap("vgname") {
            Some(n) => n.to_string(),
            None => return reply_fail("vg_update: need VG name"),
        };
        let seqno = metadata.i64_from_textmap("seqno").unwrap_or(-1);
        if seqno < 0 {
            return reply_fail("vg_update: need VG seqno");
        }

        debug!("vg_update vgid {} name {}", vgid, vgname);

        match self.update_metadata(&vgname, &vgid, &metadata, None) {
            Ok(_) => {
                self.vg_info_update(&vgid, seqno);
                reply_ok()
            }
            Err(reason) => reply_fail(&format!("vg_update: {}", reason)),
        }
    }

    /// A fresh vg_update brings the cache back in sync; clear the
    /// invalid flag once the cached seqno catches up with the version
    /// another host advertised.
    fn vg_info_update(&self, vgid: &str, cache_version: i64) {
        if cache_version < 0 {
            return;
        }
        let mut vgs = self.lock_vgs();
        if let Some(info) = vgs.vgid_to_info.get_mut(vgid) {
            if cache_version >= info.external_version {
                info.flags &= !VGFL_INVALID;
            }
        }
    }

    //
    // Validity flags
    //

    fn set_vg_info(&self, req: &LvmTextMap) -> LvmTextMap {
        let new_version = req.i64_from_textmap("version").unwrap_or(-1);
        if new_version == -1 {
            return reply_ok();
        }

        let uuid = req.string_from_textmap("uuid").map(str::to_string);
        let name = req.string_from_textmap("name").map(str::to_string);

        let mut vgs = self.lock_vgs();

        let mut targets: Vec<String> = Vec::new();
        if let Some(u) = &uuid {
            if vgs.vgid_to_metadata.contains_key(u) {
                targets.push(u.clone());
            }
        }
        if targets.is_empty() {
            if let Some(n) = &name {
                // several VGs may share the name; invalidate each
                targets = vgs
                    .vgname_to_vgid
                    .iter()
                    .filter(|(k, _)| k.as_str() == n.as_str())
                    .map(|(_, v)| v.clone())
                    .filter(|v| vgs.vgid_to_metadata.contains_key(v))
                    .collect();
            }
        }

        for vgid in targets {
            if new_version != 0 {
                let cache_version = vgs
                    .vgid_to_metadata
                    .lookup(&vgid)
                    .and_then(|m| m.i64_from_textmap("seqno"))
                    .unwrap_or(-1);
                if cache_version != -1 && cache_version >= new_version {
                    continue;
                }
            }
            let info = vgs.vgid_to_info.entry(vgid).or_insert_with(VgInfo::default);
            info.external_version = new_version;
            info.flags |= VGFL_INVALID;
        }

        reply_ok()
    }

    fn set_global_info(&self, req: &LvmTextMap) -> LvmTextMap {
        let global_invalid = req.i64_from_textmap("global_invalid").unwrap_or(-1);
        let global_disable = req.i64_from_textmap("global_disable").unwrap_or(-1);

        let mut reason_flags = 0;
        if let Some(reason) = req.string_from_textmap("disable_reason") {
            if reason.contains(DISABLE_REASON_DIRECT) {
                reason_flags |= GLFL_DISABLE_REASON_DIRECT;
            }
            if reason.contains(DISABLE_REASON_LVM1) {
                reason_flags |= GLFL_DISABLE_REASON_LVM1;
            }
            if reason.contains(DISABLE_REASON_DUPLICATES) {
                reason_flags |= GLFL_DISABLE_REASON_DUPLICATES;
            }
        }

        if global_invalid != -1 {
            debug!(
                "set global info invalid from {} to {}",
                self.global_invalid() as i64,
                global_invalid
            );
        }

        if global_invalid == 1 {
            self.flags.fetch_or(GLFL_INVALID, Ordering::SeqCst);
        } else if global_invalid == 0 {
            self.flags.fetch_and(!GLFL_INVALID, Ordering::SeqCst);
        }

        // A reason bit only ever accompanies the disable flag, and
        // clearing the disable flag clears every reason with it.
        if global_disable == 1 {
            self.flags
                .fetch_or(GLFL_DISABLE | reason_flags, Ordering::SeqCst);
        } else if global_disable == 0 {
            self.flags
                .fetch_and(!(GLFL_DISABLE | GLFL_DISABLE_REASON_ALL), Ordering::SeqCst);
        }

        reply_ok()
    }

    fn get_global_info(&self) -> LvmTextMap {
        let flags = self.flags.load(Ordering::SeqCst);

        let mut reasons = Vec::new();
        if flags & GLFL_DISABLE != 0 {
            if flags & GLFL_DISABLE_REASON_DIRECT != 0 {
                reasons.push(DISABLE_REASON_DIRECT);
            }
            if flags & GLFL_DISABLE_REASON_LVM1 != 0 {
                reasons.push(DISABLE_REASON_LVM1);
            }
            if flags & GLFL_DISABLE_REASON_DUPLICATES != 0 {
                reasons.push(DISABLE_REASON_DUPLICATES);
            }
        }
        let reason = if reasons.is_empty() {
            "none".to_string()
        } else {
            reasons.join(",")
        };

        let token = self.token.lock().unwrap_or_else(|e| e.into_inner());
        let token_str = if token.is_empty() {
            "none"
        } else {
            token.as_str()
        };

        debug!(
            "global info invalid is {} disable is {} reason {}",
            (flags & GLFL_INVALID != 0) as i64,
            (flags & GLFL_DISABLE != 0) as i64,
            reason
        );

        TextMapBuilder::new()
            .string("response", "OK")
            .number("global_invalid", (flags & GLFL_INVALID != 0) as i64)
            .number("global_disable", (flags & GLFL_DISABLE != 0) as i64)
            .string("disable_reason", &reason)
            .string("token", token_str)
            .build()
    }

    /// Entry point for the lock coordinator when a lease value block
    /// shows another host has advanced a VG's metadata.
    pub fn invalidate_vg(&self, vg_uuid: &str, version: i64) {
        let req = TextMapBuilder::new()
            .string("uuid", vg_uuid)
            .number("version", version)
            .build();
        self.set_vg_info(&req);
    }

    /// Entry point for the lock coordinator when the global-lock value
    /// block shows a cross-host change to global state.
    pub fn invalidate_global(&self) {
        self.flags.fetch_or(GLFL_INVALID, Ordering::SeqCst);
    }

    //
    // Operator inspection
    //

    fn dump(&self) -> Vec<u8> {
        let pv2vg = self.lock_pv2vg();
        let vgs = self.lock_vgs();
        let pvs = self.lock_pvs();

        let mut b = String::new();

        b.push_str("# VG METADATA\n\n");
        for (vgid, meta) in vgs.vgid_to_metadata.iter() {
            let mut wrap = LvmTextMap::new();
            wrap.insert(vgid.clone(), Entry::TextMap(Box::new(meta.clone())));
            b.push_str(&String::from_utf8_lossy(&textmap_to_buf(&wrap)));
        }

        b.push_str("\n# PV METADATA\n\n");
        for (pvid, meta) in pvs.pvid_to_pvmeta.iter() {
            let mut wrap = LvmTextMap::new();
            wrap.insert(pvid.clone(), Entry::TextMap(Box::new(meta.clone())));
            b.push_str(&String::from_utf8_lossy(&textmap_to_buf(&wrap)));
        }

        b.push_str("\n# VGID to VGNAME mapping\n\n");
        b.push_str("vgid_to_vgname {\n");
        for (vgid, name) in vgs.vgid_to_vgname.iter() {
            b.push_str(&format!("    {} = \"{}\"\n", vgid, name));
        }
        b.push_str("}\n");

        b.push_str("\n# VGID to outdated PVs mapping\n\n");
        b.push_str("vgid_to_outdated_pvs {\n");
        for (vgid, list) in vgs.vgid_to_outdated_pvs.iter() {
            let quoted: Vec<String> = list.iter().map(|p| format!("\"{}\"", p)).collect();
            b.push_str(&format!("    {} = [{}]\n", vgid, quoted.join(", ")));
        }
        b.push_str("}\n");

        b.push_str("\n# VGNAME to VGID mapping\n\n");
        b.push_str("vgname_to_vgid {\n");
        for (name, vgid) in vgs.vgname_to_vgid.iter() {
            b.push_str(&format!("    {} = \"{}\"\n", name, vgid));
        }
        b.push_str("}\n");

        b.push_str("\n# PVID to VGID mapping\n\n");
        b.push_str("pvid_to_vgid {\n");
        for (pvid, vgid) in pv2vg.iter() {
            b.push_str(&format!("    {} = \"{}\"\n", pvid, vgid));
        }
        b.push_str("}\n");

        b.push_str("\n# DEVICE to PVID mapping\n\n");
        b.push_str("device_to_pvid {\n");
        for (dev, pvid) in pvs.device_to_pvid.iter() {
            b.push_str(&format!("    {} = \"{}\"\n", dev, pvid));
        }
        b.push_str("}\n");

        b.push_str("\n# VGID to INFO version mapping\n\n");
        b.push_str("vgid_to_info {\n");
        for (vgid, info) in &vgs.vgid_to_info {
            b.push_str(&format!("    {} = {}\n", vgid, info.external_version));
        }
        b.push_str("}\n");

        b.push_str("\n# VGID to INFO flags mapping\n\n");
        b.push_str("vgid_to_info {\n");
        for (vgid, info) in &vgs.vgid_to_info {
            b.push_str(&format!("    {} = {:x}\n", vgid, info.flags));
        }
        b.push_str("}\n");

        b.into_bytes()
    }

    /// Verify the cross-table invariants; test support.
    #[cfg(test)]
    fn check_invariants(&self) {
        let pv2vg = self.lock_pv2vg();
        let vgs = self.lock_vgs();
        let _pvs = self.lock_pvs();

        // every non-orphan pvid_to_vgid target has metadata listing it
        for (pvid, vgid) in pv2vg.iter() {
            if vgid.as_str() == ORPHAN_VGID {
                continue;
            }
            let meta = vgs
                .vgid_to_metadata
                .lookup(vgid)
                .unwrap_or_else(|| panic!("pvid {} maps to unknown vgid {}", pvid, vgid));
            assert!(
                pv_ids(meta).contains(pvid),
                "pvid {} not listed by vgid {}",
                pvid,
                vgid
            );
        }

        // vgname_to_vgid is the converse multimap of vgid_to_vgname
        for (vgid, name) in vgs.vgid_to_vgname.iter() {
            assert!(
                vgs.vgname_to_vgid.lookup_with_val(name, vgid).is_some(),
                "missing converse mapping for {} {}",
                name,
                vgid
            );
        }
        for (name, vgid) in vgs.vgname_to_vgid.iter() {
            assert_eq!(
                vgs.vgid_to_vgname.lookup(vgid),
                Some(name),
                "dangling vgname_to_vgid {} {}",
                name,
                vgid
            );
        }

        // internal and external vgids agree
        for (vgid, meta) in vgs.vgid_to_metadata.iter() {
            assert_eq!(meta.string_from_textmap("id"), Some(vgid.as_str()));
        }

        // side records only exist for cached vgids
        for vgid in vgs.vgid_to_info.keys() {
            assert!(vgs.vgid_to_metadata.contains_key(vgid));
        }
        for vgid in vgs.vgid_to_outdated_pvs.keys() {
            assert!(vgs.vgid_to_metadata.contains_key(vgid));
        }

        // a disable reason only while disabled
        let flags = self.flags.load(Ordering::SeqCst);
        if flags & GLFL_DISABLE == 0 {
            assert_eq!(flags & GLFL_DISABLE_REASON_ALL, 0);
        }
    }
}
