// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The delta/paxos-lease back-end. Leases live in fixed slots on the
//! lock-LV:
//!
//!   offset 0                    lockspace header, then per-host delta
//!                               lease records (one sector per host id)
//!   offset align x 1..64        reserved
//!   offset align x 65           global-lock lease ("GL", or
//!                               "GL_DISABLED" in VGs not carrying it)
//!   offset align x 66           VG-lock lease ("VG")
//!   offset align x 67 + k       k-th LV lease (the LV name, or
//!                               "#unused" when free)
//!
//! Each record is one sector: magic, CRC over the body, sector/align
//! flags, names, owner and generation, and a 16-byte value block.
//! A zeroed slot decodes as a magic mismatch, which doubles as the
//! "freshly-extended, uninitialized" signal during slot scans.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};

use crate::lockd::{
    AcquireFlags, HostRecord, HostState, LmError, LmResult, LockManager, LockMode, LockspaceInfo,
    PersistedInfo, ResType, Resource, ValBlk, R_NAME_GL, R_NAME_GL_DISABLED, R_NAME_REMOVED,
    R_NAME_UNUSED, R_NAME_VG, VAL_BLK_VERSION,
};
use crate::util::crc32_calc;

pub const ONE_MB: u64 = 1_048_576;

pub const GL_LOCK_BEGIN: u64 = 65;
pub const VG_LOCK_BEGIN: u64 = 66;
pub const LV_LOCK_BEGIN: u64 = 67;

const DELTA_MAGIC: u32 = 0x1221_2010;
const PAXOS_MAGIC: u32 = 0x0615_2010;

const LSF_SECTOR512: u32 = 0x0000_0001;
const LSF_SECTOR4K: u32 = 0x0000_0002;
const LSF_ALIGN1M: u32 = 0x0000_0004;
const LSF_ALIGN2M: u32 = 0x0000_0008;
const LSF_ALIGN4M: u32 = 0x0000_0010;
const LSF_ALIGN8M: u32 = 0x0000_0020;

const NAME_LEN: usize = 48;
const RECORD_BODY_END: usize = 152;

const MODE_FREE: u32 = 0;
const MODE_SH: u32 = 1;
const MODE_EX: u32 = 2;

const HOST_FREE: u32 = 0;
const HOST_LIVE: u32 = 1;
const HOST_FAIL: u32 = 2;
const HOST_DEAD: u32 = 3;
const HOST_UNKNOWN: u32 = 4;

/// Pick sector and align size for a new lockspace from what the
/// device reports.
pub fn choose_sizes(physical_block_size: u32, logical_block_size: u32) -> LmResult<(u32, u32)> {
    let mut physical = physical_block_size;
    let mut logical = logical_block_size;

    if (physical, logical) == (512, 512) {
        return Ok((512, 1));
    }
    if (physical, logical) == (4096, 4096) {
        return Ok((4096, 8));
    }

    if physical != 0 && physical != 512 && physical != 4096 {
        warn!(
            "WARNING: Invalid block sizes physical {} logical {}",
            physical, logical
        );
        physical = 0;
    }
    if logical != 0 && logical != 512 && logical != 4096 {
        warn!(
            "WARNING: Invalid block sizes physical {} logical {}",
            physical, logical
        );
        logical = 0;
    }

    if physical == 0 && logical == 0 {
        return Err(LmError::Args("no block size for device".to_string()));
    }
    if physical == 0 {
        physical = logical;
    }
    if logical == 0 {
        logical = physical;
    }

    if physical != logical {
        warn!(
            "WARNING: Mixed block sizes physical {} logical {} (using 4096)",
            physical, logical
        );
        return Ok((4096, 8));
    }

    match physical {
        512 => Ok((512, 1)),
        4096 => Ok((4096, 8)),
        _ => Err(LmError::Args("no block size for device".to_string())),
    }
}

fn size_flags(sector_size: u32, align_size: u64) -> u32 {
    let mut flags = match sector_size {
        4096 => LSF_SECTOR4K,
        _ => LSF_SECTOR512,
    };
    flags |= match align_size / ONE_MB {
        8 => LSF_ALIGN8M,
        4 => LSF_ALIGN4M,
        2 => LSF_ALIGN2M,
        _ => LSF_ALIGN1M,
    };
    flags
}

fn sizes_from_flags(flags: u32) -> Option<(u32, u64)> {
    let sector = if flags & LSF_SECTOR4K != 0 {
        4096
    } else if flags & LSF_SECTOR512 != 0 {
        512
    } else {
        return None;
    };
    let align = if flags & LSF_ALIGN8M != 0 {
        8 * ONE_MB
    } else if flags & LSF_ALIGN4M != 0 {
        4 * ONE_MB
    } else if flags & LSF_ALIGN2M != 0 {
        2 * ONE_MB
    } else if flags & LSF_ALIGN1M != 0 {
        ONE_MB
    } else {
        return None;
    };
    Some((sector, align))
}

fn now_micros() -> u64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1000) as u64
}

#[derive(Debug, Clone)]
struct RawRecord {
    magic: u32,
    flags: u32,
    aux: u32,
    ls_name: String,
    res_name: String,
    owner: u64,
    generation: u64,
    timestamp: u64,
    vb: ValBlk,
}

impl RawRecord {
    fn new(magic: u32, flags: u32, ls_name: &str, res_name: &str) -> RawRecord {
        RawRecord {
            magic,
            flags,
            aux: 0,
            ls_name: ls_name.to_string(),
            res_name: res_name.to_string(),
            owner: 0,
            generation: 0,
            timestamp: 0,
            vb: ValBlk::default(),
        }
    }
}

enum DecodeError {
    /// Zeroed or foreign data where a lease was expected.
    Magic,
    Checksum,
}

fn put_name(buf: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn get_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn encode_record(rec: &RawRecord, sector_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; sector_size as usize];

    LittleEndian::write_u32(&mut buf[..4], rec.magic);
    LittleEndian::write_u32(&mut buf[8..12], rec.flags);
    LittleEndian::write_u32(&mut buf[12..16], rec.aux);
    put_name(&mut buf[16..16 + NAME_LEN], &rec.ls_name);
    put_name(&mut buf[64..64 + NAME_LEN], &rec.res_name);
    LittleEndian::write_u64(&mut buf[112..120], rec.owner);
    LittleEndian::write_u64(&mut buf[120..128], rec.generation);
    LittleEndian::write_u64(&mut buf[128..136], rec.timestamp);
    LittleEndian::write_u16(&mut buf[136..138], rec.vb.version);
    LittleEndian::write_u16(&mut buf[138..140], rec.vb.flags);
    LittleEndian::write_u32(&mut buf[140..144], rec.vb.r_version);

    let csum = crc32_calc(&buf[8..RECORD_BODY_END]);
    LittleEndian::write_u32(&mut buf[4..8], csum);

    buf
}

fn decode_record(buf: &[u8], magic: u32) -> Result<RawRecord, DecodeError> {
    if LittleEndian::read_u32(&buf[..4]) != magic {
        return Err(DecodeError::Magic);
    }
    if LittleEndian::read_u32(&buf[4..8]) != crc32_calc(&buf[8..RECORD_BODY_END]) {
        return Err(DecodeError::Checksum);
    }

    Ok(RawRecord {
        magic,
        flags: LittleEndian::read_u32(&buf[8..12]),
        aux: LittleEndian::read_u32(&buf[12..16]),
        ls_name: get_name(&buf[16..16 + NAME_LEN]),
        res_name: get_name(&buf[64..64 + NAME_LEN]),
        owner: LittleEndian::read_u64(&buf[112..120]),
        generation: LittleEndian::read_u64(&buf[120..128]),
        timestamp: LittleEndian::read_u64(&buf[128..136]),
        vb: ValBlk {
            version: LittleEndian::read_u16(&buf[136..138]),
            flags: LittleEndian::read_u16(&buf[138..140]),
            r_version: LittleEndian::read_u32(&buf[140..144]),
        },
    })
}

pub struct SanlockLm {
    path: PathBuf,
    ls_name: String,
    host_id: u32,
    sector_size: u32,
    align_size: u64,
    generation: u64,
    file: Option<File>,
    killpath: Option<(String, String)>,
}

impl SanlockLm {
    /// For joining an existing lockspace; geometry is recovered from
    /// the on-disk header.
    pub fn new(path: PathBuf, ls_name: &str) -> SanlockLm {
        SanlockLm {
            path,
            ls_name: ls_name.to_string(),
            host_id: 0,
            sector_size: 0,
            align_size: 0,
            generation: 0,
            file: None,
            killpath: None,
        }
    }

    /// For formatting a new lockspace with chosen geometry.
    pub fn with_sizes(path: PathBuf, ls_name: &str, sector_size: u32, align_mb: u32) -> SanlockLm {
        let mut lm = SanlockLm::new(path, ls_name);
        lm.sector_size = sector_size;
        lm.align_size = align_mb as u64 * ONE_MB;
        lm
    }

    fn file(&mut self) -> LmResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| LmError::Manager("not connected".to_string()))
    }

    fn dev_size(&mut self) -> LmResult<u64> {
        Ok(self.file()?.metadata().map_err(LmError::Io)?.len())
    }

    fn read_record_at(&mut self, offset: u64) -> LmResult<Vec<u8>> {
        let sector = self.sector_size as usize;
        if sector == 0 {
            return Err(LmError::Manager("lockspace geometry unknown".to_string()));
        }
        let len = self.dev_size()?;
        if offset + sector as u64 > len {
            return Err(LmError::NoSpace);
        }
        let f = self.file()?;
        f.seek(SeekFrom::Start(offset)).map_err(LmError::Io)?;
        let mut buf = vec![0u8; sector];
        f.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                LmError::NoSpace
            } else {
                LmError::Io(e)
            }
        })?;
        Ok(buf)
    }

    fn write_record_at(&mut self, offset: u64, rec: &RawRecord) -> LmResult<()> {
        let buf = encode_record(rec, self.sector_size);
        let f = self.file()?;
        f.seek(SeekFrom::Start(offset)).map_err(LmError::Io)?;
        f.write_all(&buf).map_err(LmError::Io)?;
        Ok(())
    }

    fn resource_offset(&self, r: &Resource) -> LmResult<u64> {
        match r.rtype {
            ResType::Gl => Ok(GL_LOCK_BEGIN * self.align_size),
            ResType::Vg => Ok(VG_LOCK_BEGIN * self.align_size),
            ResType::Lv => {
                if r.offset < LV_LOCK_BEGIN * self.align_size {
                    return Err(LmError::Args(format!("invalid lv offset {}", r.offset)));
                }
                Ok(r.offset)
            }
        }
    }

    fn host_record_offset(&self, host_id: u32) -> u64 {
        host_id as u64 * self.sector_size as u64
    }

    fn max_hosts(&self) -> u32 {
        if self.sector_size == 4096 {
            match self.align_size / ONE_MB {
                1 => 250,
                2 => 500,
                4 => 1000,
                _ => 2000,
            }
        } else {
            2000
        }
    }

    fn read_host_record(&mut self, host_id: u32) -> LmResult<Option<HostRecord>> {
        let buf = self.read_record_at(self.host_record_offset(host_id))?;
        match decode_record(&buf, DELTA_MAGIC) {
            Err(_) => Ok(None),
            Ok(rec) => {
                if rec.owner == 0 {
                    return Ok(None);
                }
                let state = match rec.aux {
                    HOST_LIVE => HostState::Live,
                    HOST_FAIL => HostState::Fail,
                    HOST_DEAD => HostState::Dead,
                    HOST_FREE => HostState::Free,
                    _ => HostState::Unknown,
                };
                Ok(Some(HostRecord {
                    host_id: rec.owner as u32,
                    generation: rec.generation,
                    timestamp: rec.timestamp,
                    state,
                }))
            }
        }
    }

    fn write_host_record(&mut self, host_id: u32, generation: u64, state: u32) -> LmResult<()> {
        let mut rec = RawRecord::new(
            DELTA_MAGIC,
            size_flags(self.sector_size, self.align_size),
            &self.ls_name,
            "",
        );
        rec.owner = host_id as u64;
        rec.generation = generation;
        rec.timestamp = now_micros();
        rec.aux = state;
        self.write_record_at(self.host_record_offset(host_id), &rec)
    }

    fn fresh_resource_record(&self, res_name: &str) -> RawRecord {
        RawRecord::new(
            PAXOS_MAGIC,
            size_flags(self.sector_size, self.align_size),
            &self.ls_name,
            res_name,
        )
    }

    /// Decode a resource slot, or say why it cannot be used.
    fn read_resource(&mut self, offset: u64) -> LmResult<Result<RawRecord, DecodeError>> {
        let buf = self.read_record_at(offset)?;
        Ok(decode_record(&buf, PAXOS_MAGIC))
    }
}

impl LockManager for SanlockLm {
    fn connect(&mut self) -> LmResult<()> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(LmError::Io)?;
        self.file = Some(f);
        Ok(())
    }

    fn disconnect(&mut self) -> LmResult<()> {
        self.file = None;
        Ok(())
    }

    fn set_host_id(&mut self, host_id: u32) {
        self.host_id = host_id;
    }

    fn set_killpath(&mut self, cmd: &str, args: &str) -> LmResult<()> {
        debug!("S {} set killpath to {} {}", self.ls_name, cmd, args);
        self.killpath = Some((cmd.to_string(), args.to_string()));
        Ok(())
    }

    fn init_lockspace(&mut self, enable_gl: bool) -> LmResult<()> {
        if self.sector_size == 0 || self.align_size == 0 {
            return Err(LmError::Args("init_lockspace without sizes".to_string()));
        }

        let header = RawRecord::new(
            DELTA_MAGIC,
            size_flags(self.sector_size, self.align_size),
            &self.ls_name,
            "",
        );
        self.write_record_at(0, &header)?;

        let gl_name = if enable_gl {
            R_NAME_GL
        } else {
            R_NAME_GL_DISABLED
        };
        let gl = self.fresh_resource_record(gl_name);
        self.write_record_at(GL_LOCK_BEGIN * self.align_size, &gl)?;

        let vg = self.fresh_resource_record(R_NAME_VG);
        self.write_record_at(VG_LOCK_BEGIN * self.align_size, &vg)?;

        // initialize every lv slot to the end of the device
        let dev_size = self.dev_size()?;
        let unused = self.fresh_resource_record(R_NAME_UNUSED);
        let mut offset = LV_LOCK_BEGIN * self.align_size;
        debug!("S {} init clearing lv lease areas", self.ls_name);
        while offset + self.align_size <= dev_size {
            self.write_record_at(offset, &unused)?;
            offset += self.align_size;
        }

        Ok(())
    }

    fn init_lv(&mut self, lv_name: &str, start_offset: Option<u64>) -> LmResult<u64> {
        let mut offset = start_offset.unwrap_or(LV_LOCK_BEGIN * self.align_size);
        if offset < LV_LOCK_BEGIN * self.align_size {
            return Err(LmError::Args(format!("invalid offset {}", offset)));
        }

        loop {
            let free = match self.read_resource(offset)? {
                // newly extended space is not initialized with an
                // "#unused" resource, just zeroes
                Err(DecodeError::Magic) => true,
                Err(DecodeError::Checksum) => {
                    error!(
                        "S {} init_lv bad checksum at {}",
                        self.ls_name, offset
                    );
                    return Err(LmError::LockRepair);
                }
                Ok(rec) => {
                    if rec.res_name == lv_name {
                        error!(
                            "S {} init_lv resource name {} already exists at {}",
                            self.ls_name, lv_name, offset
                        );
                        return Err(LmError::Exists);
                    }
                    rec.res_name == R_NAME_UNUSED
                }
            };

            if free {
                debug!(
                    "S {} init_lv {} found unused area at {}",
                    self.ls_name, lv_name, offset
                );
                let rec = self.fresh_resource_record(lv_name);
                self.write_record_at(offset, &rec)?;
                return Ok(offset);
            }

            offset += self.align_size;
        }
    }

    fn rename_lockspace(&mut self, new_name: &str) -> LmResult<()> {
        let buf = self.read_record_at(0)?;
        let mut header = match decode_record(&buf, DELTA_MAGIC) {
            Ok(h) => h,
            Err(_) => return Err(LmError::LockRepair),
        };
        header.ls_name = new_name.to_string();
        self.write_record_at(0, &header)?;

        // every host record carries the lockspace name too
        for host_id in 1..=self.max_hosts() {
            let off = self.host_record_offset(host_id);
            let buf = match self.read_record_at(off) {
                Ok(b) => b,
                Err(LmError::NoSpace) => break,
                Err(e) => return Err(e),
            };
            if let Ok(mut rec) = decode_record(&buf, DELTA_MAGIC) {
                rec.ls_name = new_name.to_string();
                self.write_record_at(off, &rec)?;
            }
        }

        let mut offset = GL_LOCK_BEGIN * self.align_size;
        loop {
            let rec = match self.read_resource(offset) {
                Err(LmError::NoSpace) => break,
                Err(e) => return Err(e),
                Ok(Err(_)) => {
                    offset += self.align_size;
                    continue;
                }
                Ok(Ok(rec)) => rec,
            };
            let mut rec = rec;
            rec.ls_name = new_name.to_string();
            self.write_record_at(offset, &rec)?;
            offset += self.align_size;
        }

        self.ls_name = new_name.to_string();
        Ok(())
    }

    fn free_lv(&mut self, offset: u64) -> LmResult<()> {
        if offset < LV_LOCK_BEGIN * self.align_size {
            return Err(LmError::Args(format!("invalid offset {}", offset)));
        }
        let rec = self.fresh_resource_record(R_NAME_UNUSED);
        self.write_record_at(offset, &rec)
    }

    fn read_lockspace_info(&mut self) -> LmResult<LockspaceInfo> {
        // the header's own sector size is unknown until decoded; 512
        // is enough to cover the record body either way
        if self.sector_size == 0 {
            self.sector_size = 512;
        }
        let buf = self.read_record_at(0)?;
        let header = match decode_record(&buf, DELTA_MAGIC) {
            Ok(h) => h,
            Err(_) => {
                error!("S {} corrupt lockspace header", self.ls_name);
                return Err(LmError::LockRepair);
            }
        };

        if header.ls_name != self.ls_name {
            // also hit when a removed VG's lockspace was overwritten
            // with "#unused" so nobody may rejoin it
            error!(
                "S {} lockspace name on disk is {}",
                self.ls_name, header.ls_name
            );
            return Err(LmError::LockRepair);
        }

        let (sector_size, align_size) = match sizes_from_flags(header.flags) {
            Some(s) => s,
            None => return Err(LmError::LockRepair),
        };
        self.sector_size = sector_size;
        self.align_size = align_size;

        let prev_generation = self
            .read_host_record(self.host_id)?
            .map(|h| h.generation)
            .unwrap_or(0);

        debug!(
            "S {} read_lockspace_info sector_size {} align_size {} prev_generation {}",
            self.ls_name, sector_size, align_size, prev_generation
        );

        Ok(LockspaceInfo {
            sector_size,
            align_size,
            prev_generation,
        })
    }

    fn repair_lockspace(&mut self, info: &PersistedInfo) -> LmResult<()> {
        self.sector_size = info.sector_size;
        self.align_size = info.align_size;

        debug!(
            "S {} repair host {} lease generation {}",
            self.ls_name, info.host_id, info.generation
        );

        let header = RawRecord::new(
            DELTA_MAGIC,
            size_flags(self.sector_size, self.align_size),
            &self.ls_name,
            "",
        );
        self.write_record_at(0, &header)?;
        self.write_host_record(info.host_id, info.generation, HOST_FREE)
    }

    fn add_lockspace(&mut self) -> LmResult<u64> {
        if self.host_id == 0 || self.host_id > self.max_hosts() {
            error!(
                "S {} invalid host_id {} for align {} MiB",
                self.ls_name,
                self.host_id,
                self.align_size / ONE_MB
            );
            return Err(LmError::HostId(self.host_id));
        }

        let prev = self
            .read_host_record(self.host_id)?
            .map(|h| h.generation)
            .unwrap_or(0);
        let generation = prev + 1;
        self.write_host_record(self.host_id, generation, HOST_LIVE)?;
        self.generation = generation;

        debug!(
            "S {} add_lockspace done generation {}",
            self.ls_name, generation
        );
        Ok(generation)
    }

    fn rem_lockspace(&mut self, free_vg: bool) -> LmResult<()> {
        let generation = self.generation;
        self.write_host_record(self.host_id, generation, HOST_FREE)?;

        if free_vg {
            // no other host may rejoin a removed VG's lockspace
            self.rename_lockspace(R_NAME_UNUSED)?;
        }
        Ok(())
    }

    fn acquire(
        &mut self,
        r: &mut Resource,
        mode: LockMode,
        flags: AcquireFlags,
    ) -> LmResult<Option<ValBlk>> {
        let offset = self.resource_offset(r)?;
        let mut retried = false;

        loop {
            let rec = match self.read_resource(offset)? {
                Err(_) if flags.repair && !retried => {
                    debug!(
                        "{}:{} acquire lease corrupt, repairing",
                        self.ls_name, r.name
                    );
                    let fresh = self.fresh_resource_record(&r.name);
                    self.write_record_at(offset, &fresh)?;
                    retried = true;
                    continue;
                }
                Err(_) => return Err(LmError::LockRepair),
                Ok(rec) => rec,
            };

            if rec.ls_name != self.ls_name {
                return Err(LmError::LockRepair);
            }
            if r.rtype == ResType::Gl && rec.res_name == R_NAME_GL_DISABLED {
                return Err(LmError::GlDisabled);
            }
            if rec.res_name != r.name {
                return Err(LmError::LockRepair);
            }

            let mut rec = rec;

            if rec.owner != 0 && rec.owner != self.host_id as u64 {
                // shared holders coexist; anything else waits for the
                // owner to die rather than blocking here
                if rec.aux == MODE_SH && mode == LockMode::Sh {
                    let vb = self.want_vb(r, &rec);
                    return Ok(vb);
                }
                let owner = self.read_host_record(rec.owner as u32)?;
                match owner.as_ref().map(|h| h.state) {
                    Some(HostState::Dead) | Some(HostState::Free) | None => {
                        // expired; take it over below
                    }
                    _ => return Err(LmError::Again(owner)),
                }
            } else if rec.owner == self.host_id as u64 && rec.aux != MODE_FREE {
                // left behind by a failed process of ours
                if !flags.adopt_ok && !flags.adopt_only {
                    return Err(LmError::Orphan);
                }
            } else if flags.adopt_only {
                return Err(LmError::Args("no orphan lock to adopt".to_string()));
            }

            rec.owner = self.host_id as u64;
            rec.generation = self.generation;
            rec.timestamp = now_micros();
            rec.aux = match mode {
                LockMode::Sh => MODE_SH,
                LockMode::Ex => MODE_EX,
                LockMode::Un => MODE_FREE,
            };
            self.write_record_at(offset, &rec)?;

            return Ok(self.want_vb(r, &rec));
        }
    }

    fn convert(
        &mut self,
        r: &mut Resource,
        mode: LockMode,
        r_version: Option<u32>,
    ) -> LmResult<()> {
        let offset = self.resource_offset(r)?;
        let mut rec = match self.read_resource(offset)? {
            Ok(rec) => rec,
            Err(_) => return Err(LmError::LockRepair),
        };

        if let Some(rv) = r_version {
            if r.mode == LockMode::Ex {
                if rec.vb.version == 0 {
                    rec.vb.version = VAL_BLK_VERSION;
                }
                rec.vb.r_version = rv;
                debug!("{}:{} convert set r_version {}", self.ls_name, r.name, rv);
            }
        }

        rec.aux = match mode {
            LockMode::Sh => MODE_SH,
            LockMode::Ex => MODE_EX,
            LockMode::Un => MODE_FREE,
        };
        self.write_record_at(offset, &rec)
    }

    fn release(&mut self, r: &mut Resource, r_version: Option<u32>, free_vg: bool) -> LmResult<()> {
        let offset = self.resource_offset(r)?;
        let mut rec = match self.read_resource(offset)? {
            Ok(rec) => rec,
            Err(_) => return Err(LmError::LockRepair),
        };

        if let Some(rv) = r_version {
            if r.mode == LockMode::Ex {
                if rec.vb.version == 0 {
                    rec.vb.version = VAL_BLK_VERSION;
                }
                rec.vb.r_version = rv;
                debug!("{}:{} release set r_version {}", self.ls_name, r.name, rv);
            }
        }

        if free_vg && (r.rtype == ResType::Gl || r.rtype == ResType::Vg) {
            // the removed VG's locks may never be reacquired
            rec.res_name = R_NAME_REMOVED.to_string();
        }

        rec.owner = 0;
        rec.generation = 0;
        rec.aux = MODE_FREE;
        self.write_record_at(offset, &rec)
    }

    fn read_lvb(&mut self, r: &Resource) -> LmResult<ValBlk> {
        let offset = self.resource_offset(r)?;
        match self.read_resource(offset)? {
            Ok(rec) => Ok(rec.vb),
            Err(_) => Err(LmError::LockRepair),
        }
    }

    fn set_lvb(&mut self, r: &Resource, vb: &ValBlk) -> LmResult<()> {
        let offset = self.resource_offset(r)?;
        let mut rec = match self.read_resource(offset)? {
            Ok(rec) => rec,
            Err(_) => return Err(LmError::LockRepair),
        };
        rec.vb = *vb;
        self.write_record_at(offset, &rec)
    }

    fn get_hosts(&mut self) -> LmResult<Vec<HostRecord>> {
        let mut hosts = Vec::new();
        for host_id in 1..=self.max_hosts() {
            match self.read_host_record(host_id) {
                Ok(Some(h)) => hosts.push(h),
                Ok(None) => {}
                Err(LmError::NoSpace) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(hosts)
    }

    fn hosts_count(&mut self) -> LmResult<usize> {
        let me = self.host_id;
        Ok(self
            .get_hosts()?
            .iter()
            .filter(|h| {
                h.host_id != me
                    && (h.state == HostState::Live || h.state == HostState::Unknown)
            })
            .count())
    }

    fn find_free_lv_slot(&mut self, start_offset: Option<u64>) -> LmResult<u64> {
        let begin = LV_LOCK_BEGIN * self.align_size;
        let start = start_offset.unwrap_or(begin).max(begin);
        let mut offset = start;
        let mut wrapped = false;

        loop {
            if wrapped && offset >= start {
                // back where we started: every slot is taken
                return Err(LmError::NoSpace);
            }

            match self.read_resource(offset) {
                Err(LmError::NoSpace) => {
                    // end of the device; wrap once
                    if wrapped {
                        return Err(LmError::NoSpace);
                    }
                    offset = begin;
                    wrapped = true;
                    if start == begin {
                        // nothing left to revisit
                        return Err(LmError::NoSpace);
                    }
                    continue;
                }
                Err(e) => return Err(e),
                Ok(Err(DecodeError::Magic)) => {
                    debug!(
                        "S {} find_free_lv_slot found empty area at {}",
                        self.ls_name, offset
                    );
                    return Ok(offset);
                }
                Ok(Err(DecodeError::Checksum)) => return Err(LmError::LockRepair),
                Ok(Ok(rec)) => {
                    if rec.res_name == R_NAME_UNUSED {
                        debug!(
                            "S {} find_free_lv_slot found unused area at {}",
                            self.ls_name, offset
                        );
                        return Ok(offset);
                    }
                }
            }

            offset += self.align_size;
        }
    }

    fn gl_is_enabled(&mut self) -> LmResult<bool> {
        let offset = GL_LOCK_BEGIN * self.align_size;
        match self.read_resource(offset)? {
            Err(_) => Err(LmError::LockRepair),
            Ok(rec) => {
                if rec.res_name == R_NAME_GL {
                    Ok(true)
                } else if rec.res_name == R_NAME_GL_DISABLED {
                    Ok(false)
                } else {
                    error!("invalid gl name {}", rec.res_name);
                    Err(LmError::Args(format!("invalid gl name {}", rec.res_name)))
                }
            }
        }
    }

    fn able_gl(&mut self, enable: bool) -> LmResult<()> {
        let offset = GL_LOCK_BEGIN * self.align_size;
        let mut rec = match self.read_resource(offset)? {
            Ok(rec) => rec,
            Err(_) => return Err(LmError::LockRepair),
        };
        rec.res_name = if enable {
            R_NAME_GL.to_string()
        } else {
            R_NAME_GL_DISABLED.to_string()
        };
        debug!("S {} able_gl {}", self.ls_name, rec.res_name);
        self.write_record_at(offset, &rec)
    }
}

impl SanlockLm {
    /// GL and VG leases carry value blocks; LV leases do not.
    fn want_vb(&self, r: &Resource, rec: &RawRecord) -> Option<ValBlk> {
        match r.rtype {
            ResType::Gl | ResType::Vg => Some(rec.vb),
            ResType::Lv => None,
        }
    }

    /// The helper the health monitor runs when the lockspace lease
    /// can no longer be renewed.
    pub fn killpath(&self) -> Option<&(String, String)> {
        self.killpath.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockd::LockManager;

    const ALIGN: u64 = ONE_MB;

    fn make_lock_lv(slots: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lvmlock");
        let f = File::create(&path).unwrap();
        f.set_len((LV_LOCK_BEGIN + slots) * ALIGN).unwrap();
        (dir, path)
    }

    fn formatted(slots: u64, host_id: u32) -> (tempfile::TempDir, SanlockLm) {
        let (dir, path) = make_lock_lv(slots);
        let mut lm = SanlockLm::with_sizes(path, "lvm_test", 512, 1);
        lm.set_host_id(host_id);
        lm.connect().unwrap();
        lm.init_lockspace(true).unwrap();
        lm.read_lockspace_info().unwrap();
        lm.add_lockspace().unwrap();
        (dir, lm)
    }

    fn vg_resource() -> Resource {
        Resource {
            rtype: ResType::Vg,
            name: R_NAME_VG.to_string(),
            mode: LockMode::Un,
            offset: 0,
            lv_uuid: None,
            vb: None,
        }
    }

    fn second_host(path: &std::path::Path, host_id: u32) -> SanlockLm {
        let mut lm = SanlockLm::new(path.to_path_buf(), "lvm_test");
        lm.set_host_id(host_id);
        lm.connect().unwrap();
        lm.read_lockspace_info().unwrap();
        lm.add_lockspace().unwrap();
        lm
    }

    #[test]
    fn init_and_recover_geometry() {
        let (_dir, path) = make_lock_lv(4);
        let mut lm = SanlockLm::with_sizes(path.clone(), "lvm_test", 512, 1);
        lm.set_host_id(1);
        lm.connect().unwrap();
        lm.init_lockspace(false).unwrap();

        let mut again = SanlockLm::new(path, "lvm_test");
        again.set_host_id(1);
        again.connect().unwrap();
        let info = again.read_lockspace_info().unwrap();
        assert_eq!(info.sector_size, 512);
        assert_eq!(info.align_size, ONE_MB);
        assert_eq!(info.prev_generation, 0);
        assert!(!again.gl_is_enabled().unwrap());
    }

    #[test]
    fn generation_counts_joins() {
        let (_dir, path) = make_lock_lv(2);
        let mut lm = SanlockLm::with_sizes(path, "lvm_test", 512, 1);
        lm.set_host_id(3);
        lm.connect().unwrap();
        lm.init_lockspace(true).unwrap();
        lm.read_lockspace_info().unwrap();

        assert_eq!(lm.add_lockspace().unwrap(), 1);
        lm.rem_lockspace(false).unwrap();
        let info = lm.read_lockspace_info().unwrap();
        assert_eq!(info.prev_generation, 1);
        assert_eq!(lm.add_lockspace().unwrap(), 2);
    }

    #[test]
    fn ex_conflict_surfaces_owner() {
        let (_dir, mut lm1) = formatted(2, 1);
        let mut lm2 = second_host(&lm1.path.clone(), 2);

        let mut r1 = vg_resource();
        lm1.acquire(&mut r1, LockMode::Ex, AcquireFlags::default())
            .unwrap();

        let mut r2 = vg_resource();
        match lm2.acquire(&mut r2, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::Again(Some(owner))) => {
                assert_eq!(owner.host_id, 1);
                assert_eq!(owner.state, HostState::Live);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        r1.mode = LockMode::Ex;
        lm1.release(&mut r1, None, false).unwrap();
        lm2.acquire(&mut r2, LockMode::Ex, AcquireFlags::default())
            .unwrap();
    }

    #[test]
    fn shared_holders_coexist() {
        let (_dir, mut lm1) = formatted(2, 1);
        let mut lm2 = second_host(&lm1.path.clone(), 2);

        let mut r1 = vg_resource();
        lm1.acquire(&mut r1, LockMode::Sh, AcquireFlags::default())
            .unwrap();

        let mut r2 = vg_resource();
        lm2.acquire(&mut r2, LockMode::Sh, AcquireFlags::default())
            .unwrap();

        // but exclusive still waits
        let mut r3 = vg_resource();
        let mut lm3 = second_host(&lm1.path.clone(), 3);
        assert!(matches!(
            lm3.acquire(&mut r3, LockMode::Ex, AcquireFlags::default()),
            Err(LmError::Again(_))
        ));
    }

    #[test]
    fn orphan_requires_adopt() {
        let (_dir, mut lm) = formatted(2, 1);

        let mut r = vg_resource();
        lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();

        // a fresh resource struct stands in for a restarted process
        let mut r2 = vg_resource();
        match lm.acquire(&mut r2, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::Orphan) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let flags = AcquireFlags {
            adopt_ok: true,
            ..Default::default()
        };
        lm.acquire(&mut r2, LockMode::Ex, flags).unwrap();
    }

    #[test]
    fn value_block_travels_between_hosts() {
        let (_dir, mut lm1) = formatted(2, 1);

        let mut r1 = vg_resource();
        let vb = lm1
            .acquire(&mut r1, LockMode::Ex, AcquireFlags::default())
            .unwrap()
            .unwrap();
        assert_eq!(vb.r_version, 0);

        r1.mode = LockMode::Ex;
        lm1.release(&mut r1, Some(7), false).unwrap();

        let mut lm2 = second_host(&lm1.path.clone(), 2);
        let mut r2 = vg_resource();
        let vb = lm2
            .acquire(&mut r2, LockMode::Ex, AcquireFlags::default())
            .unwrap()
            .unwrap();
        assert_eq!(vb.r_version, 7);
        assert_eq!(vb.version, VAL_BLK_VERSION);
    }

    #[test]
    fn lv_slot_allocation() {
        let (_dir, mut lm) = formatted(3, 1);

        let off1 = lm.init_lv("lv1", None).unwrap();
        assert_eq!(off1, LV_LOCK_BEGIN * ALIGN);

        // the same name may not be claimed twice
        match lm.init_lv("lv1", None) {
            Err(LmError::Exists) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let off2 = lm.init_lv("lv2", None).unwrap();
        assert_eq!(off2, (LV_LOCK_BEGIN + 1) * ALIGN);

        // freed slots are reclaimed
        lm.free_lv(off1).unwrap();
        let off3 = lm.init_lv("lv3", None).unwrap();
        assert_eq!(off3, off1);
    }

    #[test]
    fn full_lock_lv_reports_no_space() {
        let (_dir, mut lm) = formatted(2, 1);
        lm.init_lv("lv1", None).unwrap();
        lm.init_lv("lv2", None).unwrap();

        match lm.init_lv("lv3", None) {
            Err(LmError::NoSpace) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        match lm.find_free_lv_slot(None) {
            Err(LmError::NoSpace) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn free_slot_scan_wraps_around() {
        let (_dir, mut lm) = formatted(3, 1);
        let off1 = lm.init_lv("lv1", None).unwrap();
        lm.init_lv("lv2", None).unwrap();
        lm.init_lv("lv3", None).unwrap();

        lm.free_lv(off1).unwrap();
        // scanning from the second slot wraps and finds the first
        let found = lm.find_free_lv_slot(Some(off1 + ALIGN)).unwrap();
        assert_eq!(found, off1);
    }

    #[test]
    fn lv_locks_carry_no_value_block() {
        let (_dir, mut lm) = formatted(2, 1);
        let off = lm.init_lv("lv1", None).unwrap();

        let mut r = Resource {
            rtype: ResType::Lv,
            name: "lv1".to_string(),
            mode: LockMode::Un,
            offset: off,
            lv_uuid: None,
            vb: None,
        };
        let vb = lm
            .acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();
        assert!(vb.is_none());
    }

    #[test]
    fn uninitialized_slot_needs_repair() {
        // a freshly extended area reads as zeroes
        let (_dir, mut lm) = formatted(2, 1);
        let beyond = Resource {
            rtype: ResType::Lv,
            name: "lv9".to_string(),
            mode: LockMode::Un,
            offset: (LV_LOCK_BEGIN + 1) * ALIGN,
            lv_uuid: None,
            vb: None,
        };
        // slot 68 exists but holds "#unused", so zero out its magic
        let mut f = OpenOptions::new()
            .write(true)
            .open(&lm.path)
            .unwrap();
        f.seek(SeekFrom::Start((LV_LOCK_BEGIN + 1) * ALIGN)).unwrap();
        f.write_all(&[0u8; 512]).unwrap();
        drop(f);

        let mut r = beyond;
        match lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::LockRepair) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let flags = AcquireFlags {
            repair: true,
            ..Default::default()
        };
        lm.acquire(&mut r, LockMode::Ex, flags).unwrap();
    }

    #[test]
    fn checksum_corruption_detected() {
        let (_dir, mut lm) = formatted(2, 1);

        // flip one byte in the VG lease body
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&lm.path)
            .unwrap();
        let off = VG_LOCK_BEGIN * ALIGN + 70;
        f.seek(SeekFrom::Start(off)).unwrap();
        let mut byte = [0u8; 1];
        f.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xff;
        f.seek(SeekFrom::Start(off)).unwrap();
        f.write_all(&byte).unwrap();
        drop(f);

        let mut r = vg_resource();
        match lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::LockRepair) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn free_vg_release_poisons_lease_name() {
        let (_dir, mut lm) = formatted(2, 1);

        let mut r = vg_resource();
        lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();
        r.mode = LockMode::Ex;
        lm.release(&mut r, None, true).unwrap();

        let mut r2 = vg_resource();
        match lm.acquire(&mut r2, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::LockRepair) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rename_rewrites_every_record() {
        let (_dir, mut lm) = formatted(2, 1);
        lm.init_lv("lv1", None).unwrap();

        lm.rename_lockspace("lvm_renamed").unwrap();

        let mut again = SanlockLm::new(lm.path.clone(), "lvm_renamed");
        again.set_host_id(1);
        again.connect().unwrap();
        again.read_lockspace_info().unwrap();
        let mut r = vg_resource();
        // the lease accepts the new lockspace name
        again.add_lockspace().unwrap();
        again
            .acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();
    }

    #[test]
    fn gl_disable_and_enable() {
        let (_dir, path) = make_lock_lv(2);
        let mut lm = SanlockLm::with_sizes(path, "lvm_test", 512, 1);
        lm.set_host_id(1);
        lm.connect().unwrap();
        lm.init_lockspace(false).unwrap();
        lm.read_lockspace_info().unwrap();
        lm.add_lockspace().unwrap();

        assert!(!lm.gl_is_enabled().unwrap());

        let mut r = Resource {
            rtype: ResType::Gl,
            name: R_NAME_GL.to_string(),
            mode: LockMode::Un,
            offset: 0,
            lv_uuid: None,
            vb: None,
        };
        match lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default()) {
            Err(LmError::GlDisabled) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        lm.able_gl(true).unwrap();
        assert!(lm.gl_is_enabled().unwrap());
        lm.acquire(&mut r, LockMode::Ex, AcquireFlags::default())
            .unwrap();
    }

    #[test]
    fn hosts_listed_with_states() {
        let (_dir, mut lm1) = formatted(2, 1);
        let _lm2 = second_host(&lm1.path.clone(), 5);

        let hosts = lm1.get_hosts().unwrap();
        let ids: Vec<u32> = hosts.iter().map(|h| h.host_id).collect();
        assert_eq!(ids, vec![1, 5]);
        assert!(hosts.iter().all(|h| h.state == HostState::Live));
        assert_eq!(lm1.hosts_count().unwrap(), 1);
    }

    #[test]
    fn dead_owner_lease_is_taken_over() {
        let (_dir, mut lm1) = formatted(2, 1);
        let mut lm2 = second_host(&lm1.path.clone(), 2);

        let mut r1 = vg_resource();
        lm1.acquire(&mut r1, LockMode::Ex, AcquireFlags::default())
            .unwrap();

        // host 1 goes away for good
        lm1.rem_lockspace(false).unwrap();

        let mut r2 = vg_resource();
        lm2.acquire(&mut r2, LockMode::Ex, AcquireFlags::default())
            .unwrap();
    }

    #[test]
    fn size_selection_table() {
        assert_eq!(choose_sizes(512, 512).unwrap(), (512, 1));
        assert_eq!(choose_sizes(4096, 4096).unwrap(), (4096, 8));
        // mixed sizes warn and choose 4096
        assert_eq!(choose_sizes(4096, 512).unwrap(), (4096, 8));
        assert_eq!(choose_sizes(512, 4096).unwrap(), (4096, 8));
        // one side missing falls back to the other
        assert_eq!(choose_sizes(0, 512).unwrap(), (512, 1));
        assert!(choose_sizes(0, 0).is_err());
    }

    #[test]
    fn host_id_ceiling_depends_on_align() {
        let (_dir, path) = make_lock_lv(2);
        let mut lm = SanlockLm::with_sizes(path, "lvm_test", 4096, 1);
        lm.set_host_id(251);
        assert_eq!(lm.max_hosts(), 250);
        lm.connect().unwrap();
        lm.init_lockspace(true).unwrap();
        lm.read_lockspace_info().unwrap();
        match lm.add_lockspace() {
            Err(LmError::HostId(251)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
