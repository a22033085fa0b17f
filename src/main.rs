// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! melvind: the metadata cache daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction};
use log::LevelFilter;

use melvind::cache::{Cache, Reply};
use melvind::client;
use melvind::lockd::{
    lock_lv_path, lockspace_name, AcquireFlags, CacheNotifier, LockCoordinator, LockMode,
    LockdOptions, ResType, StartOptions,
};
use melvind::parser::{LvmTextMap, TextMapBuilder, TextMapOps};
use melvind::sanlock::SanlockLm;
use melvind::server::{self, DaemonConfig};

const PIDFILE_ENV: &str = "LVM_LVMETAD_PIDFILE";
const DEFAULT_PIDFILE: &str = "/var/run/melvind.pid";

fn reply_ok() -> Reply {
    Reply::Map(TextMapBuilder::new().string("response", "OK").build())
}

fn reply_failed(reason: &str) -> Reply {
    Reply::Map(
        TextMapBuilder::new()
            .string("response", "failed")
            .string("reason", reason)
            .build(),
    )
}

fn lockd_reply(result: melvind::lockd::LmResult<()>) -> Reply {
    match result {
        Ok(()) => reply_ok(),
        Err(e) => reply_failed(&e.to_string()),
    }
}

/// The coordinator's wire surface: lockspace lifecycle and the VG
/// lock, plus the kill-path entry points the external helper drives.
/// The lock-LV path and lockspace name derive from the VG name; LV
/// leases and the in-drive-mutex back-end need coordinates out of VG
/// metadata that only commands hold, so they stay library-level.
fn lockd_dispatch(lockd: &LockCoordinator, rq: &str, req: &LvmTextMap) -> Reply {
    let vg = match req.string_from_textmap("vg_name") {
        Some(vg) => vg,
        None => return reply_failed("need VG name"),
    };

    match rq {
        "kill_vg" => lockd_reply(lockd.kill_vg(vg)),
        "drop_vg" => lockd_reply(lockd.drop_vg(vg)),
        "start_vg" => {
            let uuid = match req.string_from_textmap("vg_uuid") {
                Some(u) => u,
                None => return reply_failed("need VG uuid"),
            };
            let lm = Box::new(SanlockLm::new(lock_lv_path(vg), &lockspace_name(vg)));
            let opts = StartOptions {
                host_id: req.i64_from_textmap("host_id").map(|h| h as u32),
                adopt_ok: req.i64_from_textmap("adopt").unwrap_or(0) != 0,
                repair: req.i64_from_textmap("repair").unwrap_or(0) != 0,
            };
            match lockd.start_lockspace(vg, uuid, lm, opts) {
                Ok(generation) => Reply::Map(
                    TextMapBuilder::new()
                        .string("response", "OK")
                        .number("generation", generation as i64)
                        .build(),
                ),
                Err(e) => reply_failed(&e.to_string()),
            }
        }
        "stop_vg" => {
            let free_vg = req.i64_from_textmap("free_vg").unwrap_or(0) != 0;
            lockd_reply(lockd.stop_lockspace(vg, free_vg))
        }
        "lock_vg" => {
            let mode = match req.string_from_textmap("mode") {
                Some("sh") => LockMode::Sh,
                Some("ex") => LockMode::Ex,
                _ => return reply_failed("need lock mode sh or ex"),
            };
            match lockd.lock(vg, ResType::Vg, None, mode, AcquireFlags::default()) {
                Ok(Some(vb)) => Reply::Map(
                    TextMapBuilder::new()
                        .string("response", "OK")
                        .number("r_version", vb.r_version as i64)
                        .build(),
                ),
                Ok(None) => reply_ok(),
                Err(e) => reply_failed(&e.to_string()),
            }
        }
        "unlock_vg" => {
            let r_version = req.i64_from_textmap("r_version").map(|v| v as u32);
            lockd_reply(lockd.unlock(vg, ResType::Vg, None, r_version))
        }
        _ => reply_failed("request not implemented"),
    }
}

fn main() {
    let matches = clap::command!()
        .name("melvind")
        .disable_version_flag(true)
        .arg(
            Arg::new("version")
                .short('V')
                .action(ArgAction::SetTrue)
                .help("Show version of melvind"),
        )
        .arg(
            Arg::new("foreground")
                .short('f')
                .action(ArgAction::SetTrue)
                .help("Don't fork, run in the foreground"),
        )
        .arg(
            Arg::new("levels")
                .short('l')
                .value_name("levels")
                .help("Logging message levels (all,fatal,error,warn,info,wire,debug)"),
        )
        .arg(
            Arg::new("pidfile")
                .short('p')
                .value_name("path")
                .help("Set path to the pidfile"),
        )
        .arg(
            Arg::new("socket")
                .short('s')
                .value_name("path")
                .help("Set path to the socket to listen on"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .value_name("secs")
                .value_parser(clap::value_parser!(u64))
                .help("Time to wait in seconds before shutdown on idle (missing or 0 = infinite)"),
        )
        .get_matches();

    if matches.get_flag("version") {
        println!("melvind version: {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let (level, wire) = server::log_levels(
        matches
            .get_one::<String>("levels")
            .map(String::as_str)
            .unwrap_or("error"),
    );
    env_logger::Builder::new()
        .filter(None, level)
        .filter(
            Some("wire"),
            if wire {
                LevelFilter::Debug
            } else {
                LevelFilter::Off
            },
        )
        .init();

    let socket_path = matches
        .get_one::<String>("socket")
        .map(PathBuf::from)
        .unwrap_or_else(client::socket_path);

    let pidfile = matches
        .get_one::<String>("pidfile")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var(PIDFILE_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_PIDFILE))
        });

    let idle_timeout = matches
        .get_one::<u64>("timeout")
        .copied()
        .filter(|t| *t > 0)
        .map(Duration::from_secs);

    let cache = Arc::new(Cache::new());
    let notifier: Arc<dyn CacheNotifier> = cache.clone();
    let lockd = Arc::new(LockCoordinator::new(notifier, LockdOptions::default()));

    let handler: server::Handler = {
        let cache = Arc::clone(&cache);
        let lockd = Arc::clone(&lockd);
        Arc::new(move |req: &LvmTextMap| {
            // lock requests go to the coordinator, everything else
            // belongs to the cache
            match req.string_from_textmap("request") {
                Some(
                    rq @ ("kill_vg" | "drop_vg" | "start_vg" | "stop_vg" | "lock_vg"
                    | "unlock_vg"),
                ) => lockd_dispatch(&lockd, rq, req),
                _ => cache.handle(req),
            }
        })
    };

    let config = DaemonConfig {
        name: "melvind".to_string(),
        protocol: "lvmetad".to_string(),
        protocol_version: 1,
        socket_path,
        pidfile: Some(pidfile),
        foreground: matches.get_flag("foreground"),
        idle_timeout,
        avoid_oom: true,
    };

    if let Err(e) = server::daemon_start(config, handler) {
        eprintln!("melvind: {}", e);
        std::process::exit(1);
    }
}
