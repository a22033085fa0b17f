// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! melvind: a volume-group metadata cache daemon and shared-VG lock
//! coordinator for an LVM-style volume manager.
//!
//! The `cache` module holds the in-memory PV/VG index served over a
//! local socket by `server`; `lockd` and its two back-ends (`sanlock`,
//! `idm`) coordinate on-disk leases for VGs shared between hosts.

pub mod cache;
pub mod client;
pub mod flock;
pub mod idm;
pub mod lockd;
pub mod parser;
pub mod registry;
pub mod sanlock;
pub mod server;
pub mod wire;
mod error;
mod util;

pub use crate::error::{Error, Result};
