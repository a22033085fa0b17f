// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::{flock, FlockArg};

use crate::Result;

/// Holds an advisory lock on a file. The lock is released when the
/// struct is dropped and the file closed.
pub struct Flock {
    _locked_file: File,
}

impl Flock {
    /// Take the daemon singleton lock: open-or-create the pidfile,
    /// flock it exclusively without blocking, and record our pid in
    /// it. Fails if another process holds the lock.
    pub fn lock_pidfile(path: &Path) -> Result<Flock> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        flock(f.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;

        f.set_len(0)?;
        writeln!(f, "{}", std::process::id())?;

        Ok(Flock { _locked_file: f })
    }
}
