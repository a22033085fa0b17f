// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Communicating with the metadata cache daemon.

use std::env;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::parser::{buf_to_textmap, textmap_to_buf, Entry, LvmTextMap, TextMapOps};
use crate::wire;
use crate::{Error, Result};

pub const DEFAULT_SOCKET: &str = "/run/lvm/lvmetad.socket";
pub const SOCKET_ENV: &str = "LVM_LVMETAD_SOCKET";

pub fn socket_path() -> PathBuf {
    env::var(SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET))
}

pub struct Client {
    reader: wire::MessageReader<UnixStream>,
    token: String,
}

impl Client {
    pub fn connect(path: &Path) -> Result<Client> {
        Ok(Client {
            reader: wire::MessageReader::new(UnixStream::connect(path)?),
            token: "skip".to_string(),
        })
    }

    pub fn connect_default() -> Result<Client> {
        Client::connect(&socket_path())
    }

    pub fn set_token(&mut self, token: &str) {
        self.token = token.to_string();
    }

    fn build(&self, name: &str, args: &[(&str, Entry)]) -> LvmTextMap {
        let mut req = LvmTextMap::new();
        req.insert("request".to_string(), Entry::String(name.to_string()));
        req.insert("token".to_string(), Entry::String(self.token.clone()));
        for (k, v) in args {
            req.insert(k.to_string(), v.clone());
        }
        req
    }

    /// One framed request, one framed reply, no interpretation.
    pub fn request_raw(&mut self, name: &str, args: &[(&str, Entry)]) -> Result<Vec<u8>> {
        let req = self.build(name, args);
        wire::write_message(self.reader.get_mut(), &textmap_to_buf(&req))?;
        Ok(self.reader.read_message()?)
    }

    /// Make a request, refreshing our token once on a mismatch, and
    /// fail unless the daemon said OK.
    pub fn request(&mut self, name: &str, args: &[(&str, Entry)]) -> Result<LvmTextMap> {
        let buf = self.request_raw(name, args)?;
        let mut response = buf_to_textmap(&buf)?;

        if response.string_from_textmap("response") == Some("token_mismatch") {
            self.request_raw("token_update", &[])?;
            let buf = self.request_raw(name, args)?;
            response = buf_to_textmap(&buf)?;
        }

        if response.string_from_textmap("response") != Some("OK") {
            let reason = response
                .string_from_textmap("reason")
                .unwrap_or("no reason given")
                .to_string();
            return Err(Error::Daemon(reason));
        }

        response.remove("response");

        Ok(response)
    }

    pub fn hello(&mut self) -> Result<LvmTextMap> {
        self.request("hello", &[])
    }
}
