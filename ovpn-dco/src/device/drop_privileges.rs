// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use nix::unistd::{getgid, getuid, setgid, setuid, Gid, Uid};

use super::Error;

/// The ids of the user that ran us through sudo, or our own real ids.
pub fn get_saved_ids() -> Result<(u32, u32), Error> {
    match (std::env::var("SUDO_UID"), std::env::var("SUDO_GID")) {
        (Ok(uid), Ok(gid)) => {
            let uid = uid
                .parse()
                .map_err(|_| Error::DropPrivileges("Invalid SUDO_UID".to_owned()))?;
            let gid = gid
                .parse()
                .map_err(|_| Error::DropPrivileges("Invalid SUDO_GID".to_owned()))?;
            Ok((uid, gid))
        }
        _ => Ok((getuid().as_raw(), getgid().as_raw())),
    }
}

/// Switch to the invoking user once sockets and the tunnel are open.
pub fn drop_privileges() -> Result<(), Error> {
    let (uid, gid) = get_saved_ids()?;
    setgid(Gid::from_raw(gid)).map_err(|e| Error::DropPrivileges(format!("setgid: {}", e)))?;
    setuid(Uid::from_raw(uid)).map_err(|e| Error::DropPrivileges(format!("setuid: {}", e)))?;

    // Getting root back must now fail
    if uid != 0 && setuid(Uid::from_raw(0)).is_ok() {
        return Err(Error::DropPrivileges(
            "Privileges were regained after dropping them".to_owned(),
        ));
    }
    Ok(())
}
