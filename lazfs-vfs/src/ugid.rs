//! Caller-identity guard
//!
//! Creation upcalls briefly assume the requesting user's effective uid and
//! gid so new files end up owned by the caller rather than by the daemon.
//! An unprivileged daemon cannot switch identities; that failure is expected
//! and quietly ignored, leaving files owned by whoever runs the mount.

use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Uid};
use tracing::{debug, warn};

/// Identity of the user behind the current upcall.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// Temporarily adopts the caller's euid/egid; restores on drop.
pub(crate) struct UgidGuard {
    saved_uid: Option<Uid>,
    saved_gid: Option<Gid>,
}

impl UgidGuard {
    pub(crate) fn assume(caller: Caller) -> Self {
        let mut guard = UgidGuard {
            saved_uid: None,
            saved_gid: None,
        };

        // Group first: once the uid drops, the privilege to switch groups
        // is gone as well.
        let egid = getegid();
        if egid.as_raw() != caller.gid {
            match setegid(Gid::from_raw(caller.gid)) {
                Ok(()) => guard.saved_gid = Some(egid),
                Err(err) => debug!(%err, gid = caller.gid, "cannot adopt caller gid"),
            }
        }
        let euid = geteuid();
        if euid.as_raw() != caller.uid {
            match seteuid(Uid::from_raw(caller.uid)) {
                Ok(()) => guard.saved_uid = Some(euid),
                Err(err) => debug!(%err, uid = caller.uid, "cannot adopt caller uid"),
            }
        }

        guard
    }
}

impl Drop for UgidGuard {
    fn drop(&mut self) {
        if let Some(uid) = self.saved_uid.take() {
            if let Err(err) = seteuid(uid) {
                warn!(%err, "failed to restore effective uid");
            }
        }
        if let Some(gid) = self.saved_gid.take() {
            if let Err(err) = setegid(gid) {
                warn!(%err, "failed to restore effective gid");
            }
        }
    }
}
