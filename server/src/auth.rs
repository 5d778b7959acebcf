//! Peer authentication.
//!
//! A coarse allow-list over the OS-reported identity of the connecting process.
//! Root is trusted, as is the Android `shell` user (uid and gid 2000), which is what
//! `adb shell` and forwarded sockets run as.

use dtf_common::PeerCredentials;
use serde::Deserialize;

pub const UID_ROOT: u32 = 0;
pub const UID_SHELL: u32 = 2000;
pub const GID_SHELL: u32 = 2000;

/// Why a peer was let in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Root,
    Shell,
    /// Listed in [`PeerPolicy::trusted_uids`]
    TrustedUid(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// Which peers may talk to the agent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PeerPolicy {
    /// Trust uid 0
    pub allow_root:   bool,
    /// Trust uid 2000 with gid 2000
    pub allow_shell:  bool,
    /// Additional uids trusted regardless of group
    pub trusted_uids: Vec<u32>,
}

impl Default for PeerPolicy {
    fn default() -> Self {
        Self {
            allow_root:   true,
            allow_shell:  true,
            trusted_uids: Vec::new(),
        }
    }
}

impl PeerPolicy {
    /// A policy that trusts nobody, for building up explicitly
    pub fn deny_all() -> Self {
        Self {
            allow_root:   false,
            allow_shell:  false,
            trusted_uids: Vec::new(),
        }
    }

    /// Also trust `uid`
    pub fn trust_uid(mut self, uid: u32) -> Self {
        if !self.trusted_uids.contains(&uid) {
            self.trusted_uids.push(uid);
        }
        self
    }

    pub fn authorize(&self, peer: &PeerCredentials) -> Decision {
        if self.allow_root && peer.uid == UID_ROOT {
            return Decision::Allow(Grant::Root);
        }
        if self.allow_shell && peer.uid == UID_SHELL && peer.gid == GID_SHELL {
            return Decision::Allow(Grant::Shell);
        }
        if self.trusted_uids.contains(&peer.uid) {
            return Decision::Allow(Grant::TrustedUid(peer.uid));
        }
        Decision::Deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uid: u32, gid: u32) -> PeerCredentials {
        PeerCredentials { pid: Some(4242), uid, gid }
    }

    #[test]
    fn root_is_allowed_with_any_group() {
        let policy = PeerPolicy::default();
        for gid in [0, 1, 2000, 65534] {
            assert_eq!(policy.authorize(&peer(0, gid)), Decision::Allow(Grant::Root));
        }
    }

    #[test]
    fn shell_needs_both_uid_and_gid() {
        let policy = PeerPolicy::default();
        assert_eq!(policy.authorize(&peer(2000, 2000)), Decision::Allow(Grant::Shell));
        assert_eq!(policy.authorize(&peer(2000, 1000)), Decision::Deny);
        assert_eq!(policy.authorize(&peer(1000, 2000)), Decision::Deny);
    }

    #[test]
    fn everyone_else_is_denied() {
        let policy = PeerPolicy::default();
        for (uid, gid) in [(1, 1), (1000, 1000), (10057, 10057), (1999, 2000), (2001, 2000), (u32::MAX, 0)] {
            assert!(!policy.authorize(&peer(uid, gid)).is_allowed(), "uid={uid} gid={gid}");
        }
    }

    #[test]
    fn trusted_uids_extend_the_default() {
        let policy = PeerPolicy::default().trust_uid(1000).trust_uid(1000);
        assert_eq!(policy.trusted_uids, vec![1000]);
        assert_eq!(
            policy.authorize(&peer(1000, 1234)),
            Decision::Allow(Grant::TrustedUid(1000))
        );
        assert_eq!(policy.authorize(&peer(1001, 1234)), Decision::Deny);
    }

    #[test]
    fn deny_all_denies_root() {
        let policy = PeerPolicy::deny_all();
        assert_eq!(policy.authorize(&peer(0, 0)), Decision::Deny);
        assert_eq!(policy.authorize(&peer(2000, 2000)), Decision::Deny);
    }
}
