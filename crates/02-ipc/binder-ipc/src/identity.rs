//! Opaque tokens for saving and restoring who a thread is acting for.
//!
//! A calling-identity token is laid out as
//! `[uid:32 | pid sign:1 | explicit:1 | pid rest:30]`. Keeping the sign bit
//! in place lets negative sentinels such as `-1` survive the trip.

const EXPLICIT_BIT: u32 = 1 << 30;
const SIGN_BIT: u32 = 1 << 31;

/// Bit of a work-source token recording whether the uid was propagated.
pub const WORK_SOURCE_PROPAGATED_BIT: u32 = 32;
/// Work-source uid meaning "not set".
pub const UNSET_WORK_SOURCE: i32 = -1;

fn encode_explicit(has_explicit: bool, pid: i32) -> u32 {
    let raw = pid as u32;
    if has_explicit {
        raw | EXPLICIT_BIT
    } else {
        raw & !EXPLICIT_BIT
    }
}

pub fn pack_calling_identity(has_explicit: bool, uid: u32, pid: i32) -> i64 {
    (((uid as u64) << 32) | encode_explicit(has_explicit, pid) as u64) as i64
}

pub fn unpack_has_explicit_identity(token: i64) -> bool {
    (token as u32) & EXPLICIT_BIT != 0
}

pub fn unpack_calling_uid(token: i64) -> u32 {
    ((token as u64) >> 32) as u32
}

pub fn unpack_calling_pid(token: i64) -> i32 {
    let encoded = token as u32;
    if encoded & SIGN_BIT != 0 {
        (encoded | EXPLICIT_BIT) as i32
    } else {
        (encoded & !EXPLICIT_BIT) as i32
    }
}

/// Identity of the caller a thread is currently serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingIdentity {
    pub pid: i32,
    pub uid: u32,
    /// Security context of the caller, when the peer supplied one.
    pub sid: Option<u64>,
    pub has_explicit: bool,
}

impl CallingIdentity {
    pub fn token(&self) -> i64 {
        pack_calling_identity(self.has_explicit, self.uid, self.pid)
    }

    /// Rebuilds an identity from a token; the security context is not recoverable.
    pub fn from_token(token: i64) -> Self {
        Self {
            pid: unpack_calling_pid(token),
            uid: unpack_calling_uid(token),
            sid: None,
            has_explicit: unpack_has_explicit_identity(token),
        }
    }
}

/// Uid that resource usage is attributed to, with its propagation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSource {
    pub uid: i32,
    pub propagate: bool,
}

impl Default for WorkSource {
    fn default() -> Self {
        Self {
            uid: UNSET_WORK_SOURCE,
            propagate: false,
        }
    }
}

impl WorkSource {
    pub fn token(&self) -> i64 {
        ((self.propagate as i64) << WORK_SOURCE_PROPAGATED_BIT) | (self.uid as u32 as i64)
    }

    pub fn from_token(token: i64) -> Self {
        Self {
            uid: token as i32,
            propagate: (token >> WORK_SOURCE_PROPAGATED_BIT) & 1 == 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_identity_survives_packing() {
        let token = pack_calling_identity(true, 1000, 9999);
        assert!(unpack_has_explicit_identity(token));
        assert_eq!(unpack_calling_uid(token), 1000);
        assert_eq!(unpack_calling_pid(token), 9999);
    }

    #[test]
    fn negative_pid_keeps_its_sign() {
        for explicit in [true, false] {
            let token = pack_calling_identity(explicit, 1000, -1);
            assert_eq!(unpack_has_explicit_identity(token), explicit);
            assert_eq!(unpack_calling_uid(token), 1000);
            assert_eq!(unpack_calling_pid(token), -1);
        }
    }

    #[test]
    fn unset_work_source_restores_without_propagation() {
        let unset = WorkSource::default();
        assert_eq!(WorkSource::from_token(unset.token()), unset);
        let propagated = WorkSource { uid: 10_042, propagate: true };
        assert_eq!(WorkSource::from_token(propagated.token()), propagated);
    }

    #[cfg(feature = "proptest")]
    mod prop {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any pid whose top two bits agree fits the token layout.
            #[test]
            fn calling_identity_round_trips(
                explicit in any::<bool>(),
                uid in any::<u32>(),
                pid in -(1i32 << 30)..(1i32 << 30),
            ) {
                let token = pack_calling_identity(explicit, uid, pid);
                prop_assert_eq!(unpack_has_explicit_identity(token), explicit);
                prop_assert_eq!(unpack_calling_uid(token), uid);
                prop_assert_eq!(unpack_calling_pid(token), pid);
            }

            #[test]
            fn work_source_round_trips(uid in any::<i32>(), propagate in any::<bool>()) {
                let source = WorkSource { uid, propagate };
                prop_assert_eq!(WorkSource::from_token(source.token()), source);
            }
        }
    }
}
