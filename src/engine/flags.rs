use std::fmt;

/// Networking progress bits owned by the connection engine
///
/// The first four form a prerequisite chain: a broker session needs the
/// broker host resolved, which needs an IP address, which needs an access
/// point association.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkingFlags(u8);

impl NetworkingFlags {
    pub const AP: Self = Self(1 << 0);
    pub const IP: Self = Self(1 << 1);
    pub const HOST_IP: Self = Self(1 << 2);
    pub const SESSION: Self = Self(1 << 3);
    pub const ERROR: Self = Self(1 << 4);
    /// Twin initial report sent for the current IP assignment
    pub const REPORTED: Self = Self(1 << 5);
    pub const INIT_PENDING: Self = Self(1 << 6);

    const CHAIN: [Self; 4] = [Self::AP, Self::IP, Self::HOST_IP, Self::SESSION];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// True when every set link in the AP -> IP -> host -> session chain has
    /// all of its predecessors set too
    pub fn prerequisites_hold(self) -> bool {
        let mut predecessor_missing = false;
        for stage in Self::CHAIN {
            let present = self.contains(stage);
            if present && predecessor_missing {
                return false;
            }
            predecessor_missing |= !present;
        }
        true
    }

    /// Network is up to the point where the broker host can be resolved
    pub fn has_network(self) -> bool {
        self.contains(Self::AP) && self.contains(Self::IP)
    }
}

impl fmt::Debug for NetworkingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(NetworkingFlags, &str); 7] = [
            (NetworkingFlags::AP, "AP"),
            (NetworkingFlags::IP, "IP"),
            (NetworkingFlags::HOST_IP, "HOST_IP"),
            (NetworkingFlags::SESSION, "SESSION"),
            (NetworkingFlags::ERROR, "ERROR"),
            (NetworkingFlags::REPORTED, "REPORTED"),
            (NetworkingFlags::INIT_PENDING, "INIT_PENDING"),
        ];

        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}
