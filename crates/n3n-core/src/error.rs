//! Typed error taxonomy for the core: parse, resolution, transport, replay, and
//! capacity failures (see the module docs in `lib.rs` for the class boundaries).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed supernode spec '{0}'")]
    ParseSupernode(String),

    #[error("malformed MAC address '{0}'")]
    ParseMac(String),

    #[error("resolution failed for host '{host}': {source}")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no free slot available")]
    NoFreeSlot,

    #[error("all listen slots occupied")]
    NoFreeListenSlot,

    #[error("request exceeded capacity ({len} > {max})")]
    Capacity { len: usize, max: usize },

    #[error("failed to read config file: {source}")]
    ConfigRead {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {source}")]
    ConfigParse {
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Small negative integer code, for parity with the C lineage this crate's
    /// interface is modeled on. Prefer matching on the `Error` variant directly;
    /// this exists only for callers translating into a process exit code.
    pub fn code(&self) -> i32 {
        match self {
            Error::ParseSupernode(_) => -1,
            Error::ParseMac(_) => -2,
            Error::Resolution { .. } => -3,
            Error::Transport { .. } => -4,
            Error::NoFreeSlot => -5,
            Error::NoFreeListenSlot => -6,
            Error::Capacity { .. } => -7,
            Error::ConfigRead { .. } => -8,
            Error::ConfigParse { .. } => -9,
        }
    }
}

impl From<&Error> for i32 {
    fn from(e: &Error) -> i32 {
        e.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_stable() {
        let e = Error::ParseMac("zz".into());
        assert_eq!(e.code(), -2);
        assert_eq!(i32::from(&e), -2);
    }
}
