//! Log topic filtering.
//!
//! The server classifies messages by topic rather than only by severity; the
//! active topic mask comes from the `verbosity` configuration key and the
//! `-v` command line flag. Messages pass through the `log` facade so the
//! binary's `env_logger` setup controls the final output.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Topics a log message can be tagged with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Topics: u32 {
        /// Fatal conditions; the server is going down
        const FATAL  = 0x0001;
        /// Errors the server recovers from
        const ERROR  = 0x0002;
        /// Major lifecycle events
        const MAJOR  = 0x0004;
        /// Minor lifecycle events
        const MINOR  = 0x0008;
        /// Connection handling
        const COMM   = 0x0010;
        /// Message traffic
        const MSG    = 0x0020;
        /// Malformed or rejected messages
        const MSGERR = 0x0040;
        /// Configuration processing
        const CONFIG = 0x0080;
        /// Module registration
        const MODULE = 0x0100;
        /// Everything
        const ALL    = 0xFFFF;
    }
}

impl Topics {
    /// Severity a topic maps to on the `log` facade.
    pub fn level(self) -> log::Level {
        if self.intersects(Topics::FATAL | Topics::ERROR | Topics::MSGERR) {
            log::Level::Error
        } else if self.intersects(Topics::MAJOR | Topics::MODULE | Topics::CONFIG) {
            log::Level::Info
        } else if self.intersects(Topics::MINOR | Topics::COMM) {
            log::Level::Debug
        } else {
            log::Level::Trace
        }
    }
}

// Fatal and error conditions are always reported.
const BASE_MASK: u32 = Topics::FATAL.bits() | Topics::ERROR.bits();

static TOPIC_MASK: AtomicU32 = AtomicU32::new(BASE_MASK);

/// Replace the active topic mask.
pub fn set_topics(mask: Topics) {
    TOPIC_MASK.store(mask.bits() | BASE_MASK, Ordering::Relaxed);
}

/// The active topic mask.
pub fn topics() -> Topics {
    Topics::from_bits_truncate(TOPIC_MASK.load(Ordering::Relaxed))
}

/// Whether a topic is currently enabled.
pub fn enabled(topic: Topics) -> bool {
    topics().intersects(topic)
}

/// Log a message under a topic, subject to the active mask.
#[macro_export]
macro_rules! topic_log {
    ($topic:expr, $($arg:tt)*) => {{
        let topic = $topic;
        if $crate::logger::enabled(topic) {
            ::log::log!(target: "opendax", topic.level(), $($arg)*);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    // single test because the mask is process-global state
    #[test]
    fn test_mask_filtering() {
        set_topics(Topics::empty());
        assert!(enabled(Topics::FATAL));
        assert!(enabled(Topics::ERROR));
        assert!(!enabled(Topics::MSG));

        set_topics(Topics::COMM | Topics::MODULE);
        assert!(enabled(Topics::COMM));
        assert!(enabled(Topics::MODULE));
        assert!(!enabled(Topics::CONFIG));

        set_topics(Topics::ALL);
        assert!(enabled(Topics::CONFIG));
    }

    #[test]
    fn test_topic_levels() {
        assert_eq!(Topics::FATAL.level(), log::Level::Error);
        assert_eq!(Topics::MODULE.level(), log::Level::Info);
        assert_eq!(Topics::COMM.level(), log::Level::Debug);
        assert_eq!(Topics::MSG.level(), log::Level::Trace);
    }
}
