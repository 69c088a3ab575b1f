//! UUIDv7 utilities for time-ordered identifiers.
//!
//! Every identifier tasksync generates (event IDs, connection IDs, occurrence
//! task IDs, dead-letter IDs) is a UUIDv7: the embedded millisecond timestamp
//! gives natural time-ordering and keeps index pages warm on append-heavy
//! tables like the event log.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check whether a UUID is version 7.
#[inline]
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_is_v7() {
        let id = new_v7();
        assert!(is_v7(&id));
    }

    #[test]
    fn test_v4_is_not_v7() {
        let id = Uuid::new_v4();
        assert!(!is_v7(&id));
    }

    #[test]
    fn test_v7_time_ordering() {
        // Consecutive v7 IDs generated in the same process are monotonically
        // non-decreasing in their string form.
        let a = new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_v7();
        assert!(a.to_string() < b.to_string());
    }
}
