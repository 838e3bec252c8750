//! Session identifier generation

use chrono::Utc;
use uuid::Uuid;

/// Longest session id accepted from the wire
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Millisecond timestamp (hex) followed by 128 random bits (hex)
///
/// Only `[0-9a-f-]` is produced, so ids are safe as header values and file names.
pub fn generate_session_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    format!("{millis:012x}-{}", Uuid::new_v4().simple())
}

/// Header-safe: visible ASCII only, bounded length
pub fn is_well_formed(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id.bytes().all(|b| (0x21..=0x7e).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique_and_well_formed() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(is_well_formed(id));
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
        }
    }

    #[test]
    fn test_timestamp_prefix_sorts() {
        let first = generate_session_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_session_id();
        assert!(first[..12] < second[..12]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("has space"));
        assert!(!is_well_formed("tab\tinside"));
        assert!(!is_well_formed(&"a".repeat(MAX_SESSION_ID_LEN + 1)));
        assert!(is_well_formed("abc-123_XYZ"));
    }
}
