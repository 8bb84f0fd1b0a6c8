use uuid::Uuid;

/// Allocate a time-sortable UUIDv7 primary key.
///
/// Every entity in the store uses these — sorting by id approximates
/// creation order, which keeps dashboard queries index-friendly.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Current instant as an RFC3339 string — the store's timestamp format.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_sortable() {
        let a = new_id();
        let b = new_id();
        assert!(a <= b);
    }
}
