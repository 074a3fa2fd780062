use uuid::Uuid;

/// Generate a connection identifier.
/// UUIDv7 embeds a millisecond timestamp in its most significant bits,
/// so identifiers sort by creation time.
pub fn new_connection_id() -> String {
    Uuid::now_v7().to_string()
}
