//! Shared memory constants and naming conventions.
//!
//! Segment names are the OS-level contract between minion processes: any
//! process that wants to interoperate must derive names exactly like this.

/// Directory backing POSIX shared memory on Linux.
pub const SHM_DIR: &str = "/dev/shm";

/// Maximum payload capacity of a JSON shared buffer (16 MiB).
pub const BUFFER_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Maximum payload capacity of a shared array buffer (4 GiB).
pub const ARRAY_MAX_SIZE: usize = 4 * 1024 * 1024 * 1024;

/// Size of the fixed segment header at the start of every segment.
pub const HEADER_SIZE: usize = 64;

/// Width of the identity string stored in every segment header.
pub const IDENTITY_LEN: usize = 32;

/// Size of the array header region (segment header + shape/dtype descriptor).
pub const ARRAY_HEADER_SIZE: usize = 512;

/// Default payload capacity of a minion state store (64 KiB).
pub const DEFAULT_STATE_SIZE: usize = 64 * 1024;

/// Default lock acquisition budget, in spin iterations.
pub const DEFAULT_LOCK_TIMEOUT: u32 = 10_000;

/// Identity of JSON shared buffers.
pub const BUFFER_IDENTITY: &str = "minion_shared_buffer";

/// Identity of raw array buffers.
pub const ARRAY_IDENTITY: &str = "minion_shared_array";

/// Identity of message queues.
pub const QUEUE_IDENTITY: &str = "minion_shared_queue";

/// Reserved prefix marking buffer-reference entries inside a state store.
pub const BUFFER_KEY_PREFIX: &str = "b*";

/// Reserved key holding the minion status code.
pub const STATUS_KEY: &str = "status";

/// Reserved key holding the declared minion name.
pub const NAME_KEY: &str = "name";

/// Segment name of a minion's state store.
pub fn state_store_name(minion: &str) -> String {
    format!("{minion}_shared_dict")
}

/// Segment name of an array buffer owned by a minion.
pub fn array_segment_name(minion: &str, buffer: &str) -> String {
    format!("{minion}_{buffer}")
}

/// Segment name of the directed channel carrying packets from `from` to `to`.
pub fn channel_name(from: &str, to: &str) -> String {
    format!("{from}_to_{to}_channel")
}

/// Segment name of a logger's shared record queue.
pub fn log_queue_name(logger: &str) -> String {
    format!("{logger}_log_queue")
}

/// State store key registering an array buffer.
pub fn buffer_key(buffer: &str) -> String {
    format!("{BUFFER_KEY_PREFIX}{buffer}")
}

/// Returns the buffer name if `key` is a reserved buffer reference.
pub fn buffer_name_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(BUFFER_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_caps() {
        assert_eq!(BUFFER_MAX_SIZE, 1 << 24);
        assert_eq!(ARRAY_MAX_SIZE, 1 << 32);
        assert!(DEFAULT_STATE_SIZE < BUFFER_MAX_SIZE);
        assert!(HEADER_SIZE < ARRAY_HEADER_SIZE);
    }

    #[test]
    fn test_segment_naming() {
        assert_eq!(state_store_name("stage"), "stage_shared_dict");
        assert_eq!(array_segment_name("camera", "frame"), "camera_frame");
        assert_eq!(channel_name("a", "b"), "a_to_b_channel");
        assert_eq!(log_queue_name("logger"), "logger_log_queue");
    }

    #[test]
    fn test_buffer_keys() {
        assert_eq!(buffer_key("frame"), "b*frame");
        assert_eq!(buffer_name_from_key("b*frame"), Some("frame"));
        assert_eq!(buffer_name_from_key("frame"), None);
        assert_eq!(buffer_name_from_key(STATUS_KEY), None);
    }
}
