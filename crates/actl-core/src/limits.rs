//! Payload size limits for inline stdin content.

/// Soft limit for inline content. Payloads at or above this size still send
/// inline but trigger a warn-level signal on both sides.
pub const SOFT_LIMIT_BYTES: usize = 64 * 1024;

/// Hard limit for inline content. Payloads at or above this size must use a
/// `content_ref`; the receiver rejects them inline. Overridable on the
/// receiver via `ACTL_HARD_LIMIT_BYTES`.
pub const HARD_LIMIT_BYTES: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_limit_is_below_hard_limit() {
        assert!(SOFT_LIMIT_BYTES < HARD_LIMIT_BYTES);
    }
}
