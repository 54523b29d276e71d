pub(crate) const MB: u64 = 1024 * 1024;

/// `1.50 MiB`
pub(crate) fn human_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
