// src/utils/log.rs

//! Run header and summary blocks.
//!
//! Formatting helpers on top of the `log` facade, so the blocks follow whatever logger
//! the binary installed.

/// Width of separator lines.
const RULE_WIDTH: usize = 60;

/// Log a header
pub fn header(title: &str) {
    let border = "═".repeat(RULE_WIDTH);
    ::log::info!("{border}");
    ::log::info!("  {title}");
    ::log::info!("{border}");
}

/// Log a sub-item (indented)
pub fn sub_item(message: &str) {
    ::log::info!("    {message}");
}

/// Log a separator line
pub fn separator() {
    ::log::info!("{}", "─".repeat(RULE_WIDTH));
}

/// Lines of a summary block, without the logger prefix.
pub fn summary_lines(title: &str, items: &[(&str, String)]) -> Vec<String> {
    let width = items.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    std::iter::once(format!("[SUMMARY] {title}"))
        .chain(
            items
                .iter()
                .map(|(key, value)| format!("    {key:<width$} : {value}")),
        )
        .collect()
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    separator();
    for line in summary_lines(title, items) {
        ::log::info!("{line}");
    }
}
