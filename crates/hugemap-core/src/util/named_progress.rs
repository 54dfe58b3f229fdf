use indicatif::ProgressStyle;

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a progress bar style with a name label, padded to a fixed column.
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let pad = 32usize.saturating_sub(name.len() + 1);
        let fmt = format!(
            "{name}{:pad$}{{wide_bar:40.cyan/blue}} {{pos:>1}}/{{len:<1}} [{{elapsed_precise}}] {{msg}}",
            ""
        );
        ProgressStyle::default_bar()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_bar())
    }
}
