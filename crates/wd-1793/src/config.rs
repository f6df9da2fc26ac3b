//! Boot configuration parsing.
//!
//! Boot flow: a pointer file (`boot.cfg`) holds a single line naming an
//! INI-style configuration file. The INI file has `[SECTION]` headers
//! and `LABEL=value` entries; `;` starts a comment line. Labels are
//! folded to upper case. The labels `DRIVE0`..`DRIVE3` bind a drive
//! slot to an image path.

/// Pointer file name holding the active INI file name.
pub const BOOT_POINTER: &str = "boot.cfg";

/// First non-empty line of the pointer file.
#[must_use]
pub fn parse_pointer(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Walk the entries of an INI file, invoking `entry` with the current
/// section, the upper-cased label and the trimmed value.
pub fn parse_ini(text: &str, mut entry: impl FnMut(&str, &str, &str)) {
    let mut section = String::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.split(']').next().unwrap_or("");
            section = name.trim().to_ascii_uppercase();
            continue;
        }

        if let Some((label, value)) = line.split_once('=') {
            entry(
                &section,
                &label.trim().to_ascii_uppercase(),
                value.trim(),
            );
        }
    }
}

/// Drive slot index bound by a `DRIVEn` label, if the label is one.
#[must_use]
pub fn drive_label_index(label: &str) -> Option<usize> {
    let n = label.strip_prefix("DRIVE")?;
    let index: usize = n.parse().ok()?;
    (index < crate::MAX_DRIVES).then_some(index)
}
