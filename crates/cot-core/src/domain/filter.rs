//! CoT type pattern matching.
//!
//! Types are dash-separated atoms (`a-f-G-U-C`).  A pattern is matched atom by
//! atom, where `.` matches any single atom.  A trailing `-` turns the pattern
//! into a prefix match that requires at least one more atom; the bare pattern
//! `-` matches everything.

/// Returns true when `typ` matches `pattern`.
pub fn match_pattern(typ: &str, pattern: &str) -> bool {
    if pattern == "-" {
        return true;
    }

    let open = pattern.ends_with('-');
    if open && typ.starts_with(pattern) {
        return true;
    }

    let atoms: Vec<&str> = typ.split('-').collect();
    let wanted: Vec<&str> = pattern.trim_end_matches('-').split('-').collect();

    if atoms.len() < wanted.len() {
        return false;
    }

    let prefix_ok = wanted
        .iter()
        .zip(&atoms)
        .all(|(want, got)| *want == "." || want == got);

    if !prefix_ok {
        return false;
    }

    if open {
        atoms.len() > wanted.len()
    } else {
        atoms.len() == wanted.len()
    }
}

/// Returns true when `typ` matches at least one of `patterns`.
pub fn match_any_pattern(typ: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| match_pattern(typ, p))
}
