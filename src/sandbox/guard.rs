//! Static safety guard run before interpretation: a banned-import and
//! banned-call string scan.

const BANNED_IMPORTS: &[&str] = &["os", "sys", "subprocess", "shutil", "socket", "requests"];
const BANNED_CALLS: &[&str] = &["eval(", "exec(", "open(", "__import__("];

/// Returns the first violation found, if any. The sandbox forbids
/// filesystem access outside the workspace directory and all network
/// access; both show up as banned imports/calls here.
pub fn first_violation(source: &str) -> Option<String> {
    for banned in BANNED_IMPORTS {
        if source.contains(&format!("import {banned}")) || source.contains(&format!("from {banned} import")) {
            return Some(format!("banned import '{banned}'"));
        }
    }
    for banned in BANNED_CALLS {
        if source.contains(banned) {
            return Some(format!("banned call '{banned}'"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_import_is_flagged() {
        assert!(first_violation("import os\nprint('hi')").is_some());
    }

    #[test]
    fn clean_source_passes() {
        assert!(first_violation("x = 1\nsim.step([0.1])\n").is_none());
    }
}
